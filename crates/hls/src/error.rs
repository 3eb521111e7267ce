use media_types::AttributeParseError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HlsError {
    /// The `#EXTM3U` marker never appeared.
    #[error("not an HLS playlist: missing #EXTM3U header")]
    MissingHeader,

    #[error(transparent)]
    Attribute(#[from] AttributeParseError),

    #[error("cannot resolve URI `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("malformed {tag} on line {line}: {reason}")]
    InvalidTag {
        line: usize,
        tag: &'static str,
        reason: String,
    },
}

impl HlsError {
    pub fn invalid_uri(uri: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_tag(line: usize, tag: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidTag {
            line,
            tag,
            reason: reason.into(),
        }
    }

    /// Errors caused by a single element's attributes; these are the ones a
    /// lenient parse may skip.
    pub fn is_element_local(&self) -> bool {
        matches!(self, Self::Attribute(_) | Self::InvalidTag { .. })
    }
}
