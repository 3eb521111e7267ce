use media_types::AttributeParseError;
use mp4::BoxParseError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DashError {
    #[error("manifest has no <MPD> root element")]
    MissingRoot,

    #[error("malformed XML at byte {position}: {reason}")]
    Xml { position: u64, reason: String },

    #[error(transparent)]
    Attribute(#[from] AttributeParseError),

    #[error("invalid URI `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid segment index: {0}")]
    Sidx(#[from] BoxParseError),

    #[error("representation `{representation}` has no usable segment addressing: {reason}")]
    MissingAddressing {
        representation: String,
        reason: String,
    },
}

impl DashError {
    pub fn xml(position: u64, reason: impl ToString) -> Self {
        Self::Xml {
            position,
            reason: reason.to_string(),
        }
    }

    pub fn invalid_uri(uri: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    pub fn missing_addressing(representation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MissingAddressing {
            representation: representation.into(),
            reason: reason.into(),
        }
    }

    /// Errors that only invalidate the element that produced them.
    pub fn is_element_local(&self) -> bool {
        matches!(self, Self::Attribute(_) | Self::MissingAddressing { .. })
    }
}
