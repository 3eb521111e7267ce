use std::path::PathBuf;

use dash::DashError;
use hls::HlsError;
use media_types::AttributeParseError;
use mp4::BoxParseError;
use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("manifest format error: {reason}")]
    ManifestFormat { reason: String },

    #[error(transparent)]
    AttributeParse(#[from] AttributeParseError),

    #[error(transparent)]
    BoxParse(#[from] BoxParseError),

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("response for {url} ended after {received} of {expected} bytes")]
    Truncated {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("byte ranges unsupported for {url}: {reason}")]
    RangeUnsupported { url: String, reason: String },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("failed to fetch key {uri}: {reason}")]
    KeyFetch {
        uri: String,
        reason: String,
        retryable: bool,
    },

    #[error("segment {index} failed: {source}")]
    TaskFailed {
        index: u64,
        #[source]
        source: Box<DownloadError>,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl DownloadError {
    pub fn manifest_format(reason: impl Into<String>) -> Self {
        Self::ManifestFormat {
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn range_unsupported(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RangeUnsupported {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.to_string(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Wrap a worker failure with the index of the segment or range it was
    /// processing. Cancellation passes through unwrapped.
    pub fn task_failed(index: u64, source: DownloadError) -> Self {
        match source {
            Self::Cancelled => Self::Cancelled,
            source => Self::TaskFailed {
                index,
                source: Box::new(source),
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Transient failures worth another attempt: transport errors, 5xx and
    /// 429 responses and truncated bodies.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::Network { source } => is_retryable_reqwest_error(source),
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Truncated { .. } => true,
            Self::KeyFetch { retryable, .. } => *retryable,
            Self::TaskFailed { source, .. } => source.is_retryable(),
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut
            ),
            Self::ManifestFormat { .. }
            | Self::AttributeParse(_)
            | Self::BoxParse(_)
            | Self::RangeUnsupported { .. }
            | Self::Decryption { .. }
            | Self::InvalidUrl { .. }
            | Self::Configuration { .. } => false,
        }
    }
}

/// Classify a reqwest error as retryable or non-retryable.
///
/// Retryable: connect, timeout, request, body read, and decode errors.
/// Non-retryable: redirect and builder errors.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}

impl From<HlsError> for DownloadError {
    fn from(err: HlsError) -> Self {
        match err {
            HlsError::Attribute(err) => Self::AttributeParse(err),
            HlsError::InvalidUri { uri, reason } => Self::InvalidUrl {
                input: uri,
                reason,
            },
            other => Self::manifest_format(other.to_string()),
        }
    }
}

impl From<DashError> for DownloadError {
    fn from(err: DashError) -> Self {
        match err {
            DashError::Attribute(err) => Self::AttributeParse(err),
            DashError::Sidx(err) => Self::BoxParse(err),
            DashError::InvalidUri { uri, reason } => Self::InvalidUrl {
                input: uri,
                reason,
            },
            other => Self::manifest_format(other.to_string()),
        }
    }
}
