use thiserror::Error;

/// Malformed or truncated box data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("box parse error at byte {offset}: {reason}")]
pub struct BoxParseError {
    /// Offset from the start of the parsed buffer.
    pub offset: u64,
    pub reason: String,
}

impl BoxParseError {
    pub fn new(offset: u64, reason: impl Into<String>) -> Self {
        Self {
            offset,
            reason: reason.into(),
        }
    }
}
