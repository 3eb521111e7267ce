use serde::{Deserialize, Serialize};

use crate::{ByteRange, EncryptionKey};

/// One fetchable media unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Logical position in the stream; HLS seeds it from `#EXT-X-MEDIA-SEQUENCE`.
    pub index: u64,
    /// Absolute URI.
    pub uri: String,
    /// Duration in seconds.
    pub duration: f64,
    pub title: Option<String>,
    pub byte_range: Option<ByteRange>,
    pub key: Option<EncryptionKey>,
    pub discontinuity: bool,
    pub program_date_time: Option<String>,
}

impl Segment {
    pub fn new(index: u64, uri: impl Into<String>, duration: f64) -> Self {
        Self {
            index,
            uri: uri.into(),
            duration,
            title: None,
            byte_range: None,
            key: None,
            discontinuity: false,
            program_date_time: None,
        }
    }

    /// Whether fetching this segment requires a decryption step.
    pub fn is_encrypted(&self) -> bool {
        self.key.as_ref().is_some_and(|k| !k.method.is_none())
    }
}

/// Initialization segment (`#EXT-X-MAP` or DASH `Initialization`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMap {
    pub uri: String,
    pub byte_range: Option<ByteRange>,
    pub key: Option<EncryptionKey>,
}
