use std::fmt;

use serde::{Deserialize, Serialize};

/// Encryption method announced by `#EXT-X-KEY` / `#EXT-X-MAP`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyMethod {
    None,
    Aes128,
    SampleAes,
    Other(String),
}

impl KeyMethod {
    pub fn from_attribute(value: &str) -> Self {
        match value {
            "NONE" => KeyMethod::None,
            "AES-128" => KeyMethod::Aes128,
            "SAMPLE-AES" => KeyMethod::SampleAes,
            other => KeyMethod::Other(other.to_string()),
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, KeyMethod::None)
    }
}

impl fmt::Display for KeyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMethod::None => f.write_str("NONE"),
            KeyMethod::Aes128 => f.write_str("AES-128"),
            KeyMethod::SampleAes => f.write_str("SAMPLE-AES"),
            KeyMethod::Other(method) => f.write_str(method),
        }
    }
}

/// Cipher parameters attached to a segment.
///
/// `iv` stays in its textual hex form; the engine converts it to bytes when
/// the segment is decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey {
    pub method: KeyMethod,
    pub uri: Option<String>,
    pub iv: Option<String>,
    pub key_format: Option<String>,
}

impl EncryptionKey {
    pub fn none() -> Self {
        Self {
            method: KeyMethod::None,
            uri: None,
            iv: None,
            key_format: None,
        }
    }

    /// Copy of this key bound to the segment with media sequence `sequence`.
    ///
    /// An encrypted key without an explicit IV gets the sequence number as IV.
    pub fn for_sequence(&self, sequence: u64) -> Self {
        let mut key = self.clone();
        if !key.method.is_none() && key.iv.is_none() {
            key.iv = Some(iv_for_sequence(sequence));
        }
        key
    }
}

/// The implicit AES-128 IV: the sequence number as a 128-bit big-endian
/// value, written as `0x` followed by 32 hex digits.
pub fn iv_for_sequence(sequence: u64) -> String {
    format!("0x{sequence:032x}")
}
