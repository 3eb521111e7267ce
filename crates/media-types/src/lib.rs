//! Shared media domain types.
//!
//! The manifest parsers (`hls`, `dash`) and the download engine agree on the
//! types defined here: a [`Segment`] is the unit the engine fetches, a
//! [`SegmentMap`] is an initialization segment, and [`EncryptionKey`] carries
//! the per-segment cipher parameters resolved during parsing.

mod attribute;
mod key;
mod range;
mod segment;

pub use attribute::{AttributeParseError, ParseMode, parse_attribute};
pub use key::{EncryptionKey, KeyMethod, iv_for_sequence};
pub use range::ByteRange;
pub use segment::{Segment, SegmentMap};

use serde::{Deserialize, Serialize};

/// Video resolution information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    #[inline]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count, used to rank variants with equal bandwidth.
    #[inline]
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
