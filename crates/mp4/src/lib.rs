//! Minimal ISOBMFF (MP4) support for segment addressing.
//!
//! Only what a downloader needs: a bounds-checked [`BoxCursor`], box header
//! walking, and the segment index box ([`Sidx`]) that turns a single-file
//! DASH representation into byte-range segments.

mod box_utils;
mod cursor;
mod error;
mod sidx;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use box_utils::{BoxHeader, find_box, read_box_header};
pub use cursor::BoxCursor;
pub use error::BoxParseError;
pub use sidx::{Sidx, SidxReference, find_sidx, parse_sidx};
