//! MPEG-DASH manifest handling.
//!
//! [`parse_mpd`] walks the XML into an [`Mpd`] tree, [`resolve_base_urls`]
//! returns a copy with every `BaseURL` made absolute, and
//! [`expand_representation`] turns one representation's addressing
//! (`SegmentTemplate`, `SegmentTimeline`, `SegmentList` or `SegmentBase`)
//! into concrete segment URLs.

mod base_url;
mod error;
mod model;
mod parser;
mod segments;
mod template;
mod xml;

pub use base_url::{resolve, resolve_base_urls};
pub use error::DashError;
pub use model::{
    AdaptationSet, Initialization, Mpd, Period, Representation, SegmentBase, SegmentList,
    SegmentListEntry, SegmentTemplate, TimelineEntry,
};
pub use parser::parse_mpd;
pub use segments::{
    ExpandedRepresentation, IndexedMedia, InitSegment, MediaSegments, SegmentUrl,
    expand_representation,
};
pub use template::{TemplateVars, expand_template};

use media_types::ParseMode;
use url::Url;

/// Parse `xml` fetched from `manifest_url` and resolve its base URLs.
pub fn parse_manifest(xml: &str, manifest_url: &Url, mode: ParseMode) -> Result<Mpd, DashError> {
    let raw = parse_mpd(xml, mode)?;
    resolve_base_urls(&raw, manifest_url)
}

/// Cheap sniff for an MPD document.
pub fn is_mpd(text: &str) -> bool {
    let head: String = text.chars().take(1024).collect();
    head.contains("<MPD")
}
