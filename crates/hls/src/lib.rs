//! HLS (HTTP Live Streaming) playlist handling.
//!
//! Turns `.m3u8` text into the segment model from `media-types`: a master
//! playlist becomes a list of [`StreamVariant`]s, a media playlist becomes an
//! ordered list of [`Part`]s holding [`media_types::Segment`]s with resolved
//! URIs, byte ranges and encryption keys.

pub mod attributes;
pub mod error;
pub mod master;
pub mod media;

pub use attributes::{Attributes, parse_byte_range};
pub use error::HlsError;
pub use master::{AlternateRendition, MasterPlaylist, MediaType, StreamVariant};
pub use media::{MediaPlaylist, Part, PlaylistType};

use media_types::ParseMode;
use url::Url;

/// A playlist of either kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

/// Parse `text` as whichever playlist kind it is. A playlist containing
/// `#EXT-X-STREAM-INF` or `#EXT-X-I-FRAME-STREAM-INF` is a master playlist.
pub fn parse_playlist(text: &str, base: &Url, mode: ParseMode) -> Result<Playlist, HlsError> {
    if is_master_playlist(text) {
        MasterPlaylist::parse(text, base, mode).map(Playlist::Master)
    } else {
        MediaPlaylist::parse(text, base, mode).map(Playlist::Media)
    }
}

pub fn is_master_playlist(text: &str) -> bool {
    lines(text).any(|line| {
        line.content.starts_with("#EXT-X-STREAM-INF")
            || line.content.starts_with("#EXT-X-I-FRAME-STREAM-INF")
    })
}

/// Resolve a possibly relative playlist URI against the playlist's own URL.
pub fn resolve_uri(base: &Url, uri: &str) -> Result<String, HlsError> {
    base.join(uri.trim())
        .map(String::from)
        .map_err(|e| HlsError::invalid_uri(uri, e))
}

pub(crate) struct Line<'a> {
    pub(crate) number: usize,
    pub(crate) content: &'a str,
}

/// Non-empty, trimmed lines with 1-based line numbers. A leading UTF-8 BOM
/// is dropped.
pub(crate) fn lines(text: &str) -> impl Iterator<Item = Line<'_>> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    text.lines()
        .enumerate()
        .map(|(idx, line)| Line {
            number: idx + 1,
            content: line.trim(),
        })
        .filter(|line| !line.content.is_empty())
}
