//! Media playlist parsing.
//!
//! The parser is a single pass over the playlist lines with a little running
//! state: the next segment index, the active `#EXT-X-KEY`, the active
//! `#EXT-X-MAP` and the end of the previous byte range (needed to place a
//! `#EXT-X-BYTERANGE` that omits its offset).

use media_types::{
    ByteRange, EncryptionKey, KeyMethod, ParseMode, Segment, SegmentMap, parse_attribute,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use url::Url;

use crate::attributes::{Attributes, parse_byte_range};
use crate::error::HlsError;
use crate::{Line, lines, resolve_uri};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaylistType {
    Vod,
    Event,
}

/// Segments between two discontinuities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub part_index: u64,
    pub map: Option<SegmentMap>,
    pub segments: Vec<Segment>,
}

impl Part {
    fn new(part_index: u64, map: Option<SegmentMap>) -> Self {
        Self {
            part_index,
            map,
            segments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaPlaylist {
    pub version: Option<u64>,
    pub target_duration: f64,
    pub media_sequence: u64,
    pub discontinuity_sequence: u64,
    /// `#EXT-X-ENDLIST` was present. Without it the playlist is live and may
    /// still grow.
    pub end_list: bool,
    pub playlist_type: Option<PlaylistType>,
    pub independent_segments: bool,
    pub parts: Vec<Part>,
}

impl MediaPlaylist {
    /// Parse a media playlist, resolving every URI against `base`.
    pub fn parse(text: &str, base: &Url, mode: ParseMode) -> Result<Self, HlsError> {
        let mut parser = MediaParser::new(base, mode);
        for line in lines(text) {
            parser.feed(line)?;
        }
        parser.finish()
    }

    /// All segments in playlist order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.parts.iter().flat_map(|part| part.segments.iter())
    }

    pub fn segment_count(&self) -> usize {
        self.parts.iter().map(|part| part.segments.len()).sum()
    }

    pub fn total_duration(&self) -> f64 {
        self.segments().map(|s| s.duration).sum()
    }

    /// Whether the playlist may still receive segments. Only
    /// `#EXT-X-ENDLIST` makes a plan complete.
    pub fn is_live(&self) -> bool {
        !self.end_list
    }
}

enum Pending {
    None,
    Segment { duration: f64, title: Option<String> },
    /// An `#EXTINF` that failed to parse.
    Skip,
}

struct MediaParser<'a> {
    base: &'a Url,
    mode: ParseMode,
    playlist: MediaPlaylist,
    seen_header: bool,
    next_index: u64,
    part: Part,
    active_key: Option<EncryptionKey>,
    active_map: Option<SegmentMap>,
    pending: Pending,
    /// A tag of the next segment was malformed; it is dropped when its URI
    /// arrives, whatever tags follow.
    skip_next: bool,
    pending_range: Option<ByteRange>,
    previous_range_end: Option<u64>,
    pending_discontinuity: bool,
    pending_date_time: Option<String>,
}

impl<'a> MediaParser<'a> {
    fn new(base: &'a Url, mode: ParseMode) -> Self {
        Self {
            base,
            mode,
            playlist: MediaPlaylist::default(),
            seen_header: false,
            next_index: 0,
            part: Part::new(0, None),
            active_key: None,
            active_map: None,
            pending: Pending::None,
            skip_next: false,
            pending_range: None,
            previous_range_end: None,
            pending_discontinuity: false,
            pending_date_time: None,
        }
    }

    fn has_segments(&self) -> bool {
        !self.part.segments.is_empty() || !self.playlist.parts.is_empty()
    }

    fn feed(&mut self, Line { number, content }: Line<'_>) -> Result<(), HlsError> {
        if content == "#EXTM3U" {
            self.seen_header = true;
        } else if let Some(rest) = content.strip_prefix("#EXTINF:") {
            match parse_extinf(rest) {
                Ok((duration, title)) => self.pending = Pending::Segment { duration, title },
                Err(e) => {
                    self.pending = Pending::Skip;
                    self.element_error(number, e.into())?
                }
            }
        } else if let Some(rest) = content.strip_prefix("#EXT-X-BYTERANGE:") {
            match parse_byte_range("EXT-X-BYTERANGE", rest, self.previous_range_end) {
                Ok(range) => self.pending_range = Some(range),
                Err(e) => self.element_error(number, e.into())?,
            }
        } else if let Some(rest) = content.strip_prefix("#EXT-X-KEY:") {
            self.active_key = self.parse_key(&Attributes::parse(rest))?;
        } else if let Some(rest) = content.strip_prefix("#EXT-X-MAP:") {
            self.apply_map(&Attributes::parse(rest))?;
        } else if content == "#EXT-X-DISCONTINUITY" {
            self.start_part();
        } else if content == "#EXT-X-ENDLIST" {
            self.playlist.end_list = true;
        } else if let Some(rest) = content.strip_prefix("#EXT-X-TARGETDURATION:") {
            self.playlist.target_duration =
                parse_attribute("EXT-X-TARGETDURATION", rest, "decimal number")?;
        } else if let Some(rest) = content.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            let sequence = parse_attribute("EXT-X-MEDIA-SEQUENCE", rest, "unsigned integer")?;
            self.playlist.media_sequence = sequence;
            if !self.has_segments() {
                self.next_index = sequence;
            }
        } else if let Some(rest) = content.strip_prefix("#EXT-X-DISCONTINUITY-SEQUENCE:") {
            let sequence =
                parse_attribute("EXT-X-DISCONTINUITY-SEQUENCE", rest, "unsigned integer")?;
            self.playlist.discontinuity_sequence = sequence;
            if !self.has_segments() {
                self.part.part_index = sequence;
            }
        } else if let Some(rest) = content.strip_prefix("#EXT-X-PLAYLIST-TYPE:") {
            self.playlist.playlist_type = match rest.trim() {
                "VOD" => Some(PlaylistType::Vod),
                "EVENT" => Some(PlaylistType::Event),
                other => {
                    debug!(line = number, value = other, "Unknown playlist type");
                    None
                }
            };
        } else if let Some(rest) = content.strip_prefix("#EXT-X-VERSION:") {
            self.playlist.version =
                Some(parse_attribute("EXT-X-VERSION", rest, "unsigned integer")?);
        } else if let Some(rest) = content.strip_prefix("#EXT-X-PROGRAM-DATE-TIME:") {
            self.pending_date_time = Some(rest.trim().to_string());
        } else if content == "#EXT-X-INDEPENDENT-SEGMENTS" {
            self.playlist.independent_segments = true;
        } else if content.starts_with('#') {
            trace!(line = number, tag = content, "Ignoring tag");
        } else {
            self.close_segment(number, content)?;
        }
        Ok(())
    }

    /// Strict mode propagates the error; lenient mode drops the segment the
    /// bad tag belongs to.
    fn element_error(&mut self, line: usize, error: HlsError) -> Result<(), HlsError> {
        if !self.mode.is_lenient() {
            return Err(error);
        }
        warn!(line, error = %error, "Skipping malformed segment");
        self.skip_next = true;
        Ok(())
    }

    fn parse_key(&self, attrs: &Attributes) -> Result<Option<EncryptionKey>, HlsError> {
        let method = KeyMethod::from_attribute(attrs.required("METHOD")?);
        if method.is_none() {
            return Ok(None);
        }
        let uri = attrs
            .get("URI")
            .map(|uri| resolve_uri(self.base, uri))
            .transpose()?;
        Ok(Some(EncryptionKey {
            method,
            uri,
            iv: attrs.string("IV"),
            key_format: attrs.string("KEYFORMAT"),
        }))
    }

    fn apply_map(&mut self, attrs: &Attributes) -> Result<(), HlsError> {
        let map = SegmentMap {
            uri: resolve_uri(self.base, attrs.required("URI")?)?,
            byte_range: attrs.byte_range("BYTERANGE", None)?,
            key: self.active_key.clone(),
        };

        if !self.part.segments.is_empty() {
            debug!(uri = %map.uri, "Initialization section changed inside a part");
            let next = Part::new(self.part.part_index, Some(map.clone()));
            let finished = std::mem::replace(&mut self.part, next);
            self.playlist.parts.push(finished);
        } else {
            self.part.map = Some(map.clone());
        }
        self.active_map = Some(map);
        Ok(())
    }

    fn start_part(&mut self) {
        let next = Part::new(self.part.part_index + 1, self.active_map.clone());
        let finished = std::mem::replace(&mut self.part, next);
        if !finished.segments.is_empty() {
            self.playlist.parts.push(finished);
        }
        self.pending_discontinuity = true;
    }

    fn close_segment(&mut self, line: usize, uri: &str) -> Result<(), HlsError> {
        let skip = std::mem::take(&mut self.skip_next);
        match std::mem::replace(&mut self.pending, Pending::None) {
            Pending::Segment { .. } | Pending::Skip if skip => self.drop_segment(),
            Pending::Skip => self.drop_segment(),
            Pending::Segment { duration, title } => {
                let index = self.next_index;
                let byte_range = self.pending_range.take();
                self.previous_range_end = byte_range.map(|range| range.end());

                let segment = Segment {
                    index,
                    uri: resolve_uri(self.base, uri)?,
                    duration,
                    title,
                    byte_range,
                    key: self.active_key.as_ref().map(|key| key.for_sequence(index)),
                    discontinuity: std::mem::take(&mut self.pending_discontinuity),
                    program_date_time: self.pending_date_time.take(),
                };
                trace!(index, uri = %segment.uri, "Parsed segment");
                self.part.segments.push(segment);
                self.next_index += 1;
            }
            Pending::None => {
                debug!(line, uri, "Ignoring URI without #EXTINF");
            }
        }
        Ok(())
    }

    /// Consume the next media sequence number without emitting a segment.
    fn drop_segment(&mut self) {
        self.pending_range = None;
        self.previous_range_end = None;
        self.pending_date_time = None;
        self.next_index += 1;
    }

    fn finish(mut self) -> Result<MediaPlaylist, HlsError> {
        if !self.seen_header {
            return Err(HlsError::MissingHeader);
        }
        if !self.part.segments.is_empty() {
            self.playlist.parts.push(self.part);
        }
        Ok(self.playlist)
    }
}

/// `#EXTINF:<duration>,[<title>]`
fn parse_extinf(rest: &str) -> Result<(f64, Option<String>), media_types::AttributeParseError> {
    let (duration, title) = match rest.split_once(',') {
        Some((duration, title)) => (duration, Some(title.trim())),
        None => (rest, None),
    };
    let duration = parse_attribute("EXTINF", duration, "decimal duration")?;
    let title = title.filter(|t| !t.is_empty()).map(str::to_string);
    Ok((duration, title))
}
