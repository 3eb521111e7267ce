//! Master (multivariant) playlist parsing.

use media_types::{AttributeParseError, ParseMode, Resolution};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::attributes::Attributes;
use crate::error::HlsError;
use crate::{Line, lines, resolve_uri};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamVariant {
    pub uri: String,
    pub bandwidth: u64,
    pub average_bandwidth: Option<u64>,
    pub resolution: Option<Resolution>,
    pub codecs: Option<String>,
    pub frame_rate: Option<f64>,
    pub audio: Option<String>,
    pub video: Option<String>,
    pub subtitles: Option<String>,
    pub closed_captions: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    Audio,
    Video,
    Subtitles,
    ClosedCaptions,
}

impl MediaType {
    fn from_attribute(value: &str) -> Result<Self, AttributeParseError> {
        match value {
            "AUDIO" => Ok(Self::Audio),
            "VIDEO" => Ok(Self::Video),
            "SUBTITLES" => Ok(Self::Subtitles),
            "CLOSED-CAPTIONS" => Ok(Self::ClosedCaptions),
            other => Err(AttributeParseError::new(
                "TYPE",
                other,
                "AUDIO, VIDEO, SUBTITLES or CLOSED-CAPTIONS",
            )),
        }
    }
}

/// An `#EXT-X-MEDIA` alternate rendition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateRendition {
    pub media_type: MediaType,
    pub group_id: String,
    pub language: Option<String>,
    pub name: String,
    pub uri: Option<String>,
    pub autoselect: bool,
    pub default: bool,
    pub forced: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterPlaylist {
    pub version: Option<u64>,
    pub independent_segments: bool,
    pub variants: Vec<StreamVariant>,
    pub i_frame_variants: Vec<StreamVariant>,
    pub renditions: Vec<AlternateRendition>,
}

enum PendingVariant {
    Idle,
    Waiting(StreamVariant),
    Skipping,
}

impl MasterPlaylist {
    /// Parse a master playlist, resolving every URI against `base`.
    pub fn parse(text: &str, base: &Url, mode: ParseMode) -> Result<Self, HlsError> {
        let mut playlist = MasterPlaylist::default();
        let mut seen_header = false;
        let mut pending = PendingVariant::Idle;

        for Line { number, content } in lines(text) {
            if content == "#EXTM3U" {
                seen_header = true;
                continue;
            }

            if let Some(rest) = content.strip_prefix("#EXT-X-STREAM-INF:") {
                pending = match variant_from_attributes(&Attributes::parse(rest), None, base) {
                    Ok(variant) => PendingVariant::Waiting(variant),
                    Err(e) if mode.is_lenient() && e.is_element_local() => {
                        warn!(line = number, error = %e, "Skipping malformed variant stream");
                        PendingVariant::Skipping
                    }
                    Err(e) => return Err(e),
                };
            } else if let Some(rest) = content.strip_prefix("#EXT-X-I-FRAME-STREAM-INF:") {
                let attrs = Attributes::parse(rest);
                let uri = attrs.required("URI").map_err(HlsError::from);
                match uri.and_then(|uri| variant_from_attributes(&attrs, Some(uri), base)) {
                    Ok(variant) => playlist.i_frame_variants.push(variant),
                    Err(e) if mode.is_lenient() && e.is_element_local() => {
                        warn!(line = number, error = %e, "Skipping malformed I-frame stream");
                    }
                    Err(e) => return Err(e),
                }
            } else if let Some(rest) = content.strip_prefix("#EXT-X-MEDIA:") {
                match rendition_from_attributes(&Attributes::parse(rest), base) {
                    Ok(rendition) => playlist.renditions.push(rendition),
                    Err(e) if mode.is_lenient() && e.is_element_local() => {
                        warn!(line = number, error = %e, "Skipping malformed rendition");
                    }
                    Err(e) => return Err(e),
                }
            } else if let Some(rest) = content.strip_prefix("#EXT-X-VERSION:") {
                playlist.version = Some(media_types::parse_attribute(
                    "EXT-X-VERSION",
                    rest,
                    "unsigned integer",
                )?);
            } else if content == "#EXT-X-INDEPENDENT-SEGMENTS" {
                playlist.independent_segments = true;
            } else if content.starts_with('#') {
                continue;
            } else {
                match std::mem::replace(&mut pending, PendingVariant::Idle) {
                    PendingVariant::Waiting(mut variant) => {
                        variant.uri = resolve_uri(base, content)?;
                        debug!(uri = %variant.uri, bandwidth = variant.bandwidth, "Parsed variant");
                        playlist.variants.push(variant);
                    }
                    PendingVariant::Skipping => {}
                    PendingVariant::Idle => {
                        debug!(line = number, "Ignoring URI line without #EXT-X-STREAM-INF");
                    }
                }
            }
        }

        if !seen_header {
            return Err(HlsError::MissingHeader);
        }
        Ok(playlist)
    }

    /// Variant with the highest bandwidth; ties go to the larger resolution.
    pub fn best_variant(&self) -> Option<&StreamVariant> {
        self.variants
            .iter()
            .max_by_key(|v| (v.bandwidth, v.resolution.map(|r| r.pixels()).unwrap_or(0)))
    }

    pub fn worst_variant(&self) -> Option<&StreamVariant> {
        self.variants.iter().min_by_key(|v| v.bandwidth)
    }

    /// Highest-bandwidth variant not exceeding `max_bandwidth`, falling back
    /// to the lowest one when every variant is above the limit.
    pub fn variant_for_bandwidth(&self, max_bandwidth: u64) -> Option<&StreamVariant> {
        self.variants
            .iter()
            .filter(|v| v.bandwidth <= max_bandwidth)
            .max_by_key(|v| v.bandwidth)
            .or_else(|| self.worst_variant())
    }

    /// Renditions belonging to `group_id` of the given type.
    pub fn renditions_in_group<'a>(
        &'a self,
        media_type: MediaType,
        group_id: &'a str,
    ) -> impl Iterator<Item = &'a AlternateRendition> + 'a {
        self.renditions
            .iter()
            .filter(move |r| r.media_type == media_type && r.group_id == group_id)
    }
}

fn variant_from_attributes(
    attrs: &Attributes,
    uri: Option<&str>,
    base: &Url,
) -> Result<StreamVariant, HlsError> {
    let bandwidth = attrs
        .u64("BANDWIDTH")?
        .ok_or_else(|| AttributeParseError::new("BANDWIDTH", "", "unsigned integer"))?;
    let uri = uri.map(|uri| resolve_uri(base, uri)).transpose()?;

    Ok(StreamVariant {
        uri: uri.unwrap_or_default(),
        bandwidth,
        average_bandwidth: attrs.u64("AVERAGE-BANDWIDTH")?,
        resolution: attrs.resolution("RESOLUTION")?,
        codecs: attrs.string("CODECS"),
        frame_rate: attrs.f64("FRAME-RATE")?,
        audio: attrs.string("AUDIO"),
        video: attrs.string("VIDEO"),
        subtitles: attrs.string("SUBTITLES"),
        closed_captions: attrs
            .get("CLOSED-CAPTIONS")
            .filter(|cc| *cc != "NONE")
            .map(str::to_string),
    })
}

fn rendition_from_attributes(
    attrs: &Attributes,
    base: &Url,
) -> Result<AlternateRendition, HlsError> {
    let media_type = MediaType::from_attribute(attrs.required("TYPE")?)?;
    let uri = attrs
        .get("URI")
        .map(|uri| resolve_uri(base, uri))
        .transpose()?;

    Ok(AlternateRendition {
        media_type,
        group_id: attrs.required("GROUP-ID")?.to_string(),
        language: attrs.string("LANGUAGE"),
        name: attrs.string("NAME").unwrap_or_default(),
        uri,
        autoselect: attrs.flag("AUTOSELECT"),
        default: attrs.flag("DEFAULT"),
        forced: attrs.flag("FORCED"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/a/master.m3u8").unwrap()
    }

    const TWO_VARIANTS: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=640x360,CODECS=\"avc1.4d401e,mp4a.40.2\"\n\
low.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720,FRAME-RATE=29.970\n\
high.m3u8\n";

    #[test]
    fn variants_are_resolved_against_base() {
        let playlist = MasterPlaylist::parse(TWO_VARIANTS, &base(), ParseMode::Strict).unwrap();
        assert_eq!(playlist.variants.len(), 2);

        assert_eq!(playlist.variants[0].bandwidth, 1_000_000);
        assert_eq!(playlist.variants[0].uri, "https://example.com/a/low.m3u8");
        assert_eq!(
            playlist.variants[0].codecs.as_deref(),
            Some("avc1.4d401e,mp4a.40.2")
        );

        assert_eq!(playlist.variants[1].bandwidth, 2_000_000);
        assert_eq!(playlist.variants[1].uri, "https://example.com/a/high.m3u8");
        assert_eq!(
            playlist.variants[1].resolution,
            Some(Resolution::new(1280, 720))
        );
        assert_eq!(playlist.variants[1].frame_rate, Some(29.97));
    }

    #[test]
    fn missing_header_is_fatal() {
        let err = MasterPlaylist::parse(
            "#EXT-X-STREAM-INF:BANDWIDTH=1\nlow.m3u8\n",
            &base(),
            ParseMode::Strict,
        )
        .unwrap_err();
        assert_eq!(err, HlsError::MissingHeader);
    }

    #[test]
    fn media_renditions_carry_flags() {
        let text = "#EXTM3U\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",LANGUAGE=\"en\",NAME=\"English\",AUTOSELECT=YES,DEFAULT=YES,URI=\"audio/en.m3u8\"\n\
#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",NAME=\"Deutsch\",LANGUAGE=\"de\",FORCED=NO,URI=\"https://cdn.example.com/de.m3u8\"\n\
#EXT-X-STREAM-INF:BANDWIDTH=500000,AUDIO=\"aac\",SUBTITLES=\"subs\"\n\
v.m3u8\n";
        let playlist = MasterPlaylist::parse(text, &base(), ParseMode::Strict).unwrap();
        assert_eq!(playlist.renditions.len(), 2);

        let audio = &playlist.renditions[0];
        assert_eq!(audio.media_type, MediaType::Audio);
        assert_eq!(audio.group_id, "aac");
        assert!(audio.autoselect && audio.default && !audio.forced);
        assert_eq!(
            audio.uri.as_deref(),
            Some("https://example.com/a/audio/en.m3u8")
        );

        let subs = &playlist.renditions[1];
        assert_eq!(subs.media_type, MediaType::Subtitles);
        assert_eq!(subs.uri.as_deref(), Some("https://cdn.example.com/de.m3u8"));
        assert!(!subs.forced);

        assert_eq!(playlist.variants[0].audio.as_deref(), Some("aac"));
        assert_eq!(
            playlist
                .renditions_in_group(MediaType::Audio, "aac")
                .count(),
            1
        );
    }

    #[test]
    fn strict_mode_rejects_bad_bandwidth() {
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=lots\nlow.m3u8\n";
        let err = MasterPlaylist::parse(text, &base(), ParseMode::Strict).unwrap_err();
        match err {
            HlsError::Attribute(attr) => {
                assert_eq!(attr.name, "BANDWIDTH");
                assert_eq!(attr.value, "lots");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn lenient_mode_skips_only_the_bad_variant() {
        let text = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=lots\n\
broken.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000\n\
ok.m3u8\n";
        let playlist = MasterPlaylist::parse(text, &base(), ParseMode::Lenient).unwrap();
        assert_eq!(playlist.variants.len(), 1);
        assert_eq!(playlist.variants[0].uri, "https://example.com/a/ok.m3u8");
    }

    #[test]
    fn variant_selection_helpers() {
        let playlist = MasterPlaylist::parse(TWO_VARIANTS, &base(), ParseMode::Strict).unwrap();
        assert_eq!(playlist.best_variant().unwrap().bandwidth, 2_000_000);
        assert_eq!(playlist.worst_variant().unwrap().bandwidth, 1_000_000);
        assert_eq!(
            playlist.variant_for_bandwidth(1_500_000).unwrap().bandwidth,
            1_000_000
        );
        assert_eq!(playlist.variant_for_bandwidth(10).unwrap().bandwidth, 1_000_000);
    }

    #[test]
    fn i_frame_streams_use_uri_attribute() {
        let text = "#EXTM3U\n\
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=86000,URI=\"iframe/low.m3u8\"\n";
        let playlist = MasterPlaylist::parse(text, &base(), ParseMode::Strict).unwrap();
        assert!(playlist.variants.is_empty());
        assert_eq!(
            playlist.i_frame_variants[0].uri,
            "https://example.com/a/iframe/low.m3u8"
        );
    }
}
