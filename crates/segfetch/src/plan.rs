//! The engine's view of what to fetch, built from either manifest format.

use dash::{AdaptationSet, ExpandedRepresentation, MediaSegments, Mpd, Representation, SegmentUrl};
use hls::MediaPlaylist;
use media_types::{ByteRange, EncryptionKey};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::DownloadError;
use crate::fetcher::{ByteFetcher, fetch_all};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitSection {
    pub url: String,
    pub byte_range: Option<ByteRange>,
    pub key: Option<EncryptionKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedSegment {
    /// Playlist index; also names the segment file.
    pub index: u64,
    pub url: String,
    pub byte_range: Option<ByteRange>,
    pub key: Option<EncryptionKey>,
    /// Seconds.
    pub duration: f64,
    pub discontinuity: bool,
    /// Position in [`SegmentPlan::inits`] of the section this segment
    /// depends on.
    pub init: Option<usize>,
}

/// Zero-padded width of segment file names below a million segments.
const MIN_INDEX_WIDTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentPlan {
    /// Distinct initialization sections, in order of first use.
    pub inits: Vec<InitSection>,
    pub segments: Vec<PlannedSegment>,
    /// False for live playlists that may still grow.
    pub complete: bool,
    /// File extension for segment files, without the dot.
    pub extension: String,
}

impl SegmentPlan {
    /// Each part's `#EXT-X-MAP` becomes an init section; a map repeated by
    /// a later part is planned once and shared.
    pub fn from_hls(playlist: &MediaPlaylist) -> Self {
        let mut inits: Vec<InitSection> = Vec::new();
        let mut segments = Vec::with_capacity(playlist.segment_count());

        for part in &playlist.parts {
            let init = part.map.as_ref().map(|map| {
                let section = InitSection {
                    url: map.uri.clone(),
                    byte_range: map.byte_range,
                    key: map.key.clone(),
                };
                match inits.iter().position(|known| *known == section) {
                    Some(at) => at,
                    None => {
                        inits.push(section);
                        inits.len() - 1
                    }
                }
            });
            segments.extend(part.segments.iter().map(|segment| PlannedSegment {
                index: segment.index,
                url: segment.uri.clone(),
                byte_range: segment.byte_range,
                key: segment.key.clone(),
                duration: segment.duration,
                discontinuity: segment.discontinuity,
                init,
            }));
        }
        if inits.len() > 1 {
            debug!(inits = inits.len(), "Playlist switches initialization sections");
        }

        let fallback = if inits.is_empty() { "ts" } else { "m4s" };
        let extension = segments
            .first()
            .and_then(|segment| url_extension(&segment.url))
            .unwrap_or_else(|| fallback.to_string());

        Self {
            inits,
            segments,
            complete: !playlist.is_live(),
            extension,
        }
    }

    /// Plan representation `rep` of `set` in period `period_index`. A
    /// representation indexed by a `sidx` box has its index range fetched
    /// through `fetcher` first.
    pub async fn from_dash(
        mpd: &Mpd,
        period_index: usize,
        set: &AdaptationSet,
        rep: &Representation,
        fetcher: &dyn ByteFetcher,
        retry: &RetryPolicy,
        token: &CancellationToken,
    ) -> Result<Self, DownloadError> {
        let expanded = dash::expand_representation(mpd, period_index, set, rep)?;
        let segments = match &expanded.media {
            MediaSegments::Listed(segments) => segments.clone(),
            MediaSegments::Indexed(indexed) => {
                let index = retry
                    .run(token, |_, _| {
                        fetch_all(fetcher, &indexed.url, Some(indexed.index_range))
                    })
                    .await?;
                debug!(url = %indexed.url, bytes = index.len(), "Fetched segment index");
                indexed.segments_from_index(&index)?
            }
        };

        let mime = rep.mime_type.as_deref().or(set.mime_type.as_deref());
        Ok(Self::from_expanded(&expanded, segments, !mpd.is_dynamic(), mime))
    }

    fn from_expanded(
        expanded: &ExpandedRepresentation,
        segments: Vec<SegmentUrl>,
        complete: bool,
        mime: Option<&str>,
    ) -> Self {
        let inits: Vec<InitSection> = expanded
            .init
            .iter()
            .map(|init| InitSection {
                url: init.url.clone(),
                byte_range: init.byte_range,
                key: None,
            })
            .collect();
        let init = (!inits.is_empty()).then_some(0);

        let segments: Vec<PlannedSegment> = segments
            .into_iter()
            .map(|segment| PlannedSegment {
                index: segment.number,
                duration: segment.duration_secs(),
                url: segment.media,
                byte_range: segment.byte_range,
                key: None,
                discontinuity: false,
                init,
            })
            .collect();

        let extension = segments
            .first()
            .and_then(|segment| url_extension(&segment.url))
            .or_else(|| mime.and_then(mime_extension).map(str::to_string))
            .unwrap_or_else(|| "m4s".to_string());

        Self {
            inits,
            segments,
            complete,
            extension,
        }
    }

    /// Digits that zero-pad every segment index to one width, so file names
    /// sort in index order.
    pub fn index_width(&self) -> usize {
        self.segments
            .iter()
            .map(|s| s.index)
            .max()
            .and_then(u64::checked_ilog10)
            .map_or(0, |digits| digits as usize + 1)
            .max(MIN_INDEX_WIDTH)
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    pub fn is_encrypted(&self) -> bool {
        self.segments
            .iter()
            .any(|s| s.key.as_ref().is_some_and(|key| !key.method.is_none()))
    }
}

fn url_extension(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let name = url.path_segments()?.next_back()?;
    let (_, ext) = name.rsplit_once('.')?;
    (!ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .then(|| ext.to_ascii_lowercase())
}

fn mime_extension(mime: &str) -> Option<&'static str> {
    match mime {
        "video/mp4" => Some("m4s"),
        "audio/mp4" => Some("m4a"),
        "video/webm" | "audio/webm" => Some("webm"),
        "text/vtt" => Some("vtt"),
        "video/mp2t" => Some("ts"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryFetcher;
    use media_types::ParseMode;
    use mp4::test_support::{make_box, make_sidx, sidx_entry};

    #[test]
    fn hls_plan_keeps_indices_keys_and_ranges() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:7\n\
            #EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n\
            #EXTINF:4.0,\n#EXT-X-BYTERANGE:1000@0\nmain.ts\n\
            #EXTINF:3.5,\n#EXT-X-BYTERANGE:1000\nmain.ts\n#EXT-X-ENDLIST\n";
        let base = Url::parse("https://e/vod/index.m3u8").unwrap();
        let playlist = MediaPlaylist::parse(text, &base, ParseMode::Strict).unwrap();

        let plan = SegmentPlan::from_hls(&playlist);
        assert!(plan.complete);
        assert_eq!(plan.extension, "ts");
        assert_eq!(plan.segments.len(), 2);
        assert_eq!(plan.segments[0].index, 7);
        assert_eq!(plan.segments[1].index, 8);
        assert_eq!(plan.segments[1].byte_range, Some(ByteRange::new(1000, 1000)));
        assert_eq!(
            plan.segments[1].key.as_ref().unwrap().iv.as_deref(),
            Some("0x00000000000000000000000000000008")
        );
        assert!(plan.is_encrypted());
        assert!((plan.total_duration() - 7.5).abs() < 1e-9);
    }

    #[test]
    fn live_hls_plan_is_incomplete() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MAP:URI=\"init.mp4\"\n\
            #EXTINF:2,\nseg\n";
        let base = Url::parse("https://e/live/index.m3u8").unwrap();
        let playlist = MediaPlaylist::parse(text, &base, ParseMode::Strict).unwrap();

        let plan = SegmentPlan::from_hls(&playlist);
        assert!(!plan.complete);
        assert_eq!(plan.extension, "m4s");
        assert_eq!(plan.inits.len(), 1);
        assert_eq!(plan.inits[0].url, "https://e/live/init.mp4");
        assert_eq!(plan.segments[0].init, Some(0));
    }

    #[test]
    fn every_part_keeps_its_own_map() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:2\n\
            #EXT-X-MAP:URI=\"a/init.mp4\"\n#EXTINF:2,\na/1.m4s\n\
            #EXT-X-DISCONTINUITY\n#EXT-X-MAP:URI=\"b/init.mp4\"\n#EXTINF:2,\nb/1.m4s\n\
            #EXT-X-DISCONTINUITY\n#EXT-X-MAP:URI=\"a/init.mp4\"\n#EXTINF:2,\na/2.m4s\n\
            #EXT-X-ENDLIST\n";
        let base = Url::parse("https://e/vod/index.m3u8").unwrap();
        let playlist = MediaPlaylist::parse(text, &base, ParseMode::Strict).unwrap();

        let plan = SegmentPlan::from_hls(&playlist);
        let inits: Vec<_> = plan.inits.iter().map(|init| init.url.as_str()).collect();
        assert_eq!(inits, ["https://e/vod/a/init.mp4", "https://e/vod/b/init.mp4"]);
        let used: Vec<_> = plan.segments.iter().map(|s| s.init).collect();
        assert_eq!(used, [Some(0), Some(1), Some(0)]);
    }

    #[test]
    fn index_width_grows_past_six_digits() {
        let text = "#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:999999\n#EXTINF:2,\na.ts\n#EXTINF:2,\nb.ts\n";
        let base = Url::parse("https://e/vod/index.m3u8").unwrap();
        let playlist = MediaPlaylist::parse(text, &base, ParseMode::Strict).unwrap();
        assert_eq!(SegmentPlan::from_hls(&playlist).index_width(), 7);

        let text = "#EXTM3U\n#EXTINF:2,\na.ts\n";
        let playlist = MediaPlaylist::parse(text, &base, ParseMode::Strict).unwrap();
        assert_eq!(SegmentPlan::from_hls(&playlist).index_width(), 6);
    }

    #[tokio::test]
    async fn dash_template_plan() {
        let xml = r#"<MPD type="static" mediaPresentationDuration="PT6S"><Period>
            <AdaptationSet mimeType="video/mp4">
              <SegmentTemplate media="v/$Number$.m4s" initialization="v/init.mp4" duration="2" startNumber="1"/>
              <Representation id="v1" bandwidth="500000"/>
            </AdaptationSet></Period></MPD>"#;
        let url = Url::parse("https://e/dash/manifest.mpd").unwrap();
        let mpd = dash::parse_manifest(xml, &url, ParseMode::Strict).unwrap();
        let set = &mpd.periods[0].adaptation_sets[0];

        let fetcher = MemoryFetcher::new();
        let plan = SegmentPlan::from_dash(
            &mpd,
            0,
            set,
            &set.representations[0],
            &fetcher,
            &RetryPolicy::none(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(plan.complete);
        assert_eq!(plan.inits[0].url, "https://e/dash/v/init.mp4");
        assert!(plan.segments.iter().all(|s| s.init == Some(0)));
        let urls: Vec<_> = plan.segments.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(
            urls,
            [
                "https://e/dash/v/1.m4s",
                "https://e/dash/v/2.m4s",
                "https://e/dash/v/3.m4s"
            ]
        );
        assert_eq!(plan.extension, "m4s");
        assert_eq!(fetcher.requests(), 0);
    }

    #[tokio::test]
    async fn dash_segment_base_fetches_the_index() {
        let sidx = make_sidx(0, 1000, 0, &[sidx_entry(300, 2000, true), sidx_entry(200, 2000, true)]);
        // 16-byte ftyp, then the sidx, then the media.
        let mut file = make_box(b"ftyp", &[0u8; 8]);
        file.extend_from_slice(&sidx);
        file.resize(16 + sidx.len() + 500, 0);

        let xml = format!(
            r#"<MPD mediaPresentationDuration="PT4S"><Period><AdaptationSet mimeType="audio/mp4">
            <Representation id="a" bandwidth="64000">
              <BaseURL>audio.mp4</BaseURL>
              <SegmentBase indexRange="16-{}"><Initialization range="0-15"/></SegmentBase>
            </Representation></AdaptationSet></Period></MPD>"#,
            16 + sidx.len() - 1
        );
        let url = Url::parse("https://e/dash/manifest.mpd").unwrap();
        let mpd = dash::parse_manifest(&xml, &url, ParseMode::Strict).unwrap();
        let set = &mpd.periods[0].adaptation_sets[0];

        let fetcher = MemoryFetcher::new();
        fetcher.insert("https://e/dash/audio.mp4", file);

        let plan = SegmentPlan::from_dash(
            &mpd,
            0,
            set,
            &set.representations[0],
            &fetcher,
            &RetryPolicy::none(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let anchor = 16 + sidx.len() as u64;
        assert_eq!(plan.inits[0].byte_range, Some(ByteRange::new(0, 16)));
        assert_eq!(plan.segments.len(), 2);
        assert_eq!(plan.segments[0].byte_range, Some(ByteRange::new(anchor, 300)));
        assert_eq!(
            plan.segments[1].byte_range,
            Some(ByteRange::new(anchor + 300, 200))
        );
        assert_eq!(plan.segments[0].duration, 2.0);
        assert_eq!(plan.extension, "mp4");
        assert_eq!(fetcher.ranged_requests(), 1);
    }

    #[test]
    fn extensions() {
        assert_eq!(url_extension("https://e/a/b.TS?x=1").as_deref(), Some("ts"));
        assert_eq!(url_extension("https://e/a/segment"), None);
        assert_eq!(mime_extension("audio/mp4"), Some("m4a"));
    }
}
