//! Turns a user URL into the tracks to download.

use bytes::BytesMut;
use dash::{AdaptationSet, Mpd, Representation};
use futures::StreamExt;
use hls::{AlternateRendition, MasterPlaylist, MediaType, Playlist, StreamVariant};
use media_types::ParseMode;
use segfetch_engine::{
    ByteFetcher, CancellationToken, DownloadError, RetryPolicy, SegmentPlan, fetch_all,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::cli::Quality;
use crate::error::{AppError, Result};

/// Bytes inspected to tell manifests from media files.
pub const SNIFF_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Hls,
    Dash,
    /// A single media file.
    Progressive,
}

pub fn sniff(head: &[u8]) -> SourceKind {
    let text = String::from_utf8_lossy(&head[..head.len().min(SNIFF_LEN)]);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    if text.starts_with("#EXTM3U") {
        SourceKind::Hls
    } else if dash::is_mpd(text) {
        SourceKind::Dash
    } else {
        SourceKind::Progressive
    }
}

/// What the first response revealed about `url`.
#[derive(Debug)]
pub struct Source {
    pub kind: SourceKind,
    /// The whole document for manifests; empty for progressive media.
    pub text: String,
}

/// GET `url` and classify it. The body is only read to the end when it
/// turns out to be a manifest. Failed attempts are retried under `retry`.
pub async fn probe_source(
    fetcher: &dyn ByteFetcher,
    url: &str,
    retry: &RetryPolicy,
    token: &CancellationToken,
) -> Result<Source> {
    let source = retry
        .run(token, |attempt, last_error| {
            if let Some(err) = last_error {
                debug!(attempt, url, error = %err, "Retrying source request");
            }
            read_source(fetcher, url)
        })
        .await?;
    Ok(source)
}

async fn read_source(
    fetcher: &dyn ByteFetcher,
    url: &str,
) -> std::result::Result<Source, DownloadError> {
    let response = fetcher.fetch(url, None).await?;
    let mut body = response.body;
    let mut buffer = BytesMut::new();
    while buffer.len() < SNIFF_LEN {
        match body.next().await {
            Some(chunk) => buffer.extend_from_slice(&chunk?),
            None => break,
        }
    }

    let kind = sniff(&buffer);
    debug!(?kind, sniffed = buffer.len(), "Classified source");
    if kind == SourceKind::Progressive {
        return Ok(Source {
            kind,
            text: String::new(),
        });
    }

    while let Some(chunk) = body.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    let text = String::from_utf8(buffer.to_vec())
        .map_err(|e| DownloadError::manifest_format(format!("manifest is not UTF-8: {e}")))?;
    Ok(Source { kind, text })
}

async fn fetch_text(
    fetcher: &dyn ByteFetcher,
    url: &str,
    retry: &RetryPolicy,
    token: &CancellationToken,
) -> Result<String> {
    let body = retry
        .run(token, |_, _| fetch_all(fetcher, url, None))
        .await?;
    String::from_utf8(body.to_vec()).map_err(|e| {
        AppError::Download(DownloadError::manifest_format(format!(
            "playlist {url} is not UTF-8: {e}"
        )))
    })
}

/// One independently downloaded stream.
#[derive(Debug, Clone, Serialize)]
pub struct Track {
    /// `video`, `audio` or `main` for a muxed stream.
    pub name: String,
    pub bandwidth: Option<u64>,
    pub language: Option<String>,
    pub plan: SegmentPlan,
}

pub struct Selection<'a> {
    pub quality: Quality,
    pub lang: Option<&'a str>,
    pub mode: ParseMode,
}

pub fn select_variant(master: &MasterPlaylist, quality: Quality) -> Option<&StreamVariant> {
    match quality {
        Quality::Best => master.best_variant(),
        Quality::Worst => master.worst_variant(),
        Quality::MaxBandwidth(limit) => master.variant_for_bandwidth(limit),
    }
}

/// Audio rendition for `variant`'s audio group. Renditions without a URI
/// are muxed into the variant and skipped. Preference: `lang`, then
/// `DEFAULT=YES`, then the first listed.
pub fn select_audio_rendition<'a>(
    master: &'a MasterPlaylist,
    variant: &'a StreamVariant,
    lang: Option<&str>,
) -> Option<&'a AlternateRendition> {
    let group = variant.audio.as_deref()?;
    let candidates: Vec<&AlternateRendition> = master
        .renditions_in_group(MediaType::Audio, group)
        .filter(|r| r.uri.is_some())
        .collect();

    lang.and_then(|lang| {
        candidates
            .iter()
            .find(|r| language_matches(r.language.as_deref(), lang))
    })
    .or_else(|| candidates.iter().find(|r| r.default))
    .or_else(|| candidates.first())
    .copied()
}

pub fn select_representation(set: &AdaptationSet, quality: Quality) -> Option<&Representation> {
    match quality {
        Quality::Best => set.best_representation(),
        Quality::Worst => set.worst_representation(),
        Quality::MaxBandwidth(limit) => set
            .representations
            .iter()
            .filter(|rep| rep.bandwidth.unwrap_or(0) <= limit)
            .max_by_key(|rep| rep.bandwidth.unwrap_or(0))
            .or_else(|| set.worst_representation()),
    }
}

/// Video and audio adaptation sets of period `period_index`. An audio set in
/// `lang` wins over the first audio set. A period with neither kind yields
/// its first set as the only track.
pub fn select_adaptation_sets<'a>(
    mpd: &'a Mpd,
    period_index: usize,
    lang: Option<&'a str>,
) -> Vec<(&'static str, &'a AdaptationSet)> {
    let Some(period) = mpd.periods.get(period_index) else {
        return Vec::new();
    };

    let mut sets = Vec::new();
    if let Some(video) = period.adaptation_sets_matching(Some("video"), None).next() {
        sets.push(("video", video));
    }

    let audio = lang
        .and_then(|lang| {
            period
                .adaptation_sets_matching(Some("audio"), None)
                .find(|set| language_matches(set.lang.as_deref(), lang))
        })
        .or_else(|| {
            if let Some(lang) = lang {
                warn!(lang, "No audio adaptation set in the requested language");
            }
            period.adaptation_sets_matching(Some("audio"), None).next()
        });
    if let Some(audio) = audio {
        sets.push(("audio", audio));
    }

    if sets.is_empty()
        && let Some(first) = period.adaptation_sets.first()
    {
        sets.push(("main", first));
    }
    sets
}

/// Primary subtag comparison, case-insensitive: `en` matches `en-US`.
fn language_matches(candidate: Option<&str>, wanted: &str) -> bool {
    let Some(candidate) = candidate else {
        return false;
    };
    let primary = |tag: &str| {
        tag.split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase()
    };
    candidate.eq_ignore_ascii_case(wanted) || primary(candidate) == primary(wanted)
}

/// Resolve an HLS document into tracks. A master playlist contributes the
/// selected variant and, when it has a separate audio group, one audio
/// rendition. Media playlists are fetched under `retry`.
pub async fn hls_tracks(
    fetcher: &dyn ByteFetcher,
    url: &Url,
    text: &str,
    selection: &Selection<'_>,
    retry: &RetryPolicy,
    token: &CancellationToken,
) -> Result<Vec<Track>> {
    let master = match hls::parse_playlist(text, url, selection.mode)? {
        Playlist::Media(playlist) => {
            return Ok(vec![Track {
                name: "main".to_string(),
                bandwidth: None,
                language: None,
                plan: SegmentPlan::from_hls(&playlist),
            }]);
        }
        Playlist::Master(master) => master,
    };

    let variant = select_variant(&master, selection.quality)
        .ok_or_else(|| AppError::NoStream("master playlist lists no variants".to_string()))?;
    info!(
        bandwidth = variant.bandwidth,
        resolution = ?variant.resolution,
        uri = %variant.uri,
        "Selected variant"
    );

    let mut tracks = Vec::new();
    let rendition = select_audio_rendition(&master, variant, selection.lang);
    let video_name = if rendition.is_some() { "video" } else { "main" };
    tracks.push(Track {
        name: video_name.to_string(),
        bandwidth: Some(variant.bandwidth),
        language: None,
        plan: media_plan(fetcher, &variant.uri, selection.mode, retry, token).await?,
    });

    if let Some(rendition) = rendition
        && let Some(uri) = rendition.uri.as_deref()
    {
        info!(name = %rendition.name, language = ?rendition.language, "Selected audio rendition");
        tracks.push(Track {
            name: "audio".to_string(),
            bandwidth: None,
            language: rendition.language.clone(),
            plan: media_plan(fetcher, uri, selection.mode, retry, token).await?,
        });
    }
    Ok(tracks)
}

async fn media_plan(
    fetcher: &dyn ByteFetcher,
    uri: &str,
    mode: ParseMode,
    retry: &RetryPolicy,
    token: &CancellationToken,
) -> Result<SegmentPlan> {
    let base = Url::parse(uri).map_err(|e| DownloadError::invalid_url(uri, e))?;
    let text = fetch_text(fetcher, uri, retry, token).await?;
    match hls::parse_playlist(&text, &base, mode)? {
        Playlist::Media(playlist) => Ok(SegmentPlan::from_hls(&playlist)),
        Playlist::Master(_) => Err(AppError::InvalidInput(format!(
            "variant {uri} is itself a master playlist"
        ))),
    }
}

/// Resolve an MPD into one track per selected adaptation set of the first
/// period.
pub async fn dash_tracks(
    fetcher: &dyn ByteFetcher,
    url: &Url,
    text: &str,
    selection: &Selection<'_>,
    retry: &RetryPolicy,
    token: &CancellationToken,
) -> Result<Vec<Track>> {
    let mpd = dash::parse_manifest(text, url, selection.mode)?;
    if mpd.periods.len() > 1 {
        warn!(
            periods = mpd.periods.len(),
            "Manifest has several periods; only the first is downloaded"
        );
    }
    if mpd.is_dynamic() {
        warn!("Live manifest; downloading the segments available now");
    }

    let mut tracks = Vec::new();
    for (name, set) in select_adaptation_sets(&mpd, 0, selection.lang) {
        let Some(rep) = select_representation(set, selection.quality) else {
            warn!(track = name, "Adaptation set has no representations");
            continue;
        };
        info!(track = name, id = %rep.id, bandwidth = ?rep.bandwidth, "Selected representation");
        let plan = SegmentPlan::from_dash(&mpd, 0, set, rep, fetcher, retry, token).await?;
        tracks.push(Track {
            name: name.to_string(),
            bandwidth: rep.bandwidth,
            language: set.lang.clone(),
            plan,
        });
    }

    if tracks.is_empty() {
        return Err(AppError::NoStream(
            "manifest has no downloadable representation".to_string(),
        ));
    }
    Ok(tracks)
}

/// File stem for the output: the last path segment of `url` without its
/// extension, or `output`.
pub fn output_stem(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(|last| match last.rsplit_once('.') {
            Some((stem, _)) => stem,
            None => last,
        })
        .filter(|stem| !stem.is_empty())
        .map(sanitize)
        .unwrap_or_else(|| "output".to_string())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

/// Output file name for `track`. The track name is only added when there
/// is more than one track.
pub fn track_file_name(stem: &str, track: &Track, track_count: usize) -> String {
    if track_count > 1 {
        format!("{stem}.{}.{}", track.name, track.plan.extension)
    } else {
        format!("{stem}.{}", track.plan.extension)
    }
}
