mod cli;
mod error;
mod manifest;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::Parser;
use media_types::ParseMode;
use segfetch_engine::{
    ByteFetcher, CancellationToken, ClientCache, DownloadOpts, DownloaderConfig, HttpFetcher,
    KeyFetcher, ProgressReporter, RangeDownloader, SegmentDownloader, merge_segments,
};
use tracing::{Level, debug, error, info, warn};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use url::Url;

use crate::cli::Args;
use crate::error::{AppError, Result};
use crate::manifest::{Selection, SourceKind, Track};

/// Exit status after Ctrl-C, as shells report SIGINT.
const EXIT_CANCELLED: i32 = 130;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling downloads");
            signal_token.cancel();
        }
    });

    if let Err(e) = run(args, token).await {
        if e.is_cancelled() {
            eprintln!("Cancelled");
            process::exit(EXIT_CANCELLED);
        }
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args, token: CancellationToken) -> Result<()> {
    let url = Url::parse(&args.url)
        .map_err(|e| AppError::InvalidInput(format!("invalid URL `{}`: {e}", args.url)))?;
    let opts = download_opts(&args);
    let config = DownloaderConfig::for_job(&opts)?;
    let cache = ClientCache::new();
    let http = Arc::new(HttpFetcher::from_cache(&cache, &config)?);
    let fetcher: Arc<dyn ByteFetcher> = http.clone();
    let keys: Arc<dyn KeyFetcher> = http;

    let retry = opts.retry_policy();
    let source = manifest::probe_source(fetcher.as_ref(), url.as_str(), &retry, &token).await?;
    info!(kind = ?source.kind, url = %url, "Resolved source");

    let stem = args
        .name
        .clone()
        .unwrap_or_else(|| manifest::output_stem(&url));
    let selection = Selection {
        quality: args.quality,
        lang: args.lang.as_deref(),
        mode: if args.lenient {
            ParseMode::Lenient
        } else {
            ParseMode::Strict
        },
    };

    let tracks = match source.kind {
        SourceKind::Progressive => {
            let file_name = progressive_file_name(&url, args.name.as_deref());
            let output = opts.output_dir.join(file_name);
            let outcome = RangeDownloader::new(fetcher, &opts)
                .download(url.as_str(), &output, &token)
                .await?;
            info!(
                path = %outcome.path.display(),
                bytes = outcome.bytes,
                ranged = outcome.ranged,
                reused = outcome.reused,
                "Download complete"
            );
            return Ok(());
        }
        SourceKind::Hls => {
            manifest::hls_tracks(
                fetcher.as_ref(),
                &url,
                &source.text,
                &selection,
                &retry,
                &token,
            )
            .await?
        }
        SourceKind::Dash => {
            manifest::dash_tracks(
                fetcher.as_ref(),
                &url,
                &source.text,
                &selection,
                &retry,
                &token,
            )
            .await?
        }
    };

    if args.dump_plan {
        println!("{}", serde_json::to_string_pretty(&tracks)?);
        return Ok(());
    }

    for track in &tracks {
        download_track(
            track,
            &tracks,
            &stem,
            &opts,
            fetcher.clone(),
            keys.clone(),
            args.no_merge,
            &token,
        )
        .await?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn download_track(
    track: &Track,
    tracks: &[Track],
    stem: &str,
    opts: &DownloadOpts,
    fetcher: Arc<dyn ByteFetcher>,
    keys: Arc<dyn KeyFetcher>,
    no_merge: bool,
    token: &CancellationToken,
) -> Result<()> {
    if track.plan.segments.is_empty() {
        warn!(track = %track.name, "Track has no segments");
        return Ok(());
    }
    if !track.plan.complete {
        warn!(track = %track.name, "Playlist is still live; downloading the current snapshot");
    }

    let mut track_opts = opts.clone();
    track_opts.work_dir = Some(track_work_dir(opts, stem, &track.name));

    let name = track.name.clone();
    let progress = Arc::new(ProgressReporter::new(
        track.plan.segments.len() as u64,
        Arc::new(move |percent: f64| debug!(track = %name, percent, "Progress")),
    ));

    info!(
        track = %track.name,
        segments = track.plan.segments.len(),
        duration = track.plan.total_duration(),
        encrypted = track.plan.is_encrypted(),
        "Downloading track"
    );
    let outcome = SegmentDownloader::new(fetcher, keys, &track_opts)
        .with_progress(progress)
        .download(&track.plan, token)
        .await?;
    info!(
        track = %track.name,
        files = outcome.files.len(),
        bytes = outcome.bytes,
        "Segments downloaded"
    );

    if no_merge {
        return Ok(());
    }

    let output = opts
        .output_dir
        .join(manifest::track_file_name(stem, track, tracks.len()));
    let merged = merge_segments(&outcome, &output).await?;
    info!(path = %output.display(), bytes = merged, "Merged segments");
    Ok(())
}

fn download_opts(args: &Args) -> DownloadOpts {
    DownloadOpts {
        thread_count: args.threads,
        retry_count: (!args.retry_forever).then_some(args.retries),
        retry_wait_ms: args.retry_wait,
        output_dir: args.output_dir.clone(),
        work_dir: args.work_dir.clone(),
        overwrite: args.overwrite,
        proxy: args.proxy.clone(),
        launch_delay_ms: args.launch_delay,
        headers: args.headers.clone(),
    }
}

/// Segment files of one track go to `<work dir>/<stem>/<track>`.
fn track_work_dir(opts: &DownloadOpts, stem: &str, track: &str) -> PathBuf {
    opts.work_dir().join(stem).join(track)
}

/// Name for a progressive download: `name` plus the URL's extension when a
/// name was given, else the URL's own file name.
fn progressive_file_name(url: &Url, name: Option<&str>) -> String {
    let last = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|last| !last.is_empty());
    let extension = last
        .and_then(|last| Path::new(last).extension())
        .and_then(|ext| ext.to_str());

    match (name, last, extension) {
        (Some(name), _, Some(ext)) => format!("{name}.{ext}"),
        (Some(name), _, None) => name.to_string(),
        (None, Some(last), _) => last.to_string(),
        (None, None, _) => "output".to_string(),
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(verbose)
                .with_writer(indicatif_layer.get_stderr_writer()),
        )
        .with(indicatif_layer)
        .init();
}
