//! Single-resource download split into concurrent byte ranges.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use media_types::ByteRange;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, instrument, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config::DownloadOpts;
use crate::error::DownloadError;
use crate::fetcher::{ByteFetcher, ResourceInfo};
use crate::progress::ProgressReporter;
use crate::retry::RetryPolicy;
use crate::scheduler::ConcurrencyScheduler;

/// Split `length` bytes into `threads` contiguous ranges. The last range
/// absorbs the remainder; fewer ranges are produced when there are fewer
/// bytes than threads.
pub fn compute_ranges(length: u64, threads: usize) -> Vec<ByteRange> {
    if length == 0 {
        return Vec::new();
    }
    let threads = (threads.max(1) as u64).min(length);
    let block = length / threads;

    (0..threads)
        .map(|i| {
            let offset = i * block;
            let end = if i == threads - 1 { length } else { offset + block };
            ByteRange::new(offset, end - offset)
        })
        .collect()
}

/// Path of the in-progress file for `output`.
pub fn part_path(output: &Path) -> PathBuf {
    let mut name = OsString::from(output.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeOutcome {
    pub path: PathBuf,
    pub bytes: u64,
    /// Whether the resource was fetched as parallel ranges.
    pub ranged: bool,
    /// Whether an existing output was kept instead of downloading.
    pub reused: bool,
}

pub struct RangeDownloader {
    fetcher: Arc<dyn ByteFetcher>,
    scheduler: ConcurrencyScheduler,
    retry: RetryPolicy,
    threads: usize,
    overwrite: bool,
    progress: Option<Arc<ProgressReporter>>,
}

impl RangeDownloader {
    pub fn new(fetcher: Arc<dyn ByteFetcher>, opts: &DownloadOpts) -> Self {
        Self {
            fetcher,
            scheduler: ConcurrencyScheduler::new(opts.thread_count(), opts.launch_delay()),
            retry: opts.retry_policy(),
            threads: opts.thread_count(),
            overwrite: opts.overwrite,
            progress: None,
        }
    }

    /// Report progress in bytes; the total is set from the probe.
    pub fn with_progress(mut self, progress: Arc<ProgressReporter>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Download `url` into `output`.
    ///
    /// Data is written to `<output>.part` and renamed into place once every
    /// byte arrived. When the download fails the `.part` file is left on
    /// disk for inspection; a later run overwrites it.
    #[instrument(skip(self, output, token), fields(output = %output.display()))]
    pub async fn download(
        &self,
        url: &str,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<RangeOutcome, DownloadError> {
        if !self.overwrite
            && let Ok(meta) = fs::metadata(output).await
            && meta.len() > 0
        {
            info!("Output exists, skipping download");
            return Ok(RangeOutcome {
                path: output.to_path_buf(),
                bytes: meta.len(),
                ranged: false,
                reused: true,
            });
        }

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        let info = self
            .retry
            .run(token, |_, _| self.fetcher.probe(url))
            .await?;
        let part = part_path(output);

        let (bytes, ranged) = match info {
            ResourceInfo {
                content_length: Some(length),
                accepts_ranges: true,
            } if length > 0 => match self.download_ranges(url, &part, length, token).await {
                Ok(bytes) => (bytes, true),
                Err(DownloadError::RangeUnsupported { reason, .. }) => {
                    warn!(reason = %reason, "Range requests refused, downloading sequentially");
                    (self.download_sequential(url, &part, token).await?, false)
                }
                Err(err) => return Err(err),
            },
            _ => {
                debug!(?info, "Ranges unavailable, downloading sequentially");
                (self.download_sequential(url, &part, token).await?, false)
            }
        };

        fs::rename(&part, output)
            .await
            .map_err(|e| DownloadError::io(output, e))?;
        if let Some(progress) = &self.progress {
            progress.complete();
        }
        info!(bytes, ranged, "Download complete");

        Ok(RangeOutcome {
            path: output.to_path_buf(),
            bytes,
            ranged,
            reused: false,
        })
    }

    async fn download_ranges(
        &self,
        url: &str,
        part: &Path,
        length: u64,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let file = fs::File::create(part)
            .await
            .map_err(|e| DownloadError::io(part, e))?;
        file.set_len(length)
            .await
            .map_err(|e| DownloadError::io(part, e))?;
        drop(file);

        if let Some(progress) = &self.progress {
            progress.set_total(length);
        }
        Span::current().pb_set_length(length);

        let ranges = compute_ranges(length, self.threads);
        debug!(ranges = ranges.len(), length, "Splitting download");

        self.scheduler
            .run(ranges.into_iter().enumerate(), token, |(index, range), linked| async move {
                self.fetch_range(url, part, index, range, &linked)
                    .await
                    .map_err(|e| match e {
                        e @ DownloadError::RangeUnsupported { .. } => e,
                        e => DownloadError::task_failed(index as u64, e),
                    })
            })
            .await?;

        Ok(length)
    }

    #[instrument(skip(self, url, part, token), fields(offset = range.offset, length = range.length))]
    async fn fetch_range(
        &self,
        url: &str,
        part: &Path,
        index: usize,
        range: ByteRange,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        // Highest byte count reached by any attempt, so retries do not
        // report progress twice.
        let high_water = AtomicU64::new(0);

        self.retry
            .run(token, |attempt, _| {
                let high_water = &high_water;
                async move {
                    let response = self.fetcher.fetch(url, Some(range)).await?;
                    if !response.is_partial() {
                        return Err(DownloadError::range_unsupported(
                            url,
                            format!("server answered {} to a range request", response.status),
                        ));
                    }

                    let mut file = OpenOptions::new()
                        .write(true)
                        .open(part)
                        .await
                        .map_err(|e| DownloadError::io(part, e))?;
                    file.seek(std::io::SeekFrom::Start(range.offset))
                        .await
                        .map_err(|e| DownloadError::io(part, e))?;

                    let mut received = 0u64;
                    let mut body = response.body;
                    while let Some(chunk) = body.next().await {
                        let chunk = chunk?;
                        let take = (range.length - received).min(chunk.len() as u64) as usize;
                        file.write_all(&chunk[..take])
                            .await
                            .map_err(|e| DownloadError::io(part, e))?;
                        received += take as u64;
                        self.record(high_water, received);
                        if received == range.length {
                            break;
                        }
                    }
                    file.flush().await.map_err(|e| DownloadError::io(part, e))?;

                    if received < range.length {
                        return Err(DownloadError::Truncated {
                            url: url.to_string(),
                            expected: range.length,
                            received,
                        });
                    }
                    debug!(index, attempt, "Range complete");
                    Ok(())
                }
            })
            .await
    }

    async fn download_sequential(
        &self,
        url: &str,
        part: &Path,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let high_water = AtomicU64::new(0);

        self.retry
            .run(token, |_, _| {
                let high_water = &high_water;
                async move {
                    let response = self.fetcher.fetch(url, None).await?;
                    if let Some(length) = response.content_length {
                        if let Some(progress) = &self.progress {
                            progress.set_total(length);
                        }
                        Span::current().pb_set_length(length);
                    }

                    let mut file = fs::File::create(part)
                        .await
                        .map_err(|e| DownloadError::io(part, e))?;
                    let mut received = 0u64;
                    let mut body = response.body;
                    while let Some(chunk) = body.next().await {
                        let chunk = chunk?;
                        file.write_all(&chunk)
                            .await
                            .map_err(|e| DownloadError::io(part, e))?;
                        received += chunk.len() as u64;
                        self.record(high_water, received);
                    }
                    file.flush().await.map_err(|e| DownloadError::io(part, e))?;

                    if let Some(expected) = response.content_length
                        && received < expected
                    {
                        return Err(DownloadError::Truncated {
                            url: url.to_string(),
                            expected,
                            received,
                        });
                    }
                    Ok(received)
                }
            })
            .await
    }

    fn record(&self, high_water: &AtomicU64, received: u64) {
        let previous = high_water.fetch_max(received, Ordering::SeqCst);
        if received > previous {
            let delta = received - previous;
            Span::current().pb_inc(delta);
            if let Some(progress) = &self.progress {
                progress.advance(delta);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressSink;
    use crate::test_support::MemoryFetcher;
    use reqwest::StatusCode;

    const URL: &str = "https://e/video.mp4";

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn opts(threads: usize) -> DownloadOpts {
        DownloadOpts {
            thread_count: threads,
            retry_wait_ms: 1,
            ..Default::default()
        }
    }

    #[test]
    fn ranges_cover_the_resource_exactly() {
        let ranges = compute_ranges(1000, 3);
        assert_eq!(
            ranges,
            vec![
                ByteRange::new(0, 333),
                ByteRange::new(333, 333),
                ByteRange::new(666, 334),
            ]
        );
        assert_eq!(ranges[2].last_byte(), Some(999));
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end(), pair[1].offset);
        }
    }

    #[test]
    fn tiny_resources_use_fewer_ranges() {
        assert_eq!(compute_ranges(2, 8).len(), 2);
        assert_eq!(compute_ranges(1, 1), vec![ByteRange::new(0, 1)]);
        assert!(compute_ranges(0, 4).is_empty());
    }

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/out/movie.mp4")),
            PathBuf::from("/out/movie.mp4.part")
        );
    }

    #[tokio::test]
    async fn parallel_ranges_reassemble_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(10_007);
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(URL, data.clone());

        let output = dir.path().join("video.mp4");
        let outcome = RangeDownloader::new(fetcher.clone(), &opts(4))
            .download(URL, &output, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.ranged);
        assert_eq!(outcome.bytes, 10_007);
        assert_eq!(std::fs::read(&output).unwrap(), data);
        assert!(!part_path(&output).exists());
        assert_eq!(fetcher.ranged_requests(), 4);
    }

    #[tokio::test]
    async fn transient_range_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(4096);
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(URL, data.clone());
        fetcher.fail(URL, 2, StatusCode::BAD_GATEWAY);

        let output = dir.path().join("video.mp4");
        RangeDownloader::new(fetcher.clone(), &opts(2))
            .download(URL, &output, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), data);
    }

    #[tokio::test]
    async fn falls_back_to_sequential_without_range_support() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(3000);
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(URL, data.clone());
        fetcher.disable_ranges(URL);

        let output = dir.path().join("video.mp4");
        let outcome = RangeDownloader::new(fetcher.clone(), &opts(4))
            .download(URL, &output, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.ranged);
        assert_eq!(std::fs::read(&output).unwrap(), data);
        assert_eq!(fetcher.ranged_requests(), 0);
    }

    #[tokio::test]
    async fn failure_leaves_the_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(URL, payload(2048));
        fetcher.fail(URL, u32::MAX, StatusCode::FORBIDDEN);

        let output = dir.path().join("video.mp4");
        let err = RangeDownloader::new(fetcher, &opts(2))
            .download(URL, &output, &CancellationToken::new())
            .await
            .unwrap_err();

        let DownloadError::TaskFailed { source, .. } = err else {
            panic!("expected TaskFailed, got {err:?}");
        };
        assert!(matches!(*source, DownloadError::HttpStatus { .. }));
        assert!(part_path(&output).exists());
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn existing_output_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("video.mp4");
        std::fs::write(&output, b"already here").unwrap();

        let fetcher = Arc::new(MemoryFetcher::new());
        let outcome = RangeDownloader::new(fetcher.clone(), &opts(2))
            .download(URL, &output, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.reused);
        assert_eq!(fetcher.requests(), 0);
    }

    #[tokio::test]
    async fn progress_reaches_100() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(URL, payload(5000));

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let store = seen.clone();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |p: f64| store.lock().push(p));
        let progress = Arc::new(ProgressReporter::new(0, sink));

        RangeDownloader::new(fetcher, &opts(3))
            .with_progress(progress.clone())
            .download(URL, &dir.path().join("v.mp4"), &CancellationToken::new())
            .await
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.last(), Some(&100.0));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(progress.done(), 5000);
    }
}
