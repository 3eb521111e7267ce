//! Job orchestration: fetch a [`SegmentPlan`] into per-segment files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use indicatif::ProgressStyle;
use media_types::{ByteRange, EncryptionKey};
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, instrument, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config::DownloadOpts;
use crate::decryption::cipher_for;
use crate::error::DownloadError;
use crate::fetcher::{ByteFetcher, CachedKeyFetcher, KeyFetcher};
use crate::plan::{PlannedSegment, SegmentPlan};
use crate::progress::ProgressReporter;
use crate::range::part_path;
use crate::retry::RetryPolicy;
use crate::scheduler::ConcurrencyScheduler;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentFile {
    pub index: u64,
    pub path: PathBuf,
    pub bytes: u64,
    /// Position in [`DownloadOutcome::inits`] of the section to play this
    /// file with.
    pub init: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadOutcome {
    /// One file per init section of the plan.
    pub inits: Vec<SegmentFile>,
    /// Sorted by index.
    pub files: Vec<SegmentFile>,
    /// False when the plan came from a live playlist.
    pub complete: bool,
    pub bytes: u64,
}

impl DownloadOutcome {
    /// Files in concatenation order. An init section goes ahead of every
    /// run of segments that switches to it.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        let inits = &self.inits;
        let mut current = None;
        self.files.iter().flat_map(move |file| {
            let switch = file.init.filter(|_| file.init != current);
            current = file.init;
            switch
                .and_then(|at| inits.get(at))
                .into_iter()
                .chain(std::iter::once(file))
                .map(|file| file.path.as_path())
        })
    }
}

/// What to fetch for one output file.
struct Job<'a> {
    index: u64,
    url: &'a str,
    byte_range: Option<ByteRange>,
    key: Option<&'a EncryptionKey>,
    path: PathBuf,
    init: Option<usize>,
}

pub struct SegmentDownloader {
    fetcher: Arc<dyn ByteFetcher>,
    keys: CachedKeyFetcher,
    scheduler: ConcurrencyScheduler,
    retry: RetryPolicy,
    work_dir: PathBuf,
    overwrite: bool,
    progress: Option<Arc<ProgressReporter>>,
}

impl SegmentDownloader {
    pub fn new(
        fetcher: Arc<dyn ByteFetcher>,
        keys: Arc<dyn KeyFetcher>,
        opts: &DownloadOpts,
    ) -> Self {
        Self {
            fetcher,
            keys: CachedKeyFetcher::new(keys),
            scheduler: ConcurrencyScheduler::new(opts.thread_count(), opts.launch_delay()),
            retry: opts.retry_policy(),
            work_dir: opts.work_dir().to_path_buf(),
            overwrite: opts.overwrite,
            progress: None,
        }
    }

    /// Report progress in segments; the total is set from the plan.
    pub fn with_progress(mut self, progress: Arc<ProgressReporter>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// `index` zero-padded to `width` digits, see [`SegmentPlan::index_width`].
    pub fn segment_path(&self, plan: &SegmentPlan, index: u64, width: usize) -> PathBuf {
        self.work_dir
            .join(format!("{index:0width$}.{}", plan.extension))
    }

    /// Path of the plan's `n`th init section.
    pub fn init_path(&self, plan: &SegmentPlan, n: usize) -> PathBuf {
        self.work_dir.join(format!("init-{n}.{}", plan.extension))
    }

    /// Download every segment of `plan` into the work directory.
    ///
    /// The init sections are fetched first, then the segments run through
    /// the scheduler. The first segment that fails for good cancels the rest and
    /// is returned as [`DownloadError::TaskFailed`].
    #[instrument(skip_all, fields(segments = plan.segments.len()))]
    pub async fn download(
        &self,
        plan: &SegmentPlan,
        token: &CancellationToken,
    ) -> Result<DownloadOutcome, DownloadError> {
        if !plan.complete {
            warn!("Playlist is live; downloading the segments listed so far");
        }

        fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| DownloadError::io(&self.work_dir, e))?;

        let total = (plan.segments.len() + plan.inits.len()) as u64;
        if let Some(progress) = &self.progress {
            progress.set_total(total);
        }
        let span = Span::current();
        if let Ok(style) = ProgressStyle::with_template(
            "{span_child_prefix}{spinner:.green} [{bar:30.green/white}] {pos}/{len} segments {msg}",
        ) {
            span.pb_set_style(&style.progress_chars("=> "));
        }
        span.pb_set_length(total);

        let mut inits = Vec::with_capacity(plan.inits.len());
        for (n, init) in plan.inits.iter().enumerate() {
            let job = Job {
                index: n as u64,
                url: &init.url,
                byte_range: init.byte_range,
                key: init.key.as_ref(),
                path: self.init_path(plan, n),
                init: None,
            };
            inits.push(self.fetch_job(job, token).await?);
        }

        let width = plan.index_width();
        let mut files = self
            .scheduler
            .run(plan.segments.iter(), token, |segment, linked| async move {
                let index = segment.index;
                self.fetch_segment(plan, segment, width, &linked)
                    .await
                    .map_err(|e| DownloadError::task_failed(index, e))
            })
            .await?;
        files.sort_by_key(|file| file.index);

        let bytes = inits.iter().chain(files.iter()).map(|file| file.bytes).sum();
        if let Some(progress) = &self.progress {
            progress.complete();
        }
        info!(
            segments = files.len(),
            bytes,
            complete = plan.complete,
            "Segments downloaded"
        );

        Ok(DownloadOutcome {
            inits,
            files,
            complete: plan.complete,
            bytes,
        })
    }

    async fn fetch_segment(
        &self,
        plan: &SegmentPlan,
        segment: &PlannedSegment,
        width: usize,
        token: &CancellationToken,
    ) -> Result<SegmentFile, DownloadError> {
        let job = Job {
            index: segment.index,
            url: &segment.url,
            byte_range: segment.byte_range,
            key: segment.key.as_ref(),
            path: self.segment_path(plan, segment.index, width),
            init: segment.init,
        };
        self.fetch_job(job, token).await
    }

    #[instrument(skip_all, fields(index = job.index))]
    async fn fetch_job(
        &self,
        job: Job<'_>,
        token: &CancellationToken,
    ) -> Result<SegmentFile, DownloadError> {
        if !self.overwrite
            && let Ok(meta) = fs::metadata(&job.path).await
            && meta.len() > 0
        {
            debug!(path = %job.path.display(), "Reusing existing segment file");
            self.advance();
            return Ok(SegmentFile {
                index: job.index,
                path: job.path,
                bytes: meta.len(),
                init: job.init,
            });
        }

        let tmp = part_path(&job.path);
        let bytes = self
            .retry
            .run(token, |attempt, last_error| {
                if let Some(err) = last_error {
                    debug!(attempt, error = %err, "Retrying segment");
                }
                self.fetch_to_file(&job, &tmp)
            })
            .await?;

        fs::rename(&tmp, &job.path)
            .await
            .map_err(|e| DownloadError::io(&job.path, e))?;
        self.advance();

        Ok(SegmentFile {
            index: job.index,
            path: job.path,
            bytes,
            init: job.init,
        })
    }

    /// One attempt: fetch, decrypt and write `job` to `tmp`.
    async fn fetch_to_file(&self, job: &Job<'_>, tmp: &Path) -> Result<u64, DownloadError> {
        let mut cipher = cipher_for(job.key, &self.keys).await?;
        let response = self.fetcher.fetch(job.url, job.byte_range).await?;
        if job.byte_range.is_some() && !response.is_partial() {
            return Err(DownloadError::range_unsupported(
                job.url,
                format!("server answered {} to a range request", response.status),
            ));
        }

        let mut file = fs::File::create(tmp)
            .await
            .map_err(|e| DownloadError::io(tmp, e))?;
        let mut received = 0u64;
        let mut written = 0u64;
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            let plain = cipher.update(chunk)?;
            file.write_all(&plain)
                .await
                .map_err(|e| DownloadError::io(tmp, e))?;
            written += plain.len() as u64;
        }

        if let Some(expected) = response.content_length
            && received < expected
        {
            return Err(DownloadError::Truncated {
                url: job.url.to_string(),
                expected,
                received,
            });
        }

        let tail = cipher.finish()?;
        file.write_all(&tail)
            .await
            .map_err(|e| DownloadError::io(tmp, e))?;
        file.flush().await.map_err(|e| DownloadError::io(tmp, e))?;
        written += tail.len() as u64;

        Ok(written)
    }

    fn advance(&self) {
        Span::current().pb_inc(1);
        if let Some(progress) = &self.progress {
            progress.advance(1);
        }
    }
}

/// Concatenate `outcome`'s files into `output` in the order of
/// [`DownloadOutcome::paths`]. Only bytes are joined; no remuxing happens.
pub async fn merge_segments(outcome: &DownloadOutcome, output: &Path) -> Result<u64, DownloadError> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;
    }

    let part = part_path(output);
    let mut writer = fs::File::create(&part)
        .await
        .map_err(|e| DownloadError::io(&part, e))?;
    let mut total = 0u64;
    for path in outcome.paths() {
        let mut reader = fs::File::open(path)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        total += tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
    }
    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(&part, e))?;
    drop(writer);

    fs::rename(&part, output)
        .await
        .map_err(|e| DownloadError::io(output, e))?;
    info!(output = %output.display(), bytes = total, "Merged segments");
    Ok(total)
}
