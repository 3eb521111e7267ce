//! # segfetch-engine
//!
//! Download engine for adaptive-streaming presentations. A manifest parsed
//! by the `hls` or `dash` crates becomes a [`SegmentPlan`]; the
//! [`SegmentDownloader`] fetches the plan's segments concurrently through a
//! [`ConcurrencyScheduler`], retrying transient failures per
//! [`RetryPolicy`] and decrypting AES-128 segments with a
//! [`SegmentCipher`]. Single progressive files go through the
//! [`RangeDownloader`] instead.
//!
//! Transport is abstracted behind [`ByteFetcher`] and [`KeyFetcher`];
//! [`HttpFetcher`] is the reqwest implementation, built from a
//! [`ClientCache`] so jobs sharing a proxy share a connection pool.

pub mod client;
pub mod config;
pub mod decryption;
pub mod downloader;
pub mod error;
pub mod fetcher;
pub mod plan;
pub mod progress;
pub mod proxy;
pub mod range;
pub mod retry;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{ClientCache, create_client};
pub use config::{DownloadOpts, DownloaderConfig};
pub use decryption::{SegmentCipher, cipher_for, parse_iv};
pub use downloader::{DownloadOutcome, SegmentDownloader, SegmentFile, merge_segments};
pub use error::DownloadError;
pub use fetcher::{
    ByteFetcher, ByteStream, CachedKeyFetcher, FetchResponse, HttpFetcher, KeyFetcher,
    ResourceInfo, fetch_all,
};
pub use plan::{InitSection, PlannedSegment, SegmentPlan};
pub use progress::{ProgressReporter, ProgressSink};
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType, build_proxy_from_config};
pub use range::{RangeDownloader, RangeOutcome, compute_ranges};
pub use retry::{Backoff, RetryPolicy};
pub use scheduler::ConcurrencyScheduler;

pub use tokio_util::sync::CancellationToken;
