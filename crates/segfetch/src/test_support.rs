//! In-memory collaborators for engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use media_types::ByteRange;
use parking_lot::Mutex;
use reqwest::StatusCode;

use crate::error::DownloadError;
use crate::fetcher::{ByteFetcher, FetchResponse, KeyFetcher, ResourceInfo};

const CHUNK: usize = 7;

struct Resource {
    data: Bytes,
    ranges: bool,
    truncate_at: Option<usize>,
    failures: u32,
    fail_status: StatusCode,
}

#[derive(Default)]
pub(crate) struct MemoryFetcher {
    resources: Mutex<HashMap<String, Resource>>,
    requests: AtomicUsize,
    ranged_requests: AtomicUsize,
}

impl MemoryFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, url: &str, data: impl Into<Bytes>) {
        self.resources.lock().insert(
            url.to_string(),
            Resource {
                data: data.into(),
                ranges: true,
                truncate_at: None,
                failures: 0,
                fail_status: StatusCode::SERVICE_UNAVAILABLE,
            },
        );
    }

    /// Serve full bodies with 200 even for range requests.
    pub(crate) fn disable_ranges(&self, url: &str) {
        if let Some(resource) = self.resources.lock().get_mut(url) {
            resource.ranges = false;
        }
    }

    /// Bodies end after `at` bytes while still announcing the full length.
    pub(crate) fn truncate(&self, url: &str, at: usize) {
        if let Some(resource) = self.resources.lock().get_mut(url) {
            resource.truncate_at = Some(at);
        }
    }

    /// Fail the next `times` requests with `status`.
    pub(crate) fn fail(&self, url: &str, times: u32, status: StatusCode) {
        if let Some(resource) = self.resources.lock().get_mut(url) {
            resource.failures = times;
            resource.fail_status = status;
        }
    }

    pub(crate) fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub(crate) fn ranged_requests(&self) -> usize {
        self.ranged_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ByteFetcher for MemoryFetcher {
    async fn fetch(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<FetchResponse, DownloadError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if range.is_some() {
            self.ranged_requests.fetch_add(1, Ordering::SeqCst);
        }

        let (status, mut body, announced) = {
            let mut resources = self.resources.lock();
            let Some(resource) = resources.get_mut(url) else {
                return Err(DownloadError::http_status(StatusCode::NOT_FOUND, url, "fetch"));
            };
            if resource.failures > 0 {
                resource.failures -= 1;
                return Err(DownloadError::http_status(resource.fail_status, url, "fetch"));
            }

            let (status, body) = match range {
                Some(range) if resource.ranges => {
                    let len = resource.data.len() as u64;
                    let start = range.offset.min(len) as usize;
                    let end = range.end().min(len) as usize;
                    (StatusCode::PARTIAL_CONTENT, resource.data.slice(start..end))
                }
                _ => (StatusCode::OK, resource.data.clone()),
            };
            let announced = body.len() as u64;
            let body = match resource.truncate_at {
                Some(at) => body.slice(..at.min(body.len())),
                None => body,
            };
            (status, body, announced)
        };

        let mut chunks = Vec::new();
        while !body.is_empty() {
            chunks.push(Ok(body.split_to(CHUNK.min(body.len()))));
        }

        Ok(FetchResponse {
            status,
            content_length: Some(announced),
            body: futures::stream::iter(chunks).boxed(),
        })
    }

    async fn probe(&self, url: &str) -> Result<ResourceInfo, DownloadError> {
        let resources = self.resources.lock();
        let resource = resources
            .get(url)
            .ok_or_else(|| DownloadError::http_status(StatusCode::NOT_FOUND, url, "probe"))?;
        Ok(ResourceInfo {
            content_length: Some(resource.data.len() as u64),
            accepts_ranges: resource.ranges,
        })
    }
}

#[async_trait]
impl KeyFetcher for MemoryFetcher {
    async fn fetch_key(&self, uri: &str) -> Result<Bytes, DownloadError> {
        crate::fetcher::fetch_all(self, uri, None).await
    }
}
