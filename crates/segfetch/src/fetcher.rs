//! Transport collaborators. The engine only consumes these traits; the
//! reqwest-backed [`HttpFetcher`] is the production implementation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use media_types::ByteRange;
use moka::future::Cache;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, RANGE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument, trace};

use crate::client::ClientCache;
use crate::config::DownloaderConfig;
use crate::error::DownloadError;

pub type ByteStream = BoxStream<'static, Result<Bytes, DownloadError>>;

/// A successful response: status is 2xx.
pub struct FetchResponse {
    pub status: StatusCode,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl FetchResponse {
    /// Whether the server honoured a byte-range request.
    pub fn is_partial(&self) -> bool {
        self.status == StatusCode::PARTIAL_CONTENT
    }
}

/// What a probe learned about a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceInfo {
    pub content_length: Option<u64>,
    pub accepts_ranges: bool,
}

#[async_trait]
pub trait ByteFetcher: Send + Sync {
    /// GET `url`, optionally restricted to `range`. Non-2xx statuses are
    /// returned as [`DownloadError::HttpStatus`].
    async fn fetch(&self, url: &str, range: Option<ByteRange>)
    -> Result<FetchResponse, DownloadError>;

    /// Learn the resource length and whether byte ranges are served.
    async fn probe(&self, url: &str) -> Result<ResourceInfo, DownloadError>;
}

#[async_trait]
pub trait KeyFetcher: Send + Sync {
    /// Raw key bytes for `uri`.
    async fn fetch_key(&self, uri: &str) -> Result<Bytes, DownloadError>;
}

/// Fetch a whole (ranged) body into memory, failing on short reads.
pub async fn fetch_all(
    fetcher: &dyn ByteFetcher,
    url: &str,
    range: Option<ByteRange>,
) -> Result<Bytes, DownloadError> {
    let response = fetcher.fetch(url, range).await?;
    if range.is_some() && !response.is_partial() {
        return Err(DownloadError::range_unsupported(
            url,
            format!("expected 206 for a range request, got {}", response.status),
        ));
    }

    let expected = response.content_length;
    let mut buffer = BytesMut::with_capacity(expected.unwrap_or(0).min(64 * 1024 * 1024) as usize);
    let mut body = response.body;
    while let Some(chunk) = body.next().await {
        buffer.extend_from_slice(&chunk?);
    }

    let received = buffer.len() as u64;
    if let Some(expected) = expected
        && received < expected
    {
        return Err(DownloadError::Truncated {
            url: url.to_string(),
            expected,
            received,
        });
    }
    Ok(buffer.freeze())
}

/// reqwest-backed fetcher. `headers` are attached to every request, so a
/// shared client never carries one job's headers into another.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    headers: HeaderMap,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Use the cached client for `config`'s transport settings and send
    /// `config`'s headers with each request.
    pub fn from_cache(cache: &ClientCache, config: &DownloaderConfig) -> Result<Self, DownloadError> {
        let client = cache.client_for(config)?;
        Ok(Self::new(client).with_headers(config.request_headers()))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url).headers(self.headers.clone())
    }

    /// GET a text document such as a playlist or manifest.
    pub async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        let response = self.request(Method::GET, url).send().await?;
        let response = check_status(response, url, "manifest")?;
        Ok(response.text().await?)
    }

    async fn probe_with_range_get(&self, url: &str) -> Result<ResourceInfo, DownloadError> {
        let response = self
            .request(Method::GET, url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await?;
        let response = check_status(response, url, "probe")?;

        if response.status() == StatusCode::PARTIAL_CONTENT {
            let total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total);
            return Ok(ResourceInfo {
                content_length: total,
                accepts_ranges: total.is_some(),
            });
        }

        Ok(ResourceInfo {
            content_length: header_content_length(&response),
            accepts_ranges: false,
        })
    }
}

#[async_trait]
impl ByteFetcher for HttpFetcher {
    #[instrument(skip(self), level = "debug")]
    async fn fetch(
        &self,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<FetchResponse, DownloadError> {
        let mut request = self.request(Method::GET, url);
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }

        let response = check_status(request.send().await?, url, "fetch")?;
        let status = response.status();
        let content_length = response.content_length();
        trace!(%status, ?content_length, "Response received");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(DownloadError::from))
            .boxed();

        Ok(FetchResponse {
            status,
            content_length,
            body,
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn probe(&self, url: &str) -> Result<ResourceInfo, DownloadError> {
        // Some servers reject HEAD or omit the headers on it.
        let head = match self.request(Method::HEAD, url).send().await {
            Ok(response) if response.status().is_success() => Some(response),
            Ok(response) => {
                debug!(status = %response.status(), "HEAD rejected, probing with a range GET");
                None
            }
            Err(e) => {
                debug!(error = %e, "HEAD failed, probing with a range GET");
                None
            }
        };

        if let Some(response) = head {
            let content_length = header_content_length(&response);
            let accepts_ranges = response
                .headers()
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
            if content_length.is_some() && accepts_ranges {
                return Ok(ResourceInfo {
                    content_length,
                    accepts_ranges,
                });
            }
        }

        self.probe_with_range_get(url).await
    }
}

#[async_trait]
impl KeyFetcher for HttpFetcher {
    async fn fetch_key(&self, uri: &str) -> Result<Bytes, DownloadError> {
        fetch_all(self, uri, None)
            .await
            .map_err(|e| DownloadError::KeyFetch {
                uri: uri.to_string(),
                reason: e.to_string(),
                retryable: e.is_retryable(),
            })
    }
}

/// Fetches each key URI once; concurrent requests for the same URI share
/// one fetch. Keys must be 16 bytes.
#[derive(Clone)]
pub struct CachedKeyFetcher {
    inner: Arc<dyn KeyFetcher>,
    cache: Cache<String, Bytes>,
}

impl CachedKeyFetcher {
    pub const AES_128_KEY_LEN: usize = 16;

    pub fn new(inner: Arc<dyn KeyFetcher>) -> Self {
        Self {
            inner,
            cache: Cache::builder().max_capacity(256).build(),
        }
    }
}

#[async_trait]
impl KeyFetcher for CachedKeyFetcher {
    async fn fetch_key(&self, uri: &str) -> Result<Bytes, DownloadError> {
        let inner = self.inner.clone();
        self.cache
            .try_get_with(uri.to_string(), async move {
                let key = inner.fetch_key(uri).await?;
                if key.len() != CachedKeyFetcher::AES_128_KEY_LEN {
                    return Err(DownloadError::decryption(format!(
                        "key from {uri} has {} bytes, expected {}",
                        key.len(),
                        CachedKeyFetcher::AES_128_KEY_LEN
                    )));
                }
                debug!(uri, "Fetched decryption key");
                Ok(key)
            })
            .await
            .map_err(|shared: Arc<DownloadError>| {
                Arc::try_unwrap(shared).unwrap_or_else(|shared| match &*shared {
                    DownloadError::Decryption { reason } => DownloadError::decryption(reason.clone()),
                    other => DownloadError::KeyFetch {
                        uri: uri.to_string(),
                        reason: other.to_string(),
                        retryable: other.is_retryable(),
                    },
                })
            })
    }
}

fn check_status(
    response: Response,
    url: &str,
    operation: &'static str,
) -> Result<Response, DownloadError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(DownloadError::http_status(response.status(), url, operation))
    }
}

// `Response::content_length` reports the body size hint, which is zero for
// HEAD responses.
fn header_content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Total length from `Content-Range: bytes 0-0/12345`. `*` means unknown.
pub(crate) fn parse_content_range_total(value: &str) -> Option<u64> {
    let (unit, rest) = value.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (_, total) = rest.split_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryFetcher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingKeys {
        calls: AtomicUsize,
        key: Bytes,
    }

    #[async_trait]
    impl KeyFetcher for CountingKeys {
        async fn fetch_key(&self, _uri: &str) -> Result<Bytes, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.key.clone())
        }
    }

    #[test]
    fn content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("items 0-0/5"), None);
    }

    #[tokio::test]
    async fn keys_are_fetched_once_per_uri() {
        let inner = Arc::new(CountingKeys {
            calls: AtomicUsize::new(0),
            key: Bytes::from_static(&[7u8; 16]),
        });
        let fetcher = CachedKeyFetcher::new(inner.clone());

        for _ in 0..3 {
            let key = fetcher.fetch_key("https://e/key.bin").await.unwrap();
            assert_eq!(key.len(), 16);
        }
        fetcher.fetch_key("https://e/other.bin").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn short_keys_are_rejected_and_not_cached() {
        let inner = Arc::new(CountingKeys {
            calls: AtomicUsize::new(0),
            key: Bytes::from_static(b"short"),
        });
        let fetcher = CachedKeyFetcher::new(inner.clone());

        for _ in 0..2 {
            let err = fetcher.fetch_key("https://e/key.bin").await.unwrap_err();
            assert!(matches!(err, DownloadError::Decryption { .. }));
        }
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_all_detects_truncation() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("https://e/a", vec![1u8; 100]);
        fetcher.truncate("https://e/a", 60);

        let err = fetch_all(&fetcher, "https://e/a", None).await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Truncated {
                expected: 100,
                received: 60,
                ..
            }
        ));
        assert!(err.is_retryable());
    }

    /// Serve one HTTP/1.1 request on localhost and hand back its raw head.
    async fn capture_one_request() -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/index.m3u8", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .await
                .unwrap();
            String::from_utf8_lossy(&head).to_ascii_lowercase()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn jobs_sharing_a_client_send_their_own_headers() {
        use reqwest::header::{HeaderValue, REFERER};

        let cache = ClientCache::new();
        let mut site_a = DownloaderConfig {
            use_system_proxy: false,
            user_agent: "agent-a".into(),
            ..Default::default()
        };
        site_a
            .headers
            .insert(REFERER, HeaderValue::from_static("https://site-a.example/"));
        let mut site_b = DownloaderConfig {
            use_system_proxy: false,
            user_agent: "agent-b".into(),
            ..Default::default()
        };
        site_b
            .headers
            .insert(REFERER, HeaderValue::from_static("https://site-b.example/"));

        let fetcher_a = HttpFetcher::from_cache(&cache, &site_a).unwrap();
        let fetcher_b = HttpFetcher::from_cache(&cache, &site_b).unwrap();
        assert_eq!(cache.len(), 1);

        let (url, server) = capture_one_request().await;
        assert_eq!(fetcher_b.fetch_text(&url).await.unwrap(), "ok");
        let head = server.await.unwrap();
        assert!(head.contains("referer: https://site-b.example/"));
        assert!(head.contains("user-agent: agent-b"));
        assert!(!head.contains("site-a"));
        assert!(!head.contains("agent-a"));

        let (url, server) = capture_one_request().await;
        fetch_all(&fetcher_a, &url, None).await.unwrap();
        let head = server.await.unwrap();
        assert!(head.contains("referer: https://site-a.example/"));
        assert!(!head.contains("site-b"));
    }

    #[tokio::test]
    async fn fetch_all_honours_ranges() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("https://e/a", (0u8..100).collect::<Vec<_>>());

        let body = fetch_all(&fetcher, "https://e/a", Some(ByteRange::new(10, 5)))
            .await
            .unwrap();
        assert_eq!(&body[..], &[10, 11, 12, 13, 14]);
    }
}
