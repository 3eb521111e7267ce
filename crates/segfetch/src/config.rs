use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::error::DownloadError;
use crate::proxy::ProxyConfig;
use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

pub const DEFAULT_THREAD_COUNT: usize = 8;
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_RETRY_WAIT_MS: u64 = 1000;

/// HTTP client options. Jobs with the same transport settings share one
/// client, see [`crate::ClientCache`]; headers travel with each request.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Overall timeout for a request; zero disables it.
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request
    pub headers: HeaderMap,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if no proxy is configured
    pub use_system_proxy: bool,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing
    pub pool_idle_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(0),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            proxy: None,
            use_system_proxy: true,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl DownloaderConfig {
    /// Derive the HTTP configuration for a job: caller headers are merged
    /// over the defaults and the job's proxy, if any, replaces the system
    /// proxy.
    pub fn for_job(opts: &DownloadOpts) -> Result<Self, DownloadError> {
        let mut config = Self::default();
        for (name, value) in opts.header_map()?.iter() {
            config.headers.insert(name.clone(), value.clone());
        }
        if let Some(proxy) = opts.proxy.as_deref() {
            config.proxy = Some(ProxyConfig::parse(proxy)?);
            config.use_system_proxy = false;
        }
        Ok(config)
    }

    /// Headers a job attaches to each request: the configured headers plus
    /// `User-Agent`, unless the caller already set one.
    pub fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if !headers.contains_key(USER_AGENT)
            && let Ok(value) = HeaderValue::from_str(&self.user_agent)
        {
            headers.insert(USER_AGENT, value);
        }
        headers
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );
        default_headers
    }
}

/// Caller options for one download job. Immutable for the job's duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOpts {
    /// Concurrent segment or range fetches.
    pub thread_count: usize,
    /// Retries after the first attempt; `None` retries forever.
    pub retry_count: Option<u32>,
    pub retry_wait_ms: u64,
    /// Where the final output is written.
    pub output_dir: PathBuf,
    /// Where segment files are written; defaults to `output_dir`.
    pub work_dir: Option<PathBuf>,
    /// Re-download files that already exist.
    pub overwrite: bool,
    /// Proxy URL, e.g. `socks5://127.0.0.1:1080`.
    pub proxy: Option<String>,
    /// Pause between two task launches.
    pub launch_delay_ms: u64,
    /// Extra request headers as `(name, value)` pairs.
    pub headers: Vec<(String, String)>,
}

impl Default for DownloadOpts {
    fn default() -> Self {
        Self {
            thread_count: DEFAULT_THREAD_COUNT,
            retry_count: Some(DEFAULT_RETRY_COUNT),
            retry_wait_ms: DEFAULT_RETRY_WAIT_MS,
            output_dir: PathBuf::from("."),
            work_dir: None,
            overwrite: false,
            proxy: None,
            launch_delay_ms: 0,
            headers: Vec::new(),
        }
    }
}

impl DownloadOpts {
    pub fn work_dir(&self) -> &Path {
        self.work_dir.as_deref().unwrap_or(&self.output_dir)
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count.max(1)
    }

    pub fn launch_delay(&self) -> Duration {
        Duration::from_millis(self.launch_delay_ms)
    }

    /// Fixed-delay retry policy for this job.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.retry_count.map(|retries| retries.saturating_add(1)),
            Duration::from_millis(self.retry_wait_ms),
        )
    }

    pub fn header_map(&self) -> Result<HeaderMap, DownloadError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let header_name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| {
                DownloadError::configuration(format!("invalid header name `{name}`: {e}"))
            })?;
            let header_value = HeaderValue::from_str(value.trim()).map_err(|e| {
                DownloadError::configuration(format!("invalid value for header `{name}`: {e}"))
            })?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }
}
