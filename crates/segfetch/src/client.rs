use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::{Client, ClientBuilder};
use tracing::{debug, info};

use crate::config::DownloaderConfig;
use crate::error::DownloadError;
use crate::proxy::build_proxy_from_config;

/// Create a reqwest Client with the provided configuration, including the
/// configured user agent and default headers.
pub fn create_client(config: &DownloaderConfig) -> Result<Client, DownloadError> {
    transport_builder(config)?
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .build()
        .map_err(DownloadError::from)
}

/// Client with only the connection-level settings of `config`. Headers are
/// left to the caller so one client can serve jobs with different headers.
pub fn create_shared_client(config: &DownloaderConfig) -> Result<Client, DownloadError> {
    transport_builder(config)?
        .build()
        .map_err(DownloadError::from)
}

fn transport_builder(config: &DownloaderConfig) -> Result<ClientBuilder, DownloadError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.read_timeout(config.read_timeout);
    }

    if let Some(proxy_config) = &config.proxy {
        let proxy = build_proxy_from_config(proxy_config)?;
        client_builder = client_builder.proxy(proxy);
        info!(proxy_url = %proxy_config.url, "Using explicitly configured proxy for downloads");
    } else if config.use_system_proxy {
        debug!("Using system proxy settings for downloads");
    } else {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled for downloads");
    }

    Ok(client_builder)
}

/// Everything [`create_shared_client`] reads from a config.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TransportKey {
    proxy: Option<String>,
    use_system_proxy: bool,
    timeout: Duration,
    connect_timeout: Duration,
    read_timeout: Duration,
    follow_redirects: bool,
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Duration,
}

impl TransportKey {
    fn of(config: &DownloaderConfig) -> Self {
        Self {
            proxy: config.proxy.as_ref().map(|proxy| proxy.cache_key()),
            use_system_proxy: config.proxy.is_none() && config.use_system_proxy,
            timeout: config.timeout,
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            follow_redirects: config.follow_redirects,
            pool_max_idle_per_host: config.pool_max_idle_per_host,
            pool_idle_timeout: config.pool_idle_timeout,
        }
    }
}

/// Header-free clients keyed by transport settings. Jobs sharing a proxy
/// and timeouts share a connection pool; each job's headers are sent per
/// request by [`crate::HttpFetcher`]. Owned by the caller and handed to
/// each fetcher.
#[derive(Debug, Clone, Default)]
pub struct ClientCache {
    clients: Arc<Mutex<HashMap<TransportKey, Client>>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached client for `config`'s transport settings, building
    /// it on first use. The client carries no job headers.
    pub fn client_for(&self, config: &DownloaderConfig) -> Result<Client, DownloadError> {
        let key = TransportKey::of(config);
        if let Some(client) = self.clients.lock().get(&key) {
            return Ok(client.clone());
        }

        let client = create_shared_client(config)?;
        debug!(proxy = ?key.proxy, "Built HTTP client");
        Ok(self
            .clients
            .lock()
            .entry(key)
            .or_insert(client)
            .clone())
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}
