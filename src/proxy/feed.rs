//! Proxy list feed
//!
//! Fetches the candidate list and filters it down to usable proxies.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use crate::config::FeedConfig;
use crate::error::{RelayError, Result};
use crate::models::{FeedRecord, ProxyDescriptor};

/// Where the proxy list comes from
#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Fetch the raw feed payload
    async fn fetch(&self) -> Result<String>;

    /// Human readable origin, for logs
    fn describe(&self) -> String;
}

/// Fetches the list over HTTP(S)
pub struct HttpProxySource {
    url: Url,
    client: reqwest::Client,
}

impl HttpProxySource {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("socks-relay/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Internal(format!("HTTP client error: {}", e)))?;

        Ok(Self { url, client })
    }
}

#[async_trait]
impl ProxySource for HttpProxySource {
    async fn fetch(&self) -> Result<String> {
        let resp = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| RelayError::FeedFetch(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::FeedFetch(format!(
                "HTTP {} from {}",
                status, self.url
            )));
        }

        resp.text()
            .await
            .map_err(|e| RelayError::FeedFetch(format!("failed to read response: {}", e)))
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

/// Reads the list from a local JSON file
pub struct FileProxySource {
    path: PathBuf,
}

impl FileProxySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ProxySource for FileProxySource {
    async fn fetch(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| RelayError::FeedFetch(format!("{}: {}", self.path.display(), e)))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Build the source matching the configured URL scheme
pub fn source_from_config(config: &FeedConfig) -> Result<Arc<dyn ProxySource>> {
    match config.url.scheme() {
        "http" | "https" => Ok(Arc::new(HttpProxySource::new(
            config.url.clone(),
            config.fetch_timeout,
        )?)),
        "file" => {
            let path = config.url.to_file_path().map_err(|_| {
                RelayError::InvalidConfig(format!("FEED_URL is not a valid file path: {}", config.url))
            })?;
            Ok(Arc::new(FileProxySource::new(path)))
        }
        other => Err(RelayError::InvalidConfig(format!(
            "FEED_URL has unsupported scheme: {}",
            other
        ))),
    }
}

/// Parse a feed payload into descriptors.
///
/// The payload must be a JSON array. Entries without a usable `ip`/`port`
/// are skipped rather than failing the whole refresh.
pub fn parse_feed(payload: &str) -> Result<Vec<ProxyDescriptor>> {
    let entries: Vec<Value> =
        serde_json::from_str(payload).map_err(|e| RelayError::FeedFormat(e.to_string()))?;

    let total = entries.len();
    let proxies: Vec<ProxyDescriptor> = entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<FeedRecord>(entry).ok())
        .map(ProxyDescriptor::from)
        .filter(|p| !p.ip.is_empty())
        .collect();

    if proxies.len() < total {
        debug!(
            "Skipped {} malformed feed entries out of {}",
            total - proxies.len(),
            total
        );
    }

    Ok(proxies)
}

/// Candidate filters, applied as ping ceiling, allow-list, deny-list, then minimum age
#[derive(Debug, Clone)]
pub struct FeedFilter {
    /// Strict upper bound on reported ping
    pub max_ping_ms: u32,
    /// Empty means every country is allowed
    pub allowed_countries: Vec<String>,
    pub excluded_countries: Vec<String>,
    /// Zero disables the age filter
    pub min_age: Duration,
}

impl Default for FeedFilter {
    fn default() -> Self {
        Self {
            max_ping_ms: 300,
            allowed_countries: Vec::new(),
            excluded_countries: Vec::new(),
            min_age: Duration::ZERO,
        }
    }
}

impl FeedFilter {
    pub fn matches(&self, proxy: &ProxyDescriptor, now: DateTime<Utc>) -> bool {
        if proxy.ping_ms >= self.max_ping_ms {
            return false;
        }

        let country = proxy.country_or_default();
        if !self.allowed_countries.is_empty()
            && !self
                .allowed_countries
                .iter()
                .any(|c| c.eq_ignore_ascii_case(country))
        {
            return false;
        }

        if self
            .excluded_countries
            .iter()
            .any(|c| c.eq_ignore_ascii_case(country))
        {
            return false;
        }

        if !self.min_age.is_zero() && (proxy.age_secs(now) as u64) < self.min_age.as_secs() {
            return false;
        }

        true
    }

    #[instrument(skip(self, proxies), fields(total = proxies.len()))]
    pub fn apply(&self, proxies: Vec<ProxyDescriptor>, now: DateTime<Utc>) -> Vec<ProxyDescriptor> {
        proxies
            .into_iter()
            .filter(|p| self.matches(p, now))
            .collect()
    }
}
