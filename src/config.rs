use crate::error::{RelayError, Result};
use crate::proxy::feed::FeedFilter;
use crate::proxy::session::SessionConfig;
use crate::proxy::upstream::UpstreamConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Default proxy list: public Telegram SOCKS5 feed
pub const DEFAULT_FEED_URL: &str =
    "https://raw.githubusercontent.com/hookzof/socks5_list/refs/heads/master/tg/socks.json";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Local SOCKS5 listener
    pub relay: RelayConfig,
    /// Upstream proxy connection bounds
    pub upstream: UpstreamConfig,
    /// Proxy list source and filters
    pub feed: FeedConfig,
    /// Periodic maintenance tasks
    pub maintenance: MaintenanceConfig,
    /// Status API
    pub status: StatusConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Port for the relay (default: 1080)
    pub port: u16,
    /// Forwarding buffer per direction in bytes
    pub buffer_size: usize,
    /// Per-step client handshake timeout
    pub client_timeout: Duration,
    /// Log every invalid request
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// `http`, `https` or `file` URL of the proxy list
    pub url: Url,
    /// Fetch timeout
    pub fetch_timeout: Duration,
    /// Strict ping ceiling in milliseconds
    pub max_ping_ms: u32,
    pub allowed_countries: Vec<String>,
    pub excluded_countries: Vec<String>,
    /// Minimum time since the proxy was added to the list
    pub min_age: Duration,
    /// How often the list is reloaded
    pub refresh_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often statistics are logged
    pub stats_interval: Duration,
    /// How often half of the blacklist is released
    pub blacklist_decay_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct StatusConfig {
    pub enabled: bool,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Port for the status API (default: 5000)
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            relay: RelayConfig {
                host: get_env_or("RELAY_HOST", "127.0.0.1"),
                port: parse_env("RELAY_PORT", "1080", "a valid port number")?,
                buffer_size: parse_nonzero("RELAY_BUFFER_SIZE", "8192")? as usize,
                client_timeout: parse_secs("RELAY_CLIENT_TIMEOUT", "10")?,
                verbose: parse_env("RELAY_VERBOSE", "false", "true or false")?,
            },
            upstream: UpstreamConfig {
                connect_timeout: parse_secs("UPSTREAM_CONNECT_TIMEOUT", "10")?,
                handshake_timeout: parse_secs("UPSTREAM_HANDSHAKE_TIMEOUT", "5")?,
            },
            feed: FeedConfig {
                url: parse_feed_url(&get_env_or("FEED_URL", DEFAULT_FEED_URL))?,
                fetch_timeout: parse_secs("FEED_TIMEOUT", "10")?,
                max_ping_ms: parse_env("FEED_MAX_PING", "300", "a number of milliseconds")?,
                allowed_countries: parse_list("FEED_ALLOWED_COUNTRIES"),
                excluded_countries: parse_list("FEED_EXCLUDED_COUNTRIES"),
                min_age: Duration::from_secs(parse_env(
                    "FEED_MIN_PROXY_AGE",
                    "0",
                    "a number of seconds",
                )?),
                refresh_interval: parse_secs("FEED_REFRESH_INTERVAL", "600")?,
            },
            maintenance: MaintenanceConfig {
                stats_interval: parse_secs("STATS_INTERVAL", "300")?,
                blacklist_decay_interval: parse_secs("BLACKLIST_DECAY_INTERVAL", "1800")?,
            },
            status: StatusConfig {
                enabled: parse_env("STATUS_ENABLED", "true", "true or false")?,
                host: get_env_or("STATUS_HOST", "0.0.0.0"),
                port: parse_env("STATUS_PORT", "5000", "a valid port number")?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the relay listen address
    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay.host, self.relay.port)
    }

    /// Get the status API address
    pub fn status_addr(&self) -> String {
        format!("{}:{}", self.status.host, self.status.port)
    }

    pub fn feed_filter(&self) -> FeedFilter {
        FeedFilter {
            max_ping_ms: self.feed.max_ping_ms,
            allowed_countries: self.feed.allowed_countries.clone(),
            excluded_countries: self.feed.excluded_countries.clone(),
            min_age: self.feed.min_age,
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            client_timeout: self.relay.client_timeout,
            buffer_size: self.relay.buffer_size,
            verbose: self.relay.verbose,
        }
    }
}

fn parse_feed_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| RelayError::InvalidConfig(format!("FEED_URL must be a valid URL: {}", e)))?;

    match url.scheme() {
        "http" | "https" | "file" => Ok(url),
        other => Err(RelayError::InvalidConfig(format!(
            "FEED_URL has unsupported scheme: {}",
            other
        ))),
    }
}

fn parse_env<T: FromStr>(key: &str, default: &str, expected: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| RelayError::InvalidConfig(format!("{} must be {}", key, expected)))
}

fn parse_nonzero(key: &str, default: &str) -> Result<u64> {
    let value: u64 = parse_env(key, default, "a positive number")?;
    if value == 0 {
        return Err(RelayError::InvalidConfig(format!(
            "{} must be a positive number",
            key
        )));
    }
    Ok(value)
}

fn parse_secs(key: &str, default: &str) -> Result<Duration> {
    parse_nonzero(key, default).map(Duration::from_secs)
}

/// Comma separated list, blanks dropped
fn parse_list(key: &str) -> Vec<String> {
    get_env_or(key, "")
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
