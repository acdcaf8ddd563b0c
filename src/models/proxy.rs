use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Ping assumed for feed entries that do not report one
pub const MISSING_PING_MS: u32 = 9999;

/// Identity of an upstream proxy: its `ip:port` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProxyKey {
    pub ip: String,
    pub port: u16,
}

impl std::fmt::Display for ProxyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Upstream SOCKS5 proxy as published by the proxy list feed.
///
/// Immutable after load; a refresh replaces descriptors wholesale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyDescriptor {
    pub ip: String,
    pub port: u16,
    /// ISO country code, `None` when the feed omits it
    pub country: Option<String>,
    /// Reported latency, [`MISSING_PING_MS`] when the feed omits it
    pub ping_ms: u32,
    pub provider: Option<String>,
    /// When the feed first listed the proxy, `None` means "just now"
    pub added_at: Option<DateTime<Utc>>,
}

impl ProxyDescriptor {
    pub fn key(&self) -> ProxyKey {
        ProxyKey {
            ip: self.ip.clone(),
            port: self.port,
        }
    }

    /// Address suitable for `TcpStream::connect`
    pub fn address(&self) -> String {
        if self.ip.contains(':') && !self.ip.starts_with('[') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }

    pub fn country_or_default(&self) -> &str {
        self.country.as_deref().unwrap_or("")
    }

    /// Seconds since the proxy was added to the feed; zero if unknown or in the future
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        self.added_at
            .map(|added| (now - added).num_seconds().max(0))
            .unwrap_or(0)
    }
}

impl std::fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} (country: {}, ping: {}ms, provider: {})",
            self.ip,
            self.port,
            self.country.as_deref().unwrap_or("N/A"),
            self.ping_ms,
            self.provider.as_deref().unwrap_or("N/A"),
        )
    }
}

/// Raw feed entry. Only `ip` and `port` are required.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedRecord {
    pub ip: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub ping: Option<f64>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default, rename = "addTime")]
    pub add_time: Option<i64>,
}

impl From<FeedRecord> for ProxyDescriptor {
    fn from(record: FeedRecord) -> Self {
        let ping_ms = match record.ping {
            Some(p) if p.is_finite() && p >= 0.0 => p.min(u32::MAX as f64) as u32,
            _ => MISSING_PING_MS,
        };

        ProxyDescriptor {
            ip: record.ip.trim().to_string(),
            port: record.port,
            country: record.country.filter(|c| !c.is_empty()),
            ping_ms,
            provider: record.provider.filter(|p| !p.is_empty()),
            added_at: record
                .add_time
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        }
    }
}

/// Feeds publish ports either as numbers or as numeric strings
fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(u64),
        Text(String),
    }

    let port = match RawPort::deserialize(deserializer)? {
        RawPort::Number(n) => u16::try_from(n).map_err(serde::de::Error::custom)?,
        RawPort::Text(s) => s.trim().parse::<u16>().map_err(serde::de::Error::custom)?,
    };

    if port == 0 {
        return Err(serde::de::Error::custom("port must be non-zero"));
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_feed_record_full() {
        let record: FeedRecord = serde_json::from_value(json!({
            "ip": "1.2.3.4",
            "port": 1080,
            "country": "DE",
            "ping": 120,
            "provider": "hetzner",
            "addTime": 1_700_000_000
        }))
        .unwrap();

        let proxy = ProxyDescriptor::from(record);
        assert_eq!(proxy.ip, "1.2.3.4");
        assert_eq!(proxy.port, 1080);
        assert_eq!(proxy.country.as_deref(), Some("DE"));
        assert_eq!(proxy.ping_ms, 120);
        assert_eq!(proxy.provider.as_deref(), Some("hetzner"));
        assert_eq!(proxy.added_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_feed_record_defaults() {
        let record: FeedRecord =
            serde_json::from_value(json!({"ip": "5.6.7.8", "port": "9050"})).unwrap();
        let proxy = ProxyDescriptor::from(record);

        assert_eq!(proxy.port, 9050);
        assert_eq!(proxy.country, None);
        assert_eq!(proxy.country_or_default(), "");
        assert_eq!(proxy.ping_ms, MISSING_PING_MS);
        assert_eq!(proxy.provider, None);
        assert_eq!(proxy.added_at, None);
        assert_eq!(proxy.age_secs(Utc::now()), 0);
    }

    #[test]
    fn test_feed_record_rejects_bad_port() {
        assert!(serde_json::from_value::<FeedRecord>(json!({"ip": "1.1.1.1", "port": 70000})).is_err());
        assert!(serde_json::from_value::<FeedRecord>(json!({"ip": "1.1.1.1", "port": "abc"})).is_err());
        assert!(serde_json::from_value::<FeedRecord>(json!({"ip": "1.1.1.1", "port": 0})).is_err());
        assert!(serde_json::from_value::<FeedRecord>(json!({"port": 1080})).is_err());
    }

    #[test]
    fn test_key_and_address() {
        let proxy = ProxyDescriptor {
            ip: "2001:db8::1".to_string(),
            port: 1080,
            country: None,
            ping_ms: 10,
            provider: None,
            added_at: None,
        };
        assert_eq!(proxy.address(), "[2001:db8::1]:1080");
        assert_eq!(proxy.key().to_string(), "2001:db8::1:1080");
    }

    #[test]
    fn test_age_secs() {
        let now = Utc::now();
        let proxy = ProxyDescriptor {
            ip: "1.1.1.1".to_string(),
            port: 1080,
            country: None,
            ping_ms: 10,
            provider: None,
            added_at: Some(now - chrono::Duration::seconds(90)),
        };
        assert_eq!(proxy.age_secs(now), 90);
    }
}
