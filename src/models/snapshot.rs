use serde::Serialize;

use super::proxy::ProxyDescriptor;

/// Read-only view of the pool and session counters at one instant
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    /// Currently selected upstream proxy
    pub current: Option<ProxyDescriptor>,
    /// Number of candidates loaded from the last successful refresh
    pub available: usize,
    /// Number of candidates currently excluded from selection
    pub blacklisted: usize,
    pub successful_connections: u64,
    pub total_connections: u64,
    pub invalid_socks_requests: u64,
    pub consecutive_upstream_errors: u32,
    /// Seconds since the active proxy was selected
    pub since_selection_secs: Option<u64>,
}

impl PoolSnapshot {
    /// Share of upstream attempts that were established, in percent
    pub fn success_rate(&self) -> f64 {
        if self.total_connections == 0 {
            return 0.0;
        }
        self.successful_connections as f64 / self.total_connections as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        let mut snapshot = PoolSnapshot {
            current: None,
            available: 0,
            blacklisted: 0,
            successful_connections: 0,
            total_connections: 0,
            invalid_socks_requests: 0,
            consecutive_upstream_errors: 0,
            since_selection_secs: None,
        };
        assert_eq!(snapshot.success_rate(), 0.0);

        snapshot.successful_connections = 3;
        snapshot.total_connections = 4;
        assert!((snapshot.success_rate() - 75.0).abs() < f64::EPSILON);
    }
}
