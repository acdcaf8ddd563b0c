//! Statistics reporter service

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, instrument};

use crate::models::PoolSnapshot;
use crate::proxy::pool::PoolManager;

/// Logs a summary of pool and connection counters on a fixed period
pub struct StatsReporterService {
    pool: Arc<PoolManager>,
    period: Duration,
}

impl StatsReporterService {
    pub fn new(pool: Arc<PoolManager>, period: Duration) -> Self {
        Self { pool, period }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting statistics reporter (interval: {}s)",
            self.period.as_secs()
        );

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(line) = summary(&self.pool.snapshot()) {
                        info!("{}", line);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Statistics reporter shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// One-line report, or `None` before the first upstream attempt
fn summary(snapshot: &PoolSnapshot) -> Option<String> {
    if snapshot.total_connections == 0 {
        return None;
    }

    let current = snapshot
        .current
        .as_ref()
        .map(|p| p.key().to_string())
        .unwrap_or_else(|| "none".to_string());

    Some(format!(
        "Stats: {}/{} connections ({:.1}% success), {} invalid requests, \
         proxy {}, {} blacklisted of {}",
        snapshot.successful_connections,
        snapshot.total_connections,
        snapshot.success_rate(),
        snapshot.invalid_socks_requests,
        current,
        snapshot.blacklisted,
        snapshot.available
    ))
}
