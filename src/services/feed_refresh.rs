//! Proxy list refresh service
//!
//! Reloads the candidate list on a fixed period and makes sure a usable
//! proxy stays selected.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, instrument, warn};

use crate::proxy::pool::PoolManager;

/// Feed refresh service
pub struct FeedRefreshService {
    pool: Arc<PoolManager>,
    period: Duration,
}

impl FeedRefreshService {
    pub fn new(pool: Arc<PoolManager>, period: Duration) -> Self {
        Self { pool, period }
    }

    /// Run the refresh loop. The initial load happens at startup, so the
    /// first refresh is one period away.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting feed refresh service (interval: {}s)",
            self.period.as_secs()
        );

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Feed refresh service shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Reload candidates; on failure the previous list stays in place
    async fn refresh(&self) {
        if let Err(e) = self.pool.load_candidates().await {
            error!("Failed to refresh proxy list: {}", e);
        }

        if self.pool.ensure_active().is_none() {
            warn!("No usable proxy after refresh");
        }
    }
}
