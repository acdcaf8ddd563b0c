//! Blacklist decay service
//!
//! Periodically releases the oldest half of the blacklist so proxies that
//! failed earlier get another chance.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument};

use crate::proxy::pool::PoolManager;

/// Blacklist decay service
pub struct BlacklistDecayService {
    pool: Arc<PoolManager>,
    period: Duration,
}

impl BlacklistDecayService {
    pub fn new(pool: Arc<PoolManager>, period: Duration) -> Self {
        Self { pool, period }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting blacklist decay service (interval: {}s)",
            self.period.as_secs()
        );

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.pool.decay_blacklist();
                    if removed == 0 {
                        debug!("Blacklist decay: nothing to release");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Blacklist decay service shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProxyKey;
    use crate::proxy::feed::tests::StaticSource;
    use crate::proxy::feed::FeedFilter;
    use crate::services::ServiceHandle;

    fn key(i: u8) -> ProxyKey {
        ProxyKey {
            ip: format!("10.0.0.{}", i),
            port: 1080,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_decay_halves_blacklist_each_period() {
        let pool = Arc::new(PoolManager::new(StaticSource::new("[]"), FeedFilter::default()));
        for i in 1..=8 {
            pool.blacklist_key(key(i));
        }

        let (handle, shutdown) = ServiceHandle::new();
        let service = BlacklistDecayService::new(pool.clone(), Duration::from_secs(1800));
        let task = tokio::spawn(async move { service.run(shutdown).await });

        tokio::time::sleep(Duration::from_secs(1799)).await;
        assert_eq!(pool.snapshot().blacklisted, 8);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(pool.snapshot().blacklisted, 4);
        assert!(!pool.is_blacklisted(&key(1)));
        assert!(pool.is_blacklisted(&key(8)));

        tokio::time::sleep(Duration::from_secs(1800)).await;
        assert_eq!(pool.snapshot().blacklisted, 2);

        handle.shutdown();
        task.await.unwrap();
    }
}
