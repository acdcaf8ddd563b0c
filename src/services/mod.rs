//! Background services

pub mod blacklist_decay;
pub mod feed_refresh;
pub mod stats_reporter;

pub use blacklist_decay::BlacklistDecayService;
pub use feed_refresh::FeedRefreshService;
pub use stats_reporter::StatsReporterService;

use tokio::sync::watch;

/// Handle for stopping background services
pub struct ServiceHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ServiceHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    /// Additional receiver for another task
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for ServiceHandle {
    fn default() -> Self {
        Self::new().0
    }
}
