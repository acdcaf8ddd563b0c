//! Upstream proxy pool
//!
//! Owns the candidate list, the blacklist, the active selection and the
//! session counters. Every mutation of the selection state happens under a
//! single lock so that selection, failure reporting and blacklist decay are
//! atomic with respect to one another.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{RelayError, Result};
use crate::models::{PoolSnapshot, ProxyDescriptor, ProxyKey};
use crate::proxy::feed::{parse_feed, FeedFilter, ProxySource};

/// Consecutive upstream failures before the active proxy is blacklisted
pub const FAILURE_THRESHOLD: u32 = 3;

/// Minimum time an active proxy is kept before failures may rotate it away
pub const MIN_ROTATION_INTERVAL: Duration = Duration::from_secs(30);

/// Blacklist preserving insertion order, so decay can drop the oldest entries
#[derive(Debug, Default)]
struct Blacklist {
    order: VecDeque<ProxyKey>,
    members: HashSet<ProxyKey>,
}

impl Blacklist {
    fn contains(&self, key: &ProxyKey) -> bool {
        self.members.contains(key)
    }

    /// Returns false if the key was already present
    fn insert(&mut self, key: ProxyKey) -> bool {
        if !self.members.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    /// Remove the oldest `count` entries
    fn drain_oldest(&mut self, count: usize) -> usize {
        let count = count.min(self.order.len());
        for key in self.order.drain(..count) {
            self.members.remove(&key);
        }
        count
    }
}

#[derive(Debug, Default)]
struct PoolState {
    candidates: Vec<Arc<ProxyDescriptor>>,
    blacklist: Blacklist,
    active: Option<Arc<ProxyDescriptor>>,
    consecutive_errors: u32,
    last_selection: Option<Instant>,
}

impl PoolState {
    fn select(&mut self) -> Option<Arc<ProxyDescriptor>> {
        if self.candidates.is_empty() {
            return None;
        }

        let mut available: Vec<&Arc<ProxyDescriptor>> = self
            .candidates
            .iter()
            .filter(|p| !self.blacklist.contains(&p.key()))
            .collect();

        if available.is_empty() {
            error!(
                "All {} proxies are blacklisted, clearing blacklist",
                self.candidates.len()
            );
            self.blacklist.clear();
            available = self.candidates.iter().collect();
        }

        let mut rng = rand::thread_rng();
        let chosen = available.choose(&mut rng).map(|p| Arc::clone(*p))?;

        self.active = Some(Arc::clone(&chosen));
        self.consecutive_errors = 0;
        self.last_selection = Some(Instant::now());

        info!("Selected proxy: {}", chosen);
        if self.blacklist.len() > 0 {
            info!("Blacklisted proxies: {}", self.blacklist.len());
        }

        Some(chosen)
    }

    fn active_is_candidate(&self) -> bool {
        match &self.active {
            Some(active) => {
                let key = active.key();
                self.candidates.iter().any(|p| p.key() == key)
            }
            None => false,
        }
    }
}

/// Process-wide session counters
#[derive(Debug, Default)]
struct SessionCounters {
    successful_connections: AtomicU64,
    total_connections: AtomicU64,
    invalid_socks_requests: AtomicU64,
}

/// What a reported failure did to the pool
#[derive(Debug, Clone, PartialEq)]
pub struct FailureOutcome {
    pub consecutive_errors: u32,
    /// The active proxy was newly added to the blacklist
    pub blacklisted: Option<ProxyKey>,
    /// A new proxy was selected as a result of this failure
    pub rotated_to: Option<Arc<ProxyDescriptor>>,
}

/// Upstream proxy pool manager
pub struct PoolManager {
    source: Arc<dyn ProxySource>,
    filter: FeedFilter,
    state: Mutex<PoolState>,
    counters: SessionCounters,
}

impl PoolManager {
    pub fn new(source: Arc<dyn ProxySource>, filter: FeedFilter) -> Self {
        Self {
            source,
            filter,
            state: Mutex::new(PoolState::default()),
            counters: SessionCounters::default(),
        }
    }

    /// Fetch, parse and filter the proxy list, replacing the candidates.
    ///
    /// On any failure the previous candidates are kept.
    #[instrument(skip(self), fields(source = %self.source.describe()))]
    pub async fn load_candidates(&self) -> Result<usize> {
        info!("Loading proxy list");

        let payload = self.source.fetch().await?;
        let proxies = parse_feed(&payload)?;
        let total = proxies.len();

        let filtered = self.filter.apply(proxies, Utc::now());
        if filtered.is_empty() {
            return Err(RelayError::NoCandidates { total });
        }

        let count = filtered.len();
        {
            let mut state = self.state.lock();
            state.candidates = filtered.into_iter().map(Arc::new).collect();
        }

        if self.filter.allowed_countries.is_empty() {
            info!("Loaded {} proxies ({} total)", count, total);
        } else {
            info!(
                "Loaded {} proxies ({} total) for countries: {}",
                count,
                total,
                self.filter.allowed_countries.join(", ")
            );
        }

        Ok(count)
    }

    /// Pick a random non-blacklisted candidate as the active proxy
    pub fn select_active(&self) -> Option<Arc<ProxyDescriptor>> {
        self.state.lock().select()
    }

    /// Select a proxy if none is active or the active one left the candidate list
    pub fn ensure_active(&self) -> Option<Arc<ProxyDescriptor>> {
        let mut state = self.state.lock();
        if state.active_is_candidate() {
            return state.active.clone();
        }
        if let Some(previous) = &state.active {
            info!("Active proxy {} is no longer listed", previous.key());
        }
        state.select()
    }

    /// Record an upstream failure of `proxy`.
    ///
    /// Only counts if `proxy` is still the active one, so late failures from
    /// sessions that dialed a replaced proxy are not charged to its successor.
    /// Blacklists the active proxy once the threshold is reached, and rotates
    /// only if the proxy has also been active for the minimum interval.
    pub fn report_failure(&self, proxy: &ProxyKey, reason: &RelayError) -> FailureOutcome {
        let mut state = self.state.lock();

        let is_active = state.active.as_ref().is_some_and(|a| a.key() == *proxy);
        if !is_active {
            debug!("Ignoring failure of inactive proxy {}: {}", proxy, reason);
            return FailureOutcome {
                consecutive_errors: state.consecutive_errors,
                blacklisted: None,
                rotated_to: None,
            };
        }

        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        let errors = state.consecutive_errors;

        if errors % FAILURE_THRESHOLD == 0 {
            warn!("Upstream connection error ({}): {}", errors, reason);
        } else {
            debug!("Upstream connection error ({}): {}", errors, reason);
        }

        let mut outcome = FailureOutcome {
            consecutive_errors: errors,
            blacklisted: None,
            rotated_to: None,
        };

        if errors < FAILURE_THRESHOLD {
            return outcome;
        }

        if let Some(active) = &state.active {
            let key = active.key();
            if state.blacklist.insert(key.clone()) {
                error!("Proxy {} blacklisted (repeated connection errors)", key);
                outcome.blacklisted = Some(key);
            }
        }

        let window_elapsed = state
            .last_selection
            .map_or(true, |at| at.elapsed() >= MIN_ROTATION_INTERVAL);

        if window_elapsed {
            info!("Too many errors, switching to another proxy");
            outcome.rotated_to = state.select();
        }

        outcome
    }

    /// Drop the oldest half of the blacklist, giving those proxies another chance
    pub fn decay_blacklist(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.blacklist.len();
        let removed = state.blacklist.drain_oldest(before / 2);
        if removed > 0 {
            info!(
                "Released {} proxies from blacklist ({} -> {})",
                removed,
                before,
                state.blacklist.len()
            );
        }
        removed
    }

    pub fn active(&self) -> Option<Arc<ProxyDescriptor>> {
        self.state.lock().active.clone()
    }

    pub fn is_blacklisted(&self, key: &ProxyKey) -> bool {
        self.state.lock().blacklist.contains(key)
    }

    pub fn record_attempt(&self) {
        self.counters.total_connections.fetch_add(1, Ordering::Release);
    }

    /// Pairs with the acquire load in [`snapshot`](Self::snapshot): a reader
    /// that sees a success also sees the attempt counted before it.
    pub fn record_success(&self) -> u64 {
        self.counters
            .successful_connections
            .fetch_add(1, Ordering::Release)
            + 1
    }

    /// Count an invalid client request and return the running total
    pub fn record_invalid_request(&self) -> u64 {
        self.counters
            .invalid_socks_requests
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        // successful before total, so successful <= total holds
        let successful_connections = self.counters.successful_connections.load(Ordering::Acquire);
        let total_connections = self.counters.total_connections.load(Ordering::Acquire);

        let state = self.state.lock();
        PoolSnapshot {
            current: state.active.as_deref().cloned(),
            available: state.candidates.len(),
            blacklisted: state.blacklist.len(),
            successful_connections,
            total_connections,
            invalid_socks_requests: self.counters.invalid_socks_requests.load(Ordering::Relaxed),
            consecutive_upstream_errors: state.consecutive_errors,
            since_selection_secs: state.last_selection.map(|at| at.elapsed().as_secs()),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_candidates(&self, proxies: Vec<ProxyDescriptor>) {
        self.state.lock().candidates = proxies.into_iter().map(Arc::new).collect();
    }

    #[cfg(test)]
    pub(crate) fn blacklist_key(&self, key: ProxyKey) {
        self.state.lock().blacklist.insert(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::feed::tests::StaticSource;

    fn proxy(ip: &str) -> ProxyDescriptor {
        ProxyDescriptor {
            ip: ip.to_string(),
            port: 1080,
            country: Some("DE".to_string()),
            ping_ms: 50,
            provider: None,
            added_at: None,
        }
    }

    fn pool_with(ips: &[&str]) -> PoolManager {
        let pool = PoolManager::new(StaticSource::new("[]"), FeedFilter::default());
        pool.set_candidates(ips.iter().map(|ip| proxy(ip)).collect());
        pool
    }

    fn upstream_error() -> RelayError {
        RelayError::UpstreamConnect(0x05)
    }

    fn fail_active(pool: &PoolManager) -> FailureOutcome {
        let key = pool.active().unwrap().key();
        pool.report_failure(&key, &upstream_error())
    }

    #[tokio::test]
    async fn test_load_candidates_filters_and_replaces() {
        let source = StaticSource::new(
            r#"[
                {"ip": "1.1.1.1", "port": 1080, "ping": 100},
                {"ip": "2.2.2.2", "port": 1080, "ping": 500},
                {"ip": "3.3.3.3", "port": 1080}
            ]"#,
        );
        let pool = PoolManager::new(source.clone(), FeedFilter::default());

        assert_eq!(pool.load_candidates().await.unwrap(), 1);
        assert_eq!(pool.snapshot().available, 1);

        source.set(r#"[{"ip": "4.4.4.4", "port": 1080, "ping": 10}, {"ip": "5.5.5.5", "port": 1080, "ping": 20}]"#);
        assert_eq!(pool.load_candidates().await.unwrap(), 2);
        assert_eq!(pool.snapshot().available, 2);
    }

    #[tokio::test]
    async fn test_load_candidates_failures_keep_previous_list() {
        let source = StaticSource::new(r#"[{"ip": "1.1.1.1", "port": 1080, "ping": 100}]"#);
        let pool = PoolManager::new(source.clone(), FeedFilter::default());
        pool.load_candidates().await.unwrap();

        source.set(r#"[{"ip": "2.2.2.2", "port": 1080, "ping": 900}]"#);
        let err = pool.load_candidates().await.unwrap_err();
        assert!(matches!(err, RelayError::NoCandidates { total: 1 }));

        source.set("{not json");
        let err = pool.load_candidates().await.unwrap_err();
        assert!(matches!(err, RelayError::FeedFormat(_)));

        source.fail("connection refused");
        let err = pool.load_candidates().await.unwrap_err();
        assert!(matches!(err, RelayError::FeedFetch(_)));

        assert_eq!(pool.snapshot().available, 1);
        assert_eq!(pool.select_active().unwrap().ip, "1.1.1.1");
    }

    #[test]
    fn test_select_active_empty_pool() {
        let pool = pool_with(&[]);
        assert!(pool.select_active().is_none());
        assert!(pool.active().is_none());
    }

    #[test]
    fn test_select_active_skips_blacklisted() {
        let pool = pool_with(&["1.1.1.1", "2.2.2.2", "3.3.3.3"]);
        pool.blacklist_key(proxy("1.1.1.1").key());
        pool.blacklist_key(proxy("3.3.3.3").key());

        for _ in 0..50 {
            let selected = pool.select_active().unwrap();
            assert_eq!(selected.ip, "2.2.2.2");
        }
        assert_eq!(pool.snapshot().blacklisted, 2);
    }

    #[test]
    fn test_select_active_clears_fully_blacklisted_pool() {
        let pool = pool_with(&["1.1.1.1", "2.2.2.2"]);
        pool.blacklist_key(proxy("1.1.1.1").key());
        pool.blacklist_key(proxy("2.2.2.2").key());

        let selected = pool.select_active().unwrap();
        assert!(["1.1.1.1", "2.2.2.2"].contains(&selected.ip.as_str()));
        assert_eq!(pool.snapshot().blacklisted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_active_resets_error_count() {
        let pool = pool_with(&["1.1.1.1", "2.2.2.2"]);
        pool.select_active().unwrap();
        fail_active(&pool);
        fail_active(&pool);
        assert_eq!(pool.snapshot().consecutive_upstream_errors, 2);

        pool.select_active().unwrap();
        assert_eq!(pool.snapshot().consecutive_upstream_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_blacklist_without_rotation_inside_window() {
        let pool = pool_with(&["1.1.1.1", "2.2.2.2"]);
        let active = pool.select_active().unwrap();

        let first = fail_active(&pool);
        let second = fail_active(&pool);
        assert_eq!(first.blacklisted, None);
        assert_eq!(second.blacklisted, None);
        assert!(!pool.is_blacklisted(&active.key()));

        let third = fail_active(&pool);
        assert_eq!(third.consecutive_errors, 3);
        assert_eq!(third.blacklisted, Some(active.key()));
        assert!(third.rotated_to.is_none());
        assert!(pool.is_blacklisted(&active.key()));
        assert_eq!(pool.active().unwrap().key(), active.key());

        let fourth = fail_active(&pool);
        assert_eq!(fourth.blacklisted, None);
        assert!(fourth.rotated_to.is_none());
        assert_eq!(pool.snapshot().blacklisted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_after_interval() {
        let pool = pool_with(&["1.1.1.1", "2.2.2.2"]);
        let active = pool.select_active().unwrap();

        for _ in 0..3 {
            fail_active(&pool);
        }
        assert_eq!(pool.active().unwrap().key(), active.key());

        tokio::time::advance(MIN_ROTATION_INTERVAL).await;

        let outcome = fail_active(&pool);
        let rotated = outcome.rotated_to.expect("should rotate");
        assert_ne!(rotated.key(), active.key());
        assert_eq!(pool.active().unwrap().key(), rotated.key());
        assert_eq!(pool.snapshot().consecutive_upstream_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_rotation_below_threshold_even_after_interval() {
        let pool = pool_with(&["1.1.1.1", "2.2.2.2"]);
        let active = pool.select_active().unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;

        let outcome = fail_active(&pool);
        assert!(outcome.rotated_to.is_none());
        assert_eq!(pool.active().unwrap().key(), active.key());
    }

    #[test]
    fn test_decay_blacklist_removes_oldest_half() {
        let pool = pool_with(&[]);
        assert_eq!(pool.decay_blacklist(), 0);

        let keys: Vec<ProxyKey> = (1..=5).map(|i| proxy(&format!("10.0.0.{}", i)).key()).collect();
        for key in &keys {
            pool.blacklist_key(key.clone());
        }

        assert_eq!(pool.decay_blacklist(), 2);
        assert!(!pool.is_blacklisted(&keys[0]));
        assert!(!pool.is_blacklisted(&keys[1]));
        assert!(pool.is_blacklisted(&keys[2]));
        assert_eq!(pool.snapshot().blacklisted, 3);

        assert_eq!(pool.decay_blacklist(), 1);
        assert_eq!(pool.decay_blacklist(), 1);
        assert_eq!(pool.snapshot().blacklisted, 1);
        assert_eq!(pool.decay_blacklist(), 0);
        assert!(pool.is_blacklisted(&keys[4]));
    }

    #[test]
    fn test_ensure_active_keeps_listed_selection() {
        let pool = pool_with(&["1.1.1.1", "2.2.2.2"]);
        let active = pool.select_active().unwrap();
        assert_eq!(pool.ensure_active().unwrap().key(), active.key());

        pool.set_candidates(vec![proxy("3.3.3.3")]);
        assert_eq!(pool.ensure_active().unwrap().ip, "3.3.3.3");
    }

    #[test]
    fn test_counters() {
        let pool = pool_with(&["1.1.1.1"]);
        pool.record_attempt();
        pool.record_attempt();
        assert_eq!(pool.record_success(), 1);
        assert_eq!(pool.record_invalid_request(), 1);
        assert_eq!(pool.record_invalid_request(), 2);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.successful_connections, 1);
        assert_eq!(snapshot.invalid_socks_requests, 2);
        assert!(snapshot.successful_connections <= snapshot.total_connections);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_of_replaced_proxy_are_ignored() {
        let pool = pool_with(&["1.1.1.1", "2.2.2.2"]);
        let dead = pool.select_active().unwrap();

        for _ in 0..3 {
            fail_active(&pool);
        }
        tokio::time::advance(MIN_ROTATION_INTERVAL).await;
        let replacement = fail_active(&pool).rotated_to.expect("should rotate");
        assert_ne!(replacement.key(), dead.key());

        // Sessions that were still dialing the dead proxy report late.
        for _ in 0..5 {
            let outcome = pool.report_failure(&dead.key(), &upstream_error());
            assert_eq!(outcome.consecutive_errors, 0);
            assert!(outcome.blacklisted.is_none());
            assert!(outcome.rotated_to.is_none());
        }

        assert_eq!(pool.active().unwrap().key(), replacement.key());
        assert!(!pool.is_blacklisted(&replacement.key()));
        assert_eq!(pool.snapshot().consecutive_upstream_errors, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_counters_never_show_more_successes_than_attempts() {
        let pool = Arc::new(pool_with(&["1.1.1.1"]));

        let mut writers = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            writers.push(tokio::spawn(async move {
                for _ in 0..2000 {
                    pool.record_attempt();
                    pool.record_success();
                }
            }));
        }

        let reader = {
            let pool = pool.clone();
            tokio::spawn(async move {
                for _ in 0..2000 {
                    let snapshot = pool.snapshot();
                    assert!(snapshot.successful_connections <= snapshot.total_connections);
                    tokio::task::yield_now().await;
                }
            })
        };

        for writer in writers {
            writer.await.unwrap();
        }
        reader.await.unwrap();

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.total_connections, 8000);
        assert_eq!(snapshot.successful_connections, 8000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_and_selection_stay_consistent() {
        let pool = Arc::new(pool_with(&["1.1.1.1", "2.2.2.2", "3.3.3.3", "4.4.4.4"]));
        pool.select_active().unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..200 {
                    if i % 4 == 0 {
                        pool.select_active();
                    } else if i % 4 == 1 {
                        pool.decay_blacklist();
                    } else {
                        if let Some(active) = pool.active() {
                            pool.report_failure(
                                &active.key(),
                                &RelayError::UpstreamTimeout { phase: "greeting" },
                            );
                        }
                    }
                    let snapshot = pool.snapshot();
                    assert!(snapshot.blacklisted <= snapshot.available);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(pool.active().is_some());
    }
}
