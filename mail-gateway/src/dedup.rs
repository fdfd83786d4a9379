//! Idempotency cache
//!
//! Coalesces requests sharing an idempotency key so that at most one send per
//! key is in flight, and replays a successful result for a retention window.
//!
//! Each key moves through a small state machine guarded by the cache lock:
//!
//! ```text
//! (absent) --claim--> Pending --success--> Succeeded --ttl--> (absent)
//!                        |
//!                        +--failure / stale / abandoned--> (absent)
//! ```
//!
//! The first caller for a key receives a [`Lease`] and must resolve it.
//! Concurrent callers receive a [`Waiter`] observing the same outcome.
//! Failures are never cached, so a retry after a failure starts fresh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Result shared between every caller of one key
pub type Outcome<T, E> = Result<Arc<T>, E>;

type Signal<T, E> = Option<Outcome<T, E>>;

/// Retention settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupSettings {
    /// How long a successful result is replayed
    pub ttl: Duration,
    /// How long a pending entry may stay unresolved before it is discarded
    pub stale_pending: Duration,
    /// Interval of the background sweep
    pub sweep_interval: Duration,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            stale_pending: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

enum Slot<T, E> {
    Pending(watch::Receiver<Signal<T, E>>),
    Succeeded(Arc<T>),
}

struct Entry<T, E> {
    /// Distinguishes a replaced entry from the one a lease was issued for
    id: u64,
    created_at: Instant,
    slot: Slot<T, E>,
}

struct Inner<T, E> {
    entries: Mutex<HashMap<String, Entry<T, E>>>,
    next_id: AtomicU64,
    settings: DedupSettings,
}

/// Outcome of [`DedupCache::claim`]
pub enum Claim<T, E> {
    /// A successful result within its TTL
    Replay(Arc<T>),
    /// Another caller is already sending
    Join(Waiter<T, E>),
    /// The caller owns the send and must resolve the lease
    Lead(Lease<T, E>),
}

/// Counts from one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub stale: usize,
}

/// Keyed in-memory store of pending and completed sends
pub struct DedupCache<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for DedupCache<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> DedupCache<T, E> {
    pub fn new(settings: DedupSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> DedupSettings {
        self.inner.settings
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry<T, E>>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up `key`, creating a pending entry if none is live
    ///
    /// The check and the insert happen under one lock, so two callers can
    /// never both become leader for the same key. Expired successes and stale
    /// pending entries count as absent.
    pub fn claim(&self, key: &str) -> Claim<T, E> {
        let now = Instant::now();
        let settings = self.inner.settings;
        let mut entries = self.entries();

        if let Some(entry) = entries.get(key) {
            let age = now.saturating_duration_since(entry.created_at);
            match &entry.slot {
                Slot::Succeeded(value) if age <= settings.ttl => {
                    return Claim::Replay(Arc::clone(value));
                }
                Slot::Pending(rx) if age <= settings.stale_pending => {
                    return Claim::Join(Waiter { rx: rx.clone() });
                }
                _ => debug!("Idempotency entry for '{}' expired, starting fresh", key),
            }
        }

        let (tx, rx) = watch::channel(None);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key.to_string(),
            Entry {
                id,
                created_at: now,
                slot: Slot::Pending(rx),
            },
        );

        Claim::Lead(Lease {
            key: key.to_string(),
            id,
            tx,
            cache: self.clone(),
            settled: false,
        })
    }

    /// Record the leader's outcome if its entry is still the live one
    fn settle(&self, key: &str, id: u64, outcome: &Outcome<T, E>) {
        let mut entries = self.entries();
        let current = entries.get(key).map(|entry| entry.id);
        if current != Some(id) {
            debug!("Idempotency entry for '{}' was replaced before settling", key);
            return;
        }

        match outcome {
            Ok(value) => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        id,
                        created_at: Instant::now(),
                        slot: Slot::Succeeded(Arc::clone(value)),
                    },
                );
            }
            Err(_) => {
                entries.remove(key);
            }
        }
    }

    /// Drop a pending entry whose leader went away without an outcome
    fn abandon(&self, key: &str, id: u64) {
        let mut entries = self.entries();
        if entries.get(key).is_some_and(|entry| entry.id == id) {
            entries.remove(key);
            debug!("Idempotency entry for '{}' abandoned", key);
        }
    }

    /// Remove expired successes and stale pending entries
    pub fn sweep(&self) -> SweepStats {
        let now = Instant::now();
        let settings = self.inner.settings;
        let mut stats = SweepStats::default();

        self.entries().retain(|_, entry| {
            let age = now.saturating_duration_since(entry.created_at);
            match entry.slot {
                Slot::Succeeded(_) if age > settings.ttl => {
                    stats.expired += 1;
                    false
                }
                Slot::Pending(_) if age > settings.stale_pending => {
                    stats.stale += 1;
                    false
                }
                _ => true,
            }
        });

        stats
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }
}

impl<T, E> DedupCache<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Run [`sweep`](Self::sweep) every `sweep_interval` until aborted
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let cache = self.clone();
        let period = self.inner.settings.sweep_interval;

        tokio::spawn(async move {
            info!("Starting idempotency sweep every {}s", period.as_secs());
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

            loop {
                ticker.tick().await;
                let stats = cache.sweep();
                if stats.expired + stats.stale > 0 {
                    info!(
                        "Idempotency sweep removed {} expired and {} stale entries",
                        stats.expired, stats.stale
                    );
                }
            }
        })
    }
}

/// Observes the outcome of a send started by another caller
pub struct Waiter<T, E> {
    rx: watch::Receiver<Signal<T, E>>,
}

impl<T, E: Clone> Waiter<T, E> {
    /// Wait for the leader's outcome
    ///
    /// Returns `None` if the leader was dropped without resolving.
    pub async fn outcome(mut self) -> Option<Outcome<T, E>> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(signal) => signal.clone(),
            Err(_) => None,
        }
    }
}

/// Ownership of the single in-flight send for a key
///
/// Dropping an unresolved lease removes its pending entry and wakes waiters
/// with no outcome.
pub struct Lease<T, E> {
    key: String,
    id: u64,
    tx: watch::Sender<Signal<T, E>>,
    cache: DedupCache<T, E>,
    settled: bool,
}

impl<T, E> Lease<T, E> {
    /// A waiter for this lease's own outcome
    pub fn waiter(&self) -> Waiter<T, E> {
        Waiter {
            rx: self.tx.subscribe(),
        }
    }

    /// Publish the outcome: cache a success, forget a failure, wake waiters
    pub fn resolve(mut self, outcome: Outcome<T, E>) {
        self.cache.settle(&self.key, self.id, &outcome);
        self.settled = true;
        self.tx.send_replace(Some(outcome));
    }
}

impl<T, E> Drop for Lease<T, E> {
    fn drop(&mut self) {
        if !self.settled {
            self.cache.abandon(&self.key, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Cache = DedupCache<String, String>;

    fn settings() -> DedupSettings {
        DedupSettings {
            ttl: Duration::from_secs(600),
            stale_pending: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }

    fn lead(cache: &Cache, key: &str) -> Lease<String, String> {
        match cache.claim(key) {
            Claim::Lead(lease) => lease,
            _ => panic!("expected to lead '{key}'"),
        }
    }

    #[tokio::test]
    async fn test_first_claim_leads_second_joins() {
        let cache = Cache::new(settings());
        let lease = lead(&cache, "k1");

        let waiter = match cache.claim("k1") {
            Claim::Join(waiter) => waiter,
            _ => panic!("expected to join"),
        };

        lease.resolve(Ok(Arc::new("sent".to_string())));
        let outcome = waiter.outcome().await.unwrap().unwrap();
        assert_eq!(*outcome, "sent");
    }

    #[tokio::test]
    async fn test_waiters_share_the_same_value() {
        let cache = Cache::new(settings());
        let lease = lead(&cache, "k1");
        let own = lease.waiter();
        let other = match cache.claim("k1") {
            Claim::Join(waiter) => waiter,
            _ => panic!("expected to join"),
        };

        lease.resolve(Ok(Arc::new("sent".to_string())));
        let a = own.outcome().await.unwrap().unwrap();
        let b = other.outcome().await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_success_is_replayed() {
        let cache = Cache::new(settings());
        lead(&cache, "k1").resolve(Ok(Arc::new("sent".to_string())));

        match cache.claim("k1") {
            Claim::Replay(value) => assert_eq!(*value, "sent"),
            _ => panic!("expected replay"),
        }
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let cache = Cache::new(settings());
        let lease = lead(&cache, "k1");
        let waiter = lease.waiter();

        lease.resolve(Err("boom".to_string()));
        assert_eq!(waiter.outcome().await, Some(Err("boom".to_string())));
        assert!(!cache.contains("k1"));
        assert!(matches!(cache.claim("k1"), Claim::Lead(_)));
    }

    #[tokio::test]
    async fn test_joined_waiter_sees_failure() {
        let cache = Cache::new(settings());
        let lease = lead(&cache, "k1");
        let joined = match cache.claim("k1") {
            Claim::Join(waiter) => waiter,
            _ => panic!("expected to join"),
        };

        let leader = tokio::spawn(async move {
            lease.resolve(Err("auth".to_string()));
        });

        assert_eq!(joined.outcome().await, Some(Err("auth".to_string())));
        leader.await.unwrap();
        assert!(matches!(cache.claim("k1"), Claim::Lead(_)));
    }

    #[tokio::test]
    async fn test_dropped_lease_releases_key() {
        let cache = Cache::new(settings());
        let lease = lead(&cache, "k1");
        let waiter = lease.waiter();

        drop(lease);
        assert!(waiter.outcome().await.is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_expires_after_ttl() {
        let cache = Cache::new(settings());
        lead(&cache, "k1").resolve(Ok(Arc::new("sent".to_string())));

        tokio::time::advance(Duration::from_secs(599)).await;
        assert!(matches!(cache.claim("k1"), Claim::Replay(_)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(cache.claim("k1"), Claim::Lead(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_counts_from_completion() {
        let cache = Cache::new(settings());
        let lease = lead(&cache, "k1");

        tokio::time::advance(Duration::from_secs(200)).await;
        lease.resolve(Ok(Arc::new("sent".to_string())));

        tokio::time::advance(Duration::from_secs(500)).await;
        assert!(matches!(cache.claim("k1"), Claim::Replay(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_uses_two_thresholds() {
        let cache = Cache::new(DedupSettings {
            ttl: Duration::from_secs(60),
            stale_pending: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        });

        lead(&cache, "done").resolve(Ok(Arc::new("sent".to_string())));
        let _pending = lead(&cache, "slow");

        tokio::time::advance(Duration::from_secs(120)).await;
        let stats = cache.sweep();
        assert_eq!(stats, SweepStats { expired: 1, stale: 0 });
        assert!(cache.contains("slow"));

        tokio::time::advance(Duration::from_secs(200)).await;
        let stats = cache.sweep();
        assert_eq!(stats, SweepStats { expired: 0, stale: 1 });
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_pending_is_replaced() {
        let cache = Cache::new(settings());
        let stale = lead(&cache, "k1");

        tokio::time::advance(Duration::from_secs(301)).await;
        let fresh = lead(&cache, "k1");

        // The late leader must not clobber the fresh entry
        stale.resolve(Err("late".to_string()));
        assert!(cache.contains("k1"));

        fresh.resolve(Ok(Arc::new("sent".to_string())));
        assert!(matches!(cache.claim("k1"), Claim::Replay(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let cache = Cache::new(DedupSettings {
            ttl: Duration::from_secs(30),
            stale_pending: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        });
        lead(&cache, "k1").resolve(Ok(Arc::new("sent".to_string())));

        let handle = cache.spawn_sweeper();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(cache.is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn test_independent_keys() {
        let cache = Cache::new(settings());
        let _a = lead(&cache, "a");
        assert!(matches!(cache.claim("b"), Claim::Lead(_)));
    }
}
