//! Expiring key/value cache
//!
//! [`TtlCache`] stores values with a per-entry time-to-live measured from the
//! moment of `set`. Expired entries read as misses and are removed lazily on
//! access, or in bulk by [`TtlCache::sweep`]. The clock is injectable so
//! tests can advance time deterministically.

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Background sweep period for entries living `ttl`
pub fn sweep_interval(ttl: Duration) -> Duration {
    ttl.clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
}

/// Source of monotonic time
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Concurrent cache with plain (non-sliding) TTL expiry
pub struct TtlCache<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    clock: Arc<dyn Clock>,
}

impl<K: Eq + Hash, V> fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("entries", &self.entries.len())
            .field("clock", &self.clock)
            .finish()
    }
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Live value for `key`, removing it if it has expired
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        {
            let entry = self.entries.get(key)?;
            if now <= entry.expires_at {
                return Some(entry.value.clone());
            }
        }
        // Re-check under the write lock so a concurrent fresh `set` survives.
        self.entries.remove_if(key, |_, entry| now > entry.expires_at);
        None
    }

    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.entries.insert(key, CacheEntry { value, expires_at });
    }

    pub fn delete(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    /// Drop every expired entry, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now <= entry.expires_at);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Swept {} expired cache entries", removed);
        }
        removed
    }

    /// Cached value for `key`, or the result of `init` stored for `ttl`
    ///
    /// Errors from `init` are returned and nothing is cached, and neither is
    /// anything with a zero `ttl`. Concurrent misses on the same key may each
    /// run `init`; the last write wins.
    pub async fn get_or_try_insert_with<F, Fut, E>(
        &self,
        key: K,
        ttl: Duration,
        init: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            trace!("Cache hit");
            return Ok(value);
        }

        let value = init().await?;
        if !ttl.is_zero() {
            self.set(key, value.clone(), ttl);
        }
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Sweep every [`sweep_interval`] of `ttl`, when a runtime is available
    ///
    /// Outside a runtime, and for a zero `ttl` where nothing is stored,
    /// no task is spawned and expired entries are only evicted on read.
    pub fn sweep_for_ttl(self: &Arc<Self>, ttl: Duration) -> Option<JoinHandle<()>> {
        if ttl.is_zero() || tokio::runtime::Handle::try_current().is_err() {
            return None;
        }
        Some(self.spawn_sweeper(sweep_interval(ttl)))
    }

    /// Spawn a background task sweeping the cache every `interval`
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cache.upgrade() {
                    Some(cache) => {
                        cache.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_cache() -> (Arc<ManualClock>, TtlCache<String, u32>) {
        let clock = Arc::new(ManualClock::new());
        let cache = TtlCache::with_clock(clock.clone());
        (clock, cache)
    }

    #[test]
    fn test_entry_expires_strictly_after_ttl() {
        let (clock, cache) = manual_cache();
        cache.set("k".into(), 7, Duration::from_secs(10));

        assert_eq!(cache.get(&"k".into()), Some(7));

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.get(&"k".into()), Some(7));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get(&"k".into()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ttl_is_not_sliding() {
        let (clock, cache) = manual_cache();
        cache.set("k".into(), 1, Duration::from_secs(5));

        clock.advance(Duration::from_secs(4));
        assert_eq!(cache.get(&"k".into()), Some(1));

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get(&"k".into()), None);
    }

    #[test]
    fn test_set_replaces_and_resets_expiry() {
        let (clock, cache) = manual_cache();
        cache.set("k".into(), 1, Duration::from_secs(5));
        clock.advance(Duration::from_secs(4));
        cache.set("k".into(), 2, Duration::from_secs(5));
        clock.advance(Duration::from_secs(4));
        assert_eq!(cache.get(&"k".into()), Some(2));
    }

    #[test]
    fn test_delete_and_sweep() {
        let (clock, cache) = manual_cache();
        cache.set("a".into(), 1, Duration::from_secs(1));
        cache.set("b".into(), 2, Duration::from_secs(100));
        cache.set("c".into(), 3, Duration::from_secs(100));

        assert_eq!(cache.delete(&"c".into()), Some(3));
        clock.advance(Duration::from_secs(2));

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"b".into()), Some(2));
    }

    #[tokio::test]
    async fn test_get_or_try_insert_caches_success_only() {
        let (_clock, cache) = manual_cache();

        let failed: Result<u32, &str> = cache
            .get_or_try_insert_with("k".into(), Duration::from_secs(5), || async { Err("boom") })
            .await;
        assert!(failed.is_err());
        assert!(cache.is_empty());

        let value: Result<u32, &str> = cache
            .get_or_try_insert_with("k".into(), Duration::from_secs(5), || async { Ok(42) })
            .await;
        assert_eq!(value, Ok(42));

        let cached: Result<u32, &str> = cache
            .get_or_try_insert_with("k".into(), Duration::from_secs(5), || async { Ok(0) })
            .await;
        assert_eq!(cached, Ok(42));
    }

    #[tokio::test]
    async fn test_zero_ttl_loads_are_not_stored() {
        let (_clock, cache) = manual_cache();
        for i in 0..20u32 {
            let value: Result<u32, &str> = cache
                .get_or_try_insert_with(format!("k{}", i), Duration::ZERO, || async move { Ok(i) })
                .await;
            assert_eq!(value, Ok(i));
        }
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let clock = Arc::new(ManualClock::new());
        let cache = Arc::new(TtlCache::<String, u32>::with_clock(clock.clone()));
        cache.set("k".into(), 1, Duration::from_secs(1));
        clock.advance(Duration::from_secs(2));

        let handle = cache.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.is_empty());

        drop(cache);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper stops once the cache is dropped")
            .unwrap();
    }

    #[test]
    fn test_debug_reports_entry_count() {
        let (_clock, cache) = manual_cache();
        cache.set("k".into(), 1, Duration::from_secs(1));
        assert!(format!("{:?}", cache).contains("entries: 1"));
    }

    #[test]
    fn test_sweep_interval_is_bounded() {
        assert_eq!(sweep_interval(Duration::from_millis(1)), Duration::from_millis(10));
        assert_eq!(sweep_interval(Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(sweep_interval(Duration::from_secs(3600)), Duration::from_secs(30));
    }

    #[test]
    fn test_no_sweeper_outside_runtime_or_for_zero_ttl() {
        let cache = Arc::new(TtlCache::<String, u32>::new());
        assert!(cache.sweep_for_ttl(Duration::from_secs(1)).is_none());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            assert!(cache.sweep_for_ttl(Duration::ZERO).is_none());
            let handle = cache.sweep_for_ttl(Duration::from_secs(1)).unwrap();
            handle.abort();
        });
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        let cache = Arc::new(TtlCache::<u32, u32>::new());
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache.set(i, i * 2, Duration::from_secs(60));
                    cache.get(&i)
                })
            })
            .collect();

        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap(), Some(i as u32 * 2));
        }
    }
}
