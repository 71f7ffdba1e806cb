/*!
 * TTL Cache
 *
 * Concurrent memoizing cache with per-key single-flight, minimum-lifetime
 * retention, and LRU trimming to a bound.
 *
 * # Design
 *
 * One reader/writer spinlock guards the key map and the LRU list together,
 * keeping recency order coherent with membership. An entry is inserted and
 * published to other callers *before* its value is built; the build runs
 * outside the lock and its outcome (value or error) is released through the
 * entry's one-shot latch. Later callers for the same key wait on the latch
 * and observe the stored outcome, so the build runs at most once per entry
 * lifetime.
 *
 * Evictors are serialized by a separate gate and defer to live accessors
 * (courtesy yield); readers never wait for an eviction sweep.
 *
 * # Error Caching
 *
 * A failed build is cached under the same lifetime rules as a value and
 * re-raised to every caller until the key is explicitly removed.
 */

use crate::cache::lru::LruArena;
use crate::core::clock::TickClock;
use crate::core::errors::{BuildPanicked, CacheError};
use crate::core::limits::EVICTOR_PARK_WAIT;
use crate::sync::latch::Latch;
use crate::sync::spin_rwlock::SpinRw;
use ahash::RandomState;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Error type a build closure may return
pub type BuildError = Box<dyn std::error::Error + Send + Sync + 'static>;

type BuildFn<K, V> = Box<dyn Fn(&K) -> Result<V, BuildError> + Send + Sync>;
type BuildOutcome<V> = Result<V, Arc<dyn std::error::Error + Send + Sync>>;

struct CacheEntry<K, V> {
    key: K,
    /// Written once by the builder, before `ready` is set
    outcome: OnceLock<BuildOutcome<V>>,
    ready: Latch,
    last_access: AtomicU64,
}

struct CacheInner<K, V, S> {
    map: HashMap<K, usize, S>,
    lru: LruArena<Arc<CacheEntry<K, V>>>,
}

/// Concurrent computed-value cache keyed by `K`
pub struct TtlCache<K, V, S = RandomState> {
    build: BuildFn<K, V>,
    min_life_ticks: u64,
    anticipate_slow_equality: bool,
    clock: TickClock,
    inner: SpinRw<CacheInner<K, V, S>>,
    /// Callers inside the exclusive section; evictors defer while nonzero
    accessors: AtomicUsize,
    evictor_parked: AtomicBool,
    accessor_gate: Mutex<()>,
    accessor_cv: Condvar,
    /// At most one evictor proceeds at a time
    deleter: Mutex<()>,
    /// Evict-everything-at-or-before horizon, in clock ticks; only raised
    horizon: AtomicU64,
}

impl<K, V> TtlCache<K, V, RandomState>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Cache with the default hasher.
    ///
    /// `min_life` is the minimum interval since last access before an entry
    /// becomes eligible for [`Self::delete_old`].
    pub fn new(
        min_life: Duration,
        build: impl Fn(&K) -> Result<V, BuildError> + Send + Sync + 'static,
    ) -> Self {
        Self::with_hasher(min_life, RandomState::new(), build)
    }
}

impl<K, V, S> TtlCache<K, V, S>
where
    K: Eq + Hash + Clone,
    V: Clone,
    S: BuildHasher,
{
    pub fn with_hasher(
        min_life: Duration,
        hasher: S,
        build: impl Fn(&K) -> Result<V, BuildError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            build: Box::new(build),
            min_life_ticks: TickClock::ticks_for(min_life),
            anticipate_slow_equality: false,
            clock: TickClock::new(),
            inner: SpinRw::new(CacheInner {
                map: HashMap::with_hasher(hasher),
                lru: LruArena::new(),
            }),
            accessors: AtomicUsize::new(0),
            evictor_parked: AtomicBool::new(false),
            accessor_gate: Mutex::new(()),
            accessor_cv: Condvar::new(),
            deleter: Mutex::new(()),
            horizon: AtomicU64::new(0),
        }
    }

    /// Pre-probe under the shared lock and rebind to the stored key, for
    /// key types whose equality is expensive.
    pub fn anticipate_slow_equality(mut self, enabled: bool) -> Self {
        self.anticipate_slow_equality = enabled;
        self
    }

    /// Fetch or build the value for `key`.
    ///
    /// At most one build runs per entry lifetime; concurrent callers wait
    /// on the entry latch and share the outcome. A cached build error is
    /// re-raised until the key is removed.
    pub fn get(&self, key: &K) -> Result<V, CacheError> {
        let mut prefetched = None;
        if self.anticipate_slow_equality {
            let inner = self.inner.read();
            if let Some(&slot) = inner.map.get(key) {
                prefetched = Some(inner.lru.get(slot).clone());
            }
        }
        // Comparisons below run against the entry's own key when the
        // pre-probe found one.
        let lookup_key: &K = prefetched.as_ref().map_or(key, |entry| &entry.key);

        let (entry, needs_build) = {
            let mut inner = self.inner.write();
            self.accessors.fetch_add(1, Ordering::AcqRel);
            let now = self.clock.now_ticks();
            let found = inner.map.get(lookup_key).copied();
            match found {
                Some(slot) => {
                    let entry = inner.lru.get(slot).clone();
                    entry.last_access.store(now, Ordering::Release);
                    inner.lru.move_to_tail(slot);
                    (entry, false)
                }
                None => {
                    let entry = Arc::new(CacheEntry {
                        key: lookup_key.clone(),
                        outcome: OnceLock::new(),
                        ready: Latch::new(),
                        last_access: AtomicU64::new(now),
                    });
                    let slot = inner.lru.push_tail(entry.clone());
                    inner.map.insert(lookup_key.clone(), slot);
                    (entry, true)
                }
            }
        };
        self.leave_accessor();

        if needs_build {
            let guard = PublishGuard {
                entry: &entry,
                armed: true,
            };
            let outcome: BuildOutcome<V> = (self.build)(&entry.key).map_err(Arc::from);
            guard.publish(outcome)
        } else {
            entry.ready.wait();
            match entry.outcome.get() {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(err)) => Err(CacheError::Build(err.clone())),
                None => unreachable!("entry latch set before outcome publication"),
            }
        }
    }

    /// Evict every entry whose last access is at or before `now - min_life`.
    ///
    /// Concurrent calls collapse onto the highest requested horizon; if
    /// another evictor is already running it picks the raised horizon up,
    /// and this call returns immediately.
    pub fn delete_old(&self) {
        let target = self
            .clock
            .now_ticks()
            .saturating_sub(self.min_life_ticks);
        self.horizon.fetch_max(target, Ordering::AcqRel);

        let Some(_deleter) = self.deleter.try_lock() else {
            return;
        };
        let mut evicted = 0usize;
        loop {
            self.yield_to_accessors();
            let horizon = self.horizon.load(Ordering::Acquire);
            let Some(mut inner) = self.inner.try_write() else {
                std::thread::yield_now();
                continue;
            };
            while let Some(head) = inner.lru.head() {
                if self.accessors.load(Ordering::Acquire) > 0 {
                    break;
                }
                if inner.lru.get(head).last_access.load(Ordering::Acquire) > horizon {
                    break;
                }
                let entry = inner.lru.unlink(head);
                inner.map.remove(&entry.key);
                evicted += 1;
            }
            drop(inner);
            // A racing delete_old may have raised the horizon past what was
            // just processed.
            if self.horizon.load(Ordering::Acquire) == horizon {
                break;
            }
        }
        if evicted > 0 {
            log::debug!("evicted {evicted} cache entries past the horizon");
        }
    }

    /// Drop least-recently-used entries until at most `max` remain, then
    /// apply the minimum-lifetime policy to the rest.
    pub fn trim_to(&self, max: usize) {
        {
            let _deleter = self.deleter.lock();
            let mut inner = self.inner.write();
            while inner.map.len() > max {
                let Some(head) = inner.lru.head() else {
                    break;
                };
                let entry = inner.lru.unlink(head);
                inner.map.remove(&entry.key);
            }
        }
        self.delete_old();
    }

    /// Remove a single key; true iff it was present.
    ///
    /// Uncontended removal takes the exclusive lock directly; under
    /// contention a shared probe rules out absent keys before escalating.
    pub fn remove(&self, key: &K) -> bool {
        if let Some(mut inner) = self.inner.try_write() {
            return Self::remove_locked(&mut inner, key);
        }
        {
            let inner = self.inner.read();
            if !inner.map.contains_key(key) {
                return false;
            }
        }
        let mut inner = self.inner.write();
        Self::remove_locked(&mut inner, key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_locked(inner: &mut CacheInner<K, V, S>, key: &K) -> bool {
        match inner.map.remove(key) {
            Some(slot) => {
                inner.lru.unlink(slot);
                true
            }
            None => false,
        }
    }

    fn leave_accessor(&self) {
        if self.accessors.fetch_sub(1, Ordering::AcqRel) == 1
            && self.evictor_parked.load(Ordering::Acquire)
        {
            let _gate = self.accessor_gate.lock();
            self.accessor_cv.notify_all();
        }
    }

    /// Courtesy yield: park while callers are inside the exclusive section.
    /// The park is bounded so a lost wakeup cannot stall an observed
    /// horizon.
    fn yield_to_accessors(&self) {
        while self.accessors.load(Ordering::Acquire) > 0 {
            let mut gate = self.accessor_gate.lock();
            self.evictor_parked.store(true, Ordering::Release);
            if self.accessors.load(Ordering::Acquire) > 0 {
                self.accessor_cv.wait_for(&mut gate, EVICTOR_PARK_WAIT);
            }
            self.evictor_parked.store(false, Ordering::Release);
        }
    }
}

/// Publishes a panic outcome if the build unwinds, so waiters never hang
struct PublishGuard<'a, K, V> {
    entry: &'a CacheEntry<K, V>,
    armed: bool,
}

impl<K, V: Clone> PublishGuard<'_, K, V> {
    fn publish(mut self, outcome: BuildOutcome<V>) -> Result<V, CacheError> {
        let result = match &outcome {
            Ok(value) => Ok(value.clone()),
            Err(err) => Err(CacheError::Build(err.clone())),
        };
        let _ = self.entry.outcome.set(outcome);
        self.entry.ready.set();
        self.armed = false;
        result
    }
}

impl<K, V> Drop for PublishGuard<'_, K, V> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.entry.outcome.set(Err(Arc::new(BuildPanicked)));
            self.entry.ready.set();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_cache(
        min_life: Duration,
    ) -> (Arc<AtomicUsize>, TtlCache<String, String>) {
        let builds = Arc::new(AtomicUsize::new(0));
        let builds2 = builds.clone();
        let cache = TtlCache::new(min_life, move |key: &String| {
            builds2.fetch_add(1, Ordering::SeqCst);
            if key == "bad" {
                return Err("no value for bad".into());
            }
            Ok(format!("{key}:built"))
        });
        (builds, cache)
    }

    #[test]
    fn test_build_once_then_hit() {
        let (builds, cache) = counting_cache(Duration::from_secs(60));

        assert_eq!(cache.get(&"k".to_string()).unwrap(), "k:built");
        assert_eq!(cache.get(&"k".to_string()).unwrap(), "k:built");
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_error_cached_until_removed() {
        let (builds, cache) = counting_cache(Duration::from_secs(60));
        let bad = "bad".to_string();

        let first = cache.get(&bad).unwrap_err();
        let second = cache.get(&bad).unwrap_err();
        assert!(first.to_string().contains("no value for bad"));
        // Same error value, no second build
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        assert!(cache.remove(&bad));
        let _ = cache.get(&bad).unwrap_err();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_missing_key() {
        let (_builds, cache) = counting_cache(Duration::from_secs(60));
        assert!(!cache.remove(&"absent".to_string()));
    }

    #[test]
    fn test_delete_old_respects_min_life() {
        let (_builds, cache) = counting_cache(Duration::from_secs(60));
        cache.get(&"young".to_string()).unwrap();

        cache.delete_old();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_delete_old_evicts_expired() {
        let (_builds, cache) = counting_cache(Duration::from_millis(20));
        cache.get(&"k".to_string()).unwrap();

        std::thread::sleep(Duration::from_millis(40));
        cache.delete_old();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_touch_refreshes_lifetime() {
        let (_builds, cache) = counting_cache(Duration::from_millis(60));
        cache.get(&"k".to_string()).unwrap();

        std::thread::sleep(Duration::from_millis(40));
        cache.get(&"k".to_string()).unwrap(); // re-access
        std::thread::sleep(Duration::from_millis(40));

        // 80ms since insert but only 40ms since last access
        cache.delete_old();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_trim_keeps_most_recent() {
        let (builds, cache) = counting_cache(Duration::from_secs(60));
        for i in 0..10 {
            cache.get(&format!("key-{i}")).unwrap();
        }
        // Re-access the oldest so it survives the trim
        cache.get(&"key-0".to_string()).unwrap();

        cache.trim_to(4);
        assert_eq!(cache.len(), 4);
        // Survivors are the four most-recently-accessed keys and hit
        // without rebuilding
        for key in ["key-0", "key-7", "key-8", "key-9"] {
            cache.get(&key.to_string()).unwrap();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 10);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_slow_equality_probe_path() {
        let (builds, cache) = counting_cache(Duration::from_secs(60));
        let cache = cache.anticipate_slow_equality(true);

        assert_eq!(cache.get(&"k".to_string()).unwrap(), "k:built");
        assert_eq!(cache.get(&"k".to_string()).unwrap(), "k:built");
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_build_panic_does_not_hang_waiters() {
        let cache = TtlCache::new(Duration::from_secs(60), |key: &String| {
            if key == "boom" {
                panic!("builder exploded");
            }
            Ok(key.clone())
        });
        let cache = Arc::new(cache);

        let boom = "boom".to_string();
        let builder = {
            let cache = cache.clone();
            let boom = boom.clone();
            std::thread::spawn(move || cache.get(&boom))
        };
        assert!(builder.join().is_err()); // the panic propagates to the builder

        // A later caller observes the stored panic outcome instead of hanging
        let err = cache.get(&boom).unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }
}
