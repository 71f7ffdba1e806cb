/*!
 * Auto-Evicting Cache
 *
 * Wraps a [`TtlCache`] with a self-arming eviction driver. A `get` arms the
 * driver if it is idle; the driver calls `delete_old` once per interval and
 * disarms itself when the cache drains empty, so an empty cache imposes no
 * periodic wakeups. The next `get` re-arms it.
 */

use crate::cache::ttl::TtlCache;
use crate::core::errors::CacheError;
use ahash::RandomState;
use parking_lot::{Condvar, Mutex};
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct EvictionDriver {
    armed: AtomicBool,
    shutdown: AtomicBool,
    gate: Mutex<()>,
    cv: Condvar,
}

/// [`TtlCache`] with periodic background eviction
pub struct AutoEvictingCache<K, V, S = RandomState> {
    inner: Arc<TtlCache<K, V, S>>,
    driver: Arc<EvictionDriver>,
    interval: Duration,
}

impl<K, V, S> AutoEvictingCache<K, V, S>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    pub fn new(cache: TtlCache<K, V, S>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(cache),
            driver: Arc::new(EvictionDriver {
                armed: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                gate: Mutex::new(()),
                cv: Condvar::new(),
            }),
            interval,
        }
    }

    /// [`TtlCache::get`], arming the eviction driver if it is idle
    pub fn get(&self, key: &K) -> Result<V, CacheError> {
        let result = self.inner.get(key);
        self.arm();
        result
    }

    pub fn remove(&self, key: &K) -> bool {
        self.inner.remove(key)
    }

    pub fn delete_old(&self) {
        self.inner.delete_old();
    }

    pub fn trim_to(&self, max: usize) {
        self.inner.trim_to(max);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// True while the driver thread is scheduled (for diagnostics)
    pub fn timer_armed(&self) -> bool {
        self.driver.armed.load(Ordering::Acquire)
    }

    fn arm(&self) {
        if self.driver.armed.swap(true, Ordering::AcqRel) {
            return;
        }
        let cache = Arc::clone(&self.inner);
        let driver = Arc::clone(&self.driver);
        let interval = self.interval;
        let spawned = thread::Builder::new()
            .name("synckit-cache-evictor".into())
            .spawn(move || {
                log::debug!("eviction driver armed");
                loop {
                    {
                        let mut gate = driver.gate.lock();
                        if driver.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        driver.cv.wait_for(&mut gate, interval);
                    }
                    if driver.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    cache.delete_old();
                    if cache.is_empty() {
                        break;
                    }
                }
                driver.armed.store(false, Ordering::Release);
                log::debug!("eviction driver disarmed");
            });
        if let Err(err) = spawned {
            self.driver.armed.store(false, Ordering::Release);
            log::error!("failed to spawn eviction driver: {err}");
        }
    }
}

impl<K, V, S> Drop for AutoEvictingCache<K, V, S> {
    fn drop(&mut self) {
        self.driver.shutdown.store(true, Ordering::Release);
        let _gate = self.driver.gate.lock();
        self.driver.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(min_life: Duration, interval: Duration) -> AutoEvictingCache<String, String> {
        let inner = TtlCache::new(min_life, |key: &String| Ok(format!("{key}:v")));
        AutoEvictingCache::new(inner, interval)
    }

    #[test]
    fn test_get_arms_driver() {
        let cache = cache(Duration::from_secs(60), Duration::from_millis(20));
        assert!(!cache.timer_armed());

        cache.get(&"k".to_string()).unwrap();
        assert!(cache.timer_armed());
    }

    #[test]
    fn test_driver_disarms_when_empty() {
        let cache = cache(Duration::from_millis(10), Duration::from_millis(20));
        cache.get(&"k".to_string()).unwrap();

        // The entry outlives min_life, gets swept, and the driver stands down
        std::thread::sleep(Duration::from_millis(150));
        assert!(cache.is_empty());
        assert!(!cache.timer_armed());

        // A new get re-arms
        cache.get(&"k2".to_string()).unwrap();
        assert!(cache.timer_armed());
    }

    #[test]
    fn test_delegates() {
        let cache = cache(Duration::from_secs(60), Duration::from_secs(60));
        cache.get(&"a".to_string()).unwrap();
        cache.get(&"b".to_string()).unwrap();
        assert_eq!(cache.len(), 2);

        assert!(cache.remove(&"a".to_string()));
        assert_eq!(cache.len(), 1);

        cache.trim_to(0);
        assert!(cache.is_empty());
    }
}
