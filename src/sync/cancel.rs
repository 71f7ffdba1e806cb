/*!
 * Cancellation Token
 *
 * One-shot cancellation source with O(1) callback registration and
 * deregistration-on-drop. A registration made after cancellation fires its
 * callback immediately on the registering thread; otherwise callbacks run
 * on the canceling thread, exactly once.
 */

use ahash::RandomState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback = Box<dyn FnOnce() + Send>;

struct Inner {
    canceled: AtomicBool,
    callbacks: Mutex<HashMap<u64, Callback, RandomState>>,
    next_id: AtomicU64,
}

/// Cloneable handle to a one-shot cancellation source
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                callbacks: Mutex::new(HashMap::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Cancel the token and run every registered callback.
    ///
    /// Idempotent; only the first call drains the callback table.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks: Vec<Callback> = {
            let mut table = self.inner.callbacks.lock();
            table.drain().map(|(_, callback)| callback).collect()
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Register a callback to run on cancellation.
    ///
    /// The returned registration removes the callback when dropped. If the
    /// token is already canceled the callback runs inline before this
    /// returns, so callers must not hold locks the callback takes.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> CancelRegistration {
        {
            let mut table = self.inner.callbacks.lock();
            // The flag is raised before the canceling thread drains the
            // table, so a check under the table lock cannot miss it.
            if !self.is_canceled() {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                table.insert(id, Box::new(callback));
                return CancelRegistration {
                    token: Some(Arc::downgrade(&self.inner)),
                    id,
                };
            }
        }
        callback();
        CancelRegistration { token: None, id: 0 }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Removes its callback from the token when dropped
pub struct CancelRegistration {
    token: Option<Weak<Inner>>,
    id: u64,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Some(weak) = self.token.take() {
            if let Some(inner) = weak.upgrade() {
                inner.callbacks.lock().remove(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_runs_callback() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        let _reg = token.register(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!token.is_canceled());
        token.cancel();
        assert!(token.is_canceled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Second cancel is a no-op
        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_after_cancel_fires_inline() {
        let token = CancelToken::new();
        token.cancel();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let _reg = token.register(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_registration_does_not_fire() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        let reg = token.register(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        drop(reg);

        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_canceled());
    }
}
