/*!
 * One-Shot Latch
 *
 * A boolean flag that transitions false → true exactly once and wakes every
 * waiter, with lazy allocation of the blocking primitive.
 *
 * # Design
 *
 * The fast path is a single atomic load. The condvar slot is allocated only
 * if some thread reaches the waiting path before the flag is set; `set`
 * clears the slot so it is never allocated again. Cheap when set races
 * wait, which is the common case for publication latches.
 */

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Event {
    lock: Mutex<()>,
    cv: Condvar,
}

impl Event {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }
}

/// One-shot latch; cannot be reset
pub struct Latch {
    is_set: AtomicBool,
    /// Lazily allocated wait slot; cleared permanently by `set`
    event: Mutex<Option<Arc<Event>>>,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            is_set: AtomicBool::new(false),
            event: Mutex::new(None),
        }
    }

    /// Memory-ordered read of the flag
    #[inline]
    pub fn is_set(&self) -> bool {
        self.is_set.load(Ordering::Acquire)
    }

    /// Set the flag and wake every waiter.
    ///
    /// Idempotent and safe to call concurrently. After the first `set`
    /// returns, every subsequent or already-blocked `wait` returns in
    /// bounded time.
    pub fn set(&self) {
        self.is_set.store(true, Ordering::Release);
        let event = self.event.lock().take();
        if let Some(event) = event {
            // Taking the slot lock orders the notify after any waiter that
            // checked the flag and is committing to sleep.
            let _guard = event.lock.lock();
            event.cv.notify_all();
        }
    }

    /// Block until the flag is set
    pub fn wait(&self) {
        if self.is_set() {
            return;
        }
        let Some(event) = self.waiting_event() else {
            return;
        };
        let mut guard = event.lock.lock();
        while !self.is_set() {
            event.cv.wait(&mut guard);
        }
    }

    /// Block until the flag is set or the timeout elapses.
    ///
    /// Returns the flag value at return, so a true result is a real wake
    /// and never a spurious one.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let Some(event) = self.waiting_event() else {
            return true;
        };
        let mut guard = event.lock.lock();
        while !self.is_set() {
            if event.cv.wait_until(&mut guard, deadline).timed_out() {
                return self.is_set();
            }
        }
        true
    }

    /// Install or reuse the wait slot; `None` means the flag was set while
    /// we held the slot lock and no wait is needed.
    fn waiting_event(&self) -> Option<Arc<Event>> {
        let mut slot = self.event.lock();
        if self.is_set() {
            return None;
        }
        Some(slot.get_or_insert_with(|| Arc::new(Event::new())).clone())
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("is_set", &self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_set_before_wait() {
        let latch = Latch::new();
        assert!(!latch.is_set());
        latch.set();
        assert!(latch.is_set());
        // Returns immediately, no slot allocated
        latch.wait();
        assert!(latch.event.lock().is_none());
    }

    #[test]
    fn test_set_is_idempotent() {
        let latch = Latch::new();
        latch.set();
        latch.set();
        assert!(latch.is_set());
    }

    #[test]
    fn test_wait_blocks_until_set() {
        let latch = Arc::new(Latch::new());
        let latch2 = latch.clone();

        let handle = thread::spawn(move || {
            latch2.wait();
            latch2.is_set()
        });

        thread::sleep(Duration::from_millis(50));
        latch.set();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_wakes_multiple_waiters() {
        let latch = Arc::new(Latch::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let latch = latch.clone();
                thread::spawn(move || {
                    latch.wait();
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        latch.set();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_wait_for_timeout() {
        let latch = Latch::new();
        let start = Instant::now();
        assert!(!latch.wait_for(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_for_set() {
        let latch = Arc::new(Latch::new());
        let latch2 = latch.clone();

        let handle = thread::spawn(move || latch2.wait_for(Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(20));
        latch.set();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_slot_cleared_after_set() {
        let latch = Arc::new(Latch::new());
        let latch2 = latch.clone();

        let handle = thread::spawn(move || latch2.wait());
        thread::sleep(Duration::from_millis(20));
        latch.set();
        handle.join().unwrap();

        // The event reference is gone and will not come back
        assert!(latch.event.lock().is_none());
        latch.wait();
        assert!(latch.event.lock().is_none());
    }
}
