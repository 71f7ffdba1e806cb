/*!
 * Deadline Sweeper
 *
 * A single lazily spawned thread services every deadline-bounded waiter of
 * one lock. It parks until the earliest outstanding deadline, sweeps
 * expired waiters, and reparks at whatever deadline the sweep reports
 * next. Locks that never use timeouts never pay for a thread.
 */

use super::Shared;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

pub(crate) struct Sweeper {
    inner: Mutex<SweeperState>,
    cv: Condvar,
}

struct SweeperState {
    /// Earliest instant the thread must wake at, if any
    next_wake: Option<Instant>,
    running: bool,
    shutdown: bool,
}

impl Sweeper {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SweeperState {
                next_wake: None,
                running: false,
                shutdown: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Ensure the sweeper fires no later than `deadline`, spawning the
    /// thread on first use.
    pub(crate) fn schedule(&self, deadline: Instant, shared: &Arc<Shared>) {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return;
        }
        let earlier = inner.next_wake.map_or(true, |current| deadline < current);
        if earlier {
            inner.next_wake = Some(deadline);
        }
        if !inner.running {
            let weak = Arc::downgrade(shared);
            match thread::Builder::new()
                .name("synckit-lock-sweeper".into())
                .spawn(move || Self::run(weak))
            {
                Ok(_) => inner.running = true,
                Err(err) => {
                    // Timeouts degrade to never firing; grants and
                    // cancellation still work.
                    log::error!("failed to spawn deadline sweeper: {err}");
                    inner.next_wake = None;
                }
            }
        } else if earlier {
            self.cv.notify_one();
        }
    }

    /// Stop the thread; called from the owning lock's teardown
    pub(crate) fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        self.cv.notify_one();
    }

    fn run(weak: Weak<Shared>) {
        loop {
            let Some(shared) = weak.upgrade() else {
                return;
            };

            // Park until the earliest deadline is due.
            {
                let sweeper = &shared.sweeper;
                let mut inner = sweeper.inner.lock();
                loop {
                    if inner.shutdown {
                        inner.running = false;
                        return;
                    }
                    match inner.next_wake {
                        None => sweeper.cv.wait(&mut inner),
                        Some(at) if Instant::now() < at => {
                            sweeper.cv.wait_until(&mut inner, at);
                        }
                        Some(_) => {
                            inner.next_wake = None;
                            break;
                        }
                    }
                }
            }

            let next = shared.sweep();
            if let Some(next) = next {
                let mut inner = shared.sweeper.inner.lock();
                if inner.shutdown {
                    inner.running = false;
                    return;
                }
                inner.next_wake = Some(match inner.next_wake {
                    Some(current) => current.min(next),
                    None => next,
                });
            }
        }
    }
}
