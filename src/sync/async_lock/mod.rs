/*!
 * FIFO Async Lock
 *
 * A fair, non-blocking exclusive lock. Each enter hands the caller a
 * [`Receipt`] future; completion with `Ok(true)` is the grant, and the same
 * receipt releases the lock. Waiters suspend their task instead of an OS
 * thread.
 *
 * # Enter Protocol
 *
 * 1. Fast path: CAS the holder word from idle.
 * 2. Bounded spin: when the queue is empty and few threads are already
 *    spinning, retry the fast CAS for a short burst; the contention tail of
 *    a short critical section is much shorter than scheduler latency.
 * 3. Queued path: under the state mutex, a last fast CAS, then a fresh
 *    pending receipt enqueued FIFO.
 *
 * # Ordering
 *
 * Grants are strictly FIFO among queued waiters: if receipt R1 was returned
 * incomplete before R2 was returned incomplete, R1 completes with `Ok(true)`
 * first. Synchronous grants carry no ordering guarantee among themselves.
 *
 * # Receipt Reuse
 *
 * With `reuse_receipts` the lock keeps two completed singleton receipts and
 * may return them for any synchronous grant or denial, saving allocation on
 * the hot path. The hazard is the caller's: clones of a reused granted
 * receipt are indistinguishable, so a double exit can release another
 * holder's grant.
 *
 * # Waiter Bookkeeping
 *
 * Waiters live in an id-keyed map plus a FIFO of ids; cancel, timeout, and
 * withdraw remove from the map in O(1) and leave a tombstone id that the
 * next drain skips. Deadlines sit in a lazily-pruned min-heap served by a
 * single sweeper thread rescheduled to the earliest outstanding deadline.
 */

mod receipt;
mod sweeper;

pub use receipt::Receipt;
pub(crate) use receipt::ReceiptState;

use crate::core::limits::{ASYNC_LOCK_MAX_SPINNERS, ASYNC_LOCK_SPIN_LIMIT};
use crate::sync::cancel::{CancelRegistration, CancelToken};
use ahash::RandomState;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use sweeper::Sweeper;

const STOCK_TRUE_ID: u64 = 1;
const STOCK_FALSE_ID: u64 = 2;
const FIRST_FRESH_ID: u64 = 3;

struct Waiter {
    receipt: Receipt,
    /// Deregisters on drop; fires [`Shared::cancel_waiter`] when triggered
    _cancel: Option<CancelRegistration>,
}

struct QueueState {
    /// FIFO of waiter ids; removed waiters leave tombstones
    queue: VecDeque<u64>,
    /// Live waiters by receipt id
    waiters: HashMap<u64, Waiter, RandomState>,
    /// Min-heap over finite deadlines, pruned lazily
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
}

pub(crate) struct Shared {
    reuse_receipts: bool,
    /// Receipt id of the current grant; 0 = unheld
    holder: AtomicU64,
    /// Live waiter count; -1 flags a fast exit in progress
    queue_count: AtomicIsize,
    spinners: AtomicUsize,
    next_id: AtomicU64,
    stock_true: Receipt,
    stock_false: Receipt,
    state: Mutex<QueueState>,
    pub(crate) sweeper: Sweeper,
}

impl Shared {
    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fast claim: CAS the holder word from idle to a granted receipt
    fn claim_fast(&self) -> Option<Receipt> {
        if self.holder.load(Ordering::Acquire) != 0 {
            return None;
        }
        if self.reuse_receipts {
            self.holder
                .compare_exchange(0, STOCK_TRUE_ID, Ordering::AcqRel, Ordering::Relaxed)
                .ok()?;
            Some(self.stock_true.clone())
        } else {
            let id = self.alloc_id();
            self.holder
                .compare_exchange(0, id, Ordering::AcqRel, Ordering::Relaxed)
                .ok()?;
            Some(Receipt::completed(id, ReceiptState::GrantedTrue))
        }
    }

    /// Increment the live waiter count, standing off from a fast exit
    fn push_queue_count(&self) {
        loop {
            let count = self.queue_count.load(Ordering::Acquire);
            if count < 0 {
                std::hint::spin_loop();
                continue;
            }
            if self
                .queue_count
                .compare_exchange_weak(count, count + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    fn pop_queue_count(&self) {
        self.queue_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Cancellation callback: the transition decides the race, the queue
    /// cleanup follows under the state mutex.
    fn cancel_waiter(weak: &Weak<Shared>, receipt: &Receipt) {
        if !receipt.transition(ReceiptState::Canceled) {
            return;
        }
        if let Some(shared) = weak.upgrade() {
            let mut state = shared.state.lock();
            if state.waiters.remove(&receipt.id()).is_some() {
                shared.pop_queue_count();
            }
        }
    }

    /// Deliver `Ok(false)` to every expired waiter; returns the next
    /// outstanding deadline, if any.
    pub(crate) fn sweep(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut state = self.state.lock();
        loop {
            let Some(Reverse((deadline, id))) = state.deadlines.peek().copied() else {
                return None;
            };
            if !state.waiters.contains_key(&id) {
                // Already granted, canceled, or withdrawn
                state.deadlines.pop();
                continue;
            }
            if deadline > now {
                return Some(deadline);
            }
            state.deadlines.pop();
            if let Some(waiter) = state.waiters.remove(&id) {
                self.pop_queue_count();
                waiter.receipt.transition(ReceiptState::GrantedFalse);
            }
        }
    }
}

/// Strictly FIFO, suspension-based exclusive lock
pub struct AsyncLock {
    shared: Arc<Shared>,
}

impl AsyncLock {
    pub fn new(reuse_receipts: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                reuse_receipts,
                holder: AtomicU64::new(0),
                queue_count: AtomicIsize::new(0),
                spinners: AtomicUsize::new(0),
                next_id: AtomicU64::new(FIRST_FRESH_ID),
                stock_true: Receipt::completed(STOCK_TRUE_ID, ReceiptState::GrantedTrue),
                stock_false: Receipt::completed(STOCK_FALSE_ID, ReceiptState::GrantedFalse),
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    waiters: HashMap::default(),
                    deadlines: BinaryHeap::new(),
                }),
                sweeper: Sweeper::new(),
            }),
        }
    }

    /// Acquire the lock, queueing FIFO behind current waiters.
    ///
    /// The receipt completes with `Ok(true)` when the lock is granted; an
    /// already-completed receipt means the grant was synchronous.
    pub fn enter(&self) -> Receipt {
        if let Some(granted) = self.shared.claim_fast() {
            return granted;
        }
        if let Some(granted) = self.spin_for_claim() {
            return granted;
        }
        self.enqueue(None, None)
    }

    /// Single fast claim; the receipt resolves `Ok(false)` on contention
    pub fn try_enter(&self) -> Receipt {
        if let Some(granted) = self.shared.claim_fast() {
            return granted;
        }
        if self.shared.reuse_receipts {
            self.shared.stock_false.clone()
        } else {
            Receipt::completed(self.shared.alloc_id(), ReceiptState::GrantedFalse)
        }
    }

    /// Acquire with a deadline and/or cancellation.
    ///
    /// `None` timeout waits forever; `Some(Duration::ZERO)` degenerates to
    /// [`Self::try_enter`]. A timed-out receipt resolves `Ok(false)`; a
    /// canceled one resolves `Err(Canceled)`.
    pub fn enter_for(&self, timeout: Option<Duration>, cancel: Option<&CancelToken>) -> Receipt {
        if let Some(token) = cancel {
            if token.is_canceled() {
                return Receipt::completed(self.shared.alloc_id(), ReceiptState::Canceled);
            }
        }
        if timeout == Some(Duration::ZERO) {
            return self.try_enter();
        }
        if let Some(granted) = self.shared.claim_fast() {
            return granted;
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        self.enqueue(deadline, cancel)
    }

    /// Release the lock held by `receipt`, granting the next queued waiter.
    ///
    /// Returns true iff the lock was held by this receipt. Called with a
    /// still-pending receipt, the request is withdrawn instead (resolving
    /// `Err(Disposed)`) and false is returned.
    pub fn exit(&self, receipt: &Receipt) -> bool {
        let shared = &self.shared;
        // Fast path: empty queue, sentinel guards the holder handoff.
        if shared
            .queue_count
            .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let held = shared.holder.load(Ordering::Acquire) == receipt.id();
            if held {
                shared.holder.store(0, Ordering::Release);
            }
            shared.queue_count.store(0, Ordering::Release);
            if held {
                return true;
            }
        }
        self.exit_slow(receipt)
    }

    #[inline]
    pub fn is_held(&self) -> bool {
        self.shared.holder.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn is_held_by(&self, receipt: &Receipt) -> bool {
        self.shared.holder.load(Ordering::Acquire) == receipt.id()
    }

    #[inline]
    pub fn reuses_receipts(&self) -> bool {
        self.shared.reuse_receipts
    }

    /// Bounded spin between the fast path and the queued path
    fn spin_for_claim(&self) -> Option<Receipt> {
        let shared = &self.shared;
        if shared.queue_count.load(Ordering::Acquire) > 0
            || shared.spinners.load(Ordering::Relaxed) >= ASYNC_LOCK_MAX_SPINNERS
        {
            return None;
        }
        shared.spinners.fetch_add(1, Ordering::Relaxed);
        let mut claimed = None;
        for _ in 0..ASYNC_LOCK_SPIN_LIMIT {
            std::hint::spin_loop();
            if let Some(granted) = shared.claim_fast() {
                claimed = Some(granted);
                break;
            }
            if shared.queue_count.load(Ordering::Acquire) > 0 {
                break;
            }
        }
        shared.spinners.fetch_sub(1, Ordering::Relaxed);
        claimed
    }

    fn enqueue(&self, deadline: Option<Instant>, cancel: Option<&CancelToken>) -> Receipt {
        let shared = &self.shared;
        let receipt;
        {
            let mut state = shared.state.lock();
            shared.push_queue_count();
            // Last chance: the holder may have released between the failed
            // fast CAS and this critical section. Only valid with no live
            // waiters ahead of us.
            if state.waiters.is_empty() {
                if let Some(granted) = shared.claim_fast() {
                    shared.pop_queue_count();
                    state.queue.clear(); // any leftovers are tombstones
                    return granted;
                }
            }
            let id = shared.alloc_id();
            receipt = Receipt::pending(id);
            state.waiters.insert(
                id,
                Waiter {
                    receipt: receipt.clone(),
                    _cancel: None,
                },
            );
            state.queue.push_back(id);
            if let Some(deadline) = deadline {
                let earliest = state
                    .deadlines
                    .peek()
                    .map_or(true, |Reverse((current, _))| deadline < *current);
                state.deadlines.push(Reverse((deadline, id)));
                if earliest {
                    shared.sweeper.schedule(deadline, shared);
                }
            }
        }
        // Registered outside the queue lock: an inline fire takes the same
        // lock through cancel_waiter.
        if let Some(token) = cancel {
            let registration = token.register({
                let weak = Arc::downgrade(shared);
                let receipt = receipt.clone();
                move || Shared::cancel_waiter(&weak, &receipt)
            });
            let mut state = shared.state.lock();
            match state.waiters.get_mut(&receipt.id()) {
                Some(waiter) => waiter._cancel = Some(registration),
                // Already resolved; dropping deregisters
                None => drop(registration),
            }
        }
        receipt
    }

    fn exit_slow(&self, receipt: &Receipt) -> bool {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if shared.holder.load(Ordering::Acquire) != receipt.id() {
            // Not the holder: withdraw the request if it is still pending.
            if let Some(waiter) = state.waiters.remove(&receipt.id()) {
                shared.pop_queue_count();
                waiter.receipt.transition(ReceiptState::Disposed);
            }
            return false;
        }
        // FIFO handoff: the first waiter that wins {Pending -> GrantedTrue}
        // becomes the holder; cancel and timeout losers are skipped.
        while let Some(id) = state.queue.pop_front() {
            let Some(waiter) = state.waiters.remove(&id) else {
                continue; // tombstone
            };
            shared.pop_queue_count();
            if waiter.receipt.transition(ReceiptState::GrantedTrue) {
                shared.holder.store(id, Ordering::Release);
                return true;
            }
        }
        shared.holder.store(0, Ordering::Release);
        true
    }
}

impl Default for AsyncLock {
    /// Receipt reuse on: the allocation-free synchronous paths
    fn default() -> Self {
        Self::new(true)
    }
}

impl Drop for AsyncLock {
    fn drop(&mut self) {
        self.shared.sweeper.shutdown();
        let mut state = self.shared.state.lock();
        state.deadlines.clear();
        state.queue.clear();
        for (_, waiter) in state.waiters.drain() {
            self.shared.pop_queue_count();
            waiter.receipt.transition(ReceiptState::Disposed);
        }
    }
}

impl std::fmt::Debug for AsyncLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncLock")
            .field("held", &self.is_held())
            .field("reuse_receipts", &self.shared.reuse_receipts)
            .finish()
    }
}
