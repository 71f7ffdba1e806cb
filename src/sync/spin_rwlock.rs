/*!
 * Spin Reader/Writer Lock
 *
 * Non-thread-affine, non-reentrant reader/writer lock whose whole state is
 * one 64-bit atomic word; no auxiliary locks, no blocking primitive.
 *
 * # State Encoding
 *
 * - Low 32 bits: reader count, with `0xFFFF_FFFF` as the "exclusive lock
 *   held" sentinel.
 * - High 32 bits: sum of per-thread marks published while a thread is
 *   mid-transition. Nonzero high bits block a writer grant from landing
 *   between the two halves of an acquisition.
 *
 * Marks are added and removed with exact arithmetic, so concurrent
 * mid-transition readers compose and cancel without interfering. A writer
 * mid-claim is the one state a reader must not join: reader count zero with
 * nonzero high bits.
 *
 * # The `taken` Flag Contract
 *
 * Every enter operation takes a `taken: &mut bool` that must be false on
 * entry and is written true only once the lock is truly held. The write of
 * the flag is adjacent to the publication of the held state with no failure
 * point in between, so a caller's cleanup path can trust the flag even when
 * unwinding. [`SpinRw`] layers RAII guards on the same discipline.
 *
 * # Fairness
 *
 * Readers have implicit priority: a writer that observes any reader yields
 * and retries. Writer starvation is the accepted trade.
 */

use crate::core::errors::SyncError;
use crate::core::limits::SPIN_RWLOCK_MAX_READERS;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;

const LOW_MASK: u64 = 0x0000_0000_FFFF_FFFF;
const HIGH_MASK: u64 = 0xFFFF_FFFF_0000_0000;

/// Low-word sentinel: the exclusive lock is held
const WRITER: u64 = 0x0000_0000_FFFF_FFFF;

static NEXT_MARK: AtomicU32 = AtomicU32::new(1);

thread_local! {
    /// Nonzero per-thread mark, pre-shifted into the high word
    static THREAD_MARK: u64 = {
        loop {
            let mark = NEXT_MARK.fetch_add(1, Ordering::Relaxed);
            if mark != 0 {
                break u64::from(mark) << 32;
            }
        }
    };
}

#[inline]
fn thread_mark() -> u64 {
    THREAD_MARK.with(|mark| *mark)
}

/// Reader/writer spinlock in a single atomic word
pub struct SpinRwLock {
    state: AtomicU64,
}

impl SpinRwLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
        }
    }

    /// True when no writer holds the lock and a reader could still join
    #[inline]
    pub fn is_readable(&self) -> bool {
        let readers = self.state.load(Ordering::Acquire) & LOW_MASK;
        readers != WRITER && readers < SPIN_RWLOCK_MAX_READERS
    }

    /// True when the lock is completely idle
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.state.load(Ordering::Acquire) == 0
    }

    /// At-most-one CAS attempt against the idle state.
    ///
    /// On a cleanly observed busy state `taken` is left false. On success
    /// the word passes through `own_mark << 32` (readers see a writer
    /// mid-claim and stand off) before the sentinel store publishes the
    /// exclusive hold.
    pub fn try_enter_write(&self, taken: &mut bool) -> Result<(), SyncError> {
        Self::check_flag(taken, "try_enter_write")?;
        if self.write_attempt() {
            *taken = true;
        }
        Ok(())
    }

    /// Loop [`Self::try_enter_write`] with an OS yield on each failure
    pub fn enter_write(&self, taken: &mut bool) -> Result<(), SyncError> {
        Self::check_flag(taken, "enter_write")?;
        while !self.write_attempt() {
            thread::yield_now();
        }
        *taken = true;
        Ok(())
    }

    /// Release the exclusive hold.
    ///
    /// Fails with [`SyncError::InvalidRelease`] if the exclusive sentinel is
    /// not present; the word may be inconsistent afterwards and no recovery
    /// is attempted.
    pub fn exit_write(&self) -> Result<(), SyncError> {
        self.state
            .compare_exchange(WRITER, 0, Ordering::Release, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| SyncError::InvalidRelease)
    }

    /// Attempt a shared acquisition, retrying past transient contention.
    ///
    /// `taken` is left false only when a writer was observed holding the
    /// lock.
    pub fn try_enter_read(&self, taken: &mut bool) -> Result<(), SyncError> {
        Self::check_flag(taken, "try_enter_read")?;
        if self.read_attempt() {
            *taken = true;
        }
        Ok(())
    }

    /// Loop [`Self::try_enter_read`] with an OS yield while a writer holds
    pub fn enter_read(&self, taken: &mut bool) -> Result<(), SyncError> {
        Self::check_flag(taken, "enter_read")?;
        while !self.read_attempt() {
            thread::yield_now();
        }
        *taken = true;
        Ok(())
    }

    /// Release a shared hold.
    ///
    /// Underflow and writer aliasing are detected on the decremented value
    /// and reverted with a matching increment before failing.
    pub fn exit_read(&self) -> Result<(), SyncError> {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        let readers = prev & LOW_MASK;
        if readers == 0 || readers == WRITER {
            self.state.fetch_add(1, Ordering::Relaxed);
            return Err(SyncError::InvalidRelease);
        }
        Ok(())
    }

    /// Single write claim attempt. True iff the exclusive hold was taken.
    fn write_attempt(&self) -> bool {
        if self.state.load(Ordering::Acquire) != 0 {
            return false;
        }
        let mark = thread_mark();
        if self
            .state
            .compare_exchange(0, mark, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        // Only this thread writes the word between the claim above and the
        // sentinel below: readers stand off from a zero count with high bits
        // set, and other writers fail the zero-expectation CAS.
        self.state.store(WRITER, Ordering::Release);
        true
    }

    /// Shared acquisition attempt. False iff a writer was observed.
    fn read_attempt(&self) -> bool {
        let mark = thread_mark();
        loop {
            let current = self.state.load(Ordering::Acquire);
            let readers = current & LOW_MASK;
            if readers == WRITER {
                return false;
            }
            // Zero readers with high bits set is a writer mid-claim; joining
            // it would be clobbered by the sentinel store.
            if readers == 0 && current & HIGH_MASK != 0 {
                thread::yield_now();
                continue;
            }
            if readers >= SPIN_RWLOCK_MAX_READERS {
                thread::yield_now();
                continue;
            }
            let marked = current.wrapping_add(mark);
            if self
                .state
                .compare_exchange_weak(current, marked, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // Commit the reader and retire the mark in one atomic step.
                self.state
                    .fetch_add(1u64.wrapping_sub(mark), Ordering::AcqRel);
                return true;
            }
            thread::yield_now();
        }
    }

    fn check_flag(taken: &bool, operation: &str) -> Result<(), SyncError> {
        if *taken {
            return Err(SyncError::AlreadyHeld(operation.to_string()));
        }
        Ok(())
    }
}

impl Default for SpinRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SpinRwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("SpinRwLock")
            .field("readers", &(state & LOW_MASK))
            .field("writer", &(state & LOW_MASK == WRITER))
            .finish()
    }
}

/// Data cell guarded by a [`SpinRwLock`], with RAII guards
///
/// The guards are the structured rendition of the `taken` flag contract:
/// a guard exists exactly while the lock is held, and its drop is the
/// matching exit.
pub struct SpinRw<T> {
    lock: SpinRwLock,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is mediated by the reader/writer protocol;
// shared guards hand out `&T`, the exclusive guard hands out `&mut T`.
unsafe impl<T: Send> Send for SpinRw<T> {}
unsafe impl<T: Send + Sync> Sync for SpinRw<T> {}

impl<T> SpinRw<T> {
    pub fn new(value: T) -> Self {
        Self {
            lock: SpinRwLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire a shared guard, spinning past any writer
    pub fn read(&self) -> SpinRwReadGuard<'_, T> {
        while !self.lock.read_attempt() {
            thread::yield_now();
        }
        SpinRwReadGuard { cell: self }
    }

    /// Acquire the exclusive guard, spinning past readers and writers
    pub fn write(&self) -> SpinRwWriteGuard<'_, T> {
        while !self.lock.write_attempt() {
            thread::yield_now();
        }
        SpinRwWriteGuard { cell: self }
    }

    /// Single exclusive claim attempt
    pub fn try_write(&self) -> Option<SpinRwWriteGuard<'_, T>> {
        if self.lock.write_attempt() {
            Some(SpinRwWriteGuard { cell: self })
        } else {
            None
        }
    }

    /// The underlying lock, for state inspection
    pub fn lock(&self) -> &SpinRwLock {
        &self.lock
    }
}

impl<T> std::fmt::Debug for SpinRw<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinRw").field("lock", &self.lock).finish()
    }
}

pub struct SpinRwReadGuard<'a, T> {
    cell: &'a SpinRw<T>,
}

impl<T> Deref for SpinRwReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the shared hold excludes writers for the guard's lifetime.
        unsafe { &*self.cell.value.get() }
    }
}

impl<T> Drop for SpinRwReadGuard<'_, T> {
    fn drop(&mut self) {
        let released = self.cell.lock.exit_read();
        debug_assert!(released.is_ok(), "read guard dropped without a hold");
    }
}

pub struct SpinRwWriteGuard<'a, T> {
    cell: &'a SpinRw<T>,
}

impl<T> Deref for SpinRwWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the exclusive hold excludes all other access.
        unsafe { &*self.cell.value.get() }
    }
}

impl<T> DerefMut for SpinRwWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the exclusive hold excludes all other access.
        unsafe { &mut *self.cell.value.get() }
    }
}

impl<T> Drop for SpinRwWriteGuard<'_, T> {
    fn drop(&mut self) {
        let released = self.cell.lock.exit_write();
        debug_assert!(released.is_ok(), "write guard dropped without a hold");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_write_enter_exit() {
        let lock = SpinRwLock::new();
        let mut taken = false;

        lock.try_enter_write(&mut taken).unwrap();
        assert!(taken);
        assert!(!lock.is_writable());
        assert!(!lock.is_readable());

        lock.exit_write().unwrap();
        assert!(lock.is_writable());
        assert!(lock.is_readable());
    }

    #[test]
    fn test_read_enter_exit() {
        let lock = SpinRwLock::new();
        let mut first = false;
        let mut second = false;

        lock.enter_read(&mut first).unwrap();
        lock.enter_read(&mut second).unwrap();
        assert!(first && second);
        assert!(lock.is_readable());
        assert!(!lock.is_writable());

        lock.exit_read().unwrap();
        lock.exit_read().unwrap();
        assert!(lock.is_writable());
    }

    #[test]
    fn test_writer_blocks_try_read() {
        let lock = SpinRwLock::new();
        let mut writer = false;
        lock.enter_write(&mut writer).unwrap();

        let mut reader = false;
        lock.try_enter_read(&mut reader).unwrap();
        assert!(!reader);

        lock.exit_write().unwrap();
        lock.try_enter_read(&mut reader).unwrap();
        assert!(reader);
        lock.exit_read().unwrap();
    }

    #[test]
    fn test_reader_blocks_try_write() {
        let lock = SpinRwLock::new();
        let mut reader = false;
        lock.enter_read(&mut reader).unwrap();

        let mut writer = false;
        lock.try_enter_write(&mut writer).unwrap();
        assert!(!writer);

        lock.exit_read().unwrap();
        lock.try_enter_write(&mut writer).unwrap();
        assert!(writer);
        lock.exit_write().unwrap();
    }

    #[test]
    fn test_flag_already_set_rejected() {
        let lock = SpinRwLock::new();
        let mut taken = true;
        assert!(matches!(
            lock.try_enter_read(&mut taken),
            Err(SyncError::AlreadyHeld(_))
        ));
        assert!(matches!(
            lock.enter_write(&mut taken),
            Err(SyncError::AlreadyHeld(_))
        ));
    }

    #[test]
    fn test_illegal_releases() {
        let lock = SpinRwLock::new();
        assert_eq!(lock.exit_write(), Err(SyncError::InvalidRelease));
        assert_eq!(lock.exit_read(), Err(SyncError::InvalidRelease));
        // The reverted word is still usable
        assert!(lock.is_writable());

        let mut taken = false;
        lock.enter_read(&mut taken).unwrap();
        assert_eq!(lock.exit_write(), Err(SyncError::InvalidRelease));
        lock.exit_read().unwrap();
    }

    #[test]
    fn test_concurrent_writers_count() {
        let cell = Arc::new(SpinRw::new(0u64));
        let mut handles = vec![];

        for _ in 0..8 {
            let cell = cell.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *cell.write() += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*cell.read(), 8_000);
        assert!(cell.lock().is_writable());
    }

    #[test]
    fn test_readers_overlap() {
        let lock = Arc::new(SpinRwLock::new());
        let lock2 = lock.clone();

        let mut taken = false;
        lock.enter_read(&mut taken).unwrap();

        // A second thread can read while the first holds
        let joined = thread::spawn(move || {
            let mut taken = false;
            lock2.try_enter_read(&mut taken).unwrap();
            let ok = taken;
            if taken {
                lock2.exit_read().unwrap();
            }
            ok
        })
        .join()
        .unwrap();

        assert!(joined);
        lock.exit_read().unwrap();
    }

    #[test]
    fn test_try_write_cell() {
        let cell = SpinRw::new(5i32);
        let guard = cell.read();
        assert!(cell.try_write().is_none());
        drop(guard);

        let mut guard = cell.try_write().expect("idle lock");
        *guard = 6;
        drop(guard);
        assert_eq!(*cell.read(), 6);
    }
}
