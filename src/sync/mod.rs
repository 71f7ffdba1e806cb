/*!
 * Synchronization Primitives
 *
 * The locking core of the crate:
 * - `SpinRwLock` / `SpinRw`: word-sized reader/writer spinlock
 * - `Latch`: one-shot flag with lazy blocking primitive
 * - `AsyncLock` / `Receipt`: FIFO suspension-based exclusive lock
 * - `CancelToken`: one-shot cancellation source for lock requests
 */

pub mod async_lock;
pub mod cancel;
pub mod latch;
pub mod spin_rwlock;

pub use async_lock::{AsyncLock, Receipt};
pub use cancel::{CancelRegistration, CancelToken};
pub use latch::Latch;
pub use spin_rwlock::{SpinRw, SpinRwLock, SpinRwReadGuard, SpinRwWriteGuard};
