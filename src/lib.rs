/*!
 * synckit
 *
 * Synchronization and caching core:
 *
 * - [`SpinRwLock`] — lock-free reader/writer lock in a single 64-bit atomic
 *   word, safe against asynchronous termination via the `taken`-flag
 *   discipline and RAII guards.
 * - [`Latch`] — one-shot flag with lazy allocation of its blocking
 *   primitive.
 * - [`AsyncLock`] — strictly FIFO, suspension-based exclusive lock handing
 *   each requester a [`Receipt`] future, with cancellation and
 *   deadline-based timeout.
 * - [`TtlCache`] / [`AutoEvictingCache`] — concurrent computed-value cache
 *   with per-key single-flight, minimum-lifetime eviction, and LRU trimming.
 *
 * Each primitive is self-contained; there is no shared event loop. The
 * cache composes the spinlock and the latch.
 */

pub mod cache;
pub mod core;
pub mod sync;

pub use cache::{AutoEvictingCache, TtlCache};
pub use core::errors::{AsyncLockError, CacheError, SyncError};
pub use sync::{AsyncLock, CancelToken, Latch, Receipt, SpinRw, SpinRwLock};
