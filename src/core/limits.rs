/*!
 * Tunable Limits and Constants
 *
 * Centralized location for the crate's thresholds and magic numbers.
 * All values include rationale comments explaining WHY they exist.
 * Performance-critical constants are marked with [PERF].
 */

use std::time::Duration;

// =============================================================================
// ASYNC LOCK
// =============================================================================

/// Spin iterations attempted before a contended enter falls back to the
/// queued path.
/// [PERF] The contention tail of a short critical section is much shorter
/// than scheduler latency; ~200 pause cycles cover it without burning a
/// timeslice.
pub const ASYNC_LOCK_SPIN_LIMIT: u32 = 200;

/// Maximum number of threads allowed in the spin phase at once.
/// [PERF] Beyond a handful of spinners the cache line ping-pong costs more
/// than queueing; extra arrivals go straight to the queue.
pub const ASYNC_LOCK_MAX_SPINNERS: usize = 4;

// =============================================================================
// SPIN READER/WRITER LOCK
// =============================================================================

/// Highest representable reader count.
/// One below the low-word writer sentinel `0xFFFF_FFFF`; an enter observing
/// this many readers yields rather than alias the sentinel.
pub const SPIN_RWLOCK_MAX_READERS: u64 = 0xFFFF_FFFE;

// =============================================================================
// CACHE EVICTION
// =============================================================================

/// Upper bound on a single courtesy-yield park while an evictor defers to
/// live accessors.
/// Bounded so an evictor that has observed a horizon always makes forward
/// progress even if a wakeup is lost to a race.
pub const EVICTOR_PARK_WAIT: Duration = Duration::from_micros(200);
