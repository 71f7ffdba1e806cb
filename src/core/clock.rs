/*!
 * Tick Clock
 *
 * Monotonic tick source for last-access stamps and eviction horizons.
 * Ticks are nanoseconds since a per-clock base instant, so they fit in an
 * `AtomicU64` and can be compared and max-raised without taking a lock.
 */

use std::time::{Duration, Instant};

/// Monotonic nanosecond tick source
#[derive(Debug, Clone)]
pub struct TickClock {
    base: Instant,
}

impl TickClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
        }
    }

    /// Current ticks since the clock base
    ///
    /// Starts at 1 so that 0 can serve as an "always eligible" horizon floor.
    #[inline]
    pub fn now_ticks(&self) -> u64 {
        saturating_nanos(self.base.elapsed()).saturating_add(1)
    }

    /// Convert a duration to ticks
    #[inline]
    pub fn ticks_for(duration: Duration) -> u64 {
        saturating_nanos(duration)
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
