/*!
 * Caching
 *
 * Single-flight computed-value caching:
 * - `TtlCache`: minimum-lifetime retention, LRU trimming, error caching
 * - `AutoEvictingCache`: the above plus a self-arming eviction driver
 */

pub mod auto_evict;
pub(crate) mod lru;
pub mod ttl;

pub use auto_evict::AutoEvictingCache;
pub use ttl::{BuildError, TtlCache};
