//! Cache Budget and Eviction
//!
//! Shared by every tree driven by one controller:
//!
//! - [`CacheBudget`]: used-byte counter with lower/upper watermarks
//! - [`CacheBuffer`]: RAII block buffer accounted against the budget
//! - [`LiveCache`]: lock-free FIFO of nodes holding buffers, swept per round
//! - [`CacheMetrics`]: hit/eviction/round counters

mod budget;
mod live;
mod metrics;

pub use budget::{CacheBudget, CacheBuffer, Usage};
pub use live::{CacheOwner, CacheRef, LiveCache};
pub use metrics::{CacheMetrics, MetricsSnapshot};
