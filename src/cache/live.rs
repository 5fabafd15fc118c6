//! Live-cache queue
//!
//! Every node that holds a buffer is recorded once on a lock-free FIFO.
//! During the GC phase workers pop entries and ask the owning tree to evict
//! the node until usage falls to the round's target. Entries are weak: a
//! dropped tree or a reused arena slot simply makes the entry stale.

use std::sync::Weak;

use crossbeam::queue::SegQueue;
use tracing::trace;

use super::{CacheBudget, CacheMetrics};
use crate::tree::NodeId;

/// Something that owns cached nodes and can evict them
pub trait CacheOwner: Send + Sync {
    /// Flush and release the buffer of `id`.
    ///
    /// Returns true if a buffer was released. Stale ids return false.
    fn evict(&self, id: NodeId, metrics: &CacheMetrics) -> bool;

    /// Persist the buffer of `id` if dirty and keep it cached.
    ///
    /// `None` once `id` no longer holds a buffer.
    fn flush(&self, id: NodeId, metrics: &CacheMetrics) -> Option<bool>;
}

/// Weak reference to a cached node
pub struct CacheRef {
    owner: Weak<dyn CacheOwner>,
    id: NodeId,
}

impl CacheRef {
    pub fn new(owner: Weak<dyn CacheOwner>, id: NodeId) -> Self {
        Self { owner, id }
    }
}

/// Queue of nodes currently holding a buffer
#[derive(Default)]
pub struct LiveCache {
    queue: SegQueue<CacheRef>,
}

impl LiveCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node holding a buffer
    pub fn push(&self, entry: CacheRef) {
        self.queue.push(entry);
    }

    /// Entries currently queued (stale ones included)
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Evict one queued entry. Returns false once the queue is empty.
    pub fn consume_one(&self, metrics: &CacheMetrics) -> bool {
        let Some(entry) = self.queue.pop() else {
            return false;
        };
        match entry.owner.upgrade() {
            Some(owner) => {
                if owner.evict(entry.id, metrics) {
                    metrics.record_eviction();
                }
            }
            None => trace!(node = %entry.id, "Discarding entry of dropped tree"),
        }
        true
    }

    /// Flush every queued entry without evicting it.
    ///
    /// Live entries are re-queued, stale ones dropped. Returns the number of
    /// failed flushes.
    pub fn flush_all(&self, metrics: &CacheMetrics) -> usize {
        let mut failures = 0;
        for _ in 0..self.queue.len() {
            let Some(entry) = self.queue.pop() else {
                break;
            };
            let Some(owner) = entry.owner.upgrade() else {
                continue;
            };
            if let Some(ok) = owner.flush(entry.id, metrics) {
                if !ok {
                    failures += 1;
                }
                self.queue.push(entry);
            }
        }
        failures
    }

    /// Evict until `used <= target` or the queue runs dry
    pub fn sweep(&self, budget: &CacheBudget, target: u64, metrics: &CacheMetrics) {
        while budget.used() > target && self.consume_one(metrics) {}
    }
}

impl std::fmt::Debug for LiveCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCache")
            .field("len", &self.queue.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheBuffer;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Holder {
        buffers: Mutex<Vec<Option<CacheBuffer>>>,
    }

    impl CacheOwner for Holder {
        fn evict(&self, id: NodeId, _metrics: &CacheMetrics) -> bool {
            let mut buffers = self.buffers.lock();
            match buffers.get_mut(id.index() as usize) {
                Some(slot) => slot.take().is_some(),
                None => false,
            }
        }

        fn flush(&self, id: NodeId, _metrics: &CacheMetrics) -> Option<bool> {
            let buffers = self.buffers.lock();
            match buffers.get(id.index() as usize) {
                Some(Some(_)) => Some(id.generation() == 0),
                _ => None,
            }
        }
    }

    fn holder(budget: &Arc<CacheBudget>, count: usize, size: u64) -> Arc<Holder> {
        let buffers = (0..count)
            .map(|_| Some(budget.try_allocate(size).unwrap()))
            .collect();
        Arc::new(Holder {
            buffers: Mutex::new(buffers),
        })
    }

    #[test]
    fn test_sweep_stops_at_target() {
        let budget = Arc::new(CacheBudget::new(0, 1 << 20));
        let metrics = CacheMetrics::new();
        let owner = holder(&budget, 4, 100);
        let live = LiveCache::new();
        for index in 0..4 {
            let weak: Weak<dyn CacheOwner> = Arc::downgrade(&owner) as Weak<dyn CacheOwner>;
            live.push(CacheRef::new(weak, NodeId::new(index, 0)));
        }

        live.sweep(&budget, 250, &metrics);
        assert_eq!(budget.used(), 200);
        assert_eq!(live.len(), 2);
        assert_eq!(metrics.evictions(), 2);

        live.sweep(&budget, 0, &metrics);
        assert_eq!(budget.used(), 0);
        assert!(live.is_empty());
    }

    #[test]
    fn test_dropped_owner_is_discarded() {
        let budget = Arc::new(CacheBudget::new(0, 1 << 20));
        let metrics = CacheMetrics::new();
        let live = LiveCache::new();
        {
            let owner = holder(&budget, 1, 10);
            let weak: Weak<dyn CacheOwner> = Arc::downgrade(&owner) as Weak<dyn CacheOwner>;
            live.push(CacheRef::new(weak, NodeId::new(0, 0)));
        }

        assert!(live.consume_one(&metrics));
        assert_eq!(metrics.evictions(), 0);
        assert!(!live.consume_one(&metrics));
    }

    #[test]
    fn test_flush_all_keeps_entries() {
        let budget = Arc::new(CacheBudget::new(0, 1 << 20));
        let metrics = CacheMetrics::new();
        let owner = holder(&budget, 2, 100);
        let live = LiveCache::new();
        // Generation 1 entries stand for nodes whose flush fails.
        for (index, generation) in [(0, 0), (1, 1), (5, 0)] {
            let weak: Weak<dyn CacheOwner> = Arc::downgrade(&owner) as Weak<dyn CacheOwner>;
            live.push(CacheRef::new(weak, NodeId::new(index, generation)));
        }

        assert_eq!(live.flush_all(&metrics), 1);
        assert_eq!(live.len(), 2);
        assert_eq!(budget.used(), 200);
        assert_eq!(metrics.evictions(), 0);
    }
}
