//! Node arena
//!
//! Nodes are addressed by [`NodeId`], an index plus a generation. Removing a
//! node bumps its slot's generation, so ids still held by queued tasks or the
//! live-cache queue stop resolving instead of pointing at a reused slot.
//!
//! Each slot carries a packed atomic tag `generation << 32 | busy`, where
//! `busy` counts outstanding tasks targeting strict descendants of the node.
//! Updates are generation-checked so late decrements against a removed node
//! are dropped.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};

use super::node::Node;

/// Generation-checked node handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

const BUSY_MASK: u64 = 0xffff_ffff;

struct Slot {
    tag: AtomicU64,
    invalid: AtomicBool,
    node: Mutex<Option<Node>>,
}

impl Slot {
    fn generation(&self) -> u32 {
        (self.tag.load(Ordering::Acquire) >> 32) as u32
    }

    fn update_busy(&self, generation: u32, apply: impl Fn(u64) -> Option<u64>) -> bool {
        self.tag
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tag| {
                if (tag >> 32) as u32 != generation {
                    return None;
                }
                apply(tag & BUSY_MASK).map(|busy| (tag & !BUSY_MASK) | (busy & BUSY_MASK))
            })
            .is_ok()
    }
}

/// Slab of node slots with a lock-free free list
#[derive(Default)]
pub(crate) struct NodeArena {
    slots: RwLock<Vec<Arc<Slot>>>,
    free: SegQueue<u32>,
}

impl NodeArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn slot(&self, index: u32) -> Option<Arc<Slot>> {
        self.slots.read().get(index as usize).cloned()
    }

    fn live_slot(&self, id: NodeId) -> Option<Arc<Slot>> {
        self.slot(id.index)
            .filter(|slot| slot.generation() == id.generation)
    }

    /// Store `node` and return its id
    pub(crate) fn insert(&self, node: Node) -> NodeId {
        if let Some(index) = self.free.pop() {
            if let Some(slot) = self.slot(index) {
                let mut guard = slot.node.lock();
                *guard = Some(node);
                return NodeId::new(index, slot.generation());
            }
        }

        let mut slots = self.slots.write();
        let index = slots.len() as u32;
        slots.push(Arc::new(Slot {
            tag: AtomicU64::new(0),
            invalid: AtomicBool::new(false),
            node: Mutex::new(Some(node)),
        }));
        NodeId::new(index, 0)
    }

    /// Run `f` on the node under its lock. `None` if the id is stale.
    pub(crate) fn with<R>(&self, id: NodeId, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        let slot = self.slot(id.index)?;
        let mut guard = slot.node.lock();
        if slot.generation() != id.generation {
            return None;
        }
        guard.as_mut().map(f)
    }

    /// Take the node out and retire its id
    pub(crate) fn remove(&self, id: NodeId) -> Option<Node> {
        let slot = self.slot(id.index)?;
        let node = {
            let mut guard = slot.node.lock();
            if slot.generation() != id.generation {
                return None;
            }
            let node = guard.take();
            let next = u64::from(id.generation.wrapping_add(1)) << 32;
            slot.tag.store(next, Ordering::Release);
            slot.invalid.store(false, Ordering::Release);
            node
        };
        self.free.push(id.index);
        node
    }

    /// Add `count` outstanding descendant tasks
    pub(crate) fn busy_add(&self, id: NodeId, count: u64) -> bool {
        match self.live_slot(id) {
            Some(slot) => slot.update_busy(id.generation, |busy| busy.checked_add(count)),
            None => false,
        }
    }

    /// One descendant task finished
    pub(crate) fn busy_sub(&self, id: NodeId) -> bool {
        match self.live_slot(id) {
            Some(slot) => slot.update_busy(id.generation, |busy| busy.checked_sub(1)),
            None => false,
        }
    }

    /// Outstanding descendant tasks; 0 for stale ids
    pub(crate) fn busy(&self, id: NodeId) -> u64 {
        match self.slot(id.index) {
            Some(slot) => {
                let tag = slot.tag.load(Ordering::Acquire);
                if (tag >> 32) as u32 == id.generation {
                    tag & BUSY_MASK
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    pub(crate) fn invalidate(&self, id: NodeId) {
        if let Some(slot) = self.live_slot(id) {
            slot.invalid.store(true, Ordering::Release);
        }
    }

    /// Invalid flag set, or id no longer resolves
    pub(crate) fn is_invalid(&self, id: NodeId) -> bool {
        match self.live_slot(id) {
            Some(slot) => slot.invalid.load(Ordering::Acquire),
            None => true,
        }
    }

    /// Nodes currently stored
    pub(crate) fn len(&self) -> usize {
        self.slots.read().len() - self.free.len()
    }

    /// Take every stored node out of the arena
    pub(crate) fn drain(&mut self) -> Vec<Node> {
        let slots = std::mem::take(self.slots.get_mut());
        while self.free.pop().is_some() {}
        slots
            .into_iter()
            .filter_map(|slot| {
                let node = slot.node.lock().take();
                node
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
