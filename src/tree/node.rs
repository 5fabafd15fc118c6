//! Tree nodes and node tasks
//!
//! A node covers one block of the address space. It caches the whole block
//! in `data`, or delegates sub-ranges to lazily created children, or defers
//! to storage. Never both `data` and children.
//!
//! Work on a node is a [`NodeTask`]. A task serves its range locally if it
//! can, otherwise it pushes one task per overlapping child into the
//! executing worker's wait list, so every operation descends one level per
//! round.
//!
//! # Busy accounting
//!
//! Each task carries the ids of its ancestors. Dispatching `k` children from
//! a node adds `k` to the node and to every ancestor; a finishing task
//! subtracts one from every ancestor. A node with `busy == 0` has no
//! outstanding work beneath it and may be promoted.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::arena::NodeId;
use super::TreeShared;
use crate::cache::{CacheBuffer, CacheMetrics, CacheOwner, CacheRef};
use crate::completion::{CompletionHandle, ReadTarget};
use crate::scheduler::{Task, WorkerContext};

/// One block of the tree
pub(crate) struct Node {
    level: usize,
    base: u64,
    /// Cached copy of the whole block
    pub(crate) data: Option<CacheBuffer>,
    /// `data` holds unpersisted writes
    pub(crate) dirty: bool,
    /// Recorded on the live-cache queue
    pub(crate) listed: bool,
    /// Present children by child index
    pub(crate) children: BTreeMap<u64, NodeId>,
}

impl Node {
    pub(crate) fn new(level: usize, base: u64) -> Self {
        Self {
            level,
            base,
            data: None,
            dirty: false,
            listed: false,
            children: BTreeMap::new(),
        }
    }

    pub(crate) fn base(&self) -> u64 {
        self.base
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// Direction and buffer of a node I/O
#[derive(Clone)]
pub(crate) enum IoKind {
    Read(ReadTarget),
    Write(Bytes),
}

/// A read or write of `[begin, end)`, clipped to the target node's block
#[derive(Clone)]
pub(crate) struct NodeIo {
    pub(crate) kind: IoKind,
    pub(crate) begin: u64,
    pub(crate) end: u64,
    pub(crate) handle: CompletionHandle,
}

impl NodeIo {
    fn is_write(&self) -> bool {
        matches!(self.kind, IoKind::Write(_))
    }

    /// Sub-range `[begin, end)` sharing the buffer and handle
    fn slice(&self, begin: u64, end: u64) -> Self {
        let kind = match &self.kind {
            IoKind::Read(target) => IoKind::Read(target.clone()),
            IoKind::Write(data) => {
                let start = (begin - self.begin) as usize;
                let stop = (end - self.begin) as usize;
                IoKind::Write(data.slice(start..stop))
            }
        };
        Self {
            kind,
            begin,
            end,
            handle: self.handle.clone(),
        }
    }

    /// Copy between `block` (starting at address `base`) and the client buffer
    fn serve(&self, block: &mut [u8], base: u64) {
        let start = (self.begin - base) as usize;
        let stop = (self.end - base) as usize;
        match &self.kind {
            IoKind::Read(target) => target.fill(self.begin, &block[start..stop]),
            IoKind::Write(data) => block[start..stop].copy_from_slice(data),
        }
    }
}

/// Operation carried by a node task
pub(crate) enum NodeOp {
    Io(NodeIo),
    Flush(CompletionHandle),
    Detach(CompletionHandle),
}

/// Work targeting one node
pub(crate) struct NodeTask {
    tree: Arc<TreeShared>,
    id: NodeId,
    ancestors: Vec<NodeId>,
    op: NodeOp,
}

impl NodeTask {
    /// Task at the root of `tree`
    pub(crate) fn root(tree: Arc<TreeShared>, op: NodeOp) -> Self {
        let id = tree.root;
        Self {
            tree,
            id,
            ancestors: Vec::new(),
            op,
        }
    }

    pub(crate) fn tree(&self) -> &Arc<TreeShared> {
        &self.tree
    }

    pub(crate) fn into_task(self) -> Task {
        Box::new(move |ctx| self.run(ctx))
    }

    pub(crate) fn run(self, ctx: &WorkerContext) {
        let Self {
            tree,
            id,
            ancestors,
            op,
        } = self;

        let settle = match op {
            NodeOp::Io(io) => {
                let handle = io.handle.clone();
                let ok = tree.run_io(ctx, id, &ancestors, io);
                Some((handle, ok))
            }
            NodeOp::Flush(handle) => {
                tree.run_flush(ctx, id, &ancestors, &handle);
                None
            }
            NodeOp::Detach(handle) => {
                tree.run_detach(ctx, id, &handle);
                None
            }
        };

        for ancestor in &ancestors {
            tree.arena.busy_sub(*ancestor);
        }

        // Counting handles settle only after the busy counters dropped.
        if let Some((handle, ok)) = settle {
            if !ok {
                handle.fail();
            }
            handle.release();
        }
    }
}

/// Complete `finish` in the done phase `rounds` rounds from now
pub(crate) fn trail(ctx: &WorkerContext, rounds: usize, finish: Task) {
    if rounds == 0 {
        ctx.push_done(finish);
    } else {
        ctx.push_wait(Box::new(move |ctx| trail(ctx, rounds - 1, finish)));
    }
}

// =============================================================================
// Node operations
// =============================================================================

impl TreeShared {
    /// Serve or split one node I/O. Returns false on failure.
    fn run_io(
        self: &Arc<Self>,
        ctx: &WorkerContext,
        id: NodeId,
        ancestors: &[NodeId],
        io: NodeIo,
    ) -> bool {
        if self.arena.is_invalid(id) {
            self.arena.with(id, |node| node.data = None);
            debug!(tree = self.id, node = %id, "I/O against detached node");
            return false;
        }
        self.arena
            .with(id, |node| self.route(ctx, id, ancestors, node, io))
            .unwrap_or(false)
    }

    fn route(
        self: &Arc<Self>,
        ctx: &WorkerContext,
        id: NodeId,
        ancestors: &[NodeId],
        node: &mut Node,
        io: NodeIo,
    ) -> bool {
        if let Some(block) = node.data.as_mut() {
            io.serve(block, node.base);
            ctx.metrics().record_hit();
            if io.is_write() {
                node.dirty = true;
                self.enlist(ctx, id, node);
            }
            return true;
        }

        if self.levels.is_leaf(node.level) {
            return match self.allocate(ctx, node.level) {
                Some(mut block) => {
                    if !self.read_storage(&mut block, node.base) {
                        return false;
                    }
                    io.serve(&mut block, node.base);
                    node.dirty = io.is_write();
                    node.data = Some(block);
                    self.enlist(ctx, id, node);
                    ctx.metrics().record_miss();
                    true
                }
                None => {
                    ctx.metrics().record_bypass();
                    self.direct(&io)
                }
            };
        }

        let full = self
            .levels
            .block_len(node.level)
            .is_some_and(|len| io.begin == node.base && io.end - io.begin == len);
        if full {
            if self.arena.busy(id) == 0 {
                if let Some(block) = self.allocate(ctx, node.level) {
                    return self.promote(ctx, id, node, block, &io);
                }
            }
            if node.children.is_empty() {
                ctx.metrics().record_bypass();
                return self.direct(&io);
            }
        }

        self.fan_out(ctx, id, ancestors, node, &io);
        true
    }

    fn allocate(&self, ctx: &WorkerContext, level: usize) -> Option<CacheBuffer> {
        self.levels
            .block_len(level)
            .and_then(|len| ctx.budget().try_allocate(len))
    }

    /// Record a node holding a buffer on the live-cache queue, once
    fn enlist(self: &Arc<Self>, ctx: &WorkerContext, id: NodeId, node: &mut Node) {
        if !node.listed {
            node.listed = true;
            let owner: Weak<dyn CacheOwner> = Arc::downgrade(self) as Weak<dyn CacheOwner>;
            ctx.live().push(CacheRef::new(owner, id));
        }
    }

    /// Fill `buf` from storage at `offset`; bytes past the end read as zero
    fn read_storage(&self, buf: &mut [u8], offset: u64) -> bool {
        let available = self.storage.len();
        if offset >= available {
            buf.fill(0);
            return true;
        }
        let len = (buf.len() as u64).min(available - offset) as usize;
        buf[len..].fill(0);
        self.storage.read_at(&mut buf[..len], offset)
    }

    /// Uncached I/O for exactly the requested range
    fn direct(&self, io: &NodeIo) -> bool {
        match &io.kind {
            IoKind::Read(target) => {
                let mut scratch = vec![0u8; (io.end - io.begin) as usize];
                if !self.read_storage(&mut scratch, io.begin) {
                    return false;
                }
                target.fill(io.begin, &scratch);
                true
            }
            IoKind::Write(data) => self.storage.write_at(data, io.begin),
        }
    }

    /// Cache the whole block of an internal node and collapse its subtree
    fn promote(
        self: &Arc<Self>,
        ctx: &WorkerContext,
        id: NodeId,
        node: &mut Node,
        mut block: CacheBuffer,
        io: &NodeIo,
    ) -> bool {
        let collapsed = if io.is_write() {
            let (removed, _) = self.collapse(node, None);
            io.serve(&mut block, node.base);
            node.dirty = true;
            removed
        } else {
            if !self.read_storage(&mut block, node.base) {
                return false;
            }
            let (removed, dirty) = self.collapse(node, Some(&mut block));
            io.serve(&mut block, node.base);
            node.dirty = dirty;
            removed
        };

        node.data = Some(block);
        self.enlist(ctx, id, node);
        ctx.metrics().record_promotion();
        ctx.metrics().record_collapse(collapsed);
        debug!(
            tree = self.id,
            node = %id,
            level = node.level,
            base = node.base,
            collapsed,
            "Promoted node"
        );
        true
    }

    /// Free every descendant of `node`, folding cached data into `block`.
    ///
    /// Returns the number of freed nodes and whether any folded data was dirty.
    fn collapse(&self, node: &mut Node, mut block: Option<&mut CacheBuffer>) -> (u64, bool) {
        let base = node.base;
        let mut removed = 0;
        let mut dirty = false;
        let mut pending: Vec<NodeId> = std::mem::take(&mut node.children).into_values().collect();

        while let Some(child) = pending.pop() {
            let Some(mut child_node) = self.arena.remove(child) else {
                continue;
            };
            removed += 1;
            if let (Some(data), Some(block)) = (child_node.data.take(), block.as_deref_mut()) {
                let start = (child_node.base - base) as usize;
                block[start..start + data.len()].copy_from_slice(&data);
                dirty |= child_node.dirty;
            }
            pending.extend(child_node.children.into_values());
        }
        (removed, dirty)
    }

    /// Split the range over the children and queue one task per child
    fn fan_out(
        self: &Arc<Self>,
        ctx: &WorkerContext,
        id: NodeId,
        ancestors: &[NodeId],
        node: &mut Node,
        io: &NodeIo,
    ) {
        let level = node.level;
        let below = self.levels.bits_below(level);
        let child_len = self.levels.child_len(level);
        let first = self.levels.child_index(level, io.begin);
        let last = self.levels.child_index(level, io.end - 1);

        let mut ops = Vec::with_capacity((last - first + 1) as usize);
        for index in first..=last {
            let child_base = node.base + (index << below);
            let child_end = child_base.saturating_add(child_len);
            let begin = io.begin.max(child_base);
            let end = io.end.min(child_end);
            let child = *node
                .children
                .entry(index)
                .or_insert_with(|| self.arena.insert(Node::new(level + 1, child_base)));
            ops.push((child, NodeOp::Io(io.slice(begin, end))));
        }

        io.handle.retain(ops.len());
        trace!(tree = self.id, node = %id, level, children = ops.len(), "Fan out");
        self.dispatch(ctx, id, ancestors, ops);
    }

    /// Account and queue child tasks. Called with the parent locked.
    fn dispatch(
        self: &Arc<Self>,
        ctx: &WorkerContext,
        parent: NodeId,
        ancestors: &[NodeId],
        ops: Vec<(NodeId, NodeOp)>,
    ) {
        if ops.is_empty() {
            return;
        }
        let count = ops.len() as u64;
        self.arena.busy_add(parent, count);
        for ancestor in ancestors {
            self.arena.busy_add(*ancestor, count);
        }

        let mut lineage = Vec::with_capacity(ancestors.len() + 1);
        lineage.extend_from_slice(ancestors);
        lineage.push(parent);
        for (id, op) in ops {
            let task = NodeTask {
                tree: Arc::clone(self),
                id,
                ancestors: lineage.clone(),
                op,
            };
            ctx.push_wait(task.into_task());
        }
    }

    /// Persist `data` at `base`, clipped to the logical size
    pub(crate) fn flush_buffer(&self, metrics: Option<&CacheMetrics>, data: &[u8], base: u64) -> bool {
        let size = self.size();
        if base >= size {
            return true;
        }
        let len = (data.len() as u64).min(size - base) as usize;
        let ok = self.storage.write_at(&data[..len], base);
        if let Some(metrics) = metrics {
            metrics.record_flush(ok);
        }
        if !ok {
            warn!(
                tree = self.id,
                base,
                len,
                storage = %self.storage.describe(),
                "Flush failed"
            );
        }
        ok
    }

    /// Sync walk step: flush this node, then every present child next round
    fn run_flush(
        self: &Arc<Self>,
        ctx: &WorkerContext,
        id: NodeId,
        ancestors: &[NodeId],
        handle: &CompletionHandle,
    ) {
        if self.arena.is_invalid(id) {
            return;
        }
        self.arena.with(id, |node| {
            if node.dirty {
                if let Some(data) = node.data.as_deref() {
                    if self.flush_buffer(Some(ctx.metrics()), data, node.base) {
                        node.dirty = false;
                    } else {
                        handle.fail();
                    }
                }
            }
            let ops = node
                .children
                .values()
                .map(|child| (*child, NodeOp::Flush(handle.clone())))
                .collect();
            self.dispatch(ctx, id, ancestors, ops);
        });
    }

    /// Detach walk step: invalidate, flush, free, then the children next round
    fn run_detach(self: &Arc<Self>, ctx: &WorkerContext, id: NodeId, handle: &CompletionHandle) {
        self.arena.invalidate(id);
        let Some(mut node) = self.arena.remove(id) else {
            return;
        };

        if let Some(data) = node.data.take() {
            if node.dirty && !self.flush_buffer(Some(ctx.metrics()), &data, node.base) {
                handle.fail();
            }
        }

        for child in node.children.values() {
            let task = NodeTask {
                tree: Arc::clone(self),
                id: *child,
                ancestors: Vec::new(),
                op: NodeOp::Detach(handle.clone()),
            };
            ctx.push_wait(task.into_task());
        }
    }
}

impl CacheOwner for TreeShared {
    fn evict(&self, id: NodeId, metrics: &CacheMetrics) -> bool {
        self.arena
            .with(id, |node| {
                node.listed = false;
                let Some(data) = node.data.take() else {
                    return false;
                };
                if node.dirty {
                    if !self.flush_buffer(Some(metrics), &data, node.base) {
                        self.failed.store(true, Ordering::Release);
                        warn!(tree = self.id, node = %id, "Eviction flush failed; tree marked failed");
                    }
                    node.dirty = false;
                }
                trace!(tree = self.id, node = %id, size = data.len(), "Evicted node");
                true
            })
            .unwrap_or(false)
    }

    fn flush(&self, id: NodeId, metrics: &CacheMetrics) -> Option<bool> {
        self.arena
            .with(id, |node| {
                let Some(data) = node.data.as_deref() else {
                    node.listed = false;
                    return None;
                };
                if !node.dirty {
                    return Some(true);
                }
                let ok = self.flush_buffer(Some(metrics), data, node.base);
                if ok {
                    node.dirty = false;
                }
                Some(ok)
            })
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::IoState;
    use crate::config::ControllerConfig;
    use crate::scheduler::Controller;
    use crate::storage::MemoryStorage;
    use crate::tree::Tree;
    use std::time::Duration;

    const POLL: Duration = Duration::from_millis(1);

    fn first_child(shared: &TreeShared, id: NodeId) -> Option<NodeId> {
        shared
            .arena
            .with(id, |node| node.children.values().next().copied())
            .flatten()
    }

    #[test]
    fn test_io_against_invalidated_node_fails() {
        let config = ControllerConfig {
            idle_rounds_before_decay: u32::MAX,
            ..ControllerConfig::new(1 << 20, 1 << 24, 2)
        };
        let ctrl = Controller::with_config(config).unwrap();
        let storage = Arc::new(MemoryStorage::with_contents(vec![7u8; 1024]));
        let tree = Tree::new(storage, "52,4,8".parse().unwrap());

        assert_eq!(tree.read(&ctrl, 0, 10).wait(POLL), IoState::Done);
        let shared = Arc::clone(&tree.shared);
        let block = first_child(&shared, shared.root).unwrap();
        let leaf = first_child(&shared, block).unwrap();
        assert!(shared.arena.with(leaf, |node| node.data.is_some()).unwrap());
        let used = ctrl.used();

        shared.arena.invalidate(leaf);
        let handle = CompletionHandle::counting();
        let task = NodeTask {
            tree: Arc::clone(&shared),
            id: leaf,
            ancestors: Vec::new(),
            op: NodeOp::Io(NodeIo {
                kind: IoKind::Read(ReadTarget::new(0, 10)),
                begin: 0,
                end: 10,
                handle: handle.clone(),
            }),
        };
        assert!(tree.inject(&ctrl, move |ctx| task.run(ctx)));

        assert_eq!(handle.wait(POLL), IoState::Failed);
        assert!(shared.arena.with(leaf, |node| node.data.is_none()).unwrap());
        assert!(ctrl.used() < used);
    }
}
