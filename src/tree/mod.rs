//! Cached Trees
//!
//! A [`Tree`] overlays a flat storage engine with a tree of fixed fan-out
//! whose nodes cache blocks of the address space in memory. All operations
//! are asynchronous: they are injected into the tree's affine worker and
//! complete through a [`CompletionHandle`].
//!
//! # Operations
//!
//! - `read` / `readsome` / `write`: counting handles, one dependency unit
//!   per outstanding node task
//! - `sync` / `fsync` / `detach` / `hook`: timing handles, completed by a
//!   marker that trails the walk by the tree depth
//!
//! # Ordering
//!
//! Every operation on one tree enters through the same worker, one per
//! round, and descends one level per round, so operations reach each level
//! in issue order.

mod arena;
mod levels;
mod node;

#[cfg(test)]
mod proptest;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

pub use arena::NodeId;
pub use levels::{LevelTable, DEFAULT_LEVELS};

use crate::completion::{CompletionHandle, IoState, ReadHandle, ReadTarget};
use crate::error::Result;
use crate::scheduler::{Controller, Task, WorkerContext};
use crate::storage::{FileStorage, Storage};

use arena::NodeArena;
use node::{trail, IoKind, Node, NodeIo, NodeOp, NodeTask};

static NEXT_TREE_ID: AtomicUsize = AtomicUsize::new(0);

/// State shared by a tree, its queued tasks and the live-cache queue
pub(crate) struct TreeShared {
    id: usize,
    storage: Arc<dyn Storage>,
    levels: LevelTable,
    arena: NodeArena,
    root: NodeId,
    /// max(storage length at open, highest end ever written)
    size: AtomicU64,
    failed: AtomicBool,
    detached: AtomicBool,
}

impl TreeShared {
    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }
}

impl Drop for TreeShared {
    fn drop(&mut self) {
        let nodes = self.arena.drain();
        let mut flushed = 0usize;
        let mut failures = 0usize;
        for node in &nodes {
            if let (true, Some(data)) = (node.dirty, node.data.as_deref()) {
                if self.flush_buffer(None, data, node.base()) {
                    flushed += 1;
                } else {
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            warn!(tree = self.id, failures, "Dirty blocks lost while releasing tree");
        }
        debug!(tree = self.id, nodes = nodes.len(), flushed, "Tree released");
    }
}

/// Memory-cached tree over a storage engine
pub struct Tree {
    shared: Arc<TreeShared>,
}

impl Tree {
    /// Open (or create) a file and build a tree over it
    pub fn open(path: impl AsRef<Path>, levels: LevelTable) -> Result<Self> {
        let storage = FileStorage::open(path)?;
        Ok(Self::new(Arc::new(storage), levels))
    }

    /// Build a tree over any storage engine
    pub fn new(storage: Arc<dyn Storage>, levels: LevelTable) -> Self {
        let arena = NodeArena::new();
        let root = arena.insert(Node::new(0, 0));
        let id = NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed);
        let size = storage.len();
        info!(tree = id, storage = %storage.describe(), levels = %levels, size, "Tree opened");

        Self {
            shared: Arc::new(TreeShared {
                id,
                storage,
                levels,
                arena,
                root,
                size: AtomicU64::new(size),
                failed: AtomicBool::new(false),
                detached: AtomicBool::new(false),
            }),
        }
    }

    /// Process-unique tree id; selects the affine worker
    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn levels(&self) -> &LevelTable {
        &self.shared.levels
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.shared.storage
    }

    /// Logical size: highest byte present in storage or ever written
    pub fn size(&self) -> u64 {
        self.shared.size()
    }

    /// Whether an eviction flush failed for this tree
    pub fn failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    pub fn is_detached(&self) -> bool {
        self.shared.detached.load(Ordering::Acquire)
    }

    /// Nodes currently materialized, root included
    pub fn node_count(&self) -> usize {
        self.shared.arena.len()
    }

    /// Read exactly `len` bytes at `offset`. Fails if the range extends past
    /// the logical size.
    #[instrument(skip(self, ctrl), fields(tree = self.shared.id))]
    pub fn read(&self, ctrl: &Controller, offset: u64, len: usize) -> ReadHandle {
        self.issue_read(ctrl, offset, len as u64)
    }

    /// Read up to `len` bytes at `offset`, truncated at the logical size.
    /// Fails only if `offset` is at or past the end.
    #[instrument(skip(self, ctrl), fields(tree = self.shared.id))]
    pub fn readsome(&self, ctrl: &Controller, offset: u64, len: usize) -> ReadHandle {
        if len > 0 && offset >= self.size() {
            return ReadHandle::new(CompletionHandle::failed(), ReadTarget::new(offset, 0), 0);
        }
        let len = (len as u64).min(self.size().saturating_sub(offset));
        self.issue_read(ctrl, offset, len)
    }

    fn issue_read(&self, ctrl: &Controller, offset: u64, len: u64) -> ReadHandle {
        let empty = |handle| ReadHandle::new(handle, ReadTarget::new(offset, 0), 0);
        if len == 0 {
            return empty(CompletionHandle::done());
        }
        if let Some(refused) = self.refuse("read") {
            return empty(refused);
        }
        let end = match offset.checked_add(len) {
            Some(end) if end <= self.size() => end,
            _ => {
                warn!(tree = self.shared.id, offset, len, size = self.size(), "Read past end");
                return empty(CompletionHandle::failed());
            }
        };

        let handle = CompletionHandle::counting();
        let target = ReadTarget::new(offset, len as usize);
        let io = NodeIo {
            kind: IoKind::Read(target.clone()),
            begin: offset,
            end,
            handle: handle.clone(),
        };
        self.submit(ctrl, &handle, NodeTask::root(Arc::clone(&self.shared), NodeOp::Io(io)).into_task());
        ReadHandle::new(handle, target, len as usize)
    }

    /// Write `data` at `offset`, extending the logical size as needed
    #[instrument(skip(self, ctrl, data), fields(tree = self.shared.id))]
    pub fn write(&self, ctrl: &Controller, offset: u64, data: impl Into<Bytes>) -> CompletionHandle {
        let data: Bytes = data.into();
        if data.is_empty() {
            return CompletionHandle::done();
        }
        if let Some(refused) = self.refuse("write") {
            return refused;
        }
        let Some(end) = offset.checked_add(data.len() as u64) else {
            warn!(tree = self.shared.id, offset, len = data.len(), "Write past address space");
            return CompletionHandle::failed();
        };

        let handle = CompletionHandle::counting();
        let io = NodeIo {
            kind: IoKind::Write(data),
            begin: offset,
            end,
            handle: handle.clone(),
        };
        let root = NodeTask::root(Arc::clone(&self.shared), NodeOp::Io(io));
        // Extended by the root step before any block is cached, and by the
        // issuer once admitted. A rejected write leaves the size untouched.
        let task: Task = Box::new(move |ctx| {
            root.tree().size.fetch_max(end, Ordering::AcqRel);
            root.run(ctx);
        });
        if ctrl.submit(self.shared.id, task) {
            self.shared.size.fetch_max(end, Ordering::AcqRel);
        } else {
            handle.reject();
        }
        handle
    }

    /// Flush every dirty block of the tree
    #[instrument(skip(self, ctrl), fields(tree = self.shared.id))]
    pub fn sync(&self, ctrl: &Controller) -> CompletionHandle {
        if let Some(refused) = self.refuse("sync") {
            return refused;
        }
        self.walk(ctrl, NodeOp::Flush, |_shared, handle| handle.complete())
    }

    /// Flush every dirty block, then persist the storage engine
    #[instrument(skip(self, ctrl), fields(tree = self.shared.id))]
    pub fn fsync(&self, ctrl: &Controller) -> CompletionHandle {
        if let Some(refused) = self.refuse("fsync") {
            return refused;
        }
        self.walk(ctrl, NodeOp::Flush, |shared, handle| {
            if !shared.storage.sync_data() {
                handle.fail();
            }
            handle.complete();
        })
    }

    /// Flush and free every node. Later operations are rejected.
    #[instrument(skip(self, ctrl), fields(tree = self.shared.id))]
    pub fn detach(&self, ctrl: &Controller) -> CompletionHandle {
        if self.shared.detached.swap(true, Ordering::AcqRel) {
            warn!(tree = self.shared.id, "Tree already detached");
            return CompletionHandle::rejected();
        }
        let handle = self.walk(ctrl, NodeOp::Detach, |shared, handle| {
            info!(tree = shared.id, "Tree detached");
            handle.complete();
        });
        if handle.state() == IoState::Rejected {
            self.shared.detached.store(false, Ordering::Release);
        }
        handle
    }

    /// Inject `task` through the tree's worker. The handle completes once
    /// any per-level work the task queued has drained.
    pub fn hook<F>(&self, ctrl: &Controller, task: F) -> CompletionHandle
    where
        F: FnOnce(&WorkerContext) + Send + 'static,
    {
        if let Some(refused) = self.refuse("hook") {
            return refused;
        }
        let handle = CompletionHandle::timing();
        let done = handle.clone();
        let depth = self.shared.levels.depth();
        let wrapped: Task = Box::new(move |ctx| {
            task(ctx);
            trail(ctx, depth - 1, Box::new(move |_| done.complete()));
        });
        self.submit(ctrl, &handle, wrapped);
        handle
    }

    /// Inject `task` through the tree's worker without tracking
    pub fn inject<F>(&self, ctrl: &Controller, task: F) -> bool
    where
        F: FnOnce(&WorkerContext) + Send + 'static,
    {
        if self.is_detached() {
            return false;
        }
        ctrl.submit(self.shared.id, Box::new(task))
    }

    /// Pre-settled handle for operations refused at issue
    fn refuse(&self, operation: &str) -> Option<CompletionHandle> {
        if self.is_detached() {
            warn!(tree = self.shared.id, operation, "Rejected: tree detached");
            return Some(CompletionHandle::rejected());
        }
        if self.failed() {
            warn!(tree = self.shared.id, operation, "Refused: tree failed");
            return Some(CompletionHandle::failed());
        }
        None
    }

    fn submit(&self, ctrl: &Controller, handle: &CompletionHandle, task: Task) {
        if !ctrl.submit(self.shared.id, task) {
            handle.reject();
        }
    }

    /// Inject a root walk step followed by a trailing completion marker
    fn walk<F>(&self, ctrl: &Controller, op: fn(CompletionHandle) -> NodeOp, finish: F) -> CompletionHandle
    where
        F: FnOnce(&TreeShared, &CompletionHandle) + Send + 'static,
    {
        let handle = CompletionHandle::timing();
        let done = handle.clone();
        let shared = Arc::clone(&self.shared);
        let task: Task = Box::new(move |ctx| {
            let depth = shared.levels.depth();
            NodeTask::root(Arc::clone(&shared), op(done.clone())).run(ctx);
            trail(
                ctx,
                depth - 1,
                Box::new(move |_| finish(&*shared, &done)),
            );
        });
        self.submit(ctrl, &handle, task);
        handle
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.shared.id)
            .field("levels", &self.shared.levels.to_string())
            .field("size", &self.size())
            .field("nodes", &self.node_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
