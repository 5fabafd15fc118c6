//! Per-worker task queues
//!
//! Each worker owns a [`TaskQueue`] with two shared halves:
//!
//! - `injected`: bounded MPMC queue, the only way work enters from outside
//!   the pool. At most one injected task is pulled per round.
//! - `ready`: this round's runnable tasks, drained by the owner and stolen
//!   by every other worker.
//!
//! The wait and done lists are plain `Vec`s held by the worker context and
//! touched only by the owning thread.

use crossbeam::queue::{ArrayQueue, SegQueue};

use super::worker::WorkerContext;

/// Unit of work executed by a worker
pub type Task = Box<dyn FnOnce(&WorkerContext) + Send + 'static>;

/// Thread-local lists owned by one worker
#[derive(Default)]
pub(crate) struct LocalLists {
    /// Runs next round
    pub(crate) wait: Vec<Task>,
    /// Runs after this round's GC phase
    pub(crate) done: Vec<Task>,
}

impl LocalLists {
    pub(crate) fn has_pending(&self) -> bool {
        !self.wait.is_empty() || !self.done.is_empty()
    }
}

/// Shared halves of one worker's queue
pub(crate) struct TaskQueue {
    injected: ArrayQueue<Task>,
    ready: SegQueue<Task>,
}

impl TaskQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            injected: ArrayQueue::new(capacity.max(1)),
            ready: SegQueue::new(),
        }
    }

    /// Cross-thread injection. Returns the task back if the queue is full.
    pub(crate) fn inject(&self, task: Task) -> Result<(), Task> {
        self.injected.push(task)
    }

    pub(crate) fn pop_ready(&self) -> Option<Task> {
        self.ready.pop()
    }

    pub(crate) fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub(crate) fn has_injected(&self) -> bool {
        !self.injected.is_empty()
    }

    /// Start of round: wait list becomes ready, plus at most one injected task
    pub(crate) fn roll(&self, local: &mut LocalLists) {
        for task in local.wait.drain(..) {
            self.ready.push(task);
        }
        if let Some(task) = self.injected.pop() {
            self.ready.push(task);
        }
    }

    /// Unlocking phase: done list becomes ready
    pub(crate) fn roll_done(&self, local: &mut LocalLists) {
        for task in local.done.drain(..) {
            self.ready.push(task);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
