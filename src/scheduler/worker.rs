//! Worker threads and the round protocol
//!
//! Every worker runs the same loop, separated by four decider barriers:
//!
//! ```text
//! Pulling    roll wait -> ready (+1 injected)      B1: any ready?
//! Running    drain own ready, steal from others    B2
//! GC         eviction sweep to the round's target
//! Unlocking  roll done -> ready                    B3
//!            drain, steal                          B4: any pending? -> Pulling | Quit
//! ```
//!
//! Worker 0 is the decider. It computes every cross-worker decision (next
//! phase, eviction target, back-off, quit) so all workers agree.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, trace};

use super::controller::ControllerShared;
use super::queue::{LocalLists, Task};
use super::state::WorkerState;
use crate::cache::{CacheBudget, CacheMetrics, LiveCache};

/// Outcome of a barrier, computed by the decider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Decision {
    /// Phase after the barrier
    pub(crate) next: WorkerState,
    /// Eviction target for this round's GC phase
    pub(crate) gc_target: u64,
    /// Shutdown drain round: nothing was ready and closing was requested
    pub(crate) drain: bool,
    /// Sleep after the round instead of spinning
    pub(crate) backoff: bool,
}

impl Default for Decision {
    fn default() -> Self {
        Self {
            next: WorkerState::Pulling,
            gc_target: 0,
            drain: false,
            backoff: false,
        }
    }
}

/// Execution context handed to every task
pub struct WorkerContext {
    id: usize,
    shared: Arc<ControllerShared>,
    local: RefCell<LocalLists>,
}

impl WorkerContext {
    pub(crate) fn new(id: usize, shared: Arc<ControllerShared>) -> Self {
        Self {
            id,
            shared,
            local: RefCell::new(LocalLists::default()),
        }
    }

    /// Index of the executing worker
    pub fn id(&self) -> usize {
        self.id
    }

    /// Queue a task for the next round on this worker
    pub fn push_wait(&self, task: Task) {
        self.local.borrow_mut().wait.push(task);
    }

    /// Queue a task to run after this round's GC phase
    pub fn push_done(&self, task: Task) {
        self.local.borrow_mut().done.push(task);
    }

    pub(crate) fn budget(&self) -> &Arc<CacheBudget> {
        &self.shared.budget
    }

    pub(crate) fn live(&self) -> &LiveCache {
        &self.shared.live
    }

    pub(crate) fn metrics(&self) -> &CacheMetrics {
        &self.shared.metrics
    }

    fn execute(&self, task: Task) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| task(self))) {
            error!(worker = self.id, "Task panicked: {}", panic_message(panic.as_ref()));
        }
    }

    fn drain_and_steal(&self) {
        let queues = &self.shared.queues;
        while let Some(task) = queues[self.id].pop_ready() {
            self.execute(task);
        }

        let mut stolen = 0;
        for offset in 1..queues.len() {
            let victim = &queues[(self.id + offset) % queues.len()];
            while let Some(task) = victim.pop_ready() {
                stolen += 1;
                self.execute(task);
            }
        }
        self.shared.metrics.record_steals(stolen);
    }

    fn has_pending(&self) -> bool {
        let queue = &self.shared.queues[self.id];
        self.local.borrow().has_pending() || queue.has_injected() || queue.has_ready()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic>"
    }
}

/// Worker thread body
pub(crate) fn run(ctx: WorkerContext) {
    let shared = Arc::clone(&ctx.shared);
    let id = ctx.id;
    let state = &shared.states[id];
    let queue = &shared.queues[id];
    let decider = id == 0;

    state.store(WorkerState::Created);
    if !shared.gate.arrive() {
        state.store(WorkerState::Quit);
        return;
    }
    debug!(worker = id, "Worker released");

    loop {
        state.store(WorkerState::Pulling);
        queue.roll(&mut ctx.local.borrow_mut());
        let plan = shared.barrier.sync(
            queue.has_ready(),
            decider.then_some(|any: bool| shared.plan_round(any)),
        );

        if plan.next == WorkerState::Running {
            state.store(WorkerState::Running);
            ctx.drain_and_steal();
            shared.barrier.sync(false, decider.then_some(|_: bool| plan));
        }

        state.store(WorkerState::Gc);
        shared
            .live
            .sweep(&shared.budget, plan.gc_target, &shared.metrics);

        state.store(WorkerState::Unlocking);
        queue.roll_done(&mut ctx.local.borrow_mut());
        shared.barrier.sync(false, decider.then_some(|_: bool| plan));
        ctx.drain_and_steal();

        let end = shared.barrier.sync(
            ctx.has_pending(),
            decider.then_some(|any: bool| shared.finish_round(plan, any)),
        );
        if end.next == WorkerState::Quit {
            break;
        }

        if end.backoff {
            std::thread::sleep(shared.config.idle_sleep());
        } else if plan.next != WorkerState::Running {
            std::thread::yield_now();
        }
    }

    state.store(WorkerState::Quit);
    trace!(worker = id, "Worker quit");
}
