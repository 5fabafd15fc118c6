//! Cache Controller
//!
//! Owns the worker pool and the state shared by every tree it drives: the
//! memory budget, the live-cache queue and metrics.
//!
//! # Lifecycle
//!
//! 1. `with_config` validates, spawns `concurrency` workers and releases them
//!    once all report `Created`
//! 2. Trees submit root tasks to their affine worker's injection queue
//! 3. `shutdown` (or `Drop`) closes admission, lets the rounds finish every
//!    queued task, drains the cache to zero and joins the workers

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use super::barrier::{RoundBarrier, StartGate};
use super::queue::{Task, TaskQueue};
use super::state::{AtomicWorkerState, WorkerState};
use super::worker::{self, Decision, WorkerContext};
use crate::cache::{CacheBudget, CacheMetrics, LiveCache, MetricsSnapshot, Usage};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};

/// State shared between the controller handle and its workers
pub(crate) struct ControllerShared {
    pub(crate) config: ControllerConfig,
    pub(crate) queues: Vec<TaskQueue>,
    pub(crate) states: Vec<AtomicWorkerState>,
    pub(crate) budget: Arc<CacheBudget>,
    pub(crate) live: LiveCache,
    pub(crate) metrics: CacheMetrics,
    pub(crate) barrier: RoundBarrier<Decision>,
    pub(crate) gate: StartGate,
    /// Admission flag; the write lock orders shutdown after every injection
    accepting: RwLock<bool>,
    closing: AtomicBool,
    /// Consecutive idle rounds, written by the decider only
    idle: AtomicU32,
}

impl ControllerShared {
    fn new(config: ControllerConfig, workers: usize) -> Self {
        Self {
            queues: (0..workers)
                .map(|_| TaskQueue::new(config.injection_capacity))
                .collect(),
            states: (0..workers)
                .map(|_| AtomicWorkerState::new(WorkerState::Pending))
                .collect(),
            budget: Arc::new(CacheBudget::new(
                config.lower_watermark,
                config.upper_watermark,
            )),
            live: LiveCache::new(),
            metrics: CacheMetrics::new(),
            barrier: RoundBarrier::new(workers),
            gate: StartGate::default(),
            accepting: RwLock::new(true),
            closing: AtomicBool::new(false),
            idle: AtomicU32::new(0),
            config,
        }
    }

    /// Decision at the end of Pulling
    pub(crate) fn plan_round(&self, any_ready: bool) -> Decision {
        let idle = if any_ready {
            self.idle.store(0, Ordering::Relaxed);
            0
        } else {
            self.idle.fetch_add(1, Ordering::Relaxed).saturating_add(1)
        };
        self.metrics.record_round(!any_ready);

        let drain = !any_ready && self.closing.load(Ordering::Acquire);
        let threshold = self.config.idle_rounds_before_decay;
        let lower = self.budget.lower();
        let gc_target = if drain {
            0
        } else if idle > threshold {
            lower.checked_shr(idle - threshold).unwrap_or(0)
        } else {
            lower
        };
        let backoff = !any_ready
            && !drain
            && idle > self.config.idle_rounds_before_sleep
            && (self.budget.used() <= gc_target || self.live.is_empty());

        Decision {
            next: if any_ready {
                WorkerState::Running
            } else {
                WorkerState::Gc
            },
            gc_target,
            drain,
            backoff,
        }
    }

    /// Decision at the end of the round
    pub(crate) fn finish_round(&self, plan: Decision, any_pending: bool) -> Decision {
        let next = if plan.drain && !any_pending {
            WorkerState::Quit
        } else {
            WorkerState::Pulling
        };
        Decision { next, ..plan }
    }

    fn submit(&self, worker: usize, task: Task) -> bool {
        let accepting = self.accepting.read();
        if !*accepting {
            self.metrics.record_rejected();
            warn!(worker, "Rejecting task: controller is shutting down");
            return false;
        }
        let index = worker % self.queues.len();
        match self.queues[index].inject(task) {
            Ok(()) => true,
            Err(_) => {
                self.metrics.record_rejected();
                warn!(worker = index, "Rejecting task: injection queue full");
                false
            }
        }
    }
}

/// Handle to a worker pool and its cache budget
pub struct Controller {
    shared: Arc<ControllerShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    /// Start a controller with the given watermarks and worker count.
    ///
    /// `concurrency = 0` uses one worker per available core.
    pub fn new(lower: u64, upper: u64, concurrency: usize) -> Result<Self> {
        Self::with_config(ControllerConfig::new(lower, upper, concurrency))
    }

    /// Start a controller from a full configuration
    pub fn with_config(config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let workers = config.resolved_concurrency();
        let shared = Arc::new(ControllerShared::new(config, workers));

        let mut threads = Vec::with_capacity(workers);
        for id in 0..workers {
            let ctx = WorkerContext::new(id, Arc::clone(&shared));
            let spawned = thread::Builder::new()
                .name(format!("treecache-worker-{id}"))
                .spawn(move || worker::run(ctx));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    shared.gate.abort();
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(Error::WorkerPool(format!(
                        "failed to spawn worker {id}: {e}"
                    )));
                }
            }
        }
        shared.gate.release_when_created(workers);

        info!(
            workers,
            lower = shared.budget.lower(),
            upper = shared.budget.upper(),
            "Cache controller started"
        );
        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Classify `used + pending`
    pub fn usage(&self, pending: u64) -> Usage {
        self.shared.budget.usage(pending)
    }

    /// Bytes currently cached
    pub fn used(&self) -> u64 {
        self.shared.budget.used()
    }

    pub fn lower(&self) -> u64 {
        self.shared.budget.lower()
    }

    pub fn upper(&self) -> u64 {
        self.shared.budget.upper()
    }

    /// Number of workers in the pool
    pub fn concurrency(&self) -> usize {
        self.shared.queues.len()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    /// Whether new tasks are admitted
    pub fn is_accepting(&self) -> bool {
        *self.shared.accepting.read()
    }

    /// Current phase of every worker
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared.states.iter().map(|s| s.load()).collect()
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot(self.used())
    }

    /// Persist every dirty cached block of every tree, keeping it cached.
    ///
    /// Runs on the calling thread; each block is flushed under its node lock.
    pub fn flush(&self) -> Result<()> {
        let failures = self.shared.live.flush_all(&self.shared.metrics);
        if failures > 0 {
            warn!(failures, "Cache flush incomplete");
            return Err(Error::Failed {
                operation: "flush".to_string(),
            });
        }
        Ok(())
    }

    /// Inject `task` into `worker`'s queue (modulo pool size).
    ///
    /// Returns false if the controller is shutting down or the queue is full.
    pub(crate) fn submit(&self, worker: usize, task: Task) -> bool {
        self.shared.submit(worker, task)
    }

    /// Stop admission, finish all queued work, flush the cache and join
    pub fn shutdown(&self) {
        {
            let mut accepting = self.shared.accepting.write();
            *accepting = false;
        }
        self.shared.closing.store(true, Ordering::Release);

        let threads = std::mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            return;
        }
        info!(used = self.used(), "Shutting down cache controller");

        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        info!(used = self.used(), "Cache controller stopped");
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("workers", &self.concurrency())
            .field("used", &self.used())
            .field("lower", &self.lower())
            .field("upper", &self.upper())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_invalid_watermarks() {
        assert_matches!(Controller::new(10, 5, 1), Err(Error::InvalidConfig(_)));
    }

    #[test]
    fn test_start_and_shutdown() {
        let controller = Controller::new(1 << 10, 1 << 20, 3).unwrap();
        assert_eq!(controller.concurrency(), 3);
        assert!(controller.is_accepting());
        assert!(controller
            .worker_states()
            .iter()
            .all(|s| *s != WorkerState::Pending));
        wait_until(|| {
            controller
                .worker_states()
                .iter()
                .all(|s| *s != WorkerState::Created)
        });

        controller.shutdown();
        assert!(!controller.is_accepting());
        assert!(controller
            .worker_states()
            .iter()
            .all(|s| *s == WorkerState::Quit));
        controller.shutdown();
    }

    #[test]
    fn test_submitted_tasks_run() {
        let controller = Controller::new(1 << 10, 1 << 20, 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for worker in 0..10 {
            let counter = Arc::clone(&counter);
            assert!(controller.submit(
                worker,
                Box::new(move |_ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            ));
        }
        wait_until(|| counter.load(Ordering::SeqCst) == 10);
    }

    #[test]
    fn test_wait_runs_next_round_and_done_after_gc() {
        let controller = Controller::new(1 << 10, 1 << 20, 2).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&order);
        assert!(controller.submit(
            0,
            Box::new(move |ctx| {
                log.lock().push("root");
                let wait_log = Arc::clone(&log);
                ctx.push_wait(Box::new(move |_| wait_log.lock().push("wait")));
                let done_log = Arc::clone(&log);
                ctx.push_done(Box::new(move |_| done_log.lock().push("done")));
            })
        ));

        wait_until(|| order.lock().len() == 3);
        assert_eq!(*order.lock(), vec!["root", "done", "wait"]);
    }

    #[test]
    fn test_shutdown_finishes_queued_work() {
        let controller = Controller::new(1 << 10, 1 << 20, 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        fn chain(counter: Arc<AtomicUsize>, remaining: usize) -> Task {
            Box::new(move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                if remaining > 0 {
                    ctx.push_wait(chain(counter, remaining - 1));
                }
            })
        }

        assert!(controller.submit(1, chain(Arc::clone(&counter), 20)));
        controller.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let controller = Controller::new(1 << 10, 1 << 20, 1).unwrap();
        controller.shutdown();
        assert!(!controller.submit(0, Box::new(|_| {})));
        assert_eq!(controller.metrics().rejected, 1);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let controller = Controller::new(1 << 10, 1 << 20, 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(controller.submit(0, Box::new(|_| panic!("boom"))));
        let after = Arc::clone(&counter);
        assert!(controller.submit(
            0,
            Box::new(move |_| {
                after.fetch_add(1, Ordering::SeqCst);
            })
        ));
        wait_until(|| counter.load(Ordering::SeqCst) == 1);
    }

    #[test]
    fn test_idle_rounds_counted() {
        let controller = Controller::new(1 << 10, 1 << 20, 2).unwrap();
        wait_until(|| controller.metrics().idle_rounds > 20);
        assert!(controller.metrics().rounds >= controller.metrics().idle_rounds);
    }
}
