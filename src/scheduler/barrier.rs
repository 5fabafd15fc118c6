//! Round synchronization
//!
//! [`RoundBarrier`] is a reusable all-worker barrier with a designated
//! decider. Every worker arrives with a vote; the decider waits for all of
//! them, computes an outcome from the OR of the votes and releases everyone
//! with that outcome. All workers therefore take the same path through the
//! round.
//!
//! [`StartGate`] holds freshly spawned workers until the whole pool exists.

use parking_lot::{Condvar, Mutex};

struct BarrierState<T> {
    arrived: usize,
    any: bool,
    generation: u64,
    outcome: T,
}

/// Decider barrier shared by all workers of a pool
pub(crate) struct RoundBarrier<T> {
    workers: usize,
    state: Mutex<BarrierState<T>>,
    cond: Condvar,
}

impl<T: Copy + Default> RoundBarrier<T> {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            workers,
            state: Mutex::new(BarrierState {
                arrived: 0,
                any: false,
                generation: 0,
                outcome: T::default(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Arrive with `vote`. Exactly one worker passes `Some(decide)`.
    pub(crate) fn sync<F>(&self, vote: bool, decide: Option<F>) -> T
    where
        F: FnOnce(bool) -> T,
    {
        let mut state = self.state.lock();
        state.arrived += 1;
        state.any |= vote;

        match decide {
            Some(decide) => {
                while state.arrived < self.workers {
                    self.cond.wait(&mut state);
                }
                let outcome = decide(state.any);
                state.outcome = outcome;
                state.arrived = 0;
                state.any = false;
                state.generation = state.generation.wrapping_add(1);
                self.cond.notify_all();
                outcome
            }
            None => {
                let generation = state.generation;
                if state.arrived == self.workers {
                    self.cond.notify_all();
                }
                while state.generation == generation {
                    self.cond.wait(&mut state);
                }
                state.outcome
            }
        }
    }
}

#[derive(Default)]
struct GateState {
    created: usize,
    released: bool,
    aborted: bool,
}

/// Start-up gate: workers report in, the controller releases them together
#[derive(Default)]
pub(crate) struct StartGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl StartGate {
    /// Report this worker created and wait for release.
    ///
    /// Returns false if the pool was aborted during start-up.
    pub(crate) fn arrive(&self) -> bool {
        let mut state = self.state.lock();
        state.created += 1;
        self.cond.notify_all();
        while !state.released && !state.aborted {
            self.cond.wait(&mut state);
        }
        !state.aborted
    }

    /// Wait until `workers` threads arrived, then release them
    pub(crate) fn release_when_created(&self, workers: usize) {
        let mut state = self.state.lock();
        while state.created < workers {
            self.cond.wait(&mut state);
        }
        state.released = true;
        self.cond.notify_all();
    }

    /// Release every waiting worker with an abort
    pub(crate) fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.cond.notify_all();
    }
}

// =============================================================================
// Tests
// =============================================================================
