//! Worker lifecycle states

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Phase a worker is in within the round protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    /// Thread not yet started
    Pending,
    /// Thread started, waiting for the pool to be released
    Created,
    /// Rolling queues and voting on the next phase
    Pulling,
    /// Draining ready work and stealing
    Running,
    /// Eviction sweep
    Gc,
    /// Running the done list
    Unlocking,
    /// Exited
    Quit,
}

impl WorkerState {
    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Pending => 0,
            WorkerState::Created => 1,
            WorkerState::Pulling => 2,
            WorkerState::Running => 3,
            WorkerState::Gc => 4,
            WorkerState::Unlocking => 5,
            WorkerState::Quit => 6,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => WorkerState::Created,
            2 => WorkerState::Pulling,
            3 => WorkerState::Running,
            4 => WorkerState::Gc,
            5 => WorkerState::Unlocking,
            6 => WorkerState::Quit,
            _ => WorkerState::Pending,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Pending => write!(f, "Pending"),
            WorkerState::Created => write!(f, "Created"),
            WorkerState::Pulling => write!(f, "Pulling"),
            WorkerState::Running => write!(f, "Running"),
            WorkerState::Gc => write!(f, "GC"),
            WorkerState::Unlocking => write!(f, "Unlocking"),
            WorkerState::Quit => write!(f, "Quit"),
        }
    }
}

/// Atomically published worker state
#[derive(Debug)]
pub(crate) struct AtomicWorkerState(AtomicU8);

impl AtomicWorkerState {
    pub(crate) fn new(state: WorkerState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub(crate) fn load(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: WorkerState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

// =============================================================================
// Tests
// =============================================================================
