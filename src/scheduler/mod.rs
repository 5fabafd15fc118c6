//! Round-Based Work-Stealing Scheduler
//!
//! A fixed pool of worker threads executes tree tasks in synchronized
//! rounds. Work submitted from outside enters through a bounded per-worker
//! injection queue; work spawned by a task lands in the executing worker's
//! wait list (next round) or done list (after the round's GC phase).

mod barrier;
mod controller;
mod queue;
mod state;
mod worker;

pub use controller::Controller;
pub use queue::Task;
pub use state::WorkerState;
pub use worker::WorkerContext;
