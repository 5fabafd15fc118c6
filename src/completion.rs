//! Completion Handles
//!
//! Every asynchronous tree operation returns a [`CompletionHandle`]. The
//! handle never blocks a worker: clients either poll [`CompletionHandle::state`]
//! or block on [`CompletionHandle::wait`] from their own thread.
//!
//! # Disciplines
//!
//! - **Counting**: a dependency counter starts at one unit owned by the
//!   issuing task. Every fan-out retains one unit per extra sub-task and every
//!   finished sub-task releases one. Reaching zero settles the handle.
//! - **Timing**: the handle is settled by a trailing marker task that follows
//!   the operation through the scheduler rounds (see `Tree::sync`).
//!
//! A failure recorded through [`CompletionHandle::fail`] is sticky: the
//! terminal state is `Failed` no matter how many sub-tasks succeed.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default polling interval for [`CompletionHandle::wait_default`]
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Observable state of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoState {
    /// Sub-tasks are still outstanding
    Running,
    /// At least one sub-task failed
    Failed,
    /// Refused at admission
    Rejected,
    /// Completed successfully
    Done,
}

impl IoState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => IoState::Failed,
            2 => IoState::Rejected,
            3 => IoState::Done,
            _ => IoState::Running,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            IoState::Running => 0,
            IoState::Failed => 1,
            IoState::Rejected => 2,
            IoState::Done => 3,
        }
    }

    /// Whether the state is terminal
    pub fn is_terminal(self) -> bool {
        self != IoState::Running
    }
}

impl fmt::Display for IoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoState::Running => write!(f, "Running"),
            IoState::Failed => write!(f, "Failed"),
            IoState::Rejected => write!(f, "Rejected"),
            IoState::Done => write!(f, "Done"),
        }
    }
}

/// How a handle reaches its terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Dependency counting over sub-tasks
    Counting,
    /// Settled by a trailing marker task
    Timing,
}

#[derive(Debug)]
struct Inner {
    discipline: Discipline,
    state: AtomicU8,
    deps: AtomicUsize,
    failed: AtomicBool,
}

/// Shared completion tracker for one client operation
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    inner: Arc<Inner>,
}

impl CompletionHandle {
    fn with_state(discipline: Discipline, state: IoState, deps: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                discipline,
                state: AtomicU8::new(state.as_u8()),
                deps: AtomicUsize::new(deps),
                failed: AtomicBool::new(state == IoState::Failed),
            }),
        }
    }

    /// Create a running handle holding one dependency unit
    pub(crate) fn counting() -> Self {
        Self::with_state(Discipline::Counting, IoState::Running, 1)
    }

    /// Create a running handle settled by [`CompletionHandle::complete`]
    pub(crate) fn timing() -> Self {
        Self::with_state(Discipline::Timing, IoState::Running, 0)
    }

    /// Create an already successful handle
    pub(crate) fn done() -> Self {
        Self::with_state(Discipline::Counting, IoState::Done, 0)
    }

    /// Create an already failed handle
    pub(crate) fn failed() -> Self {
        Self::with_state(Discipline::Counting, IoState::Failed, 0)
    }

    /// Create an already rejected handle
    pub(crate) fn rejected() -> Self {
        Self::with_state(Discipline::Counting, IoState::Rejected, 0)
    }

    /// Discipline used by this handle
    pub fn discipline(&self) -> Discipline {
        self.inner.discipline
    }

    /// Non-blocking state query
    pub fn state(&self) -> IoState {
        IoState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Whether the operation reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Block until terminal, polling every `interval`
    pub fn wait(&self, interval: Duration) -> IoState {
        loop {
            let state = self.state();
            if state.is_terminal() {
                return state;
            }
            std::thread::sleep(interval);
        }
    }

    /// Block until terminal with the default 100ms polling interval
    pub fn wait_default(&self) -> IoState {
        self.wait(DEFAULT_WAIT_INTERVAL)
    }

    /// Await a terminal state from async code, polling every `interval`
    pub async fn wait_async(&self, interval: Duration) -> IoState {
        loop {
            let state = self.state();
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Record a failure. Idempotent and monotonic.
    pub fn fail(&self) {
        self.inner.failed.store(true, Ordering::Release);
        // A handle that already settled as Done still reports the failure.
        let _ = self.inner.state.compare_exchange(
            IoState::Done.as_u8(),
            IoState::Failed.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Whether a failure has been recorded, even if still running
    pub fn has_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Acquire)
    }

    /// Outstanding dependency units
    pub fn pending(&self) -> usize {
        self.inner.deps.load(Ordering::Acquire)
    }

    /// Add `num` dependency units for additional sub-tasks
    pub(crate) fn retain(&self, num: usize) {
        if num > 0 {
            self.inner.deps.fetch_add(num, Ordering::AcqRel);
        }
    }

    /// Release one dependency unit, settling the handle at zero
    pub(crate) fn release(&self) {
        if self.inner.deps.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.settle();
        }
    }

    /// Settle a timing handle
    pub(crate) fn complete(&self) {
        self.settle();
    }

    /// Refuse the operation at admission
    pub(crate) fn reject(&self) {
        let _ = self.inner.state.compare_exchange(
            IoState::Running.as_u8(),
            IoState::Rejected.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn settle(&self) {
        let terminal = if self.has_failed() {
            IoState::Failed
        } else {
            IoState::Done
        };
        let _ = self.inner.state.compare_exchange(
            IoState::Running.as_u8(),
            terminal.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        // fail() may have raced between the flag check and the exchange.
        if terminal == IoState::Done && self.has_failed() {
            self.fail();
        }
    }

    /// Convert a terminal state into a `Result`
    pub fn into_result(&self, operation: &str) -> Result<()> {
        match self.state() {
            IoState::Done => Ok(()),
            IoState::Failed => Err(Error::Failed {
                operation: operation.to_string(),
            }),
            IoState::Rejected => Err(Error::Rejected {
                operation: operation.to_string(),
            }),
            IoState::Running => Err(Error::StillRunning {
                operation: operation.to_string(),
            }),
        }
    }
}

/// Destination of a read: a buffer filled by concurrent sub-tasks
#[derive(Debug, Clone)]
pub(crate) struct ReadTarget {
    buf: Arc<Mutex<Vec<u8>>>,
    origin: u64,
}

impl ReadTarget {
    pub(crate) fn new(origin: u64, len: usize) -> Self {
        Self {
            buf: Arc::new(Mutex::new(vec![0u8; len])),
            origin,
        }
    }

    /// Copy `data` into the slot for absolute address `at`
    pub(crate) fn fill(&self, at: u64, data: &[u8]) {
        let start = (at - self.origin) as usize;
        let mut guard = self.buf.lock();
        guard[start..start + data.len()].copy_from_slice(data);
    }
}

/// Handle for a read, carrying the destination buffer
#[derive(Debug, Clone)]
pub struct ReadHandle {
    handle: CompletionHandle,
    target: ReadTarget,
    len: usize,
}

impl ReadHandle {
    pub(crate) fn new(handle: CompletionHandle, target: ReadTarget, len: usize) -> Self {
        Self {
            handle,
            target,
            len,
        }
    }

    /// Number of bytes this read covers (may be truncated by `readsome`)
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the read covers no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The underlying completion handle
    pub fn handle(&self) -> &CompletionHandle {
        &self.handle
    }

    /// Take the bytes once the read is Done
    pub fn into_bytes(self) -> Result<Bytes> {
        self.handle.into_result("read")?;
        let data = std::mem::take(&mut *self.target.buf.lock());
        Ok(Bytes::from(data))
    }
}

impl Deref for ReadHandle {
    type Target = CompletionHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_counting_settles_at_zero() {
        let handle = CompletionHandle::counting();
        handle.retain(2);
        handle.release();
        handle.release();
        assert_eq!(handle.state(), IoState::Running);
        assert_eq!(handle.pending(), 1);

        handle.release();
        assert_eq!(handle.state(), IoState::Done);
    }

    #[test]
    fn test_failure_is_sticky() {
        let handle = CompletionHandle::counting();
        handle.retain(1);
        handle.fail();
        assert_eq!(handle.state(), IoState::Running);
        assert!(handle.has_failed());

        handle.release();
        handle.release();
        assert_eq!(handle.state(), IoState::Failed);

        handle.fail();
        assert_eq!(handle.state(), IoState::Failed);
    }

    #[test]
    fn test_fail_after_done_reports_failed() {
        let handle = CompletionHandle::done();
        handle.fail();
        assert_eq!(handle.state(), IoState::Failed);
    }

    #[test]
    fn test_timing_complete() {
        let handle = CompletionHandle::timing();
        assert_eq!(handle.discipline(), Discipline::Timing);
        assert_eq!(handle.state(), IoState::Running);
        handle.complete();
        assert_eq!(handle.state(), IoState::Done);
    }

    #[test]
    fn test_reject_does_not_override_terminal() {
        let handle = CompletionHandle::done();
        handle.reject();
        assert_eq!(handle.state(), IoState::Done);

        let handle = CompletionHandle::counting();
        handle.reject();
        assert_eq!(handle.state(), IoState::Rejected);
        handle.release();
        assert_eq!(handle.state(), IoState::Rejected);
    }

    #[test]
    fn test_wait_returns_after_settle_from_other_thread() {
        let handle = CompletionHandle::counting();
        let remote = handle.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.release();
        });

        assert_eq!(handle.wait(Duration::from_millis(1)), IoState::Done);
        thread.join().unwrap();
    }

    #[tokio::test]
    async fn test_wait_async() {
        let handle = CompletionHandle::timing();
        let remote = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.complete();
        });

        let state = handle.wait_async(Duration::from_millis(1)).await;
        assert_eq!(state, IoState::Done);
    }

    #[test]
    fn test_read_handle_into_bytes() {
        let target = ReadTarget::new(100, 4);
        target.fill(102, b"zz");
        let handle = CompletionHandle::counting();
        let read = ReadHandle::new(handle.clone(), target, 4);

        handle.release();
        let bytes = read.into_bytes().unwrap();
        assert_eq!(bytes.as_ref(), b"\0\0zz");
    }

    #[test]
    fn test_read_handle_errors() {
        let read = ReadHandle::new(CompletionHandle::rejected(), ReadTarget::new(0, 1), 1);
        assert_matches!(read.into_bytes(), Err(Error::Rejected { .. }));

        let read = ReadHandle::new(CompletionHandle::counting(), ReadTarget::new(0, 1), 1);
        assert_matches!(read.into_bytes(), Err(Error::StillRunning { .. }));
    }

    #[test]
    fn test_io_state_display() {
        assert_eq!(format!("{}", IoState::Running), "Running");
        assert_eq!(format!("{}", IoState::Done), "Done");
    }
}
