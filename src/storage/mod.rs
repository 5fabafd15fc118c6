//! Raw Storage Engines
//!
//! The tree persists its cache through a [`Storage`] engine: a synchronous,
//! uncached, positioned read/write interface over flat bytes. Engines report
//! success or failure only; there are no partial-length semantics.
//!
//! - [`FileStorage`]: positioned I/O against a file (`pread`/`pwrite` on unix)
//! - [`MemoryStorage`]: in-memory bytes with fault injection, for tests

mod file;
mod memory;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Positioned storage engine
pub trait Storage: Send + Sync {
    /// Fill `buf` from `offset`. Fails if any byte cannot be read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> bool;

    /// Write all of `buf` at `offset`, extending storage as needed
    fn write_at(&self, buf: &[u8], offset: u64) -> bool;

    /// Current length in bytes
    fn len(&self) -> u64;

    /// Whether storage holds no bytes
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist written data to stable media
    fn sync_data(&self) -> bool {
        true
    }

    /// Human-readable engine description for logs
    fn describe(&self) -> String;

    /// Engine statistics
    fn stats(&self) -> StorageStats;
}

/// Storage engine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Bytes read
    pub bytes_read: u64,
    /// Bytes written
    pub bytes_written: u64,
    /// Failed operations
    pub failures: u64,
}

/// Atomic counters backing [`StorageStats`]
#[derive(Debug, Default)]
pub(crate) struct StorageCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    failures: AtomicU64,
}

impl StorageCounters {
    pub(crate) fn record_read(&self, len: usize, ok: bool) -> bool {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.bytes_read.fetch_add(len as u64, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    pub(crate) fn record_write(&self, len: usize, ok: bool) -> bool {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.bytes_written.fetch_add(len as u64, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    pub(crate) fn snapshot(&self) -> StorageStats {
        StorageStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
