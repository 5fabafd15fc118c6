//! In-memory storage engine for testing
//!
//! Behaves like a file: reads past the end fail, writes extend the contents
//! with zeros. Reads and writes can be made to fail on demand to exercise the
//! tree's failure paths.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::{Storage, StorageCounters, StorageStats};

/// In-memory storage with fault injection
#[derive(Debug, Default)]
pub struct MemoryStorage {
    bytes: RwLock<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    counters: StorageCounters,
}

impl MemoryStorage {
    /// Create empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage pre-filled with `bytes`
    pub fn with_contents(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
            ..Self::default()
        }
    }

    /// Copy of the current contents
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// Make every subsequent read fail (or succeed again)
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Storage for MemoryStorage {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> bool {
        if self.fail_reads.load(Ordering::SeqCst) {
            return self.counters.record_read(buf.len(), false);
        }

        let bytes = self.bytes.read();
        let start = offset as usize;
        let ok = match start.checked_add(buf.len()) {
            Some(end) if end <= bytes.len() => {
                buf.copy_from_slice(&bytes[start..end]);
                true
            }
            _ => false,
        };
        self.counters.record_read(buf.len(), ok)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> bool {
        if self.fail_writes.load(Ordering::SeqCst) {
            return self.counters.record_write(buf.len(), false);
        }

        let mut bytes = self.bytes.write();
        let start = offset as usize;
        let end = start + buf.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        self.counters.record_write(buf.len(), true)
    }

    fn len(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    fn describe(&self) -> String {
        format!("[MemoryStorage: {} bytes]", self.len())
    }

    fn stats(&self) -> StorageStats {
        self.counters.snapshot()
    }
}

// =============================================================================
// Tests
// =============================================================================
