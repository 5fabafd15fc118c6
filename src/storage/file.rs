//! File-backed storage engine
//!
//! Each operation maps to a single positioned syscall. The file is opened
//! read-write and created when missing. The tracked length only grows, so
//! concurrent writers never need to re-stat the file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use super::{Storage, StorageCounters, StorageStats};
use crate::error::Result;

/// Positioned I/O against a file
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    #[cfg(unix)]
    file: File,
    #[cfg(not(unix))]
    file: parking_lot::Mutex<File>,
    len: AtomicU64,
    counters: StorageCounters,
}

impl FileStorage {
    /// Open (or create) the file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        debug!(path = %path.display(), len, "Opened file storage");

        Ok(Self {
            path,
            #[cfg(unix)]
            file,
            #[cfg(not(unix))]
            file: parking_lot::Mutex::new(file),
            len: AtomicU64::new(len),
            counters: StorageCounters::default(),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn pread(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(unix)]
    fn pwrite(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn pread(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    #[cfg(not(unix))]
    fn pwrite(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }
}

impl Storage for FileStorage {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> bool {
        let result = self.pread(buf, offset);
        if let Err(e) = &result {
            warn!(path = %self.path.display(), offset, len = buf.len(), "Read failed: {}", e);
        }
        self.counters.record_read(buf.len(), result.is_ok())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> bool {
        let result = self.pwrite(buf, offset);
        match &result {
            Ok(()) => {
                self.len
                    .fetch_max(offset + buf.len() as u64, Ordering::AcqRel);
            }
            Err(e) => {
                warn!(path = %self.path.display(), offset, len = buf.len(), "Write failed: {}", e);
            }
        }
        self.counters.record_write(buf.len(), result.is_ok())
    }

    fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    fn sync_data(&self) -> bool {
        #[cfg(unix)]
        let result = self.file.sync_data();
        #[cfg(not(unix))]
        let result = self.file.lock().sync_data();

        if let Err(e) = &result {
            warn!(path = %self.path.display(), "sync_data failed: {}", e);
        }
        result.is_ok()
    }

    fn describe(&self) -> String {
        format!("[FileStorage: \"{}\"]", self.path.display())
    }

    fn stats(&self) -> StorageStats {
        self.counters.snapshot()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("data")).unwrap();
        assert!(storage.is_empty());

        assert!(storage.write_at(b"hello", 10));
        assert_eq!(storage.len(), 15);

        let mut buf = [0u8; 5];
        assert!(storage.read_at(&mut buf, 10));
        assert_eq!(&buf, b"hello");

        let mut gap = [0xffu8; 10];
        assert!(storage.read_at(&mut gap, 0));
        assert_eq!(gap, [0u8; 10]);
    }

    #[test]
    fn test_read_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("data")).unwrap();
        assert!(storage.write_at(b"abc", 0));

        let mut buf = [0u8; 8];
        assert!(!storage.read_at(&mut buf, 0));
        assert_eq!(storage.stats().failures, 1);
    }

    #[test]
    fn test_reopen_keeps_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        {
            let storage = FileStorage::open(&path).unwrap();
            assert!(storage.write_at(&[7u8; 100], 0));
            assert!(storage.sync_data());
        }

        let storage = FileStorage::open(&path).unwrap();
        assert_eq!(storage.len(), 100);
        assert!(storage.describe().contains("FileStorage"));
    }
}
