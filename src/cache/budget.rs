//! Cache memory budget
//!
//! All cached blocks of all trees draw from one [`CacheBudget`]. A block
//! buffer is a [`CacheBuffer`]: allocating it reserves its size against the
//! budget, dropping it gives the bytes back.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Cache pressure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Usage {
    /// Nothing cached
    Empty,
    /// Below the lower watermark
    Low,
    /// Above the lower watermark, eviction is due
    High,
    /// At or above the upper watermark, no new buffers
    Full,
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Usage::Empty => write!(f, "Empty"),
            Usage::Low => write!(f, "Low"),
            Usage::High => write!(f, "High"),
            Usage::Full => write!(f, "Full"),
        }
    }
}

/// Shared byte budget with lower/upper watermarks
#[derive(Debug)]
pub struct CacheBudget {
    used: AtomicU64,
    lower: u64,
    upper: u64,
}

impl CacheBudget {
    /// Create a budget. Callers validate `lower < upper`.
    pub fn new(lower: u64, upper: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            lower,
            upper,
        }
    }

    /// Bytes currently held by live buffers
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Lower watermark
    pub fn lower(&self) -> u64 {
        self.lower
    }

    /// Upper watermark
    pub fn upper(&self) -> u64 {
        self.upper
    }

    /// Classify `used + pending`
    pub fn usage(&self, pending: u64) -> Usage {
        let total = self.used().saturating_add(pending);
        if total >= self.upper {
            Usage::Full
        } else if total > self.lower {
            Usage::High
        } else if total > 0 {
            Usage::Low
        } else {
            Usage::Empty
        }
    }

    /// Reserve and allocate a zeroed buffer of `size` bytes.
    ///
    /// Returns `None` when the reservation would reach the upper watermark.
    pub fn try_allocate(self: &Arc<Self>, size: u64) -> Option<CacheBuffer> {
        let len = usize::try_from(size).ok()?;
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(size)?;
            if next >= self.upper {
                return None;
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Some(CacheBuffer {
            data: vec![0u8; len].into_boxed_slice(),
            budget: Arc::clone(self),
        })
    }

    fn give_back(&self, size: u64) {
        self.used.fetch_sub(size, Ordering::AcqRel);
    }
}

/// Block buffer accounted against a [`CacheBudget`]
pub struct CacheBuffer {
    data: Box<[u8]>,
    budget: Arc<CacheBudget>,
}

impl CacheBuffer {
    /// Buffer size in bytes
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl Deref for CacheBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for CacheBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for CacheBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheBuffer")
            .field("size", &self.data.len())
            .finish()
    }
}

impl Drop for CacheBuffer {
    fn drop(&mut self) {
        self.budget.give_back(self.size());
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_classification() {
        let budget = Arc::new(CacheBudget::new(100, 200));
        assert_eq!(budget.usage(0), Usage::Empty);
        assert_eq!(budget.usage(1), Usage::Low);
        assert_eq!(budget.usage(100), Usage::Low);
        assert_eq!(budget.usage(101), Usage::High);
        assert_eq!(budget.usage(200), Usage::Full);
    }

    #[test]
    fn test_allocation_is_accounted() {
        let budget = Arc::new(CacheBudget::new(100, 200));
        let a = budget.try_allocate(64).unwrap();
        let b = budget.try_allocate(64).unwrap();
        assert_eq!(budget.used(), 128);
        assert_eq!(a.len(), 64);
        assert!(a.iter().all(|b| *b == 0));

        drop(a);
        assert_eq!(budget.used(), 64);
        drop(b);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_allocation_never_reaches_upper() {
        let budget = Arc::new(CacheBudget::new(10, 100));
        let held = budget.try_allocate(99).unwrap();
        assert!(budget.try_allocate(1).is_none());
        assert_eq!(budget.used(), 99);
        assert!(budget.try_allocate(u64::MAX).is_none());
        drop(held);
        assert!(budget.try_allocate(100).is_none());
    }

    #[test]
    fn test_concurrent_allocation_respects_cap() {
        let budget = Arc::new(CacheBudget::new(0, 1000));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let budget = Arc::clone(&budget);
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    while let Some(buf) = budget.try_allocate(10) {
                        held.push(buf);
                        assert!(budget.used() < 1000);
                    }
                    held.len()
                })
            })
            .collect();
        let total: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert!(total >= 99);
        assert_eq!(budget.used(), 0);
    }
}
