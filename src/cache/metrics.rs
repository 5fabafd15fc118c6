//! Cache Metrics Collection
//!
//! Counters for cache hits, promotions, eviction and scheduler rounds.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Cache and scheduler metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Node I/O
    hits: AtomicU64,
    misses: AtomicU64,
    bypassed: AtomicU64,

    // Tree shape
    promotions: AtomicU64,
    collapses: AtomicU64,

    // Persistence
    evictions: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,

    // Scheduler
    rounds: AtomicU64,
    idle_rounds: AtomicU64,
    steals: AtomicU64,
    rejected: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Served from an existing buffer
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Buffer allocated and back-filled from storage
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Served by direct storage I/O because the budget was exhausted
    pub fn record_bypass(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_collapse(&self, children: u64) {
        self.collapses.fetch_add(children, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, ok: bool) {
        if ok {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.flush_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_round(&self, idle: bool) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
        if idle {
            self.idle_rounds.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_steals(&self, count: u64) {
        if count > 0 {
            self.steals.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Fraction of node accesses served from cache
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64 + self.bypassed.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self, used_bytes: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
            promotions: self.promotions.load(Ordering::Relaxed),
            collapses: self.collapses.load(Ordering::Relaxed),
            evictions: self.evictions(),
            flushes: self.flushes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            rounds: self.rounds(),
            idle_rounds: self.idle_rounds.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            used_bytes,
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub bypassed: u64,
    pub hit_ratio: f64,
    pub promotions: u64,
    pub collapses: u64,
    pub evictions: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub rounds: u64,
    pub idle_rounds: u64,
    pub steals: u64,
    pub rejected: u64,
    pub used_bytes: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hits(), 0);
        assert_eq!(metrics.rounds(), 0);
        assert_eq!(metrics.hit_ratio(), 0.0);
    }

    #[test]
    fn test_hit_tracking() {
        let metrics = CacheMetrics::new();

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();

        assert_eq!(metrics.hits(), 2);
        assert_eq!(metrics.misses(), 1);
        assert!((metrics.hit_ratio() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_snapshot() {
        let metrics = CacheMetrics::new();
        metrics.record_flush(true);
        metrics.record_flush(false);
        metrics.record_round(true);
        metrics.record_round(false);
        metrics.record_collapse(3);

        let snapshot = metrics.snapshot(4096);
        assert_eq!(snapshot.flushes, 1);
        assert_eq!(snapshot.flush_failures, 1);
        assert_eq!(snapshot.rounds, 2);
        assert_eq!(snapshot.idle_rounds, 1);
        assert_eq!(snapshot.collapses, 3);
        assert_eq!(snapshot.used_bytes, 4096);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"used_bytes\":4096"));
    }
}
