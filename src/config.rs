//! Controller configuration
//!
//! Loaded from defaults, YAML or CLI flags. Every field has a default so a
//! partial YAML document is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Default lower watermark (256 MiB)
pub const DEFAULT_LOWER_WATERMARK: u64 = 256 * 1024 * 1024;

/// Default upper watermark (1 GiB)
pub const DEFAULT_UPPER_WATERMARK: u64 = 1024 * 1024 * 1024;

/// Default per-worker injection queue capacity
pub const DEFAULT_INJECTION_CAPACITY: usize = 65536;

/// Idle rounds after which the eviction target starts decaying
pub const DEFAULT_IDLE_ROUNDS_BEFORE_DECAY: u32 = 10;

/// Idle rounds after which workers sleep between rounds
pub const DEFAULT_IDLE_ROUNDS_BEFORE_SLEEP: u32 = 10;

/// Default back-off sleep for idle workers, in microseconds
pub const DEFAULT_IDLE_SLEEP_MICROS: u64 = 500;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the cache controller and its worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Eviction target while the system is active (bytes)
    pub lower_watermark: u64,

    /// Hard cap on cache memory (bytes)
    pub upper_watermark: u64,

    /// Number of worker threads; 0 means one per available core
    pub concurrency: usize,

    /// Capacity of each worker's cross-thread injection queue
    pub injection_capacity: usize,

    /// Idle rounds before the eviction target decays towards zero
    pub idle_rounds_before_decay: u32,

    /// Idle rounds before workers start sleeping between rounds
    pub idle_rounds_before_sleep: u32,

    /// Sleep between idle rounds once nothing is left to evict (microseconds)
    pub idle_sleep_micros: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            lower_watermark: DEFAULT_LOWER_WATERMARK,
            upper_watermark: DEFAULT_UPPER_WATERMARK,
            concurrency: 0,
            injection_capacity: DEFAULT_INJECTION_CAPACITY,
            idle_rounds_before_decay: DEFAULT_IDLE_ROUNDS_BEFORE_DECAY,
            idle_rounds_before_sleep: DEFAULT_IDLE_ROUNDS_BEFORE_SLEEP,
            idle_sleep_micros: DEFAULT_IDLE_SLEEP_MICROS,
        }
    }
}

impl ControllerConfig {
    /// Configuration with the given watermarks and worker count
    pub fn new(lower_watermark: u64, upper_watermark: u64, concurrency: usize) -> Self {
        Self {
            lower_watermark,
            upper_watermark,
            concurrency,
            ..Self::default()
        }
    }

    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Worker count with 0 resolved to the available parallelism
    pub fn resolved_concurrency(&self) -> usize {
        if self.concurrency > 0 {
            self.concurrency
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Idle back-off sleep
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_micros)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.lower_watermark >= self.upper_watermark {
            return Err(Error::InvalidConfig(format!(
                "lower_watermark ({}) must be below upper_watermark ({})",
                self.lower_watermark, self.upper_watermark
            )));
        }
        if self.injection_capacity == 0 {
            return Err(Error::InvalidConfig(
                "injection_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
