//! Error types for treecache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or driving a cached tree
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Level bit-widths do not describe a valid tree
    #[error("Invalid level table: {0}")]
    InvalidLevels(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    // =========================================================================
    // Operation Outcomes
    // =========================================================================
    /// Operation was refused at admission
    #[error("Operation rejected: {operation}")]
    Rejected { operation: String },

    /// Operation completed with a storage or subtree failure
    #[error("Operation failed: {operation}")]
    Failed { operation: String },

    /// Result requested before the operation finished
    #[error("Operation still running: {operation}")]
    StillRunning { operation: String },

    /// Worker pool could not be started
    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}
