//! TreeCache - Memory-Cached Block Trees over Flat Storage
//!
//! Overlays a flat storage engine (a file or an in-memory buffer) with a
//! tree of fixed fan-out whose nodes cache blocks of the address space in
//! memory. Operations run asynchronously on a pool of round-synchronized,
//! work-stealing workers which also drive eviction between the cache's
//! lower and upper watermarks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  Tree::read / write / sync / detach / hook   →  CompletionHandle │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐        │
//! │  │  Controller  │───▶│   Workers    │───▶│  Node tasks  │        │
//! │  │ (admission)  │    │ (4 barriers) │    │ (per level)  │        │
//! │  └──────────────┘    └──────┬───────┘    └──────┬───────┘        │
//! │                             │ GC phase          │ miss / flush   │
//! │                      ┌──────▼───────┐    ┌──────▼───────┐        │
//! │                      │  Live cache  │    │   Storage    │        │
//! │                      │   (FIFO)     │    │ file|memory  │        │
//! │                      └──────────────┘    └──────────────┘        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Memory budget, live-cache queue and cache metrics
//! - [`completion`] - Completion handles for asynchronous operations
//! - [`config`] - Controller configuration
//! - [`error`] - Error types
//! - [`scheduler`] - Controller and round-based worker pool
//! - [`storage`] - Flat storage engines
//! - [`tree`] - Cached trees

pub mod cache;
pub mod completion;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod storage;
pub mod tree;

// Re-export commonly used types
pub use cache::{MetricsSnapshot, Usage};
pub use completion::{CompletionHandle, IoState, ReadHandle};
pub use config::ControllerConfig;
pub use error::{Error, Result};
pub use scheduler::{Controller, WorkerContext, WorkerState};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use tree::{LevelTable, Tree};
