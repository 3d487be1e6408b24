//! # chanwatch-core
//!
//! Core library for chanwatch - a bias-aware collector for public message
//! channels.
//!
//! This library provides:
//! - Domain types for channels, messages, continuity state and checkpoints
//! - Capability declarations for each source backend
//! - Source adapters over an opaque transport
//! - A checkpointed fetch loop with flood-wait backoff and proxy rotation
//! - Continuity tracking, bias metrics and run manifests
//! - Keyword, engagement and media filters applied before storage
//! - Database storage layer with SQLite
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Collection is split by how much the data can be trusted:
//! - **Capabilities:** what each backend can and cannot observe
//! - **Records:** normalized messages tagged with where their ids came from
//! - **Continuity:** observed, edited, deleted and unknown ids over time,
//!   inferred only from ids the backend promises are contiguous
//!
//! ## Example
//!
//! ```rust,no_run
//! use chanwatch_core::{Config, Database};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open database
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//! ```

// Re-export commonly used items at the crate root
pub use bias::{BiasMetrics, ContinuityTracker, RunContext, RunManifest, RunRecorder};
pub use capabilities::{BiasConfidence, Capabilities};
pub use config::Config;
pub use db::{Database, MessageStore};
pub use error::{Error, ErrorClass, Result};
pub use fetch::{ChannelOutcome, Collector, RunSummary, StopSignal};
pub use filter::{FilterMode, MessageFilter};
pub use rotation::{ProxyEndpoint, ProxyPool, RotationStrategy};
pub use source::SourceAdapter;
pub use types::*;

// Public modules
pub mod bias;
pub mod capabilities;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod logging;
pub mod rotation;
pub mod source;
pub mod types;
