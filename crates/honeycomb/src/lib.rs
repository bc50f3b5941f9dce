//! Honeycomb: ingestion of honeypot session logs into SQLite.
//!
//! This crate handles:
//! - Detecting the layout of Cowrie JSON logs (line, multi-line or mixed)
//! - Sanitizing and validating hostile input into typed events
//! - Idempotent raw event storage and per-session summary upserts
//! - Bulk backfill and resumable delta loading with checkpoints
//! - A dead letter queue with repair and replay
//! - A circuit breaker in front of every storage commit

pub mod aggregate;
pub mod breaker;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dlq;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod sanitize;
pub mod source;
pub mod status;
pub mod store;
pub mod validate;

// Re-export commonly used items
pub use config::Config;
pub use error::PipelineError;
pub use pipeline::{BulkLoader, DeltaLoader, DeltaOptions, LoaderContext, Stats};
pub use store::{EventStore, SqliteStore, StoreRef};

pub use honeycomb_core::{MetricsConfig, cancel_on_signal, init_metrics, init_tracing};
