//! Error types for the honeycomb loader.
//!
//! Record-level failures (`ParseError`, `ValidationError`) are values that
//! route a record to the dead letter queue. Run-level failures are collected
//! in `PipelineError`, which classifies itself as transient, malformed input
//! or fatal.

use std::path::PathBuf;

use snafu::prelude::*;

use crate::dlq::ReasonCode;

pub use honeycomb_core::error::{ConfigError, MetricsError};

// ============ Record Errors ============

/// The text of a record is not valid JSON.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display("invalid JSON at line {line} column {column}: {message}"))]
#[snafu(visibility(pub))]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl From<serde_json::Error> for ParseError {
    fn from(e: serde_json::Error) -> Self {
        Self {
            message: e.to_string(),
            line: e.line(),
            column: e.column(),
        }
    }
}

/// A parsed record does not satisfy the event schema.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum ValidationError {
    #[snafu(display("missing required field '{field}'"))]
    MissingRequiredField { field: &'static str },

    #[snafu(display("field '{field}' must be a {expected}"))]
    InvalidFieldType {
        field: &'static str,
        expected: &'static str,
    },

    #[snafu(display("record is not a JSON object"))]
    NotAnObject,
}

/// Why a single record could not be ingested.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum RecordError {
    #[snafu(display("{source}"))]
    Syntax { source: ParseError },

    #[snafu(display("{source}"))]
    Schema { source: ValidationError },
}

impl RecordError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            RecordError::Syntax { .. } => ReasonCode::ParseError,
            RecordError::Schema { source } => match source {
                ValidationError::MissingRequiredField { .. } => ReasonCode::MissingRequiredField,
                ValidationError::InvalidFieldType { .. } => ReasonCode::InvalidFieldType,
                ValidationError::NotAnObject => ReasonCode::NotAnObject,
            },
        }
    }
}

impl From<ParseError> for RecordError {
    fn from(source: ParseError) -> Self {
        RecordError::Syntax { source }
    }
}

impl From<ValidationError> for RecordError {
    fn from(source: ValidationError) -> Self {
        RecordError::Schema { source }
    }
}

// ============ Reader Errors ============

/// Errors reading a source file.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReaderError {
    #[snafu(display("Failed to open source {}: {source}", path.display()))]
    OpenSource {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to read source {}: {source}", path.display()))]
    ReadSource {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to decompress {}: {message}", path.display()))]
    Decompression { path: PathBuf, message: String },

    #[snafu(display("Unrecognized format in {}: no JSON events can be extracted", path.display()))]
    UnknownFormat { path: PathBuf },

    #[snafu(display(
        "Checkpoint cursor {cursor} is beyond the end of {} ({len} bytes); rerun with --reset-checkpoint",
        path.display()
    ))]
    CursorBeyondEnd { path: PathBuf, cursor: u64, len: u64 },

    #[snafu(display(
        "Source {} no longer matches its checkpoint (rotated or replaced); rerun with --reset-checkpoint",
        path.display()
    ))]
    SourceRotated { path: PathBuf },

    #[snafu(display("Failed to list {}: {source}", path.display()))]
    ListSource {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("No source files matched '{pattern}'"))]
    NoSources { pattern: String },

    #[snafu(display("Invalid source pattern '{pattern}': {source}"))]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
}

// ============ Store Errors ============

/// Errors from the storage collaborator.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    #[snafu(display("Failed to open database {}: {source}", path.display()))]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[snafu(display("Storage operation '{operation}' failed: {source}"))]
    Sqlite {
        operation: &'static str,
        source: rusqlite::Error,
    },

    #[snafu(display("Failed to serialize payload: {source}"))]
    Serialize { source: serde_json::Error },

    #[snafu(display("Database connection lock poisoned"))]
    LockPoisoned,

    #[snafu(display("Source '{source_name}' is locked by '{owner}'"))]
    LockHeld { source_name: String, owner: String },

    #[snafu(display("Storage unavailable: {message}"))]
    Unavailable { message: String, transient: bool },

    #[snafu(display("Checkpoint for '{source_name}' was moved by another writer"))]
    CheckpointConflict { source_name: String },

    #[snafu(display("Stored value in {table}.{column} is invalid: {message}"))]
    Decode {
        table: &'static str,
        column: &'static str,
        message: String,
    },
}

impl StoreError {
    /// Busy and locked databases clear up on their own; everything else does not.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite { source, .. } | StoreError::Open { source, .. } => {
                matches!(
                    source.sqlite_error_code(),
                    Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
                )
            }
            StoreError::Unavailable { transient, .. } => *transient,
            _ => false,
        }
    }
}

// ============ Pipeline Errors ============

/// How a run-level error should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff, bounded by the circuit breaker.
    Transient,
    /// Routed to the dead letter queue; never retried inline.
    MalformedInput,
    /// Aborts the current run and leaves the checkpoint untouched.
    Fatal,
}

/// Top-level pipeline errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    #[snafu(display("Reader error: {source}"))]
    Reader { source: ReaderError },

    #[snafu(display("Storage error: {source}"))]
    Store { source: StoreError },

    #[snafu(display("Malformed record: {source}"))]
    Record { source: RecordError },

    #[snafu(display("Circuit breaker for '{service}' stayed open after {cycles} cooldown cycles"))]
    CircuitOpen { service: String, cycles: u32 },

    #[snafu(display("Commit failed after {attempts} attempts: {source}"))]
    RetriesExhausted { attempts: u32, source: StoreError },

    #[snafu(display("Maximum quarantined records exceeded: {count}"))]
    MaxQuarantined { count: usize },

    #[snafu(display("Failed to write status document {}: {source}", path.display()))]
    StatusWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    #[snafu(display("{failed} of {total} sources failed, first error: {source}"))]
    SourcesFailed {
        failed: usize,
        total: usize,
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Store { source } if source.is_transient() => ErrorClass::Transient,
            PipelineError::Record { .. } => ErrorClass::MalformedInput,
            _ => ErrorClass::Fatal,
        }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<ReaderError> for PipelineError {
    fn from(source: ReaderError) -> Self {
        PipelineError::Reader { source }
    }
}

impl From<StoreError> for PipelineError {
    fn from(source: StoreError) -> Self {
        PipelineError::Store { source }
    }
}

impl From<RecordError> for PipelineError {
    fn from(source: RecordError) -> Self {
        PipelineError::Record { source }
    }
}

impl From<MetricsError> for PipelineError {
    fn from(source: MetricsError) -> Self {
        PipelineError::Metrics { source }
    }
}
