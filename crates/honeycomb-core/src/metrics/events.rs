//! Internal events for honeycomb metrics emission.
//!
//! Each struct is one measurable occurrence in the ingestion pipeline.
//! Metrics carry a `target` label naming the source being ingested.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    fn emit(self);
}

/// Records extracted from a source.
pub struct EventsRead {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for EventsRead {
    fn emit(self) {
        trace!(count = self.count, source = %self.target, "Events read");
        counter!("honeycomb_events_read_total", "target" => self.target).increment(self.count);
    }
}

/// New raw events durably inserted.
pub struct EventsInserted {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for EventsInserted {
    fn emit(self) {
        trace!(count = self.count, source = %self.target, "Events inserted");
        counter!("honeycomb_events_inserted_total", "target" => self.target).increment(self.count);
    }
}

/// Events skipped because their dedupe key already existed.
pub struct DuplicateEvents {
    pub count: u64,
    pub target: String,
}

impl InternalEvent for DuplicateEvents {
    fn emit(self) {
        trace!(count = self.count, source = %self.target, "Duplicate events");
        counter!("honeycomb_events_duplicate_total", "target" => self.target)
            .increment(self.count);
    }
}

/// A record was routed to the dead letter queue.
pub struct RecordQuarantined {
    pub reason: &'static str,
    pub target: String,
}

impl InternalEvent for RecordQuarantined {
    fn emit(self) {
        trace!(reason = self.reason, source = %self.target, "Record quarantined");
        counter!(
            "honeycomb_records_quarantined_total",
            "reason" => self.reason,
            "target" => self.target
        )
        .increment(1);
    }
}

/// Sanitization altered a record.
pub struct RecordSanitized {
    pub target: String,
}

impl InternalEvent for RecordSanitized {
    fn emit(self) {
        trace!(source = %self.target, "Record sanitized");
        counter!("honeycomb_records_sanitized_total", "target" => self.target).increment(1);
    }
}

/// A string field exceeded its configured width and was truncated.
pub struct FieldTruncated {
    pub field: String,
    pub target: String,
}

impl InternalEvent for FieldTruncated {
    fn emit(self) {
        trace!(field = %self.field, source = %self.target, "Field truncated");
        counter!(
            "honeycomb_fields_truncated_total",
            "field" => self.field,
            "target" => self.target
        )
        .increment(1);
    }
}

/// A batch transaction committed.
pub struct BatchCommitted {
    pub records: u64,
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for BatchCommitted {
    fn emit(self) {
        trace!(
            records = self.records,
            duration_ms = self.duration.as_millis(),
            source = %self.target,
            "Batch committed"
        );
        counter!("honeycomb_batches_committed_total", "target" => self.target.clone())
            .increment(1);
        histogram!("honeycomb_batch_commit_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}

/// A batch commit failed with a transient error and will be retried.
pub struct CommitRetried {
    pub attempt: u32,
    pub target: String,
}

impl InternalEvent for CommitRetried {
    fn emit(self) {
        trace!(attempt = self.attempt, source = %self.target, "Commit retried");
        counter!("honeycomb_commit_retries_total", "target" => self.target).increment(1);
    }
}

/// The adaptive batch size changed.
pub struct CurrentBatchSize {
    pub size: usize,
    pub target: String,
}

impl InternalEvent for CurrentBatchSize {
    fn emit(self) {
        trace!(size = self.size, source = %self.target, "Batch size");
        gauge!("honeycomb_batch_size", "target" => self.target).set(self.size as f64);
    }
}

/// Circuit breaker state, encoded as 0 = closed, 1 = half open, 2 = open.
pub struct BreakerStateChanged {
    pub level: u8,
    pub service: String,
}

impl InternalEvent for BreakerStateChanged {
    fn emit(self) {
        trace!(level = self.level, service = %self.service, "Breaker state changed");
        gauge!("honeycomb_circuit_breaker_state", "service" => self.service)
            .set(f64::from(self.level));
    }
}

/// A delta checkpoint was persisted.
pub struct CheckpointSaved {
    pub target: String,
}

impl InternalEvent for CheckpointSaved {
    fn emit(self) {
        trace!(source = %self.target, "Checkpoint saved");
        counter!("honeycomb_checkpoints_saved_total", "target" => self.target).increment(1);
    }
}

/// Outcome of a dead letter repair attempt.
#[derive(Debug, Clone, Copy)]
pub enum RepairOutcomeKind {
    Repaired,
    StillFailing,
    Discarded,
}

impl RepairOutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairOutcomeKind::Repaired => "repaired",
            RepairOutcomeKind::StillFailing => "still_failing",
            RepairOutcomeKind::Discarded => "discarded",
        }
    }
}

/// A dead letter entry went through the repair path.
pub struct DlqRepairAttempted {
    pub outcome: RepairOutcomeKind,
}

impl InternalEvent for DlqRepairAttempted {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), "DLQ repair attempted");
        counter!("honeycomb_dlq_repairs_total", "outcome" => self.outcome.as_str()).increment(1);
    }
}

// ============================================================================
// Polling loop events
// ============================================================================

/// Result type for polling iterations.
#[derive(Debug, Clone, Copy)]
pub enum IterationResultType {
    Processed,
    NoItems,
}

impl IterationResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationResultType::Processed => "processed",
            IterationResultType::NoItems => "no_items",
        }
    }
}

/// A polling iteration completed.
pub struct IterationCompleted {
    pub result: IterationResultType,
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for IterationCompleted {
    fn emit(self) {
        trace!(
            result = self.result.as_str(),
            duration_ms = self.duration.as_millis(),
            source = %self.target,
            "Iteration completed"
        );
        counter!(
            "honeycomb_polling_iterations_total",
            "result" => self.result.as_str(),
            "target" => self.target.clone()
        )
        .increment(1);
        histogram!("honeycomb_polling_iteration_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}
