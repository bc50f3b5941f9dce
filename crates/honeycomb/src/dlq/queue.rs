//! Dead letter queue operations: record, list, repair and resolve.
//!
//! Writes that carry events or dead letters go through the [`Committer`],
//! so repair is subject to the same retry and circuit breaker as loading.

use std::sync::Arc;

use serde::Serialize;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use honeycomb_core::emit;
use honeycomb_core::metrics::events::{DlqRepairAttempted, RepairOutcomeKind};

use crate::error::{PipelineError, TaskJoinSnafu};
use crate::pipeline::{Batch, Committer};
use crate::store::{CommitOutcome, StoreRef};
use crate::validate::Validator;

use super::repair::repair_json;
use super::types::{DeadLetter, DlqEntry, Resolution};

/// Result of one repair attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The entry validated after repair and its events were committed.
    Repaired { inserted: u64, duplicates: u64 },
    /// Still unusable; the retry count was incremented.
    StillFailing { retry_count: u32 },
    /// Retry cap exceeded; the entry is now terminal.
    Discarded,
}

/// Totals from a repair pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairSummary {
    pub attempted: u64,
    pub repaired: u64,
    pub still_failing: u64,
    pub discarded: u64,
    pub events_inserted: u64,
}

/// Handle on the dead letter entries in the store.
pub struct DeadLetterQueue {
    store: StoreRef,
    committer: Arc<Committer>,
    validator: Arc<Validator>,
    max_retries: u32,
}

impl DeadLetterQueue {
    pub fn new(committer: Arc<Committer>, validator: Arc<Validator>, max_retries: u32) -> Self {
        Self {
            store: committer.store().clone(),
            committer,
            validator,
            max_retries,
        }
    }

    /// Store dead letters outside of a batch.
    ///
    /// Entries already present have their retry count incremented instead.
    pub async fn record(&self, letters: Vec<DeadLetter>) -> Result<CommitOutcome, PipelineError> {
        let Some(source_name) = letters.first().map(|l| l.source_name.clone()) else {
            return Ok(CommitOutcome::default());
        };
        let batch = Batch {
            dead_letters: letters,
            ..Batch::default()
        };
        let report = self.committer.commit(&source_name, batch).await?;
        Ok(report.outcome)
    }

    /// Unresolved entries still within the retry cap.
    pub async fn list_pending(&self) -> Result<Vec<DlqEntry>, PipelineError> {
        let store = self.store.clone();
        let max_retries = self.max_retries;
        let entries = tokio::task::spawn_blocking(move || store.list_pending(max_retries))
            .await
            .context(TaskJoinSnafu)??;
        Ok(entries)
    }

    /// Set a terminal resolution. Returns false if the entry was already terminal.
    pub async fn mark_terminal(
        &self,
        entry: &DlqEntry,
        resolution: Resolution,
    ) -> Result<bool, PipelineError> {
        let store = self.store.clone();
        let id = entry.id;
        let changed = tokio::task::spawn_blocking(move || store.resolve(id, resolution))
            .await
            .context(TaskJoinSnafu)??;
        if changed {
            info!(
                id,
                resolution = resolution.as_str(),
                reason = entry.reason_code.as_str(),
                "Dead letter resolved"
            );
        }
        Ok(changed)
    }

    /// Try to recover the events in `entry` and replay them.
    ///
    /// Replayed events go through the normal validation and commit path, so
    /// dedupe keys protect against inserting an event twice.
    pub async fn repair(&self, entry: &DlqEntry) -> Result<RepairOutcome, PipelineError> {
        let candidate = if serde_json::from_str::<serde_json::Value>(&entry.raw_content).is_ok() {
            // Parses already; only validation can have failed.
            Some(entry.raw_content.clone())
        } else {
            repair_json(&entry.raw_content)
        };

        let events = candidate.and_then(|text| {
            self.validator
                .process(text.as_bytes(), &entry.source_name)
                .into_iter()
                .collect::<Result<Vec<_>, _>>()
                .ok()
        });

        let outcome = match events {
            Some(events) if !events.is_empty() => {
                let batch = Batch {
                    events,
                    ..Batch::default()
                };
                let committed = self.committer.commit(&entry.source_name, batch).await?.outcome;
                self.mark_terminal(entry, Resolution::Repaired).await?;
                RepairOutcome::Repaired {
                    inserted: committed.inserted,
                    duplicates: committed.duplicates,
                }
            }
            _ => self.record_failed_attempt(entry).await?,
        };

        emit!(DlqRepairAttempted {
            outcome: match outcome {
                RepairOutcome::Repaired { .. } => RepairOutcomeKind::Repaired,
                RepairOutcome::StillFailing { .. } => RepairOutcomeKind::StillFailing,
                RepairOutcome::Discarded => RepairOutcomeKind::Discarded,
            },
        });
        Ok(outcome)
    }

    async fn record_failed_attempt(&self, entry: &DlqEntry) -> Result<RepairOutcome, PipelineError> {
        let store = self.store.clone();
        let id = entry.id;
        let retry_count = tokio::task::spawn_blocking(move || store.bump_retry(id))
            .await
            .context(TaskJoinSnafu)??;
        if retry_count > self.max_retries {
            self.mark_terminal(entry, Resolution::Discarded).await?;
            return Ok(RepairOutcome::Discarded);
        }
        debug!(id, retry_count, "Dead letter still failing");
        Ok(RepairOutcome::StillFailing { retry_count })
    }

    /// Repair every pending entry and discard entries past the retry cap.
    pub async fn repair_pending(&self) -> Result<RepairSummary, PipelineError> {
        let mut summary = RepairSummary::default();

        let store = self.store.clone();
        let max_retries = self.max_retries;
        let exhausted = tokio::task::spawn_blocking(move || store.list_exhausted(max_retries))
            .await
            .context(TaskJoinSnafu)??;
        for entry in &exhausted {
            if self.mark_terminal(entry, Resolution::Discarded).await? {
                emit!(DlqRepairAttempted {
                    outcome: RepairOutcomeKind::Discarded,
                });
                summary.discarded += 1;
            }
        }

        for entry in self.list_pending().await? {
            summary.attempted += 1;
            match self.repair(&entry).await? {
                RepairOutcome::Repaired { inserted, .. } => {
                    summary.repaired += 1;
                    summary.events_inserted += inserted;
                }
                RepairOutcome::StillFailing { .. } => summary.still_failing += 1,
                RepairOutcome::Discarded => summary.discarded += 1,
            }
        }

        if summary.still_failing > 0 || summary.discarded > 0 {
            warn!(
                still_failing = summary.still_failing,
                discarded = summary.discarded,
                "Some dead letters could not be repaired"
            );
        }
        info!(
            attempted = summary.attempted,
            repaired = summary.repaired,
            events_inserted = summary.events_inserted,
            "Dead letter repair finished"
        );
        Ok(summary)
    }
}
