//! The single write path to storage.
//!
//! Every batch from every source goes through [`Committer::commit`], which
//! holds the circuit breaker for the whole retry cycle. Commits are therefore
//! serialized, and while the breaker is open every reader waiting to commit
//! stalls, which in turn stalls its bounded read channel.

use std::sync::Arc;
use std::time::Instant;

use snafu::prelude::*;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use honeycomb_core::emit;
use honeycomb_core::metrics::events::{BatchCommitted, CommitRetried, DuplicateEvents, EventsInserted};

use crate::breaker::{BreakerState, CircuitBreaker, Permit};
use crate::config::{BreakerConfig, RetryConfig};
use crate::error::{CircuitOpenSnafu, PipelineError, RetriesExhaustedSnafu, TaskJoinSnafu};
use crate::status::StatusHandle;
use crate::store::{CommitOutcome, StoreRef};

use super::Phase;
use super::batch::Batch;

/// Name the breaker reports for the storage backend.
pub const STORAGE_SERVICE: &str = "storage";

pub struct Committer {
    store: StoreRef,
    breaker: Mutex<CircuitBreaker>,
    retry: RetryConfig,
    status: StatusHandle,
}

/// A committed batch. Transient failures feed the adaptive batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReport {
    pub outcome: CommitOutcome,
    /// Transient failures before the batch went through.
    pub transient_failures: u32,
}

impl Committer {
    pub fn new(
        store: StoreRef,
        breaker: &BreakerConfig,
        retry: RetryConfig,
        status: StatusHandle,
    ) -> Self {
        Self {
            store,
            breaker: Mutex::new(CircuitBreaker::new(STORAGE_SERVICE, breaker)),
            retry,
            status,
        }
    }

    pub fn store(&self) -> &StoreRef {
        &self.store
    }

    /// Commit `batch` for `source_name`, retrying transient failures.
    ///
    /// Retries back off exponentially while the breaker is closed, up to
    /// `retry.max_attempts`. Once the breaker opens no write is attempted
    /// until its cooldown ends; the run fails when the breaker has reopened
    /// `max_open_cycles` times. Any other storage error fails immediately.
    pub async fn commit(&self, source_name: &str, batch: Batch) -> Result<CommitReport, PipelineError> {
        let records = batch.len() as u64;
        let payload = Arc::new(batch);
        let mut breaker = self.breaker.lock().await;
        let mut attempt = 0u32;

        loop {
            match breaker.try_acquire() {
                Permit::Rejected { retry_after } => {
                    self.status.set_phase(Phase::CircuitOpen);
                    self.status.set_breaker(breaker.snapshot());
                    warn!(
                        source = %source_name,
                        wait_ms = retry_after.as_millis() as u64,
                        "Storage circuit open, pausing reads"
                    );
                    tokio::time::sleep(retry_after).await;
                    continue;
                }
                Permit::Allowed | Permit::Trial => {}
            }

            attempt += 1;
            self.status.set_phase(Phase::Committing);
            let started = Instant::now();
            let store = self.store.clone();
            let batch = payload.clone();
            let name = source_name.to_string();
            let result = tokio::task::spawn_blocking(move || {
                store.commit_batch(&name, &batch.events, &batch.dead_letters)
            })
            .await
            .context(TaskJoinSnafu)?;

            let error = match result {
                Ok(outcome) => {
                    breaker.record_success();
                    self.status.set_breaker(breaker.snapshot());
                    self.status.record_commit(&outcome);
                    self.report(source_name, records, started, &outcome);
                    return Ok(CommitReport {
                        outcome,
                        transient_failures: attempt - 1,
                    });
                }
                Err(e) => e,
            };

            breaker.record_failure();
            self.status.set_breaker(breaker.snapshot());
            if !error.is_transient() {
                return Err(error.into());
            }

            emit!(CommitRetried {
                attempt,
                target: source_name.to_string(),
            });
            ensure!(
                !breaker.is_exhausted(),
                CircuitOpenSnafu {
                    service: breaker.service().to_string(),
                    cycles: breaker.open_cycles(),
                }
            );

            if breaker.state() == BreakerState::Closed {
                if attempt >= self.retry.max_attempts {
                    return Err(error).context(RetriesExhaustedSnafu { attempts: attempt });
                }
                let delay = self.retry.backoff(attempt);
                warn!(
                    source = %source_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient storage error, retrying batch"
                );
                tokio::time::sleep(delay).await;
            } else {
                warn!(source = %source_name, attempt, error = %error, "Storage write failed");
            }
        }
    }

    fn report(&self, source_name: &str, records: u64, started: Instant, outcome: &CommitOutcome) {
        debug!(
            source = %source_name,
            records,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            quarantined = outcome.quarantined_new + outcome.quarantined_repeat,
            "Committed batch"
        );
        emit!(BatchCommitted {
            records,
            duration: started.elapsed(),
            target: source_name.to_string(),
        });
        if outcome.inserted > 0 {
            emit!(EventsInserted {
                count: outcome.inserted,
                target: source_name.to_string(),
            });
        }
        if outcome.duplicates > 0 {
            emit!(DuplicateEvents {
                count: outcome.duplicates,
                target: source_name.to_string(),
            });
        }
    }
}
