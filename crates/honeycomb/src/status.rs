//! Status document for external monitoring.
//!
//! Loaders update a shared [`StatusHandle`]; a [`StatusReporter`] writes the
//! current document to disk on an interval and once more when the run ends.
//! Writes go to a sibling temp file that is then renamed over the target, so
//! readers never see a partial document.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use snafu::prelude::*;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreakerState;
use crate::checkpoint::Checkpoint;
use crate::error::{PipelineError, StatusWriteSnafu, TaskJoinSnafu};
use crate::pipeline::{Phase, Stats};
use crate::store::CommitOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointStatus {
    pub source_name: String,
    pub cursor: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<&Checkpoint> for CheckpointStatus {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            source_name: checkpoint.source_name.clone(),
            cursor: checkpoint.cursor,
            updated_at: checkpoint.updated_at,
        }
    }
}

/// Snapshot of a run's progress.
#[derive(Debug, Clone, Serialize)]
pub struct StatusDocument {
    /// `bulk` or `delta`.
    pub mode: String,
    pub phase: Phase,
    pub read: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub quarantined: u64,
    pub batch_size: usize,
    pub checkpoint: Option<CheckpointStatus>,
    pub breaker: Option<CircuitBreakerState>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StatusDocument {
    fn new(mode: &str) -> Self {
        let now = Utc::now();
        Self {
            mode: mode.to_string(),
            phase: Phase::Idle,
            read: 0,
            inserted: 0,
            duplicates: 0,
            quarantined: 0,
            batch_size: 0,
            checkpoint: None,
            breaker: None,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }
}

/// Shared, cheaply cloned handle to the run's status.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    inner: Arc<Mutex<StatusDocument>>,
}

impl StatusHandle {
    pub fn new(mode: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatusDocument::new(mode))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusDocument> {
        // A panicked writer leaves counters that are still worth reporting.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut StatusDocument)) {
        let mut doc = self.lock();
        f(&mut doc);
        doc.updated_at = Utc::now();
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn set_phase(&self, next: Phase) {
        self.update(|doc| {
            if !doc.phase.can_transition_to(next) {
                debug!(from = %doc.phase, to = %next, "Phase transition outside the loader state machine");
            }
            doc.phase = next;
        });
    }

    pub fn add_read(&self, records: u64) {
        self.update(|doc| doc.read += records);
    }

    pub fn add_quarantined(&self, records: u64) {
        self.update(|doc| doc.quarantined += records);
    }

    pub fn record_commit(&self, outcome: &CommitOutcome) {
        self.update(|doc| {
            doc.inserted += outcome.inserted;
            doc.duplicates += outcome.duplicates;
        });
    }

    pub fn set_batch_size(&self, size: usize) {
        self.update(|doc| doc.batch_size = size);
    }

    pub fn set_checkpoint(&self, checkpoint: &Checkpoint) {
        self.update(|doc| doc.checkpoint = Some(checkpoint.into()));
    }

    pub fn set_breaker(&self, breaker: CircuitBreakerState) {
        self.update(|doc| doc.breaker = Some(breaker));
    }

    /// Mark the run finished, failed if `error` is set.
    pub fn finish(&self, error: Option<&PipelineError>) {
        self.update(|doc| match error {
            Some(e) => {
                doc.phase = Phase::Failed;
                doc.error = Some(e.to_string());
            }
            None => doc.phase = Phase::Done,
        });
    }

    pub fn snapshot(&self) -> StatusDocument {
        self.lock().clone()
    }

    /// Counts as loader stats.
    pub fn stats(&self) -> Stats {
        let doc = self.lock();
        Stats {
            read: doc.read,
            inserted: doc.inserted,
            duplicates: doc.duplicates,
            quarantined: doc.quarantined,
        }
    }
}

/// Write `doc` to `path` via a temp file and rename.
pub fn write_atomic(path: &Path, doc: &StatusDocument) -> Result<(), PipelineError> {
    let json = serde_json::to_vec_pretty(doc)
        .map_err(std::io::Error::other)
        .context(StatusWriteSnafu { path })?;
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "status".into());
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, json).context(StatusWriteSnafu { path: &tmp })?;
    std::fs::rename(&tmp, path).context(StatusWriteSnafu { path })?;
    Ok(())
}

/// Publishes the status document while a run is in progress.
pub struct StatusReporter {
    handle: StatusHandle,
    path: Option<PathBuf>,
    interval: Duration,
}

impl StatusReporter {
    /// With no path the document is logged instead of written.
    pub fn new(handle: StatusHandle, path: Option<PathBuf>, interval: Duration) -> Self {
        Self {
            handle,
            path,
            interval,
        }
    }

    /// Publish the current document once.
    pub async fn publish(&self) -> Result<(), PipelineError> {
        let doc = self.handle.snapshot();
        match &self.path {
            Some(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || write_atomic(&path, &doc))
                    .await
                    .context(TaskJoinSnafu)??;
            }
            None => info!(
                phase = %doc.phase,
                read = doc.read,
                inserted = doc.inserted,
                duplicates = doc.duplicates,
                quarantined = doc.quarantined,
                cursor = doc.checkpoint.as_ref().map(|c| c.cursor),
                breaker = doc.breaker.as_ref().map(|b| b.state.as_str()),
                "Status"
            ),
        }
        Ok(())
    }

    /// Publish on every interval tick until `shutdown`, then once more.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(100)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.publish().await {
                            warn!(error = %e, "Failed to publish status");
                        }
                    }
                }
            }
            if let Err(e) = self.publish().await {
                warn!(error = %e, "Failed to publish final status");
            }
        })
    }
}
