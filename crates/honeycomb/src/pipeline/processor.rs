//! Per-source record processing shared by the bulk and delta loaders.
//!
//! Consumes raw records from a read task, validates them, groups the
//! results into batches and hands full batches to the committer. When a
//! checkpoint manager is supplied the cursor is advanced after every
//! committed batch, never before.

use std::sync::Arc;
use std::time::Duration;

use snafu::prelude::*;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use honeycomb_core::emit;
use honeycomb_core::metrics::events::EventsRead;

use crate::checkpoint::CheckpointManager;
use crate::config::IngestConfig;
use crate::dlq::QuarantineTracker;
use crate::error::{PipelineError, ReaderError, RecordError, TaskJoinSnafu};
use crate::source::{RawRecord, ReadItem};
use crate::status::StatusHandle;
use crate::store::SourceLock;
use crate::validate::Validator;

use super::batch::{AdaptiveBatchSizer, Batch};
use super::committer::Committer;
use super::{Phase, Stats};

/// How a processing run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub stats: Stats,
    /// Where the reader stopped; `None` if it never reported an end.
    pub resume_offset: Option<u64>,
    /// True if shutdown was requested before the source was exhausted.
    pub stopped: bool,
}

pub struct RecordProcessor {
    source_name: String,
    validator: Arc<Validator>,
    committer: Arc<Committer>,
    status: StatusHandle,
    sizer: AdaptiveBatchSizer,
    quarantine: QuarantineTracker,
    lock: Option<Arc<SourceLock>>,
    last_refresh: Instant,
    batch: Batch,
    stats: Stats,
    read_since_flush: u64,
}

impl RecordProcessor {
    pub fn new(
        source_name: impl Into<String>,
        validator: Arc<Validator>,
        committer: Arc<Committer>,
        ingest: &IngestConfig,
        batch_size: usize,
        status: StatusHandle,
    ) -> Self {
        let source_name = source_name.into();
        let sizer = AdaptiveBatchSizer::new(
            batch_size,
            ingest.min_batch_size,
            ingest.max_batch_bytes,
            source_name.clone(),
        );
        status.set_batch_size(sizer.current());
        Self {
            quarantine: QuarantineTracker::new(ingest.max_quarantined, source_name.clone()),
            source_name,
            validator,
            committer,
            status,
            sizer,
            lock: None,
            last_refresh: Instant::now(),
            batch: Batch::default(),
            stats: Stats::default(),
            read_since_flush: 0,
        }
    }

    /// Keep `lock` alive for the run, refreshing it between batches.
    pub fn with_lock(mut self, lock: Arc<SourceLock>) -> Self {
        self.lock = Some(lock);
        self.last_refresh = Instant::now();
        self
    }

    /// Drain `records` until the reader ends, fails or shutdown is requested.
    ///
    /// On shutdown the receiver is dropped (stopping the reader), the
    /// in-flight batch is committed and the checkpoint advanced past it.
    /// On error nothing after the last committed batch is written.
    pub async fn run(
        mut self,
        mut records: mpsc::Receiver<Result<ReadItem, ReaderError>>,
        mut checkpoint: Option<&mut CheckpointManager>,
        shutdown: &CancellationToken,
    ) -> Result<RunOutcome, PipelineError> {
        let mut resume_offset = None;
        let mut stopped = false;

        loop {
            self.status.set_phase(Phase::Reading);
            let item = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    stopped = true;
                    break;
                }

                item = records.recv() => item,
            };

            match item {
                Some(Ok(ReadItem::Record(record))) => {
                    self.handle_record(record)?;
                    if self.sizer.is_full(&self.batch) {
                        self.flush(checkpoint.as_deref_mut()).await?;
                    }
                }
                Some(Ok(ReadItem::End { resume_offset: offset })) => {
                    resume_offset = Some(offset);
                    break;
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    warn!(source = %self.source_name, "Reader stopped before the end of the source");
                    break;
                }
            }
        }
        drop(records);

        self.flush(checkpoint.as_deref_mut()).await?;
        if let (Some(manager), Some(offset)) = (checkpoint, resume_offset) {
            self.advance(manager, offset).await?;
        }

        if stopped {
            info!(
                source = %self.source_name,
                read = self.stats.read,
                "Stopped on request after flushing the in-flight batch"
            );
        }
        Ok(RunOutcome {
            stats: self.stats,
            resume_offset,
            stopped,
        })
    }

    fn handle_record(&mut self, record: RawRecord) -> Result<(), PipelineError> {
        self.stats.read += 1;
        self.read_since_flush += 1;
        self.status.add_read(1);
        self.status.set_phase(Phase::Parsing);

        let outcomes = self.validator.process(&record.bytes, &self.source_name);
        let unparsable = matches!(
            outcomes.as_slice(),
            [Err(rejection)] if matches!(rejection.error, RecordError::Syntax { .. })
        );
        if !unparsable {
            self.status.set_phase(Phase::Validating);
        }

        for outcome in outcomes {
            match outcome {
                Ok(event) => {
                    self.status.set_phase(Phase::Batching);
                    self.batch.events.push(event);
                }
                Err(rejection) => {
                    self.status.set_phase(Phase::Quarantine);
                    self.stats.quarantined += 1;
                    self.status.add_quarantined(1);
                    let (letter, within_limit) = self.quarantine.quarantine(rejection, record.line);
                    within_limit?;
                    self.batch.dead_letters.push(letter);
                }
            }
        }

        self.batch.close_record(record.bytes.len(), record.end);
        Ok(())
    }

    async fn flush(&mut self, checkpoint: Option<&mut CheckpointManager>) -> Result<(), PipelineError> {
        let batch = self.batch.take();
        let (len, bytes, end_offset) = (batch.len(), batch.bytes, batch.end_offset);

        if self.read_since_flush > 0 {
            emit!(EventsRead {
                count: self.read_since_flush,
                target: self.source_name.clone(),
            });
            self.read_since_flush = 0;
        }

        if len > 0 {
            let report = self.committer.commit(&self.source_name, batch).await?;
            self.stats.inserted += report.outcome.inserted;
            self.stats.duplicates += report.outcome.duplicates;
            if report.transient_failures > 0 {
                self.sizer.on_transient_failure();
            } else {
                self.sizer.on_commit(len, bytes);
            }
            self.status.set_batch_size(self.sizer.current());
            self.refresh_lock().await?;
        }

        // Records that produced nothing (an empty array) still move the cursor.
        if let (Some(manager), Some(end)) = (checkpoint, end_offset) {
            self.advance(manager, end).await?;
        }
        Ok(())
    }

    async fn advance(&self, manager: &mut CheckpointManager, cursor: u64) -> Result<(), PipelineError> {
        self.status.set_phase(Phase::Checkpointing);
        manager.advance(cursor).await?;
        if let Some(current) = manager.current() {
            self.status.set_checkpoint(current);
        }
        self.status.set_phase(Phase::Idle);
        Ok(())
    }

    async fn refresh_lock(&mut self) -> Result<(), PipelineError> {
        let Some(lock) = &self.lock else {
            return Ok(());
        };
        let every = lock.ttl() / 3;
        if self.last_refresh.elapsed() < every.max(Duration::from_secs(1)) {
            return Ok(());
        }
        let lock = lock.clone();
        tokio::task::spawn_blocking(move || lock.refresh())
            .await
            .context(TaskJoinSnafu)??;
        debug!(source = %self.source_name, "Refreshed source lock");
        self.last_refresh = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, RetryConfig, ValidationConfig};
    use crate::source::{ExtractionMode, ReadOptions, spawn_read_task};
    use crate::store::{SqliteStore, StoreRef};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const EVENTS: &str = concat!(
        r#"{"eventid":"cowrie.session.connect","session":"a","src_ip":"10.0.0.1"}"#,
        "\n",
        r#"{"eventid":"cowrie.command.input","session":"a","input":"uname -a"}"#,
        "\n",
        r#"{"eventid":"cowrie.login.failed","session":"a","username":"root""#,
        "\n",
        r#"{"eventid":"cowrie.session.closed","session":"a","duration":3.5}"#,
        "\n",
    );

    fn setup(contents: &str) -> (TempDir, PathBuf, Arc<SqliteStore>) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cowrie.json");
        std::fs::write(&path, contents).unwrap();
        (dir, path, Arc::new(SqliteStore::open_in_memory().unwrap()))
    }

    fn processor(store: StoreRef, batch_size: usize) -> RecordProcessor {
        let status = StatusHandle::new("test");
        let committer = Arc::new(Committer::new(
            store,
            &BreakerConfig::default(),
            RetryConfig::default(),
            status.clone(),
        ));
        RecordProcessor::new(
            "cowrie.json",
            Arc::new(Validator::new(&ValidationConfig::default())),
            committer,
            &IngestConfig::default(),
            batch_size,
            status,
        )
    }

    fn read(path: &Path, final_input: bool) -> mpsc::Receiver<Result<ReadItem, ReaderError>> {
        spawn_read_task(
            path.to_path_buf(),
            ExtractionMode::Line,
            ReadOptions {
                start_offset: 0,
                final_input,
                max_record_bytes: 1024 * 1024,
                channel_capacity: 2,
            },
        )
    }

    #[tokio::test]
    async fn test_commits_events_and_dead_letters() {
        let (_dir, path, store) = setup(EVENTS);
        let outcome = processor(store.clone(), 2)
            .run(read(&path, true), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.stats.read, 4);
        assert_eq!(outcome.stats.inserted, 3);
        assert_eq!(outcome.stats.quarantined, 1);
        assert_eq!(outcome.resume_offset, Some(EVENTS.len() as u64));
        assert!(!outcome.stopped);

        let summary = store.session_summary("a").unwrap().unwrap();
        assert_eq!(summary.event_count, 3);
        assert_eq!(summary.command_count, 1);
        assert_eq!(store.dlq_entries().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_follows_commits() {
        let (_dir, path, store) = setup(EVENTS);
        let mut manager = CheckpointManager::new(store.clone(), "cowrie.json", path.clone());
        processor(store.clone(), 3)
            .run(read(&path, false), Some(&mut manager), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(manager.cursor(), EVENTS.len() as u64);
        assert_eq!(
            crate::store::EventStore::load_checkpoint(store.as_ref(), "cowrie.json")
                .unwrap()
                .unwrap()
                .cursor,
            EVENTS.len() as u64
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_before_reading() {
        let (_dir, path, store) = setup(EVENTS);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let outcome = processor(store.clone(), 10)
            .run(read(&path, true), None, &shutdown)
            .await
            .unwrap();
        assert!(outcome.stopped);
        assert_eq!(outcome.stats.read, 0);
        assert_eq!(store.raw_event_count(None).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_quarantine_limit_aborts_run() {
        let (_dir, path, store) = setup("not json\nstill not json\n");
        let status = StatusHandle::new("test");
        let committer = Arc::new(Committer::new(
            store.clone(),
            &BreakerConfig::default(),
            RetryConfig::default(),
            status.clone(),
        ));
        let ingest = IngestConfig {
            max_quarantined: 1,
            ..IngestConfig::default()
        };
        let err = RecordProcessor::new(
            "cowrie.json",
            Arc::new(Validator::new(&ValidationConfig::default())),
            committer,
            &ingest,
            10,
            status,
        )
        .run(read(&path, true), None, &CancellationToken::new())
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::MaxQuarantined { count: 2 }));
    }
}
