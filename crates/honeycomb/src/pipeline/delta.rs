//! Delta loading: resumable ingestion of one growing source.
//!
//! Each pass reads from the stored checkpoint cursor to the last complete
//! record and advances the cursor after every committed batch. An
//! unterminated final line is left for the next pass. A crash between a
//! commit and its checkpoint save replays that batch, which dedupe keys and
//! idempotent summaries absorb.
//!
//! With `--follow` passes repeat on the shared polling loop until shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use snafu::prelude::*;
use tracing::{debug, info};

use honeycomb_core::{IterationResult, PollingProcessor, run_polling_loop};

use crate::checkpoint::CheckpointManager;
use crate::error::{PipelineError, ReadSourceSnafu, ReaderError, TaskJoinSnafu};
use crate::source::{ExtractionMode, detect_format, spawn_read_task};
use crate::store::SourceLock;

use super::{LoaderContext, Phase, RunOutcome, Stats, source_name};

#[derive(Debug, Clone, Copy)]
pub struct DeltaOptions {
    pub batch_size: usize,
    /// Discard the stored checkpoint and start from the first byte.
    pub reset_checkpoint: bool,
}

pub struct DeltaLoader {
    ctx: LoaderContext,
}

impl DeltaLoader {
    pub fn new(ctx: LoaderContext) -> Self {
        Self { ctx }
    }

    /// Ingest everything appended to `source` since its checkpoint.
    pub async fn load_incremental(
        &self,
        source: &Path,
        options: &DeltaOptions,
    ) -> Result<Stats, PipelineError> {
        let mut session = DeltaSession::open(&self.ctx, source, options).await?;
        let outcome = session.pass(&self.ctx).await?;
        info!(
            source = %session.source_name,
            read = outcome.stats.read,
            inserted = outcome.stats.inserted,
            duplicates = outcome.stats.duplicates,
            quarantined = outcome.stats.quarantined,
            cursor = session.checkpoint.cursor(),
            "Delta load finished"
        );
        Ok(outcome.stats)
    }

    /// Keep ingesting `source` as it grows until shutdown.
    pub async fn follow(&self, source: &Path, options: &DeltaOptions) -> Result<Stats, PipelineError> {
        let session = DeltaSession::open(&self.ctx, source, options).await?;
        let name = session.source_name.clone();
        let mut follower = Follower {
            ctx: self.ctx.clone(),
            session,
            last_len: None,
            stats: Stats::default(),
        };

        let poll_interval = Duration::from_secs(self.ctx.config.delta.poll_interval_secs);
        info!(
            source = %name,
            poll_interval_secs = poll_interval.as_secs(),
            "Following source"
        );
        run_polling_loop(
            &mut follower,
            poll_interval,
            self.ctx.config.delta.poll_jitter_secs,
            self.ctx.shutdown.clone(),
            &name,
        )
        .await?;

        info!(
            source = %name,
            read = follower.stats.read,
            inserted = follower.stats.inserted,
            quarantined = follower.stats.quarantined,
            cursor = follower.session.checkpoint.cursor(),
            "Stopped following source"
        );
        Ok(follower.stats)
    }
}

/// One locked source with its checkpoint and detected format.
struct DeltaSession {
    source_name: String,
    path: PathBuf,
    lock: Arc<SourceLock>,
    checkpoint: CheckpointManager,
    mode: ExtractionMode,
    batch_size: usize,
}

impl DeltaSession {
    async fn open(
        ctx: &LoaderContext,
        source: &Path,
        options: &DeltaOptions,
    ) -> Result<Self, PipelineError> {
        let source_name = source_name(source);
        let lock = ctx.lock_source(&source_name).await?;

        let mut checkpoint = CheckpointManager::new(ctx.store.clone(), source_name.clone(), source);
        if options.reset_checkpoint {
            checkpoint.reset().await?;
        } else {
            checkpoint.load().await?;
        }
        if let Some(current) = checkpoint.current() {
            ctx.status.set_checkpoint(current);
        }

        let detection = detect_format(source.to_path_buf(), ctx.config.ingest.sample_lines).await?;
        let mode = detection
            .format
            .extraction_mode()
            .ok_or_else(|| ReaderError::UnknownFormat {
                path: source.to_path_buf(),
            })?;
        info!(
            source = %source_name,
            format = detection.format.as_str(),
            cursor = checkpoint.cursor(),
            "Opened delta source"
        );

        Ok(Self {
            source_name,
            path: source.to_path_buf(),
            lock,
            checkpoint,
            mode,
            batch_size: options.batch_size,
        })
    }

    /// Read from the cursor to the last complete record.
    async fn pass(&mut self, ctx: &LoaderContext) -> Result<RunOutcome, PipelineError> {
        let start = self.checkpoint.cursor();
        debug!(source = %self.source_name, cursor = start, "Starting delta pass");
        let records = spawn_read_task(self.path.clone(), self.mode, ctx.read_options(start, false));
        let outcome = ctx
            .processor(&self.source_name, self.batch_size)
            .with_lock(self.lock.clone())
            .run(records, Some(&mut self.checkpoint), &ctx.shutdown)
            .await?;
        ctx.status.set_phase(Phase::Idle);
        Ok(outcome)
    }
}

/// Drives repeated passes for follow mode.
struct Follower {
    ctx: LoaderContext,
    session: DeltaSession,
    /// On-disk length seen at the last pass.
    last_len: Option<u64>,
    stats: Stats,
}

#[async_trait]
impl PollingProcessor for Follower {
    type State = u64;
    type Error = PipelineError;

    async fn prepare(&mut self, cold_start: bool) -> Result<Option<u64>, PipelineError> {
        let path = self.session.path.clone();
        let lock = self.session.lock.clone();
        let len = tokio::task::spawn_blocking(move || {
            lock.refresh()?;
            let metadata = std::fs::metadata(&path).context(ReadSourceSnafu { path: &path })?;
            Ok::<_, PipelineError>(metadata.len())
        })
        .await
        .context(TaskJoinSnafu)??;

        if !cold_start && self.last_len == Some(len) {
            debug!(source = %self.session.source_name, len, "Source unchanged");
            return Ok(None);
        }
        Ok(Some(len))
    }

    async fn process(&mut self, len: u64) -> Result<IterationResult, PipelineError> {
        let outcome = self.session.pass(&self.ctx).await?;
        self.last_len = Some(len);
        self.stats.merge(&outcome.stats);

        if outcome.stopped {
            return Ok(IterationResult::Shutdown);
        }
        if outcome.stats.read == 0 {
            return Ok(IterationResult::NoItems);
        }
        Ok(IterationResult::ProcessedItems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::status::StatusHandle;
    use crate::store::{EventStore, SqliteStore};
    use std::io::Write;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const CONNECT: &str = "{\"eventid\":\"cowrie.session.connect\",\"session\":\"s1\",\"src_ip\":\"10.0.0.1\"}\n";
    const COMMAND: &str = "{\"eventid\":\"cowrie.command.input\",\"session\":\"s1\",\"input\":\"id\"}\n";

    fn loader(store: Arc<SqliteStore>) -> DeltaLoader {
        DeltaLoader::new(LoaderContext::new(
            store,
            Config::default(),
            StatusHandle::new("delta"),
            CancellationToken::new(),
        ))
    }

    fn options(reset_checkpoint: bool) -> DeltaOptions {
        DeltaOptions {
            batch_size: 10,
            reset_checkpoint,
        }
    }

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new().append(true).create(true).open(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_resumes_from_checkpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cowrie.json");
        append(&path, CONNECT);
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let first = loader(store.clone()).load_incremental(&path, &options(false)).await.unwrap();
        assert_eq!(first.read, 1);

        append(&path, COMMAND);
        let second = loader(store.clone()).load_incremental(&path, &options(false)).await.unwrap();
        assert_eq!(second.read, 1);
        assert_eq!(second.inserted, 1);

        let checkpoint = store.load_checkpoint(&source_name(&path)).unwrap().unwrap();
        assert_eq!(checkpoint.cursor, (CONNECT.len() + COMMAND.len()) as u64);
        assert_eq!(store.session_summary("s1").unwrap().unwrap().event_count, 2);
    }

    #[tokio::test]
    async fn test_unterminated_tail_waits_for_next_run() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cowrie.json");
        append(&path, CONNECT);
        append(&path, "{\"eventid\":\"cowrie.command.input\",\"sess");
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let first = loader(store.clone()).load_incremental(&path, &options(false)).await.unwrap();
        assert_eq!(first.read, 1);
        assert_eq!(first.quarantined, 0);

        append(&path, "ion\":\"s1\",\"input\":\"id\"}\n");
        let second = loader(store.clone()).load_incremental(&path, &options(false)).await.unwrap();
        assert_eq!(second.inserted, 1);
        assert!(store.dlq_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_replays_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cowrie.json");
        append(&path, CONNECT);
        append(&path, COMMAND);
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        loader(store.clone()).load_incremental(&path, &options(false)).await.unwrap();
        let replay = loader(store.clone()).load_incremental(&path, &options(true)).await.unwrap();
        assert_eq!(replay.read, 2);
        assert_eq!(replay.inserted, 0);
        assert_eq!(replay.duplicates, 2);
        assert_eq!(store.session_summary("s1").unwrap().unwrap().event_count, 2);
    }

    #[tokio::test]
    async fn test_replaced_source_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cowrie.json");
        append(&path, CONNECT);
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        loader(store.clone()).load_incremental(&path, &options(false)).await.unwrap();

        std::fs::write(&path, COMMAND.replace("s1", "s2")).unwrap();
        let err = loader(store.clone())
            .load_incremental(&path, &options(false))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Reader {
                source: ReaderError::SourceRotated { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_lock_held_by_other_owner() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cowrie.json");
        append(&path, CONNECT);
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let _held = SourceLock::acquire(store.clone(), &source_name(&path), "someone-else", Duration::from_secs(300))
            .unwrap();

        let err = loader(store.clone())
            .load_incremental(&path, &options(false))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Store { .. }));
        assert_eq!(store.raw_event_count(None).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_follow_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cowrie.json");
        append(&path, CONNECT);
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let shutdown = CancellationToken::new();
        let mut config = Config::default();
        config.delta.poll_interval_secs = 3600;
        let loader = DeltaLoader::new(LoaderContext::new(
            store.clone(),
            config,
            StatusHandle::new("delta"),
            shutdown.clone(),
        ));

        let stopper = shutdown.clone();
        let stop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            stopper.cancel();
        });
        let stats = loader.follow(&path, &options(false)).await.unwrap();
        stop.await.unwrap();

        assert_eq!(stats.inserted, 1);
        let checkpoint = store.load_checkpoint(&source_name(&path)).unwrap().unwrap();
        assert_eq!(checkpoint.cursor, CONNECT.len() as u64);
    }
}
