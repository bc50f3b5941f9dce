//! Ingestion drivers and the pieces they share.
//!
//! Both loaders run the same per-record path (validate, quarantine, batch)
//! through a [`RecordProcessor`] and commit through one shared
//! [`Committer`]. They differ in how sources are chosen and whether a
//! checkpoint is kept:
//!
//! - [`BulkLoader`]: many complete sources, read from the start, in parallel.
//! - [`DeltaLoader`]: one growing source, resumed from its checkpoint.

pub mod batch;
pub mod bulk;
pub mod committer;
pub mod delta;
pub mod phase;
pub mod processor;

pub use batch::{AdaptiveBatchSizer, Batch};
pub use bulk::BulkLoader;
pub use committer::{CommitReport, Committer};
pub use delta::{DeltaLoader, DeltaOptions};
pub use phase::Phase;
pub use processor::{RecordProcessor, RunOutcome};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dlq::DeadLetterQueue;
use crate::error::{PipelineError, TaskJoinSnafu};
use crate::source::ReadOptions;
use crate::status::StatusHandle;
use crate::store::{SourceLock, StoreRef, lock_owner};
use crate::validate::Validator;

/// Counts reported by a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Raw records extracted from the source.
    pub read: u64,
    /// Raw events newly stored.
    pub inserted: u64,
    /// Events already stored by an earlier run.
    pub duplicates: u64,
    /// Records routed to the dead letter queue.
    pub quarantined: u64,
}

impl Stats {
    pub fn merge(&mut self, other: &Stats) {
        self.read += other.read;
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.quarantined += other.quarantined;
    }
}

/// Name under which a source's checkpoint, lock and dead letters are kept.
///
/// Canonical when the path resolves, so `./cowrie.json` and an absolute
/// path to the same file share one checkpoint.
pub fn source_name(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

/// Everything a loader needs, built once per process.
#[derive(Clone)]
pub struct LoaderContext {
    pub store: StoreRef,
    pub config: Arc<Config>,
    pub validator: Arc<Validator>,
    pub committer: Arc<Committer>,
    pub status: StatusHandle,
    pub shutdown: CancellationToken,
    /// Owner id written into source locks.
    pub owner: String,
}

impl LoaderContext {
    pub fn new(store: StoreRef, config: Config, status: StatusHandle, shutdown: CancellationToken) -> Self {
        let committer = Arc::new(Committer::new(
            store.clone(),
            &config.breaker,
            config.retry.clone(),
            status.clone(),
        ));
        Self {
            validator: Arc::new(Validator::new(&config.validation)),
            committer,
            store,
            config: Arc::new(config),
            status,
            shutdown,
            owner: lock_owner(),
        }
    }

    /// Take the named lock for `source_name`; fails if another owner holds it.
    pub async fn lock_source(&self, source_name: &str) -> Result<Arc<SourceLock>, PipelineError> {
        let store = self.store.clone();
        let name = source_name.to_string();
        let owner = self.owner.clone();
        let ttl = Duration::from_secs(self.config.delta.lock_ttl_secs);
        let lock = tokio::task::spawn_blocking(move || SourceLock::acquire(store, &name, &owner, ttl))
            .await
            .context(TaskJoinSnafu)??;
        Ok(Arc::new(lock))
    }

    /// Dead letter queue that commits through this context's breaker.
    pub fn dead_letter_queue(&self) -> DeadLetterQueue {
        DeadLetterQueue::new(
            self.committer.clone(),
            self.validator.clone(),
            self.config.dlq.max_retries,
        )
    }

    pub fn processor(&self, source_name: &str, batch_size: usize) -> RecordProcessor {
        RecordProcessor::new(
            source_name,
            self.validator.clone(),
            self.committer.clone(),
            &self.config.ingest,
            batch_size,
            self.status.clone(),
        )
    }

    pub fn read_options(&self, start_offset: u64, final_input: bool) -> ReadOptions {
        ReadOptions {
            start_offset,
            final_input,
            max_record_bytes: self.config.ingest.max_record_bytes,
            channel_capacity: self.config.ingest.channel_capacity,
        }
    }
}
