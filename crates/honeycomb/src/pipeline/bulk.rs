//! Bulk loading: backfill complete historical sources.
//!
//! Sources are expanded from the CLI arguments and read concurrently (up to
//! `ingest.max_concurrent_sources`), each from its first byte with end of
//! file treated as final. Rerunning over a loaded source inserts nothing:
//! dedupe keys block the raw rows and summaries are recomputed.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use futures::stream;
use snafu::prelude::*;
use tracing::{error, info};

use crate::error::{PipelineError, ReaderError, TaskJoinSnafu};
use crate::source::{detect_format, expand_sources, spawn_read_task};

use super::{LoaderContext, Stats, source_name};

pub struct BulkLoader {
    ctx: LoaderContext,
}

impl BulkLoader {
    pub fn new(ctx: LoaderContext) -> Self {
        Self { ctx }
    }

    /// Load every source matched by `sources`.
    ///
    /// A failing source does not stop the others; once all have finished
    /// the first failure is returned, wrapped with the failure count.
    pub async fn load(&self, sources: &[PathBuf], batch_size: usize) -> Result<Stats, PipelineError> {
        let inputs = sources.to_vec();
        let paths = tokio::task::spawn_blocking(move || expand_sources(&inputs))
            .await
            .context(TaskJoinSnafu)??;
        let total = paths.len();
        let concurrency = self.ctx.config.ingest.max_concurrent_sources.max(1);
        info!(sources = total, batch_size, concurrency, "Starting bulk load");

        let results: Vec<(PathBuf, Result<Stats, PipelineError>)> = stream::iter(paths)
            .map(|path| async move {
                let result = self.load_source(&path, batch_size).await;
                (path, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut stats = Stats::default();
        let mut failures = Vec::new();
        for (path, result) in results {
            match result {
                Ok(source_stats) => stats.merge(&source_stats),
                Err(e) => {
                    error!(source = %path.display(), error = %e, "Source failed");
                    failures.push(e);
                }
            }
        }

        info!(
            read = stats.read,
            inserted = stats.inserted,
            duplicates = stats.duplicates,
            quarantined = stats.quarantined,
            failed = failures.len(),
            "Bulk load finished"
        );

        let failed = failures.len();
        match failures.into_iter().next() {
            Some(first) => Err(PipelineError::SourcesFailed {
                failed,
                total,
                source: Box::new(first),
            }),
            None => Ok(stats),
        }
    }

    async fn load_source(&self, path: &Path, batch_size: usize) -> Result<Stats, PipelineError> {
        let name = source_name(path);
        let lock = self.ctx.lock_source(&name).await?;

        let detection = detect_format(path.to_path_buf(), self.ctx.config.ingest.sample_lines).await?;
        let mode = detection
            .format
            .extraction_mode()
            .ok_or_else(|| ReaderError::UnknownFormat {
                path: path.to_path_buf(),
            })?;
        info!(source = %name, format = detection.format.as_str(), "Loading source");

        let records = spawn_read_task(path.to_path_buf(), mode, self.ctx.read_options(0, true));
        let outcome = self
            .ctx
            .processor(&name, batch_size)
            .with_lock(lock)
            .run(records, None, &self.ctx.shutdown)
            .await?;

        info!(
            source = %name,
            read = outcome.stats.read,
            inserted = outcome.stats.inserted,
            duplicates = outcome.stats.duplicates,
            quarantined = outcome.stats.quarantined,
            "Source loaded"
        );
        Ok(outcome.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::status::StatusHandle;
    use crate::store::SqliteStore;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn loader(store: Arc<SqliteStore>) -> BulkLoader {
        BulkLoader::new(LoaderContext::new(
            store,
            Config::default(),
            StatusHandle::new("bulk"),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_rerun_inserts_nothing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("cowrie.json.1"),
            "{\"eventid\":\"cowrie.session.connect\",\"session\":\"s1\"}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("cowrie.json.2"),
            "{\"eventid\":\"cowrie.session.connect\",\"session\":\"s2\"}\n",
        )
        .unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let sources = vec![dir.path().join("cowrie.json.*")];

        let first = loader(store.clone()).load(&sources, 100).await.unwrap();
        assert_eq!(first.read, 2);
        assert_eq!(first.inserted, 2);

        let second = loader(store.clone()).load(&sources, 100).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(store.raw_event_count(None).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bad_source_does_not_stop_others() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("cowrie.json");
        let bad = dir.path().join("auth.log");
        std::fs::write(&good, "{\"eventid\":\"cowrie.session.connect\",\"session\":\"s1\"}\n").unwrap();
        std::fs::write(&bad, "May  1 12:00:00 sshd[1]: Accepted password\n").unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let err = loader(store.clone()).load(&[bad, good], 100).await.unwrap_err();
        assert!(matches!(err, PipelineError::SourcesFailed { failed: 1, total: 2, .. }));
        assert_eq!(store.raw_event_count(Some("s1")).unwrap(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_same_file_through_symlink_loads_once() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("cowrie.json");
        let link = dir.path().join("current.json");
        std::fs::write(&target, "{\"eventid\":\"cowrie.session.connect\",\"session\":\"s1\"}\n").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let stats = loader(store.clone()).load(&[target, link], 100).await.unwrap();
        assert_eq!(stats.read, 1);
        assert_eq!(stats.inserted, 1);
    }
}
