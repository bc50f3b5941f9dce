//! Checkpoint management for delta loading.
//!
//! The manager wraps the storage collaborator's compare-and-set so that a
//! cursor only ever moves forward, and only after the batch it covers has
//! been committed. It also fingerprints the head of the source so a rotated
//! or replaced file is not resumed at a stale offset.

pub mod state;

pub use state::{Checkpoint, HEAD_BYTES, head_hash, head_len_for};

use std::path::{Path, PathBuf};

use snafu::prelude::*;
use tracing::{debug, info};

use honeycomb_core::emit;
use honeycomb_core::metrics::events::CheckpointSaved;

use crate::error::{CheckpointConflictSnafu, PipelineError, SourceRotatedSnafu, TaskJoinSnafu};
use crate::source::head_bytes;
use crate::store::StoreRef;

/// Loads, verifies and advances the checkpoint of one source.
pub struct CheckpointManager {
    store: StoreRef,
    source_name: String,
    path: PathBuf,
    current: Option<Checkpoint>,
}

impl CheckpointManager {
    pub fn new(store: StoreRef, source_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            source_name: source_name.into(),
            path: path.into(),
            current: None,
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Cursor to resume from; zero on a cold start.
    pub fn cursor(&self) -> u64 {
        self.current.as_ref().map_or(0, |c| c.cursor)
    }

    pub fn current(&self) -> Option<&Checkpoint> {
        self.current.as_ref()
    }

    /// Load the stored checkpoint and check that the source still matches it.
    ///
    /// Returns `Ok(true)` if a checkpoint was restored.
    pub async fn load(&mut self) -> Result<bool, PipelineError> {
        let store = self.store.clone();
        let name = self.source_name.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load_checkpoint(&name))
            .await
            .context(TaskJoinSnafu)??;

        let Some(checkpoint) = loaded else {
            debug!(source = %self.source_name, "No checkpoint found, starting from the beginning");
            self.current = None;
            return Ok(false);
        };

        verify_head(&self.path, &checkpoint).await?;
        info!(
            source = %self.source_name,
            cursor = checkpoint.cursor,
            updated_at = %checkpoint.updated_at,
            "Restored checkpoint"
        );
        self.current = Some(checkpoint);
        Ok(true)
    }

    /// Forget the stored position so the next read starts from zero.
    pub async fn reset(&mut self) -> Result<(), PipelineError> {
        let store = self.store.clone();
        let name = self.source_name.clone();
        tokio::task::spawn_blocking(move || store.reset_checkpoint(&name))
            .await
            .context(TaskJoinSnafu)??;
        info!(source = %self.source_name, "Checkpoint reset");
        self.current = None;
        Ok(())
    }

    /// Persist `cursor` once the batch ending there has been committed.
    ///
    /// A cursor at or behind the current one is a no-op.
    pub async fn advance(&mut self, cursor: u64) -> Result<(), PipelineError> {
        let expected = self.current.as_ref().map(|c| c.cursor);
        if expected.is_some_and(|current| cursor <= current) {
            return Ok(());
        }

        let path = self.path.clone();
        let head_len = head_len_for(cursor);
        let head = tokio::task::spawn_blocking(move || head_bytes(&path, head_len))
            .await
            .context(TaskJoinSnafu)??;
        let next = Checkpoint::new(self.source_name.clone(), cursor, &head);

        let store = self.store.clone();
        let to_save = next.clone();
        let applied = tokio::task::spawn_blocking(move || store.advance_checkpoint(expected, &to_save))
            .await
            .context(TaskJoinSnafu)??;
        ensure!(
            applied,
            CheckpointConflictSnafu {
                source_name: self.source_name.clone(),
            }
        );

        debug!(source = %self.source_name, cursor, "Checkpoint saved");
        emit!(CheckpointSaved {
            target: self.source_name.clone(),
        });
        self.current = Some(next);
        Ok(())
    }
}

async fn verify_head(path: &Path, checkpoint: &Checkpoint) -> Result<(), PipelineError> {
    let owned = path.to_path_buf();
    let head_len = checkpoint.head_len;
    let head = tokio::task::spawn_blocking(move || head_bytes(&owned, head_len))
        .await
        .context(TaskJoinSnafu)??;
    ensure!(
        checkpoint.matches_head(&head),
        SourceRotatedSnafu { path }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReaderError;
    use crate::store::{EventStore, SqliteStore};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(contents: &str) -> (TempDir, PathBuf, StoreRef) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cowrie.json");
        std::fs::write(&path, contents).unwrap();
        let store: StoreRef = Arc::new(SqliteStore::open_in_memory().unwrap());
        (dir, path, store)
    }

    #[tokio::test]
    async fn test_cold_start() {
        let (_dir, path, store) = setup("{}\n");
        let mut manager = CheckpointManager::new(store, "cowrie", path);
        assert!(!manager.load().await.unwrap());
        assert_eq!(manager.cursor(), 0);
    }

    #[tokio::test]
    async fn test_advance_and_restore() {
        let (_dir, path, store) = setup("{\"a\":1}\n{\"b\":2}\n");
        let mut manager = CheckpointManager::new(store.clone(), "cowrie", path.clone());
        manager.load().await.unwrap();
        manager.advance(8).await.unwrap();
        manager.advance(16).await.unwrap();
        // Behind the current cursor: ignored.
        manager.advance(8).await.unwrap();

        let mut restored = CheckpointManager::new(store.clone(), "cowrie", path);
        assert!(restored.load().await.unwrap());
        assert_eq!(restored.cursor(), 16);
        assert_eq!(store.load_checkpoint("cowrie").unwrap().unwrap().head_len, 16);
    }

    #[tokio::test]
    async fn test_rotated_source_is_detected() {
        let (_dir, path, store) = setup("{\"a\":1}\n{\"b\":2}\n");
        let mut manager = CheckpointManager::new(store.clone(), "cowrie", path.clone());
        manager.advance(16).await.unwrap();

        std::fs::write(&path, "{\"c\":3}\n{\"d\":4}\n{\"e\":5}\n").unwrap();
        let mut restored = CheckpointManager::new(store, "cowrie", path);
        let err = restored.load().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Reader {
                source: ReaderError::SourceRotated { .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writer_is_a_conflict() {
        let (_dir, path, store) = setup("{\"a\":1}\n{\"b\":2}\n");
        let mut first = CheckpointManager::new(store.clone(), "cowrie", path.clone());
        let mut second = CheckpointManager::new(store, "cowrie", path);
        first.advance(8).await.unwrap();
        let err = second.advance(16).await.unwrap_err();
        assert!(err.to_string().contains("another writer"));
    }

    #[tokio::test]
    async fn test_reset_starts_over() {
        let (_dir, path, store) = setup("{\"a\":1}\n");
        let mut manager = CheckpointManager::new(store, "cowrie", path);
        manager.advance(8).await.unwrap();
        manager.reset().await.unwrap();
        assert_eq!(manager.cursor(), 0);
        assert!(!manager.load().await.unwrap());
    }
}
