//! Store wrappers for exercising failure handling in tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::checkpoint::Checkpoint;
use crate::dlq::{DeadLetter, DlqEntry, Resolution};
use crate::error::StoreError;
use crate::event::ValidatedEvent;

use super::{CommitOutcome, EventStore, SqliteStore};

/// Fails the first `failures` commits with the given transience.
pub struct FailingStore {
    pub inner: SqliteStore,
    pub failures: u32,
    pub transient: bool,
    pub calls: AtomicU32,
}

impl FailingStore {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn failing(failures: u32, transient: bool) -> Arc<FailingStore> {
    Arc::new(FailingStore {
        inner: SqliteStore::open_in_memory().unwrap(),
        failures,
        transient,
        calls: AtomicU32::new(0),
    })
}

impl EventStore for FailingStore {
    fn commit_batch(
        &self,
        source_name: &str,
        events: &[ValidatedEvent],
        dead_letters: &[DeadLetter],
    ) -> Result<CommitOutcome, StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(StoreError::Unavailable {
                message: format!("injected failure {call}"),
                transient: self.transient,
            });
        }
        self.inner.commit_batch(source_name, events, dead_letters)
    }
    fn load_checkpoint(&self, s: &str) -> Result<Option<Checkpoint>, StoreError> {
        self.inner.load_checkpoint(s)
    }
    fn advance_checkpoint(&self, e: Option<u64>, n: &Checkpoint) -> Result<bool, StoreError> {
        self.inner.advance_checkpoint(e, n)
    }
    fn reset_checkpoint(&self, s: &str) -> Result<(), StoreError> {
        self.inner.reset_checkpoint(s)
    }
    fn acquire_lock(&self, s: &str, o: &str, t: Duration) -> Result<(), StoreError> {
        self.inner.acquire_lock(s, o, t)
    }
    fn release_lock(&self, s: &str, o: &str) -> Result<(), StoreError> {
        self.inner.release_lock(s, o)
    }
    fn list_pending(&self, m: u32) -> Result<Vec<DlqEntry>, StoreError> {
        self.inner.list_pending(m)
    }
    fn list_exhausted(&self, m: u32) -> Result<Vec<DlqEntry>, StoreError> {
        self.inner.list_exhausted(m)
    }
    fn bump_retry(&self, id: i64) -> Result<u32, StoreError> {
        self.inner.bump_retry(id)
    }
    fn resolve(&self, id: i64, r: Resolution) -> Result<bool, StoreError> {
        self.inner.resolve(id, r)
    }
}
