//! Storage collaborator backed by SQLite.
//!
//! The pipeline talks to storage through the [`EventStore`] trait: batch
//! commit (raw events, session upserts and dead letters in one
//! transaction), checkpoint compare-and-set, dead letter bookkeeping and
//! named source locks. [`SqliteStore`] is the production implementation.
//!
//! All methods are blocking; async callers run them on the blocking pool.

pub mod schema;
#[cfg(test)]
pub(crate) mod testing;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::aggregate;
use crate::checkpoint::Checkpoint;
use crate::dlq::{DeadLetter, DlqEntry, ReasonCode, Resolution};
use crate::error::{LockHeldSnafu, OpenSnafu, SqliteSnafu, StoreError};
use crate::event::ValidatedEvent;
use crate::validate::{format_timestamp, parse_timestamp};

/// Counts from one committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Raw events newly stored.
    pub inserted: u64,
    /// Events whose dedupe key was already present.
    pub duplicates: u64,
    /// Dead letters stored for the first time.
    pub quarantined_new: u64,
    /// Dead letters that matched an existing entry.
    pub quarantined_repeat: u64,
}

/// Storage operations the pipeline depends on.
pub trait EventStore: Send + Sync {
    /// Durably store a batch in one transaction.
    ///
    /// Either everything in the batch is committed or nothing is.
    fn commit_batch(
        &self,
        source_name: &str,
        events: &[ValidatedEvent],
        dead_letters: &[DeadLetter],
    ) -> Result<CommitOutcome, StoreError>;

    fn load_checkpoint(&self, source_name: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Replace the checkpoint if it still has cursor `expected` and the new
    /// cursor does not move backwards. Returns false if nothing changed.
    fn advance_checkpoint(
        &self,
        expected: Option<u64>,
        next: &Checkpoint,
    ) -> Result<bool, StoreError>;

    fn reset_checkpoint(&self, source_name: &str) -> Result<(), StoreError>;

    /// Take or refresh the named lock for `source_name`.
    fn acquire_lock(&self, source_name: &str, owner: &str, ttl: Duration)
    -> Result<(), StoreError>;

    fn release_lock(&self, source_name: &str, owner: &str) -> Result<(), StoreError>;

    /// Unresolved entries with `retry_count <= max_retries`, oldest first.
    fn list_pending(&self, max_retries: u32) -> Result<Vec<DlqEntry>, StoreError>;

    /// Unresolved entries with `retry_count > max_retries`.
    fn list_exhausted(&self, max_retries: u32) -> Result<Vec<DlqEntry>, StoreError>;

    /// Increment the retry count of an unresolved entry; returns the new count.
    fn bump_retry(&self, id: i64) -> Result<u32, StoreError>;

    /// Set the terminal resolution. Returns false if already resolved.
    fn resolve(&self, id: i64, resolution: Resolution) -> Result<bool, StoreError>;
}

/// Shared handle used throughout the pipeline.
pub type StoreRef = Arc<dyn EventStore>;

const RECORD_DEAD_LETTER: &str = r#"
INSERT INTO dlq_entries (
    content_hash, raw_content, reason_code, error_message, source_name, first_seen, retry_count
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
ON CONFLICT(content_hash) DO UPDATE SET retry_count = retry_count + 1
    WHERE resolution IS NULL
RETURNING retry_count
"#;

const DLQ_COLUMNS: &str = "id, content_hash, raw_content, reason_code, error_message, \
    source_name, first_seen, retry_count, resolved_at, resolution";

/// Session summary row as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    pub event_count: u64,
    pub command_count: u64,
    pub login_attempts: u64,
    pub protocol: Option<String>,
    pub source_ip: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub duration_seconds: Option<f64>,
    pub match_type: Option<String>,
    pub enrichment: Option<String>,
}

/// SQLite implementation of [`EventStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path).context(OpenSnafu { path })?;
        conn.busy_timeout(busy_timeout)
            .context(OpenSnafu { path })?;
        // WAL lets readers (status, dlq list) run next to the committer.
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context(OpenSnafu { path })?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened database");
        Self::bootstrap(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().context(OpenSnafu {
            path: ":memory:",
        })?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        for statement in schema::BOOTSTRAP {
            conn.execute_batch(statement).context(SqliteSnafu {
                operation: "create schema",
            })?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    pub fn session_summary(&self, session_id: &str) -> Result<Option<SessionSummary>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT session_id, first_seen, last_seen, event_count, command_count, login_attempts,
                    protocol, source_ip, username, password, duration_seconds, match_type, enrichment
             FROM session_summaries WHERE session_id = ?1",
            [session_id],
            summary_from_row,
        )
        .optional()
        .context(SqliteSnafu {
            operation: "read session summary",
        })
    }

    /// Every summary, ordered by session id.
    pub fn session_summaries(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT session_id, first_seen, last_seen, event_count, command_count, login_attempts,
                        protocol, source_ip, username, password, duration_seconds, match_type, enrichment
                 FROM session_summaries ORDER BY session_id",
            )
            .context(SqliteSnafu {
                operation: "read session summaries",
            })?;
        let rows = stmt
            .query_map([], summary_from_row)
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .context(SqliteSnafu {
                operation: "read session summaries",
            })?;
        Ok(rows)
    }

    /// Number of raw events, optionally for one session.
    pub fn raw_event_count(&self, session_id: Option<&str>) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = match session_id {
            Some(id) => conn.query_row(
                "SELECT COUNT(*) FROM raw_events WHERE session_id = ?1",
                [id],
                |row| row.get(0),
            ),
            None => conn.query_row("SELECT COUNT(*) FROM raw_events", [], |row| row.get(0)),
        }
        .context(SqliteSnafu {
            operation: "count raw events",
        })?;
        Ok(from_sql_int(count))
    }

    /// All dead letter entries, resolved or not, by id.
    pub fn dlq_entries(&self) -> Result<Vec<DlqEntry>, StoreError> {
        let conn = self.lock()?;
        query_dlq(&conn, &format!("SELECT {DLQ_COLUMNS} FROM dlq_entries ORDER BY id"), params![])
    }
}

impl EventStore for SqliteStore {
    fn commit_batch(
        &self,
        source_name: &str,
        events: &[ValidatedEvent],
        dead_letters: &[DeadLetter],
    ) -> Result<CommitOutcome, StoreError> {
        let mut conn = self.lock()?;
        // Dropping the transaction without commit rolls it back.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context(SqliteSnafu { operation: "begin" })?;
        let now = format_timestamp(&Utc::now());
        let mut outcome = CommitOutcome::default();

        for event in events {
            let result = aggregate::apply(&tx, event, source_name, &now)?;
            if result.inserted {
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }

        for letter in dead_letters {
            let retry_count: Option<i64> = tx
                .query_row(
                    RECORD_DEAD_LETTER,
                    params![
                        letter.content_hash,
                        letter.raw_content,
                        letter.reason_code.as_str(),
                        letter.error_message,
                        letter.source_name,
                        now,
                    ],
                    |row| row.get(0),
                )
                .optional()
                .context(SqliteSnafu {
                    operation: "record dead letter",
                })?;
            match retry_count {
                Some(0) => outcome.quarantined_new += 1,
                _ => outcome.quarantined_repeat += 1,
            }
        }

        tx.commit().context(SqliteSnafu { operation: "commit" })?;
        Ok(outcome)
    }

    fn load_checkpoint(&self, source_name: &str) -> Result<Option<Checkpoint>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT source_name, cursor, head_len, head_hash, updated_at
                 FROM checkpoints WHERE source_name = ?1",
                [source_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context(SqliteSnafu {
                operation: "load checkpoint",
            })?;

        row.map(|(source_name, cursor, head_len, head_hash, updated_at)| {
            Ok(Checkpoint {
                source_name,
                cursor: from_sql_int(cursor),
                head_len: from_sql_int(head_len),
                head_hash,
                updated_at: decode_time("checkpoints", "updated_at", &updated_at)?,
            })
        })
        .transpose()
    }

    fn advance_checkpoint(
        &self,
        expected: Option<u64>,
        next: &Checkpoint,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let updated_at = format_timestamp(&next.updated_at);
        let changed = match expected {
            None => conn.execute(
                "INSERT INTO checkpoints (source_name, cursor, head_len, head_hash, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(source_name) DO NOTHING",
                params![
                    next.source_name,
                    to_sql_int(next.cursor),
                    to_sql_int(next.head_len),
                    next.head_hash,
                    updated_at,
                ],
            ),
            Some(current) => conn.execute(
                "UPDATE checkpoints
                 SET cursor = ?2, head_len = ?3, head_hash = ?4, updated_at = ?5
                 WHERE source_name = ?1 AND cursor = ?6 AND ?2 >= cursor",
                params![
                    next.source_name,
                    to_sql_int(next.cursor),
                    to_sql_int(next.head_len),
                    next.head_hash,
                    updated_at,
                    to_sql_int(current),
                ],
            ),
        }
        .context(SqliteSnafu {
            operation: "advance checkpoint",
        })?;
        Ok(changed == 1)
    }

    fn reset_checkpoint(&self, source_name: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM checkpoints WHERE source_name = ?1", [source_name])
            .context(SqliteSnafu {
                operation: "reset checkpoint",
            })?;
        Ok(())
    }

    fn acquire_lock(
        &self,
        source_name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let now = format_timestamp(&now);

        let changed = conn
            .execute(
                "INSERT INTO source_locks (source_name, owner, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(source_name) DO UPDATE SET
                     owner = excluded.owner,
                     acquired_at = excluded.acquired_at,
                     expires_at = excluded.expires_at
                 WHERE source_locks.owner = excluded.owner OR source_locks.expires_at <= ?3",
                params![source_name, owner, now, format_timestamp(&expires)],
            )
            .context(SqliteSnafu {
                operation: "acquire source lock",
            })?;
        if changed == 1 {
            return Ok(());
        }

        let holder: String = conn
            .query_row(
                "SELECT owner FROM source_locks WHERE source_name = ?1",
                [source_name],
                |row| row.get(0),
            )
            .optional()
            .context(SqliteSnafu {
                operation: "read source lock",
            })?
            .unwrap_or_default();
        LockHeldSnafu {
            source_name,
            owner: holder,
        }
        .fail()
    }

    fn release_lock(&self, source_name: &str, owner: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM source_locks WHERE source_name = ?1 AND owner = ?2",
            [source_name, owner],
        )
        .context(SqliteSnafu {
            operation: "release source lock",
        })?;
        Ok(())
    }

    fn list_pending(&self, max_retries: u32) -> Result<Vec<DlqEntry>, StoreError> {
        let conn = self.lock()?;
        query_dlq(
            &conn,
            &format!(
                "SELECT {DLQ_COLUMNS} FROM dlq_entries
                 WHERE resolution IS NULL AND retry_count <= ?1 ORDER BY id"
            ),
            params![max_retries],
        )
    }

    fn list_exhausted(&self, max_retries: u32) -> Result<Vec<DlqEntry>, StoreError> {
        let conn = self.lock()?;
        query_dlq(
            &conn,
            &format!(
                "SELECT {DLQ_COLUMNS} FROM dlq_entries
                 WHERE resolution IS NULL AND retry_count > ?1 ORDER BY id"
            ),
            params![max_retries],
        )
    }

    fn bump_retry(&self, id: i64) -> Result<u32, StoreError> {
        let conn = self.lock()?;
        let count: Option<i64> = conn
            .query_row(
                "UPDATE dlq_entries SET retry_count = retry_count + 1
                 WHERE id = ?1 AND resolution IS NULL RETURNING retry_count",
                [id],
                |row| row.get(0),
            )
            .optional()
            .context(SqliteSnafu {
                operation: "bump dead letter retry",
            })?;
        Ok(count.map_or(0, |c| u32::try_from(from_sql_int(c)).unwrap_or(u32::MAX)))
    }

    fn resolve(&self, id: i64, resolution: Resolution) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE dlq_entries SET resolution = ?2, resolved_at = ?3
                 WHERE id = ?1 AND resolution IS NULL",
                params![id, resolution.as_str(), format_timestamp(&Utc::now())],
            )
            .context(SqliteSnafu {
                operation: "resolve dead letter",
            })?;
        Ok(changed == 1)
    }
}

/// Held lock on a source, released on drop.
pub struct SourceLock {
    store: StoreRef,
    source_name: String,
    owner: String,
    ttl: Duration,
}

impl SourceLock {
    pub fn acquire(
        store: StoreRef,
        source_name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Self, StoreError> {
        store.acquire_lock(source_name, owner, ttl)?;
        debug!(source = %source_name, owner, "Acquired source lock");
        Ok(Self {
            store,
            source_name: source_name.to_string(),
            owner: owner.to_string(),
            ttl,
        })
    }

    /// Extend the lock for another ttl.
    pub fn refresh(&self) -> Result<(), StoreError> {
        self.store
            .acquire_lock(&self.source_name, &self.owner, self.ttl)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl Drop for SourceLock {
    fn drop(&mut self) {
        if let Err(e) = self.store.release_lock(&self.source_name, &self.owner) {
            warn!(source = %self.source_name, error = %e, "Failed to release source lock");
        }
    }
}

/// Lock owner id for this process.
pub fn lock_owner() -> String {
    format!("pid-{}-{:08x}", std::process::id(), rand::random::<u32>())
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<SessionSummary> {
    Ok(SessionSummary {
        session_id: row.get(0)?,
        first_seen: row.get(1)?,
        last_seen: row.get(2)?,
        event_count: from_sql_int(row.get(3)?),
        command_count: from_sql_int(row.get(4)?),
        login_attempts: from_sql_int(row.get(5)?),
        protocol: row.get(6)?,
        source_ip: row.get(7)?,
        username: row.get(8)?,
        password: row.get(9)?,
        duration_seconds: row.get(10)?,
        match_type: row.get(11)?,
        enrichment: row.get(12)?,
    })
}

/// Raw DLQ row before text columns are decoded.
type DlqRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    Option<String>,
);

fn query_dlq(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<DlqEntry>, StoreError> {
    let mut stmt = conn.prepare(sql).context(SqliteSnafu {
        operation: "read dead letters",
    })?;
    let rows: Vec<DlqRow> = stmt
        .query_map(params, |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
            ))
        })
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
        .context(SqliteSnafu {
            operation: "read dead letters",
        })?;
    rows.into_iter().map(decode_dlq_row).collect()
}

fn decode_dlq_row(row: DlqRow) -> Result<DlqEntry, StoreError> {
    let (id, content_hash, raw_content, reason, error_message, source_name, first_seen, retries, resolved_at, resolution) =
        row;
    let reason_code = reason
        .parse::<ReasonCode>()
        .map_err(|message| StoreError::Decode {
            table: "dlq_entries",
            column: "reason_code",
            message,
        })?;
    let resolution = resolution
        .map(|r| r.parse::<Resolution>())
        .transpose()
        .map_err(|message| StoreError::Decode {
            table: "dlq_entries",
            column: "resolution",
            message,
        })?;
    Ok(DlqEntry {
        id,
        content_hash,
        raw_content,
        reason_code,
        error_message,
        source_name,
        first_seen: decode_time("dlq_entries", "first_seen", &first_seen)?,
        retry_count: u32::try_from(retries).unwrap_or(u32::MAX),
        resolved_at: resolved_at
            .map(|ts| decode_time("dlq_entries", "resolved_at", &ts))
            .transpose()?,
        resolution,
    })
}

fn decode_time(
    table: &'static str,
    column: &'static str,
    value: &str,
) -> Result<DateTime<Utc>, StoreError> {
    parse_timestamp(value).ok_or_else(|| StoreError::Decode {
        table,
        column,
        message: format!("not a timestamp: '{value}'"),
    })
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::config::ValidationConfig;
    use crate::validate::{Rejection, Validator};
    use crate::error::ParseError;
    use tempfile::TempDir;

    fn events(lines: &[&str]) -> Vec<ValidatedEvent> {
        let validator = Validator::new(&ValidationConfig::default());
        lines
            .iter()
            .map(|line| validator.process(line.as_bytes(), "t").remove(0).unwrap())
            .collect()
    }

    fn bad(text: &str) -> DeadLetter {
        DeadLetter::from_rejection(
            Rejection::new(
                text,
                ParseError {
                    message: "EOF".into(),
                    line: 1,
                    column: text.len(),
                },
            ),
            "t",
        )
    }

    #[test]
    fn test_commit_batch_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let batch = events(&[
            r#"{"eventid":"cowrie.session.connect","session":"abc123","protocol":"ssh"}"#,
            r#"{"eventid":"cowrie.session.closed","session":"abc123","duration":42}"#,
        ]);
        let first = store.commit_batch("t", &batch, &[]).unwrap();
        assert_eq!(first.inserted, 2);
        let second = store.commit_batch("t", &batch, &[]).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);

        let summary = store.session_summary("abc123").unwrap().unwrap();
        assert_eq!(summary.event_count, 2);
        assert_eq!(summary.duration_seconds, Some(42.0));
        assert_eq!(store.raw_event_count(Some("abc123")).unwrap(), 2);
    }

    #[test]
    fn test_dead_letters_are_keyed_by_hash() {
        let store = SqliteStore::open_in_memory().unwrap();
        let outcome = store
            .commit_batch("t", &[], &[bad("{\"a\":"), bad("{\"a\":")])
            .unwrap();
        assert_eq!(outcome.quarantined_new, 1);
        assert_eq!(outcome.quarantined_repeat, 1);

        let entries = store.dlq_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_count, 1);
        assert_eq!(entries[0].reason_code, ReasonCode::ParseError);
    }

    #[test]
    fn test_retry_count_saturates() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.commit_batch("t", &[], &[bad("y")]).unwrap();
        let id = store.dlq_entries().unwrap()[0].id;
        store
            .lock()
            .unwrap()
            .execute(
                "UPDATE dlq_entries SET retry_count = ?1 WHERE id = ?2",
                params![i64::from(u32::MAX), id],
            )
            .unwrap();

        assert_eq!(store.bump_retry(id).unwrap(), u32::MAX);
        assert_eq!(store.dlq_entries().unwrap()[0].retry_count, u32::MAX);
    }

    #[test]
    fn test_resolved_entries_are_not_revived() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.commit_batch("t", &[], &[bad("x")]).unwrap();
        let id = store.dlq_entries().unwrap()[0].id;
        assert!(store.resolve(id, Resolution::Discarded).unwrap());
        assert!(!store.resolve(id, Resolution::Repaired).unwrap());

        store.commit_batch("t", &[], &[bad("x")]).unwrap();
        let entry = &store.dlq_entries().unwrap()[0];
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.resolution, Some(Resolution::Discarded));
        assert!(store.list_pending(3).unwrap().is_empty());
    }

    #[test]
    fn test_pending_and_exhausted_split_on_retry_cap() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.commit_batch("t", &[], &[bad("a"), bad("b")]).unwrap();
        let id = store.dlq_entries().unwrap()[0].id;
        assert_eq!(store.bump_retry(id).unwrap(), 1);
        assert_eq!(store.bump_retry(id).unwrap(), 2);

        assert_eq!(store.list_pending(1).unwrap().len(), 1);
        let exhausted = store.list_exhausted(1).unwrap();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].id, id);
    }

    #[test]
    fn test_checkpoint_compare_and_set() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.load_checkpoint("src").unwrap().is_none());

        let first = Checkpoint::new("src", 100, b"head");
        assert!(store.advance_checkpoint(None, &first).unwrap());
        assert!(!store.advance_checkpoint(None, &first).unwrap());

        let next = Checkpoint::new("src", 250, b"head");
        assert!(store.advance_checkpoint(Some(100), &next).unwrap());
        // Stale expectation.
        assert!(!store.advance_checkpoint(Some(100), &next).unwrap());
        // Never backwards.
        let back = Checkpoint::new("src", 50, b"head");
        assert!(!store.advance_checkpoint(Some(250), &back).unwrap());

        let loaded = store.load_checkpoint("src").unwrap().unwrap();
        assert_eq!(loaded.cursor, 250);
        assert!(loaded.matches_head(b"head"));

        store.reset_checkpoint("src").unwrap();
        assert!(store.load_checkpoint("src").unwrap().is_none());
    }

    #[test]
    fn test_source_lock_excludes_other_owners() {
        let store: StoreRef = Arc::new(SqliteStore::open_in_memory().unwrap());
        let ttl = Duration::from_secs(60);
        let held = SourceLock::acquire(store.clone(), "cowrie.json", "a", ttl).unwrap();
        held.refresh().unwrap();

        let err = SourceLock::acquire(store.clone(), "cowrie.json", "b", ttl)
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::LockHeld { ref owner, .. } if owner == "a"));

        drop(held);
        SourceLock::acquire(store, "cowrie.json", "b", ttl).unwrap();
    }

    #[test]
    fn test_expired_lock_can_be_taken_over() {
        let store: StoreRef = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.acquire_lock("src", "a", Duration::ZERO).unwrap();
        store.acquire_lock("src", "b", Duration::from_secs(60)).unwrap();
        assert!(store.acquire_lock("src", "a", Duration::from_secs(60)).is_err());
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("honeycomb.db");
        {
            let store = SqliteStore::open(&path, Duration::from_secs(1)).unwrap();
            store
                .commit_batch(
                    "t",
                    &events(&[r#"{"eventid":"cowrie.session.connect","session":"s"}"#]),
                    &[],
                )
                .unwrap();
        }
        let store = SqliteStore::open(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(store.raw_event_count(None).unwrap(), 1);
    }
}
