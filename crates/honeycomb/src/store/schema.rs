//! Table definitions the loader issues its data operations against.
//!
//! Migrations are owned elsewhere; these statements only create missing
//! tables so that a fresh database file is usable.

pub const CREATE_RAW_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS raw_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    dedupe_key TEXT NOT NULL UNIQUE,
    session_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    kind TEXT NOT NULL,               -- EventKind, drives summary counters
    event_timestamp TEXT,             -- UTC, fixed width; NULL if unparsable
    source_name TEXT NOT NULL,
    payload TEXT NOT NULL,
    ingested_at TEXT NOT NULL
)
"#;

pub const CREATE_INDEX_RAW_SESSION: &str =
    "CREATE INDEX IF NOT EXISTS idx_raw_events_session ON raw_events(session_id, kind)";

pub const CREATE_SESSION_SUMMARIES: &str = r#"
CREATE TABLE IF NOT EXISTS session_summaries (
    session_id TEXT PRIMARY KEY,
    first_seen TEXT,
    last_seen TEXT,
    event_count INTEGER NOT NULL DEFAULT 0,
    command_count INTEGER NOT NULL DEFAULT 0,
    login_attempts INTEGER NOT NULL DEFAULT 0,
    protocol TEXT,
    source_ip TEXT,
    username TEXT,
    password TEXT,
    duration_seconds REAL,
    match_type TEXT,
    enrichment TEXT,                  -- JSON owned by the enrichment service
    updated_at TEXT NOT NULL
)
"#;

pub const CREATE_DLQ_ENTRIES: &str = r#"
CREATE TABLE IF NOT EXISTS dlq_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_hash TEXT NOT NULL UNIQUE,
    raw_content TEXT NOT NULL,
    reason_code TEXT NOT NULL,
    error_message TEXT NOT NULL,
    source_name TEXT NOT NULL,
    first_seen TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    resolved_at TEXT,
    resolution TEXT                   -- 'repaired' | 'discarded' | NULL
)
"#;

pub const CREATE_INDEX_DLQ_PENDING: &str =
    "CREATE INDEX IF NOT EXISTS idx_dlq_pending ON dlq_entries(resolution, retry_count)";

pub const CREATE_CHECKPOINTS: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    source_name TEXT PRIMARY KEY,
    cursor INTEGER NOT NULL,          -- decompressed byte offset
    head_len INTEGER NOT NULL,
    head_hash TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

pub const CREATE_SOURCE_LOCKS: &str = r#"
CREATE TABLE IF NOT EXISTS source_locks (
    source_name TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
)
"#;

/// Every statement needed for an empty database, in order.
pub const BOOTSTRAP: [&str; 7] = [
    CREATE_RAW_EVENTS,
    CREATE_INDEX_RAW_SESSION,
    CREATE_SESSION_SUMMARIES,
    CREATE_DLQ_ENTRIES,
    CREATE_INDEX_DLQ_PENDING,
    CREATE_CHECKPOINTS,
    CREATE_SOURCE_LOCKS,
];
