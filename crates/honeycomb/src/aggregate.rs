//! Folding validated events into session summaries.
//!
//! Each event is applied as two statements inside the caller's transaction:
//! an insert of the raw event that does nothing on a dedupe key conflict,
//! and one atomic upsert of the session summary. Counters are recomputed
//! from the distinct raw events of the session, timestamps merge with
//! min/max, and scalar columns follow per-event-type overwrite rules, so
//! applying the same event any number of times gives the same row.
//!
//! Nothing here retries; errors go back to the committer.

use rusqlite::{Connection, OptionalExtension, params};
use snafu::prelude::*;

use crate::error::{SerializeSnafu, SqliteSnafu, StoreError};
use crate::event::ValidatedEvent;
use crate::validate::format_timestamp;

const INSERT_RAW_EVENT: &str = r#"
INSERT INTO raw_events (
    dedupe_key, session_id, event_type, kind, event_timestamp, source_name, payload, ingested_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(dedupe_key) DO NOTHING
"#;

// ?5 marks an authoritative source ip, ?8 authoritative credentials.
const UPSERT_SUMMARY: &str = r#"
INSERT INTO session_summaries (
    session_id, first_seen, last_seen, event_count, command_count, login_attempts,
    protocol, source_ip, username, password, duration_seconds, match_type, updated_at
) VALUES (
    ?1, ?2, ?2,
    (SELECT COUNT(*) FROM raw_events WHERE session_id = ?1),
    (SELECT COUNT(*) FROM raw_events WHERE session_id = ?1 AND kind = 'command_input'),
    (SELECT COUNT(*) FROM raw_events
        WHERE session_id = ?1 AND kind IN ('login_success', 'login_failed')),
    ?3, ?4, ?6, ?7, ?9, ?10, ?11
)
ON CONFLICT(session_id) DO UPDATE SET
    first_seen = COALESCE(min(first_seen, excluded.first_seen), first_seen, excluded.first_seen),
    last_seen = COALESCE(max(last_seen, excluded.last_seen), last_seen, excluded.last_seen),
    event_count = excluded.event_count,
    command_count = excluded.command_count,
    login_attempts = excluded.login_attempts,
    protocol = COALESCE(excluded.protocol, protocol),
    source_ip = CASE WHEN ?5 THEN COALESCE(excluded.source_ip, source_ip)
                     ELSE COALESCE(source_ip, excluded.source_ip) END,
    username = CASE WHEN ?8 THEN COALESCE(excluded.username, username)
                    ELSE COALESCE(username, excluded.username) END,
    password = CASE WHEN ?8 THEN COALESCE(excluded.password, password)
                    ELSE COALESCE(password, excluded.password) END,
    duration_seconds = COALESCE(duration_seconds, excluded.duration_seconds),
    match_type = COALESCE(match_type, excluded.match_type),
    updated_at = excluded.updated_at
RETURNING event_count
"#;

/// What applying one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertResult {
    /// False if the raw event was already stored.
    pub inserted: bool,
    /// Session event count after the merge; `None` for duplicates.
    pub event_count: Option<u64>,
}

/// Persist `event` and merge it into its session summary.
///
/// Must run inside a transaction so the raw row and the summary change
/// commit together.
pub fn apply(
    conn: &Connection,
    event: &ValidatedEvent,
    source_name: &str,
    now: &str,
) -> Result<UpsertResult, StoreError> {
    let kind = event.kind();
    let timestamp = event.timestamp.as_ref().map(format_timestamp);
    let payload = serde_json::to_string(&event.payload).context(SerializeSnafu)?;

    let inserted = conn
        .execute(
            INSERT_RAW_EVENT,
            params![
                event.dedupe_key,
                event.session_id,
                event.event_type,
                kind.as_str(),
                timestamp,
                source_name,
                payload,
                now,
            ],
        )
        .context(SqliteSnafu {
            operation: "insert raw event",
        })?;

    if inserted == 0 {
        // Already folded in by whichever commit stored it.
        return Ok(UpsertResult {
            inserted: false,
            event_count: None,
        });
    }

    let update = event.event.summary_update();
    let source_ip = update.source_ip.clone().or_else(|| event.src_ip.clone());
    let event_count: Option<i64> = conn
        .query_row(
            UPSERT_SUMMARY,
            params![
                event.session_id,
                timestamp,
                update.protocol,
                source_ip,
                update.source_ip_authoritative,
                update.username,
                update.password,
                update.credentials_authoritative,
                update.duration_seconds,
                event.match_type.as_str(),
                now,
            ],
            |row| row.get(0),
        )
        .optional()
        .context(SqliteSnafu {
            operation: "upsert session summary",
        })?;

    Ok(UpsertResult {
        inserted: true,
        event_count: event_count.and_then(|n| u64::try_from(n).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationConfig;
    use crate::store::schema::BOOTSTRAP;
    use crate::validate::Validator;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        for statement in BOOTSTRAP {
            conn.execute_batch(statement).unwrap();
        }
        conn
    }

    fn event(json: &str) -> ValidatedEvent {
        Validator::new(&ValidationConfig::default())
            .process(json.as_bytes(), "test")
            .remove(0)
            .unwrap()
    }

    fn summary(conn: &Connection, session: &str) -> (i64, i64, i64, Option<String>, Option<String>, Option<f64>) {
        conn.query_row(
            "SELECT event_count, command_count, login_attempts, username, source_ip, duration_seconds
             FROM session_summaries WHERE session_id = ?1",
            [session],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
        )
        .unwrap()
    }

    const NOW: &str = "2024-03-01T00:00:00.000000Z";

    #[test]
    fn test_counts_are_recomputed_not_incremented() {
        let conn = conn();
        let input = event(r#"{"eventid":"cowrie.command.input","session":"s","input":"ls","timestamp":"2024-03-01T10:00:00Z"}"#);
        let first = apply(&conn, &input, "src", NOW).unwrap();
        assert!(first.inserted);
        assert_eq!(first.event_count, Some(1));

        for _ in 0..3 {
            let again = apply(&conn, &input, "src", NOW).unwrap();
            assert!(!again.inserted);
        }
        assert_eq!(summary(&conn, "s").0, 1);
        assert_eq!(summary(&conn, "s").1, 1);
    }

    #[test]
    fn test_first_and_last_seen_are_min_and_max() {
        let conn = conn();
        for ts in ["2024-03-01T10:05:00Z", "2024-03-01T10:00:00Z", "2024-03-01T10:09:00Z"] {
            let e = event(&format!(
                r#"{{"eventid":"cowrie.command.input","session":"s","input":"{ts}","timestamp":"{ts}"}}"#
            ));
            apply(&conn, &e, "src", NOW).unwrap();
        }
        let (first, last): (String, String) = conn
            .query_row(
                "SELECT first_seen, last_seen FROM session_summaries WHERE session_id = 's'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(first, "2024-03-01T10:00:00.000000Z");
        assert_eq!(last, "2024-03-01T10:09:00.000000Z");
    }

    #[test]
    fn test_null_timestamp_does_not_clear_bounds() {
        let conn = conn();
        apply(&conn, &event(r#"{"eventid":"cowrie.session.connect","session":"s","timestamp":"2024-03-01T10:00:00Z"}"#), "src", NOW).unwrap();
        apply(&conn, &event(r#"{"eventid":"cowrie.command.input","session":"s","timestamp":"garbage"}"#), "src", NOW).unwrap();
        let first: Option<String> = conn
            .query_row("SELECT first_seen FROM session_summaries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(first.as_deref(), Some("2024-03-01T10:00:00.000000Z"));
    }

    #[test]
    fn test_successful_login_overrides_failed_credentials() {
        let conn = conn();
        apply(&conn, &event(r#"{"eventid":"cowrie.login.failed","session":"s","username":"admin","password":"x"}"#), "src", NOW).unwrap();
        apply(&conn, &event(r#"{"eventid":"cowrie.login.success","session":"s","username":"root","password":"toor"}"#), "src", NOW).unwrap();
        apply(&conn, &event(r#"{"eventid":"cowrie.login.failed","session":"s","username":"guest","password":"y"}"#), "src", NOW).unwrap();
        let (count, _, logins, username, _, _) = summary(&conn, "s");
        assert_eq!(count, 3);
        assert_eq!(logins, 3);
        assert_eq!(username.as_deref(), Some("root"));
    }

    #[test]
    fn test_duration_is_set_once() {
        let conn = conn();
        apply(&conn, &event(r#"{"eventid":"cowrie.session.closed","session":"s","duration":42}"#), "src", NOW).unwrap();
        apply(&conn, &event(r#"{"eventid":"cowrie.session.closed","session":"s","duration":"7.5","timestamp":"2024-01-01T00:00:00Z"}"#), "src", NOW).unwrap();
        assert_eq!(summary(&conn, "s").5, Some(42.0));
    }

    #[test]
    fn test_connect_sets_source_ip_and_protocol() {
        let conn = conn();
        apply(&conn, &event(r#"{"eventid":"cowrie.command.input","session":"s","src_ip":"10.0.0.9"}"#), "src", NOW).unwrap();
        apply(&conn, &event(r#"{"eventid":"cowrie.session.connect","session":"s","src_ip":"10.0.0.5","protocol":"telnet"}"#), "src", NOW).unwrap();
        apply(&conn, &event(r#"{"eventid":"cowrie.command.input","session":"s","src_ip":"10.0.0.7","input":"id"}"#), "src", NOW).unwrap();
        let ip = summary(&conn, "s").4;
        assert_eq!(ip.as_deref(), Some("10.0.0.5"));
        let protocol: String = conn
            .query_row("SELECT protocol FROM session_summaries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(protocol, "telnet");
    }

    #[test]
    fn test_enrichment_is_preserved() {
        let conn = conn();
        apply(&conn, &event(r#"{"eventid":"cowrie.session.connect","session":"s"}"#), "src", NOW).unwrap();
        conn.execute(
            "UPDATE session_summaries SET enrichment = '{\"asn\":64500}' WHERE session_id = 's'",
            [],
        )
        .unwrap();
        apply(&conn, &event(r#"{"eventid":"cowrie.command.input","session":"s","input":"w"}"#), "src", NOW).unwrap();
        let enrichment: String = conn
            .query_row("SELECT enrichment FROM session_summaries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enrichment, r#"{"asn":64500}"#);
    }
}
