//! Typed Cowrie event model.
//!
//! Events are selected by their `eventid`/`event_type` tag into a closed set
//! of variants the aggregator understands, plus `Unknown` for everything else.
//! The `cowrie.` prefix on tags is optional.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Storage-level discriminant of an event, persisted in `raw_events.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionConnect,
    LoginSuccess,
    LoginFailed,
    CommandInput,
    CommandFailed,
    SessionClosed,
    ClientVersion,
    FileDownload,
    Unknown,
}

impl EventKind {
    pub fn from_event_type(event_type: &str) -> Self {
        match event_type.strip_prefix("cowrie.").unwrap_or(event_type) {
            "session.connect" => EventKind::SessionConnect,
            "login.success" => EventKind::LoginSuccess,
            "login.failed" => EventKind::LoginFailed,
            "command.input" => EventKind::CommandInput,
            "command.failed" => EventKind::CommandFailed,
            "session.closed" => EventKind::SessionClosed,
            "client.version" => EventKind::ClientVersion,
            "session.file_download" => EventKind::FileDownload,
            _ => EventKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionConnect => "session_connect",
            EventKind::LoginSuccess => "login_success",
            EventKind::LoginFailed => "login_failed",
            EventKind::CommandInput => "command_input",
            EventKind::CommandFailed => "command_failed",
            EventKind::SessionClosed => "session_closed",
            EventKind::ClientVersion => "client_version",
            EventKind::FileDownload => "file_download",
            EventKind::Unknown => "unknown",
        }
    }
}

/// A Cowrie event with its type-specific fields.
#[derive(Debug, Clone, PartialEq)]
pub enum CowrieEvent {
    SessionConnect {
        src_ip: Option<String>,
        src_port: Option<u16>,
        dst_ip: Option<String>,
        dst_port: Option<u16>,
        protocol: Option<String>,
    },
    LoginSuccess {
        username: Option<String>,
        password: Option<String>,
    },
    LoginFailed {
        username: Option<String>,
        password: Option<String>,
    },
    CommandInput {
        input: Option<String>,
    },
    CommandFailed {
        input: Option<String>,
    },
    SessionClosed {
        duration_seconds: Option<f64>,
    },
    ClientVersion {
        version: Option<String>,
    },
    FileDownload {
        url: Option<String>,
        shasum: Option<String>,
        outfile: Option<String>,
    },
    Unknown {
        event_type: String,
        payload: Value,
    },
}

impl CowrieEvent {
    /// Build the typed variant for `event_type` from an already sanitized payload.
    pub fn from_payload(event_type: &str, payload: &Value) -> Self {
        match EventKind::from_event_type(event_type) {
            EventKind::SessionConnect => CowrieEvent::SessionConnect {
                src_ip: string_field(payload, "src_ip"),
                src_port: port_field(payload, "src_port"),
                dst_ip: string_field(payload, "dst_ip"),
                dst_port: port_field(payload, "dst_port"),
                protocol: string_field(payload, "protocol"),
            },
            EventKind::LoginSuccess => CowrieEvent::LoginSuccess {
                username: string_field(payload, "username"),
                password: string_field(payload, "password"),
            },
            EventKind::LoginFailed => CowrieEvent::LoginFailed {
                username: string_field(payload, "username"),
                password: string_field(payload, "password"),
            },
            EventKind::CommandInput => CowrieEvent::CommandInput {
                input: string_field(payload, "input"),
            },
            EventKind::CommandFailed => CowrieEvent::CommandFailed {
                input: string_field(payload, "input"),
            },
            EventKind::SessionClosed => CowrieEvent::SessionClosed {
                duration_seconds: seconds_field(payload, "duration"),
            },
            EventKind::ClientVersion => CowrieEvent::ClientVersion {
                version: string_field(payload, "version"),
            },
            EventKind::FileDownload => CowrieEvent::FileDownload {
                url: string_field(payload, "url"),
                shasum: string_field(payload, "shasum"),
                outfile: string_field(payload, "outfile"),
            },
            EventKind::Unknown => CowrieEvent::Unknown {
                event_type: event_type.to_string(),
                payload: payload.clone(),
            },
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            CowrieEvent::SessionConnect { .. } => EventKind::SessionConnect,
            CowrieEvent::LoginSuccess { .. } => EventKind::LoginSuccess,
            CowrieEvent::LoginFailed { .. } => EventKind::LoginFailed,
            CowrieEvent::CommandInput { .. } => EventKind::CommandInput,
            CowrieEvent::CommandFailed { .. } => EventKind::CommandFailed,
            CowrieEvent::SessionClosed { .. } => EventKind::SessionClosed,
            CowrieEvent::ClientVersion { .. } => EventKind::ClientVersion,
            CowrieEvent::FileDownload { .. } => EventKind::FileDownload,
            CowrieEvent::Unknown { .. } => EventKind::Unknown,
        }
    }

    /// Scalar summary fields this event is allowed to set.
    pub fn summary_update(&self) -> SummaryUpdate {
        let mut update = SummaryUpdate::default();
        match self {
            CowrieEvent::SessionConnect {
                src_ip, protocol, ..
            } => {
                update.protocol = protocol.clone();
                update.source_ip = src_ip.clone();
                update.source_ip_authoritative = true;
            }
            CowrieEvent::LoginSuccess { username, password } => {
                update.username = username.clone();
                update.password = password.clone();
                update.credentials_authoritative = true;
            }
            CowrieEvent::LoginFailed { username, password } => {
                update.username = username.clone();
                update.password = password.clone();
            }
            CowrieEvent::SessionClosed { duration_seconds } => {
                update.duration_seconds = *duration_seconds;
            }
            _ => {}
        }
        update
    }
}

/// Scalar values an event contributes to its session summary.
///
/// Authoritative values overwrite; the rest only fill empty columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryUpdate {
    pub protocol: Option<String>,
    pub source_ip: Option<String>,
    pub source_ip_authoritative: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub credentials_authoritative: bool,
    pub duration_seconds: Option<f64>,
}

/// Which payload field supplied the session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    SessionId,
    Session,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::SessionId => "session_id",
            MatchType::Session => "session",
        }
    }
}

/// A record that passed validation and is ready to be committed.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEvent {
    pub session_id: String,
    pub event_type: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub event: CowrieEvent,
    /// Sanitized and truncated payload, stored verbatim.
    pub payload: Value,
    pub src_ip: Option<String>,
    pub match_type: MatchType,
    pub dedupe_key: String,
    pub sanitized: bool,
    pub truncated_fields: Vec<String>,
}

impl ValidatedEvent {
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key)?.as_str().map(str::to_string)
}

/// Ports must be JSON integers in range; booleans and strings are not coerced.
fn port_field(payload: &Value, key: &str) -> Option<u16> {
    payload
        .get(key)?
        .as_u64()
        .and_then(|port| u16::try_from(port).ok())
}

/// Durations arrive as numbers or numeric strings depending on the Cowrie version.
fn seconds_field(payload: &Value, key: &str) -> Option<f64> {
    let seconds = match payload.get(key)? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (seconds.is_finite() && seconds >= 0.0).then_some(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_ignores_cowrie_prefix() {
        assert_eq!(
            EventKind::from_event_type("cowrie.session.connect"),
            EventKind::SessionConnect
        );
        assert_eq!(
            EventKind::from_event_type("session.closed"),
            EventKind::SessionClosed
        );
        assert_eq!(
            EventKind::from_event_type("cowrie.direct-tcpip.request"),
            EventKind::Unknown
        );
    }

    #[test]
    fn test_connect_fields_are_typed() {
        let payload = json!({
            "src_ip": "203.0.113.7",
            "src_port": 51234,
            "dst_port": true,
            "protocol": "ssh"
        });
        let event = CowrieEvent::from_payload("cowrie.session.connect", &payload);
        assert_eq!(
            event,
            CowrieEvent::SessionConnect {
                src_ip: Some("203.0.113.7".into()),
                src_port: Some(51234),
                dst_ip: None,
                dst_port: None,
                protocol: Some("ssh".into()),
            }
        );
    }

    #[test]
    fn test_closed_duration_accepts_number_and_string() {
        let numeric = CowrieEvent::from_payload("session.closed", &json!({"duration": 42}));
        assert_eq!(numeric.summary_update().duration_seconds, Some(42.0));

        let text = CowrieEvent::from_payload("session.closed", &json!({"duration": "12.5"}));
        assert_eq!(text.summary_update().duration_seconds, Some(12.5));

        let boolean = CowrieEvent::from_payload("session.closed", &json!({"duration": true}));
        assert_eq!(boolean.summary_update().duration_seconds, None);
    }

    #[test]
    fn test_unknown_retains_payload() {
        let payload = json!({"eventid": "cowrie.client.kex", "hassh": "abc"});
        let event = CowrieEvent::from_payload("cowrie.client.kex", &payload);
        match event {
            CowrieEvent::Unknown {
                event_type,
                payload: kept,
            } => {
                assert_eq!(event_type, "cowrie.client.kex");
                assert_eq!(kept, payload);
            }
            other => panic!("expected unknown event, got {other:?}"),
        }
    }

    #[test]
    fn test_only_successful_login_is_authoritative() {
        let ok = CowrieEvent::from_payload(
            "login.success",
            &json!({"username": "root", "password": "admin"}),
        );
        let failed = CowrieEvent::from_payload("login.failed", &json!({"username": "pi"}));

        assert!(ok.summary_update().credentials_authoritative);
        assert!(!failed.summary_update().credentials_authoritative);
        assert_eq!(failed.summary_update().username.as_deref(), Some("pi"));
    }
}
