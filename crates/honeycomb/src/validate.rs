//! Schema validation of sanitized records.
//!
//! A raw fragment goes through two stages here: parsing (sanitize, then
//! decode as JSON) and validation (required fields, truncation, typed event
//! construction). Either stage can reject the record; rejections carry the
//! text that should be quarantined.

use chrono::{DateTime, Datelike, NaiveDateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

use honeycomb_core::emit;
use honeycomb_core::metrics::events::{FieldTruncated, RecordSanitized};

use crate::config::ValidationConfig;
use crate::error::{ParseError, RecordError, ValidationError};
use crate::event::{CowrieEvent, MatchType, ValidatedEvent};
use crate::sanitize::{sanitize, sanitize_value};

/// Timestamp keys, in order of preference.
const TIMESTAMP_FIELDS: [&str; 2] = ["timestamp", "event_timestamp"];

/// Separator between the parts of a dedupe key.
const KEY_SEPARATOR: &str = "\u{1f}";

/// A record that failed parsing or validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// Sanitized text of the rejected record, as it will be quarantined.
    pub raw_content: String,
    pub error: RecordError,
}

impl Rejection {
    pub fn new(raw_content: impl Into<String>, error: impl Into<RecordError>) -> Self {
        Self {
            raw_content: raw_content.into(),
            error: error.into(),
        }
    }
}

/// Outcome of validating one element of a record.
pub type Validated = Result<ValidatedEvent, Rejection>;

/// Validates raw record fragments into typed events.
#[derive(Debug, Clone)]
pub struct Validator {
    field_limits: IndexMap<String, usize>,
    marker: String,
    marker_chars: usize,
}

impl Validator {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            field_limits: config.field_limits.clone(),
            marker: config.truncation_marker.clone(),
            marker_chars: config.truncation_marker.chars().count(),
        }
    }

    /// Sanitize, parse and validate one raw fragment.
    ///
    /// A top-level array yields one outcome per element.
    pub fn process(&self, raw: &[u8], target: &str) -> Vec<Validated> {
        let sanitized = sanitize(raw);
        let value = match serde_json::from_str::<Value>(&sanitized.text) {
            Ok(value) => value,
            Err(e) => {
                if sanitized.altered {
                    emit!(RecordSanitized {
                        target: target.to_string(),
                    });
                }
                return vec![Err(Rejection::new(sanitized.text, ParseError::from(e)))];
            }
        };

        let elements = match value {
            Value::Array(items) => items,
            other => vec![other],
        };

        elements
            .into_iter()
            .map(|mut element| {
                let altered = sanitize_value(&mut element) | sanitized.altered;
                if altered {
                    emit!(RecordSanitized {
                        target: target.to_string(),
                    });
                }
                self.validate_value(element, altered, target)
            })
            .collect()
    }

    /// Validate an already parsed and sanitized value.
    pub fn validate_value(&self, value: Value, sanitized: bool, target: &str) -> Validated {
        let mut payload = match value {
            Value::Object(map) => map,
            other => {
                return Err(Rejection::new(
                    other.to_string(),
                    ValidationError::NotAnObject,
                ));
            }
        };

        let (event_type, session_field) = match required_fields(&payload) {
            Ok(found) => found,
            Err(error) => {
                return Err(Rejection::new(Value::Object(payload).to_string(), error));
            }
        };
        let match_type = if session_field == "session_id" {
            MatchType::SessionId
        } else {
            MatchType::Session
        };

        let truncated_fields = self.truncate(&mut payload, target);

        // Re-read after truncation so the stored identifiers fit their columns.
        let event_type = text_of(&payload, event_type_field(&payload)).unwrap_or(event_type);
        let session_id = text_of(&payload, session_field).unwrap_or_default();
        let timestamp = TIMESTAMP_FIELDS
            .iter()
            .find_map(|field| payload.get(*field).and_then(Value::as_str))
            .and_then(parse_timestamp);
        let src_ip = payload
            .get("src_ip")
            .and_then(Value::as_str)
            .map(str::to_string);

        let payload = Value::Object(payload);
        let event = CowrieEvent::from_payload(&event_type, &payload);
        let dedupe_key = dedupe_key(&session_id, &event_type, timestamp, &payload);

        Ok(ValidatedEvent {
            session_id,
            event_type,
            timestamp,
            event,
            payload,
            src_ip,
            match_type,
            dedupe_key,
            sanitized,
            truncated_fields,
        })
    }

    /// Truncate configured string fields, returning the names that were cut.
    fn truncate(&self, payload: &mut Map<String, Value>, target: &str) -> Vec<String> {
        let mut truncated = Vec::new();
        for (field, &limit) in &self.field_limits {
            let Some(Value::String(text)) = payload.get_mut(field) else {
                continue;
            };
            let original_chars = text.chars().count();
            if original_chars <= limit {
                continue;
            }
            let keep = limit.saturating_sub(self.marker_chars);
            let cut = text
                .char_indices()
                .nth(keep)
                .map(|(idx, _)| idx)
                .unwrap_or(text.len());
            text.truncate(cut);
            text.push_str(&self.marker);

            warn!(
                field = %field,
                original_length = original_chars,
                limit,
                source = %target,
                "Truncated oversized field"
            );
            emit!(FieldTruncated {
                field: field.clone(),
                target: target.to_string(),
            });
            truncated.push(field.clone());
        }
        truncated
    }
}

/// Find a required string under its canonical name or its Cowrie alias.
///
/// Returns the value and the key it was found under.
fn required_str(
    payload: &Map<String, Value>,
    canonical: &'static str,
    alias: &'static str,
) -> Result<(String, &'static str), ValidationError> {
    for field in [canonical, alias] {
        match payload.get(field) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) if s.trim().is_empty() => continue,
            Some(Value::String(s)) => return Ok((s.clone(), field)),
            Some(_) => {
                return Err(ValidationError::InvalidFieldType {
                    field: canonical,
                    expected: "string",
                });
            }
        }
    }
    Err(ValidationError::MissingRequiredField { field: canonical })
}

/// The event type and the key that supplied the session id.
fn required_fields(
    payload: &Map<String, Value>,
) -> Result<(String, &'static str), ValidationError> {
    let (event_type, _) = required_str(payload, "event_type", "eventid")?;
    let (_, session_field) = required_str(payload, "session_id", "session")?;
    Ok((event_type, session_field))
}

fn event_type_field(payload: &Map<String, Value>) -> &'static str {
    match payload.get("event_type") {
        Some(Value::String(s)) if !s.trim().is_empty() => "event_type",
        _ => "eventid",
    }
}

fn text_of(payload: &Map<String, Value>, field: &str) -> Option<String> {
    payload.get(field).and_then(Value::as_str).map(str::to_string)
}

/// Parse an ISO-8601-like timestamp. Zone-less values are taken as UTC.
///
/// Only years 0000 through 9999 (after conversion to UTC) are accepted, so
/// the stored text form sorts in time order.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    let parsed = match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(_) => ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.fZ"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(|naive| naive.and_utc()),
    };
    parsed.filter(|ts| (0..=9999).contains(&ts.year()))
}

/// Storage form of a timestamp.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Hash of the identifying parts of an event.
///
/// Object keys serialize in sorted order, so the key does not depend on
/// field order in the source.
pub fn dedupe_key(
    session_id: &str,
    event_type: &str,
    timestamp: Option<DateTime<Utc>>,
    payload: &Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(KEY_SEPARATOR);
    hasher.update(event_type.as_bytes());
    hasher.update(KEY_SEPARATOR);
    if let Some(ts) = timestamp {
        hasher.update(format_timestamp(&ts).as_bytes());
    }
    hasher.update(KEY_SEPARATOR);
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
