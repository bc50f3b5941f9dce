//! Dead letter queue record types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::validate::Rejection;

/// Why a record was quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    ParseError,
    MissingRequiredField,
    InvalidFieldType,
    NotAnObject,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::ParseError => "parse_error",
            ReasonCode::MissingRequiredField => "missing_required_field",
            ReasonCode::InvalidFieldType => "invalid_field_type",
            ReasonCode::NotAnObject => "not_an_object",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasonCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parse_error" => Ok(ReasonCode::ParseError),
            "missing_required_field" => Ok(ReasonCode::MissingRequiredField),
            "invalid_field_type" => Ok(ReasonCode::InvalidFieldType),
            "not_an_object" => Ok(ReasonCode::NotAnObject),
            other => Err(format!("unknown reason code '{other}'")),
        }
    }
}

/// Terminal state of a dead letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Repaired,
    Discarded,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Repaired => "repaired",
            Resolution::Discarded => "discarded",
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repaired" => Ok(Resolution::Repaired),
            "discarded" => Ok(Resolution::Discarded),
            other => Err(format!("unknown resolution '{other}'")),
        }
    }
}

/// A rejected record on its way into the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub content_hash: String,
    pub raw_content: String,
    pub reason_code: ReasonCode,
    pub error_message: String,
    pub source_name: String,
}

impl DeadLetter {
    pub fn from_rejection(rejection: Rejection, source_name: &str) -> Self {
        Self {
            content_hash: content_hash(&rejection.raw_content),
            reason_code: rejection.error.reason_code(),
            error_message: rejection.error.to_string(),
            raw_content: rejection.raw_content,
            source_name: source_name.to_string(),
        }
    }
}

/// A persisted dead letter entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: i64,
    pub content_hash: String,
    pub raw_content: String,
    pub reason_code: ReasonCode,
    pub error_message: String,
    pub source_name: String,
    pub first_seen: DateTime<Utc>,
    pub retry_count: u32,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
}

impl DlqEntry {
    pub fn is_terminal(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Identity of quarantined content.
pub fn content_hash(raw_content: &str) -> String {
    hex::encode(Sha256::digest(raw_content.as_bytes()))
}
