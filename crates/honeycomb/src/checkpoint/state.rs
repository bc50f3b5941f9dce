//! Persisted delta position for one source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Bytes from the start of a source used to recognise it after rotation.
pub const HEAD_BYTES: u64 = 4096;

/// Progress marker for a source.
///
/// `cursor` is an offset into the decompressed stream. `head_len` and
/// `head_hash` fingerprint the first bytes of the source as it was when
/// the cursor was saved; a source whose head no longer matches has been
/// rotated or replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_name: String,
    pub cursor: u64,
    pub head_len: u64,
    pub head_hash: String,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(source_name: impl Into<String>, cursor: u64, head: &[u8]) -> Self {
        Self {
            source_name: source_name.into(),
            cursor,
            head_len: head.len() as u64,
            head_hash: head_hash(head),
            updated_at: Utc::now(),
        }
    }

    /// True if `head` (read with `head_len` bytes) still matches.
    pub fn matches_head(&self, head: &[u8]) -> bool {
        head.len() as u64 == self.head_len && head_hash(head) == self.head_hash
    }
}

pub fn head_hash(head: &[u8]) -> String {
    hex::encode(Sha256::digest(head))
}

/// How many head bytes to fingerprint for a cursor.
///
/// Never more than what has been consumed, so the fingerprint stays stable
/// while the file grows.
pub fn head_len_for(cursor: u64) -> u64 {
    cursor.min(HEAD_BYTES)
}
