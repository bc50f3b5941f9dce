//! Dead letter queue for records that fail parsing or validation.
//!
//! Rejected records are stored once per distinct content hash, inside the
//! same transaction as the batch they came from. Pending entries can be run
//! through a best-effort repair and replayed into the normal commit path.

pub mod queue;
pub mod repair;
pub mod tracker;
pub mod types;

pub use queue::{DeadLetterQueue, RepairOutcome, RepairSummary};
pub use repair::repair_json;
pub use tracker::QuarantineTracker;
pub use types::{DeadLetter, DlqEntry, ReasonCode, Resolution, content_hash};
