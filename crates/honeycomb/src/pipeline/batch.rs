//! Batches of validated events and dead letters, and adaptive batch sizing.

use honeycomb_core::emit;
use honeycomb_core::metrics::events::CurrentBatchSize;
use tracing::debug;

use crate::dlq::DeadLetter;
use crate::event::ValidatedEvent;

/// Records committed together in one transaction.
#[derive(Debug, Default)]
pub struct Batch {
    pub events: Vec<ValidatedEvent>,
    pub dead_letters: Vec<DeadLetter>,
    /// Raw bytes of the records in the batch.
    pub bytes: usize,
    /// Resume offset after the last complete record in the batch.
    pub end_offset: Option<u64>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.events.len() + self.dead_letters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.dead_letters.is_empty()
    }

    /// Account for one raw record whose outcomes have been pushed.
    pub fn close_record(&mut self, bytes: usize, end_offset: u64) {
        self.bytes += bytes;
        self.end_offset = Some(end_offset);
    }

    pub fn take(&mut self) -> Batch {
        std::mem::take(self)
    }
}

/// Batch size that shrinks under pressure and recovers gradually.
///
/// Pressure is a batch hitting the byte budget before its record count, or
/// a commit failing with a transient error. Each shrink halves the size
/// (never below the floor); each clean commit grows it by a quarter back
/// toward the configured target.
#[derive(Debug)]
pub struct AdaptiveBatchSizer {
    target: usize,
    min: usize,
    max_bytes: usize,
    current: usize,
    source_name: String,
}

impl AdaptiveBatchSizer {
    pub fn new(target: usize, min: usize, max_bytes: usize, source_name: impl Into<String>) -> Self {
        let target = target.max(1);
        let sizer = Self {
            target,
            min: min.clamp(1, target),
            max_bytes: max_bytes.max(1),
            current: target,
            source_name: source_name.into(),
        };
        sizer.report();
        sizer
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn is_full(&self, batch: &Batch) -> bool {
        batch.len() >= self.current || batch.bytes >= self.max_bytes
    }

    /// Adjust after `batch` committed cleanly.
    pub fn on_commit(&mut self, batch_len: usize, batch_bytes: usize) {
        if batch_bytes >= self.max_bytes && batch_len < self.current {
            self.shrink("byte budget reached");
        } else if self.current < self.target {
            let step = (self.current / 4).max(1);
            self.current = (self.current + step).min(self.target);
            self.report();
        }
    }

    pub fn on_transient_failure(&mut self) {
        self.shrink("transient commit failure");
    }

    fn shrink(&mut self, reason: &'static str) {
        let next = (self.current / 2).max(self.min);
        if next != self.current {
            debug!(
                source = %self.source_name,
                from = self.current,
                to = next,
                reason,
                "Shrinking batch size"
            );
            self.current = next;
            self.report();
        }
    }

    fn report(&self) {
        emit!(CurrentBatchSize {
            size: self.current,
            target: self.source_name.clone(),
        });
    }
}
