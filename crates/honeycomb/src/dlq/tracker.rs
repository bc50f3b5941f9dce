//! Per-run quarantine accounting.

use tracing::{error, warn};

use honeycomb_core::emit;
use honeycomb_core::metrics::events::RecordQuarantined;

use crate::error::{MaxQuarantinedSnafu, PipelineError};
use crate::validate::Rejection;

use super::types::DeadLetter;

/// Counts quarantined records for one source and enforces the run limit.
#[derive(Debug)]
pub struct QuarantineTracker {
    count: usize,
    max_quarantined: usize,
    /// Source name for logs and metrics.
    target: String,
}

impl QuarantineTracker {
    /// `max_quarantined` of 0 means unlimited.
    pub fn new(max_quarantined: usize, target: impl Into<String>) -> Self {
        Self {
            count: 0,
            max_quarantined,
            target: target.into(),
        }
    }

    /// Log and count a rejection, turning it into a dead letter.
    ///
    /// The dead letter is always returned so it can still be committed; the
    /// result turns into `Err` once the limit is exceeded.
    pub fn quarantine(
        &mut self,
        rejection: Rejection,
        line: u64,
    ) -> (DeadLetter, Result<(), PipelineError>) {
        self.count += 1;
        let reason = rejection.error.reason_code();
        warn!(
            source = %self.target,
            line,
            reason = reason.as_str(),
            error = %rejection.error,
            "Quarantined record"
        );
        emit!(RecordQuarantined {
            reason: reason.as_str(),
            target: self.target.clone(),
        });

        let letter = DeadLetter::from_rejection(rejection, &self.target);
        if self.max_quarantined > 0 && self.count > self.max_quarantined {
            error!(
                source = %self.target,
                count = self.count,
                "Quarantine limit exceeded, stopping"
            );
            return (letter, MaxQuarantinedSnafu { count: self.count }.fail());
        }
        (letter, Ok(()))
    }

    pub fn count(&self) -> usize {
        self.count
    }
}
