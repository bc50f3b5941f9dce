//! Generic polling loop trait and runner.
//!
//! Used by the delta loader's follow mode: each iteration ingests whatever
//! was appended since the last checkpoint, then sleeps until the next poll.

use async_trait::async_trait;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::emit;
use crate::metrics::events::{IterationCompleted, IterationResultType};

/// Result of a single processing iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationResult {
    /// Items were processed successfully.
    ProcessedItems,
    /// No items were available to process.
    NoItems,
    /// Shutdown was observed by the processor.
    Shutdown,
}

/// A processor driven by [`run_polling_loop`].
#[async_trait]
pub trait PollingProcessor {
    /// State prepared for each iteration.
    type State: Send;
    type Error: std::error::Error + Send;

    /// Prepare an iteration. `None` means there is nothing to do.
    ///
    /// `cold_start` is true on the first iteration.
    async fn prepare(&mut self, cold_start: bool) -> Result<Option<Self::State>, Self::Error>;

    /// Process the prepared state.
    ///
    /// The loop does not race this future against shutdown. Processors are
    /// expected to observe the token themselves so that in-flight work can be
    /// flushed before returning [`IterationResult::Shutdown`].
    async fn process(&mut self, state: Self::State) -> Result<IterationResult, Self::Error>;
}

/// Random delay in `[0, max_secs)` used to spread out polls and retries.
pub fn random_jitter(max_secs: u64) -> Duration {
    if max_secs > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_secs * 1000))
    } else {
        Duration::ZERO
    }
}

/// Run `processor` until shutdown or error.
///
/// 1. `prepare()` (raced against shutdown, nothing has been read yet)
/// 2. `process()` if there is work
/// 3. sleep for `poll_interval` plus jitter, or until shutdown
pub async fn run_polling_loop<P: PollingProcessor>(
    processor: &mut P,
    poll_interval: Duration,
    poll_jitter_secs: u64,
    shutdown: CancellationToken,
    name: &str,
) -> Result<(), P::Error> {
    let mut cold_start = true;

    loop {
        let iteration_start = Instant::now();

        let state = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(target = name, "Shutdown requested before iteration");
                return Ok(());
            }

            result = processor.prepare(cold_start) => result?,
        };
        cold_start = false;

        let result = match state {
            Some(s) => processor.process(s).await?,
            None => IterationResult::NoItems,
        };

        let kind = match result {
            IterationResult::Shutdown => {
                info!(target = name, "Processor stopped for shutdown");
                break;
            }
            IterationResult::NoItems => IterationResultType::NoItems,
            IterationResult::ProcessedItems => IterationResultType::Processed,
        };

        emit!(IterationCompleted {
            result: kind,
            duration: iteration_start.elapsed(),
            target: name.to_string(),
        });

        let sleep_duration = poll_interval + random_jitter(poll_jitter_secs);
        debug!(
            target = name,
            result = kind.as_str(),
            "Waiting {}ms before next poll",
            sleep_duration.as_millis()
        );

        if shutdown
            .run_until_cancelled(tokio::time::sleep(sleep_duration))
            .await
            .is_none()
        {
            info!(target = name, "Shutdown requested during poll wait");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct NeverFails;

    impl fmt::Display for NeverFails {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "never")
        }
    }

    impl std::error::Error for NeverFails {}

    struct CountingProcessor {
        prepared: Vec<bool>,
        processed: usize,
        stop_after: usize,
        shutdown: CancellationToken,
    }

    #[async_trait]
    impl PollingProcessor for CountingProcessor {
        type State = ();
        type Error = NeverFails;

        async fn prepare(&mut self, cold_start: bool) -> Result<Option<()>, NeverFails> {
            self.prepared.push(cold_start);
            Ok(Some(()))
        }

        async fn process(&mut self, _state: ()) -> Result<IterationResult, NeverFails> {
            self.processed += 1;
            if self.processed >= self.stop_after {
                self.shutdown.cancel();
                return Ok(IterationResult::Shutdown);
            }
            Ok(IterationResult::ProcessedItems)
        }
    }

    #[tokio::test]
    async fn test_cold_start_only_on_first_iteration() {
        let shutdown = CancellationToken::new();
        let mut processor = CountingProcessor {
            prepared: Vec::new(),
            processed: 0,
            stop_after: 3,
            shutdown: shutdown.clone(),
        };

        run_polling_loop(&mut processor, Duration::ZERO, 0, shutdown, "test")
            .await
            .unwrap();

        assert_eq!(processor.prepared, vec![true, false, false]);
        assert_eq!(processor.processed, 3);
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_iteration() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let mut processor = CountingProcessor {
            prepared: Vec::new(),
            processed: 0,
            stop_after: 10,
            shutdown: shutdown.clone(),
        };

        run_polling_loop(&mut processor, Duration::from_secs(60), 0, shutdown, "test")
            .await
            .unwrap();

        assert!(processor.prepared.is_empty());
    }

    #[test]
    fn test_random_jitter_bounds() {
        assert_eq!(random_jitter(0), Duration::ZERO);
        for _ in 0..50 {
            assert!(random_jitter(2) < Duration::from_secs(2));
        }
    }
}
