//! Circuit breaker guarding storage writes.
//!
//! Closed: writes go through. After `failure_threshold` consecutive write
//! failures the breaker opens and refuses writes until `cooldown` has
//! elapsed. It then allows exactly one trial write (half open): success
//! closes it, failure reopens it with a fresh cooldown. Each reopening
//! counts as an open cycle; after `max_open_cycles` the caller gives up.
//!
//! Timing uses the tokio clock so tests can pause and advance time.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use honeycomb_core::emit;
use honeycomb_core::metrics::events::BreakerStateChanged;

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    /// Gauge value: 0 closed, 1 half open, 2 open.
    fn level(&self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

/// Serializable view of the breaker for the status document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub service_name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub open_cycles: u32,
}

/// Whether a write may be attempted now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Breaker closed.
    Allowed,
    /// The single write permitted while half open.
    Trial,
    /// Breaker open; try again after the given delay.
    Rejected { retry_after: Duration },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    cooldown: Duration,
    max_open_cycles: u32,
    state: BreakerState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    opened_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    open_cycles: u32,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            service: service.into(),
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
            max_open_cycles: config.max_open_cycles,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            open_until: None,
            opened_at: None,
            trial_in_flight: false,
            open_cycles: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn open_cycles(&self) -> u32 {
        self.open_cycles
    }

    /// True once the breaker has reopened `max_open_cycles` times in a row.
    pub fn is_exhausted(&self) -> bool {
        self.max_open_cycles > 0 && self.open_cycles >= self.max_open_cycles
    }

    /// Ask for permission to write.
    pub fn try_acquire(&mut self) -> Permit {
        match self.state {
            BreakerState::Closed => Permit::Allowed,
            BreakerState::HalfOpen if self.trial_in_flight => Permit::Rejected {
                retry_after: self.cooldown,
            },
            BreakerState::HalfOpen => {
                self.trial_in_flight = true;
                Permit::Trial
            }
            BreakerState::Open => {
                let now = Instant::now();
                match self.open_until {
                    Some(until) if now < until => Permit::Rejected {
                        retry_after: until - now,
                    },
                    _ => {
                        self.transition(BreakerState::HalfOpen);
                        self.trial_in_flight = true;
                        Permit::Trial
                    }
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.trial_in_flight = false;
        if self.state != BreakerState::Closed {
            self.open_cycles = 0;
            self.open_until = None;
            self.opened_at = None;
            self.transition(BreakerState::Closed);
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            BreakerState::Closed if self.consecutive_failures >= self.failure_threshold => {
                self.open();
            }
            BreakerState::HalfOpen => {
                self.trial_in_flight = false;
                self.open_cycles += 1;
                self.open();
            }
            _ => {}
        }
    }

    fn open(&mut self) {
        self.open_until = Some(Instant::now() + self.cooldown);
        self.opened_at = Some(Utc::now());
        self.transition(BreakerState::Open);
    }

    fn transition(&mut self, next: BreakerState) {
        if self.state == next {
            return;
        }
        match next {
            BreakerState::Open => warn!(
                service = %self.service,
                consecutive_failures = self.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs_f64(),
                open_cycles = self.open_cycles,
                "Circuit breaker opened"
            ),
            BreakerState::HalfOpen => info!(service = %self.service, "Circuit breaker half open, allowing one trial write"),
            BreakerState::Closed => info!(service = %self.service, "Circuit breaker closed"),
        }
        self.state = next;
        emit!(BreakerStateChanged {
            level: next.level(),
            service: self.service.clone(),
        });
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let cooldown_until = match (self.state, self.opened_at) {
            (BreakerState::Open, Some(opened)) => chrono::Duration::from_std(self.cooldown)
                .ok()
                .and_then(|d| opened.checked_add_signed(d)),
            _ => None,
        };
        CircuitBreakerState {
            service_name: self.service.clone(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            opened_at: self.opened_at,
            cooldown_until,
            open_cycles: self.open_cycles,
        }
    }
}
