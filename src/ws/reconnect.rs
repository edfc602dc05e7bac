//! Backoff and attempt accounting for the push transport.

use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use tokio::time::Instant;

use super::config::ReconnectConfig;
use crate::task::jittered;

/// What the connection loop should do after a failed or lost connection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Wait this long, then attempt again. `attempt` is 1-based.
    After { attempt: u32, delay: Duration },
    /// `max_attempts` consecutive failures: stop and surface a terminal error.
    GiveUp { attempts: u32 },
}

/// Computes reconnection delays and decides when to stop retrying.
///
/// Attempts are counted from the first failure after a successful open and reset on every
/// successful open. Reconnect triggers that arrive while an attempt is in flight, or within
/// `min_delay` of the previous attempt, are coalesced.
#[derive(Debug)]
pub struct ReconnectionScheduler {
    config: ReconnectConfig,
    backoff: ExponentialBackoff,
    failures: u32,
    in_flight: bool,
    last_attempt: Option<Instant>,
}

impl ReconnectionScheduler {
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        let backoff = (&config).into();
        Self {
            config,
            backoff,
            failures: 0,
            in_flight: false,
            last_attempt: None,
        }
    }

    /// Un-jittered delay before attempt `attempt` (1-based).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let grown = self
            .config
            .min_delay
            .mul_f64(self.config.growth_factor.powi(exponent).min(f64::from(u32::MAX)));
        grown.min(self.config.max_delay)
    }

    /// Number of consecutive failures since the last successful open.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    #[must_use]
    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    /// Records the start of a connection attempt at `now`.
    pub fn attempt_started(&mut self, now: Instant) {
        self.in_flight = true;
        self.last_attempt = Some(now);
    }

    /// Records a successful open. Resets the attempt counter and the base sequence.
    pub fn opened(&mut self) {
        self.in_flight = false;
        self.failures = 0;
        self.backoff.reset();
    }

    /// Records a failed attempt or a lost connection and returns the next step.
    pub fn failed(&mut self) -> Retry {
        self.in_flight = false;
        self.failures = self.failures.saturating_add(1);

        if self.failures > self.config.max_attempts {
            return Retry::GiveUp {
                attempts: self.config.max_attempts,
            };
        }

        let base = self
            .backoff
            .next_backoff()
            .unwrap_or(self.config.max_delay);

        Retry::After {
            attempt: self.failures,
            delay: jittered(base, self.config.jitter),
        }
    }

    /// Whether an explicit reconnect trigger at `now` should start an attempt right away.
    #[must_use]
    pub fn accepts_trigger(&self, now: Instant) -> bool {
        if self.in_flight {
            return false;
        }

        self.last_attempt
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.min_delay)
    }
}
