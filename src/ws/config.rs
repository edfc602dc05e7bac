#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_MIN_DELAY_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_GROWTH_FACTOR: f64 = 2.0;
const DEFAULT_JITTER: f64 = 0.15;
const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Configuration for the push transport.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval for sending PING messages to keep connection alive
    pub heartbeat_interval: Duration,
    /// Maximum time to wait for PONG response before considering connection dead
    pub heartbeat_timeout: Duration,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Configuration for automatic reconnection behavior.
///
/// The delay before attempt `n` is `min(max_delay, min_delay * growth_factor^(n - 1))`
/// scaled by a factor drawn uniformly from `[1 - jitter, 1 + jitter]`. Growth is capped low on
/// purpose: this is a dashboard, not a long-haul network client.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Consecutive failed attempts after which the transport gives up
    pub max_attempts: u32,
    /// Base delay of the first attempt, also the coalescing window for reconnect triggers
    pub min_delay: Duration,
    /// Upper bound of the un-jittered delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub growth_factor: f64,
    /// Relative jitter spread
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_delay: DEFAULT_MIN_DELAY_DURATION,
            max_delay: DEFAULT_MAX_DELAY_DURATION,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            jitter: DEFAULT_JITTER,
        }
    }
}

/// The capped geometric base sequence. Jitter is applied on top by
/// [`crate::ws::reconnect::ReconnectionScheduler`] so its bounds are exact.
impl From<&ReconnectConfig> for ExponentialBackoff {
    fn from(config: &ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.min_delay)
            .with_max_interval(config.max_delay)
            .with_multiplier(config.growth_factor)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff as _;

    use super::*;

    #[test]
    fn base_sequence_is_capped_geometric() {
        let config = ReconnectConfig::default();
        let mut backoff: ExponentialBackoff = (&config).into();

        let delays: Vec<_> = (0..6).map(|_| backoff.next_backoff().unwrap()).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
    }

    #[test]
    fn defaults_are_bounded_for_a_ui_client() {
        let config = Config::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(5));
    }
}
