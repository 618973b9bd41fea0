//! Retry utilities: backoff builders for broker connections and consumers.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

use crate::config::ReconnectConfig;

/// Backoff for establishing a broker connection.
///
/// Bounded by `max_attempts`; the operation fails once it is exhausted.
pub fn connection_backoff(config: &ReconnectConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(config.min_delay())
        .with_max_delay(config.max_delay())
        .with_max_times(config.max_attempts)
        .with_jitter()
}

/// Backoff for re-establishing a consumer loop.
///
/// Consumers never give up: once the iterator runs dry the ceiling is used.
pub struct ConsumerBackoff {
    builder: ExponentialBuilder,
    ceiling: Duration,
    current: backon::ExponentialBackoff,
}

impl ConsumerBackoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        let builder = ExponentialBuilder::default()
            .with_min_delay(config.min_delay())
            .with_max_delay(config.max_delay())
            .with_max_times(usize::MAX)
            .with_jitter();
        Self {
            current: builder.build(),
            builder,
            ceiling: config.max_delay(),
        }
    }

    /// Delay before the next attempt, never above the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        self.current
            .next()
            .map_or(self.ceiling, |delay| delay.min(self.ceiling))
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.builder.build();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> ReconnectConfig {
        ReconnectConfig {
            min_delay_ms: 10,
            max_delay_ms: 40,
            max_attempts: 3,
        }
    }

    #[test]
    fn test_connection_backoff_is_bounded() {
        let delays: Vec<Duration> = connection_backoff(&fast_config()).build().collect();
        assert_eq!(delays.len(), 3);
        // Jitter may add up to one more min_delay on top of the ceiling.
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(80)));
    }

    #[test]
    fn test_consumer_backoff_never_runs_dry() {
        let mut backoff = ConsumerBackoff::new(&fast_config());
        for _ in 0..50 {
            assert!(backoff.next_delay() <= Duration::from_millis(80));
        }
    }

    #[test]
    fn test_consumer_backoff_respects_ceiling_under_jitter() {
        let config = ReconnectConfig::default();
        let mut backoff = ConsumerBackoff::new(&config);
        for _ in 0..500 {
            assert!(backoff.next_delay() <= config.max_delay());
        }
    }

    #[test]
    fn test_consumer_backoff_reset() {
        let mut backoff = ConsumerBackoff::new(&fast_config());
        for _ in 0..10 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(20));
    }
}
