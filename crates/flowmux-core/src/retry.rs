//! Exponential backoff for connect and read retries.
//!
//! Backoff formula: min(max_delay, initial_delay * 2^attempt) + optional
//! jitter. There is no elapsed-time limit; adapters retry until told to
//! close.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff configuration for connector retries.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,

    /// Delay cap in milliseconds.
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,

    /// Whether to add jitter (±25%) to prevent thundering herd.
    #[serde(default)]
    pub jitter: bool,
}

fn default_initial_ms() -> u64 {
    100
}

fn default_max_ms() -> u64 {
    1_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            jitter: false,
        }
    }
}

/// Mutable backoff state owned by a single retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Create backoff state at attempt zero.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// The delay to sleep before the next attempt, advancing the attempt
    /// counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset to the initial delay. Called on success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .config
            .initial_ms
            .saturating_mul(1u64 << attempt.min(20));
        let capped_ms = delay_ms.min(self.config.max_ms);

        let final_ms = if self.config.jitter {
            let jitter_range = capped_ms / 4;
            let jitter = (std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64)
                % (jitter_range * 2 + 1);
            capped_ms.saturating_sub(jitter_range) + jitter
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial_ms, 100);
        assert_eq!(config.max_ms, 1_000);
        assert!(!config.jitter);
    }

    #[test]
    fn test_exponential_progression() {
        let mut boff = Backoff::new(BackoffConfig::default());
        assert_eq!(boff.next_delay(), Duration::from_millis(100));
        assert_eq!(boff.next_delay(), Duration::from_millis(200));
        assert_eq!(boff.next_delay(), Duration::from_millis(400));
        assert_eq!(boff.next_delay(), Duration::from_millis(800));
        // Capped at max from here on.
        assert_eq!(boff.next_delay(), Duration::from_millis(1_000));
        assert_eq!(boff.next_delay(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut boff = Backoff::new(BackoffConfig::default());
        boff.next_delay();
        boff.next_delay();
        boff.reset();
        assert_eq!(boff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut boff = Backoff::new(BackoffConfig {
            initial_ms: 1_000,
            max_ms: 1_000,
            jitter: true,
        });
        let delay = boff.next_delay();
        assert!(delay >= Duration::from_millis(750));
        assert!(delay <= Duration::from_millis(1_250));
    }

    #[test]
    fn test_high_attempt_does_not_overflow() {
        let mut boff = Backoff::new(BackoffConfig::default());
        for _ in 0..100 {
            boff.next_delay();
        }
        assert_eq!(boff.next_delay(), Duration::from_millis(1_000));
    }
}
