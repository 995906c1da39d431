//! Bounded exponential backoff between failed sync rounds.
//!
//! After each failed round the next opportunistic attempt is pushed out by a
//! delay that doubles per consecutive failure, capped at `max_delay_ms`, with
//! random jitter so many clients recovering at once do not retry in lockstep.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default delay after the first failed round.
const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;

/// Default cap on the delay between rounds (5 minutes).
const DEFAULT_MAX_DELAY_MS: u64 = 300_000;

/// Upper bound for any configured `max_delay_ms` (one day).
pub const MAX_RETRY_DELAY_MS: u64 = 86_400_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    /// Fraction of the delay added or removed at random, in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Bring `max_delay_ms` within [`MAX_RETRY_DELAY_MS`].
    pub fn clamped(mut self) -> Self {
        self.max_delay_ms = self.max_delay_ms.min(MAX_RETRY_DELAY_MS);
        self
    }

    /// Delay before the next attempt after `failures` consecutive failed rounds, without jitter.
    pub fn base_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let ms = (self.initial_delay_ms as f64 * self.factor.powi(exponent))
            .min(self.max_delay_ms.min(MAX_RETRY_DELAY_MS) as f64);
        Duration::from_millis(ms as u64)
    }

    fn jittered(&self, base: Duration) -> Duration {
        let jitter = self.jitter.clamp(0.0, 0.99);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor)
    }
}

/// Backoff state of one sync engine.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    failures: u32,
    retry_after: Option<DateTime<Utc>>,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: config.clamped(),
            failures: 0,
            retry_after: None,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        self.retry_after
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.retry_after.map_or(true, |at| now >= at)
    }

    /// Record a failed round and return the delay until the next attempt.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.config.jittered(self.config.base_delay(self.failures));
        let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        self.retry_after = Some(now + chrono::Duration::milliseconds(millis));
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.retry_after = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter: 0.0,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_base_delay_doubles_and_caps() {
        let config = no_jitter();
        assert_eq!(config.base_delay(0), Duration::ZERO);
        assert_eq!(config.base_delay(1), Duration::from_secs(1));
        assert_eq!(config.base_delay(2), Duration::from_secs(2));
        assert_eq!(config.base_delay(4), Duration::from_secs(8));
        assert_eq!(config.base_delay(20), Duration::from_secs(300));
        assert_eq!(config.base_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let config = RetryConfig::default();
        for _ in 0..100 {
            let delay = config.jittered(Duration::from_secs(10));
            assert!(delay >= Duration::from_millis(7_990));
            assert!(delay <= Duration::from_millis(12_010));
        }
    }

    #[test]
    fn test_failure_sets_deadline_and_reset_clears_it() {
        let mut backoff = Backoff::new(no_jitter());
        let now = Utc::now();
        assert!(backoff.is_ready(now));

        let delay = backoff.record_failure(now);
        assert_eq!(delay, Duration::from_secs(1));
        assert!(!backoff.is_ready(now));
        assert!(backoff.is_ready(now + chrono::Duration::seconds(1)));

        backoff.record_failure(now);
        assert_eq!(backoff.failures(), 2);
        assert_eq!(backoff.retry_after(), Some(now + chrono::Duration::seconds(2)));

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert!(backoff.is_ready(now));
    }

    #[test]
    fn test_huge_max_delay_is_capped_at_one_day() {
        let config = RetryConfig {
            max_delay_ms: u64::MAX,
            ..RetryConfig::default()
        };
        let one_day = Duration::from_millis(MAX_RETRY_DELAY_MS);
        assert_eq!(config.base_delay(u32::MAX), one_day);
        assert_eq!(config.clone().clamped().max_delay_ms, MAX_RETRY_DELAY_MS);

        let mut backoff = Backoff::new(config);
        let now = Utc::now();
        for _ in 0..100 {
            let delay = backoff.record_failure(now);
            assert!(delay <= one_day.mul_f64(1.21));
        }
        assert!(backoff.retry_after().unwrap() <= now + chrono::Duration::days(2));
    }
}
