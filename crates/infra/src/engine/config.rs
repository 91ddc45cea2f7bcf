//! Engine configuration and retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_BATCH_SIZE: &str = "PROJECTION_BATCH_SIZE";
pub const ENV_BATCH_TIMEOUT_MS: &str = "PROJECTION_BATCH_TIMEOUT_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "PROJECTION_POLL_INTERVAL_MS";
/// Retries after the first attempt, so `max_attempts` is this plus one.
pub const ENV_MAX_RETRIES: &str = "PROJECTION_MAX_RETRIES";
pub const ENV_RETRY_BASE_DELAY_MS: &str = "PROJECTION_RETRY_BASE_DELAY_MS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key}={value}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one (0 and 1 both mean "no retry")
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow((attempt - 1).min(31));
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };
        delay.min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Configuration of one projection engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum events read and committed per transaction.
    pub batch_size: usize,
    /// Time budget for reducing one batch; staged work is committed early when
    /// it runs out.
    pub batch_timeout: Duration,
    /// Fallback wake-up when the source does not signal new events.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            batch_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_timeout(mut self, batch_timeout: Duration) -> Self {
        self.batch_timeout = batch_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Defaults overridden by `PROJECTION_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(size) = parse_u64(&lookup, ENV_BATCH_SIZE)? {
            config.batch_size = usize::try_from(size)
                .map_err(|_| ConfigError::invalid(ENV_BATCH_SIZE, size.to_string(), "too large"))?;
        }
        if let Some(ms) = parse_u64(&lookup, ENV_BATCH_TIMEOUT_MS)? {
            config.batch_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, ENV_POLL_INTERVAL_MS)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        // Retries come on top of the first attempt.
        if let Some(retries) = parse_u64(&lookup, ENV_MAX_RETRIES)? {
            config.retry.max_attempts = u32::try_from(retries)
                .ok()
                .and_then(|retries| retries.checked_add(1))
                .ok_or_else(|| {
                    ConfigError::invalid(ENV_MAX_RETRIES, retries.to_string(), "too large")
                })?;
        }
        if let Some(ms) = parse_u64(&lookup, ENV_RETRY_BASE_DELAY_MS)? {
            config.retry.base_delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid(ENV_BATCH_SIZE, "0", "must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid(
                ENV_POLL_INTERVAL_MS,
                "0",
                "must be at least 1ms",
            ));
        }
        Ok(())
    }
}

fn parse_u64<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, raw.clone(), e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn unset_keys_keep_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn env_values_override_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_BATCH_SIZE, "50"),
            (ENV_BATCH_TIMEOUT_MS, "250"),
            (ENV_POLL_INTERVAL_MS, " 20 "),
            (ENV_MAX_RETRIES, "3"),
            (ENV_RETRY_BASE_DELAY_MS, "5"),
        ]))
        .unwrap();

        assert_eq!(config.batch_size, 50);
        assert_eq!(config.batch_timeout, Duration::from_millis(250));
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.base_delay, Duration::from_millis(5));
    }

    #[test]
    fn max_retries_counts_retries_after_the_first_attempt() {
        let none = EngineConfig::from_lookup(lookup(&[(ENV_MAX_RETRIES, "0")])).unwrap();
        assert_eq!(none.retry.max_attempts, 1);
        assert!(!none.retry.should_retry(1));

        let three = EngineConfig::from_lookup(lookup(&[(ENV_MAX_RETRIES, "3")])).unwrap();
        assert!(three.retry.should_retry(3));
        assert!(!three.retry.should_retry(4));

        let too_many = u32::MAX.to_string();
        let err = EngineConfig::from_lookup(lookup(&[(ENV_MAX_RETRIES, too_many.as_str())]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_MAX_RETRIES, .. }));
    }

    #[test]
    fn malformed_and_zero_values_are_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[(ENV_BATCH_SIZE, "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_BATCH_SIZE, .. }));

        let err = EngineConfig::from_lookup(lookup(&[(ENV_BATCH_SIZE, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_BATCH_SIZE, .. }));
    }

    #[test]
    fn backoff_strategies_are_capped() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));

        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            ..policy.clone()
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));

        let fixed = RetryPolicy::fixed(3, Duration::from_millis(10));
        assert_eq!(fixed.delay_for_attempt(7), Duration::from_millis(10));
        assert!(fixed.should_retry(2));
        assert!(!fixed.should_retry(3));
    }

    #[test]
    fn config_round_trips_through_json_with_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"batch_size": 10}"#).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.retry, RetryPolicy::default());
    }
}
