//! Client configuration.
//!
//! All knobs are plain data with sensible defaults; build a config with struct-update syntax
//! and let [`GuardConfig::validate`] (called by the client constructor) reject nonsense.
//!
//! ```rust
//! use outbound_guard::config::{GuardConfig, MicroCacheConfig};
//!
//! let config = GuardConfig {
//!     max_in_flight: 2,
//!     max_queue: 5,
//!     enqueue_timeout_ms: 200,
//!     micro_cache: MicroCacheConfig::disabled(),
//!     ..GuardConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! With the `serde` feature every struct deserializes with per-field defaults, and
//! [`GuardConfig::from_json_str`] parses and validates in one step.

use crate::backoff::{BackoffError, ExponentialBackoff};
use crate::jitter::Jitter;
use std::time::Duration;

/// Errors produced when validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_in_flight must be > 0")]
    ZeroMaxInFlight,
    #[error("request_timeout_ms must be > 0")]
    ZeroRequestTimeout,
    #[error("circuit_breaker.failure_threshold must be > 0 (got {0})")]
    InvalidFailureThreshold(usize),
    #[error("circuit_breaker.cooldown_ms must be > 0 when the breaker is enabled")]
    ZeroCooldown,
    #[error("micro_cache.max_entries must be > 0 when the cache is enabled")]
    ZeroMaxEntries,
    #[error("micro_cache.follower_timeout_ms must be > 0 when the cache is enabled")]
    ZeroFollowerTimeout,
    #[error("retry.max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
    #[error("invalid retry backoff: {0}")]
    Backoff(#[from] BackoffError),
    #[error("could not parse configuration: {0}")]
    Parse(String),
}

/// Top-level configuration of a [`ResilientHttpClient`](crate::ResilientHttpClient).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GuardConfig {
    /// Requests allowed to execute at once.
    pub max_in_flight: usize,
    /// Requests allowed to wait for a slot; beyond this they are rejected.
    pub max_queue: usize,
    /// How long a queued request waits for a slot.
    pub enqueue_timeout_ms: u64,
    /// Deadline for one request once admitted (per transport attempt as well).
    pub request_timeout_ms: u64,
    pub circuit_breaker: CircuitBreakerConfig,
    pub micro_cache: MicroCacheConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10,
            max_queue: 100,
            enqueue_timeout_ms: 1_000,
            request_timeout_ms: 5_000,
            circuit_breaker: CircuitBreakerConfig::default(),
            micro_cache: MicroCacheConfig::default(),
        }
    }
}

impl GuardConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::ZeroMaxInFlight);
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ZeroRequestTimeout);
        }
        self.circuit_breaker.validate()?;
        self.micro_cache.validate()
    }

    /// Parse a JSON document and validate it. Missing fields take their defaults.
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Circuit breaker ("health gate") settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures that open the breaker.
    pub failure_threshold: usize,
    /// Time spent OPEN before a probe is allowed.
    pub cooldown_ms: u64,
    /// Response statuses counted as failures in addition to transport errors.
    pub failure_statuses: Vec<u16>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { enabled: true, failure_threshold: 3, cooldown_ms: 1_000, failure_statuses: vec![] }
    }
}

impl CircuitBreakerConfig {
    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold(0));
        }
        if self.cooldown_ms == 0 {
            return Err(ConfigError::ZeroCooldown);
        }
        Ok(())
    }
}

/// Micro-cache and singleflight settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MicroCacheConfig {
    pub enabled: bool,
    /// Window in which a stored response is served without an upstream call.
    pub ttl_ms: u64,
    /// Extra window after `ttl_ms` in which a stored response may replace a failed refresh.
    pub max_stale_ms: u64,
    pub max_entries: usize,
    /// Followers allowed to wait on one in-flight refresh.
    pub max_waiters: usize,
    pub follower_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for MicroCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 1_000,
            max_stale_ms: 5_000,
            max_entries: 500,
            max_waiters: 1_000,
            follower_timeout_ms: 5_000,
            retry: RetryConfig::default(),
        }
    }
}

impl MicroCacheConfig {
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn max_stale(&self) -> Duration {
        Duration::from_millis(self.max_stale_ms)
    }

    pub fn follower_timeout(&self) -> Duration {
        Duration::from_millis(self.follower_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        if !self.enabled {
            return Ok(());
        }
        if self.max_entries == 0 {
            return Err(ConfigError::ZeroMaxEntries);
        }
        if self.follower_timeout_ms == 0 {
            return Err(ConfigError::ZeroFollowerTimeout);
        }
        Ok(())
    }
}

/// Leader retry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetryConfig {
    /// Total tries, including the first.
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub retry_on_status: Vec<u16>,
    pub jitter: Jitter,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
            retry_on_status: vec![502, 503, 504],
            jitter: Jitter::None,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    pub fn backoff(&self) -> Result<ExponentialBackoff, BackoffError> {
        ExponentialBackoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(0));
        }
        self.backoff()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(GuardConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_zero_in_flight() {
        let config = GuardConfig { max_in_flight: 0, ..GuardConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::ZeroMaxInFlight));
    }

    #[test]
    fn disabled_breaker_skips_threshold_checks() {
        let mut breaker = CircuitBreakerConfig::disabled();
        breaker.failure_threshold = 0;
        assert_eq!(breaker.validate(), Ok(()));

        breaker.enabled = true;
        assert_eq!(breaker.validate(), Err(ConfigError::InvalidFailureThreshold(0)));
    }

    #[test]
    fn retry_bounds_are_checked_even_with_cache_disabled() {
        let mut cache = MicroCacheConfig::disabled();
        cache.retry.base_delay_ms = 500;
        cache.retry.max_delay_ms = 100;
        assert!(matches!(cache.validate(), Err(ConfigError::Backoff(_))));

        cache.retry = RetryConfig { max_attempts: 0, ..RetryConfig::default() };
        assert_eq!(cache.validate(), Err(ConfigError::InvalidMaxAttempts(0)));
    }

    #[test]
    fn enabled_cache_needs_entries_and_follower_timeout() {
        let cache = MicroCacheConfig { max_entries: 0, ..MicroCacheConfig::default() };
        assert_eq!(cache.validate(), Err(ConfigError::ZeroMaxEntries));

        let cache = MicroCacheConfig { follower_timeout_ms: 0, ..MicroCacheConfig::default() };
        assert_eq!(cache.validate(), Err(ConfigError::ZeroFollowerTimeout));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn parses_partial_json_with_defaults() {
        let config = GuardConfig::from_json_str(
            r#"{
                "max_in_flight": 2,
                "micro_cache": { "ttl_ms": 0, "retry": { "retry_on_status": [503] } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.max_in_flight, 2);
        assert_eq!(config.max_queue, 100);
        assert_eq!(config.micro_cache.ttl_ms, 0);
        assert_eq!(config.micro_cache.retry.retry_on_status, vec![503]);
        assert_eq!(config.micro_cache.retry.max_attempts, 3);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_is_validated() {
        let err = GuardConfig::from_json_str(r#"{ "max_in_flight": 0 }"#).unwrap_err();
        assert_eq!(err, ConfigError::ZeroMaxInFlight);
        assert!(matches!(GuardConfig::from_json_str("{"), Err(ConfigError::Parse(_))));
    }
}
