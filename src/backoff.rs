//! Backoff computations for the retry executor and the instant-get poller.
//!
//! Both strategies are pure functions of an index; neither keeps a hidden counter.
//!
//! - [`ExponentialBackoff`]: the delay between attempt `i` and `i + 1` (0-based) is
//!   `min(base * 2^i, max)`.
//! - [`BackoffLadder`]: fixed steps indexed by the error streak, capped at the last step.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use outbound_guard::backoff::{BackoffLadder, ExponentialBackoff};
//!
//! let backoff = ExponentialBackoff::new(Duration::from_millis(50), Duration::from_secs(1)).unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(50));
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(10), Duration::from_secs(1)); // capped
//!
//! let ladder = BackoffLadder::default();
//! assert_eq!(ladder.delay(1), Duration::from_secs(1));
//! assert_eq!(ladder.delay(99), Duration::from_secs(60));
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `MAX_BACKOFF` (1 day).

use std::fmt;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
    EmptyLadder,
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
            BackoffError::EmptyLadder => write!(f, "backoff ladder needs at least one step"),
        }
    }
}

impl std::error::Error for BackoffError {}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Returns an error if `max` is zero or smaller than `base`.
    pub fn new(base: Duration, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < base {
            return Err(BackoffError::MaxLessThanBase { base, max });
        }
        Ok(Self { base, max })
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay to wait after the failed attempt `attempt` (0-based) before the next one.
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let exp_delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        exp_delay.min(self.max).min(MAX_BACKOFF)
    }
}

impl Default for ExponentialBackoff {
    /// 50ms doubling up to 1s.
    fn default() -> Self {
        Self { base: Duration::from_millis(50), max: Duration::from_secs(1) }
    }
}

/// Fixed backoff steps indexed by a consecutive-error streak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffLadder {
    steps: Vec<Duration>,
}

impl BackoffLadder {
    pub fn new(steps: Vec<Duration>) -> Result<Self, BackoffError> {
        if steps.is_empty() {
            return Err(BackoffError::EmptyLadder);
        }
        Ok(Self { steps })
    }

    /// Delay after `streak` consecutive errors. A streak of 0 or 1 maps to the first step.
    pub fn delay(&self, streak: usize) -> Duration {
        let idx = streak.saturating_sub(1).min(self.steps.len() - 1);
        self.steps[idx]
    }

    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }
}

impl Default for BackoffLadder {
    /// 1s, 5s, 10s, 30s, 60s.
    fn default() -> Self {
        Self {
            steps: [1, 5, 10, 30, 60].into_iter().map(Duration::from_secs).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn exponential_doubles_from_base() {
        let backoff = ExponentialBackoff::new(ms(100), Duration::from_secs(60)).unwrap();
        assert_eq!(backoff.delay(0), ms(100));
        assert_eq!(backoff.delay(1), ms(200));
        assert_eq!(backoff.delay(2), ms(400));
        assert_eq!(backoff.delay(3), ms(800));
    }

    #[test]
    fn exponential_respects_max() {
        let backoff = ExponentialBackoff::new(ms(50), ms(1000)).unwrap();
        assert_eq!(backoff.delay(4), ms(800));
        assert_eq!(backoff.delay(5), ms(1000));
        assert_eq!(backoff.delay(40), ms(1000));
    }

    #[test]
    fn exponential_saturates_on_huge_attempts() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::MAX).unwrap();
        assert_eq!(backoff.delay(1_000_000_000), MAX_BACKOFF);
    }

    #[test]
    fn zero_base_stays_zero() {
        let backoff = ExponentialBackoff::new(Duration::ZERO, ms(10)).unwrap();
        assert_eq!(backoff.delay(7), Duration::ZERO);
    }

    #[test]
    fn invalid_bounds_are_rejected() {
        assert_eq!(
            ExponentialBackoff::new(ms(10), Duration::ZERO),
            Err(BackoffError::MaxMustBePositive)
        );
        assert!(matches!(
            ExponentialBackoff::new(ms(100), ms(50)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
        assert_eq!(BackoffLadder::new(vec![]), Err(BackoffError::EmptyLadder));
    }

    #[test]
    fn ladder_climbs_then_caps() {
        let ladder = BackoffLadder::default();
        let secs: Vec<u64> = (1..=7).map(|s| ladder.delay(s).as_secs()).collect();
        assert_eq!(secs, vec![1, 5, 10, 30, 60, 60, 60]);
        assert_eq!(ladder.delay(0), Duration::from_secs(1));
    }
}
