//! Retry executor wrapped around one logical upstream attempt.
//!
//! Semantics:
//! - `max_attempts` counts total tries (initial try + retries).
//! - Each try is bounded by the request's own timeout; an expired try is a transport timeout.
//! - A try is retried when the transport fails transiently (timeout, connect, DNS) or when the
//!   response status is listed in `retry_on_status`.
//! - Delay before retry `i + 1` is `min(base * 2^i, max)` (0-based `i`), then jittered within
//!   `[0, delay]`. The [`Sleeper`] decides how the delay is spent.
//! - Exhausting all tries yields [`GuardError::Upstream`] carrying the last reason. A
//!   non-transient transport error stops immediately. A non-retryable status is an ordinary
//!   response and is returned as-is.
//!
//! Invariants:
//! - The transport is called at most `max_attempts` times.
//! - `on_retry` runs once per retry, before the delay, never after the final try.

use crate::backoff::ExponentialBackoff;
use crate::clock::ManualClock;
use crate::config::{ConfigError, RetryConfig};
use crate::error::{FailureReason, GuardError};
use crate::jitter::Jitter;
use crate::transport::{HttpResponse, Transport, TransportError, TransportRequest};
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// How the executor waits out a backoff delay.
pub trait Sleeper: Send + Sync + fmt::Debug {
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()>;
}

/// Waits on tokio's timer, so paused test time applies.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(delay).boxed()
    }
}

/// Skips every delay.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _delay: Duration) -> BoxFuture<'static, ()> {
        futures::future::ready(()).boxed()
    }
}

/// Records backoff delays instead of waiting them out. Clones share the record.
///
/// Built with [`advancing`](Self::advancing), it also moves a [`ManualClock`] forward by each
/// delay, so cache ages and breaker cooldowns see the time a retry sequence would have taken.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
    clock: Option<ManualClock>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advancing(clock: ManualClock) -> Self {
        Self { delays: Arc::default(), clock: Some(clock) }
    }

    /// Every delay requested so far, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn total(&self) -> Duration {
        self.delays().iter().sum()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        self.delays.lock().unwrap_or_else(PoisonError::into_inner).push(delay);
        if let Some(clock) = &self.clock {
            clock.advance(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        }
        futures::future::ready(()).boxed()
    }
}

/// Details of one upcoming retry, handed to the retry callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based index of the try that just failed.
    pub attempt: usize,
    pub max_attempts: usize,
    pub reason: FailureReason,
    pub delay: Duration,
}

/// Retry policy combining backoff, jitter, a retryable-status list, and a sleeper.
#[derive(Clone)]
pub struct RetryExecutor {
    max_attempts: usize,
    backoff: ExponentialBackoff,
    jitter: Jitter,
    retry_on_status: Arc<[u16]>,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("retry_on_status", &self.retry_on_status)
            .field("sleeper", &"<sleeper>")
            .finish()
    }
}

impl RetryExecutor {
    pub fn from_config(config: &RetryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            max_attempts: config.max_attempts,
            backoff: config.backoff()?,
            jitter: config.jitter,
            retry_on_status: config.retry_on_status.clone().into(),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// One try, no status-based retries. Transport errors still map to `Upstream`.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            backoff: ExponentialBackoff::default(),
            jitter: Jitter::None,
            retry_on_status: Arc::from(Vec::new()),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub(crate) fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn retryable_status(&self, status: u16) -> bool {
        self.retry_on_status.contains(&status)
    }

    /// Run `request` against `transport` with retries.
    pub async fn execute<T, F>(
        &self,
        transport: &T,
        request: &TransportRequest,
        mut on_retry: F,
    ) -> Result<HttpResponse, GuardError>
    where
        T: Transport + ?Sized,
        F: FnMut(&RetryAttempt) + Send,
    {
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(
                request.timeout,
                transport.perform(request.clone()),
            )
            .await
            {
                Ok(result) => result,
                Err(_elapsed) => Err(TransportError::Timeout(request.timeout)),
            };

            let reason = match outcome {
                Ok(response) if self.retryable_status(response.status) => {
                    FailureReason::Status(response.status)
                }
                Ok(response) => return Ok(response),
                Err(err) if err.is_transient() => FailureReason::Transport(err),
                Err(err) => {
                    return Err(GuardError::Upstream {
                        attempts: attempt + 1,
                        reason: FailureReason::Transport(err),
                    })
                }
            };

            if attempt + 1 >= self.max_attempts {
                tracing::debug!(url = %request.url, attempts = self.max_attempts, %reason, "retries exhausted");
                return Err(GuardError::Upstream { attempts: self.max_attempts, reason });
            }

            let delay = self.jitter.apply(self.backoff.delay(attempt));
            tracing::debug!(
                url = %request.url,
                attempt = attempt + 1,
                max_attempts = self.max_attempts,
                %reason,
                ?delay,
                "retrying upstream call"
            );
            on_retry(&RetryAttempt {
                attempt: attempt + 1,
                max_attempts: self.max_attempts,
                reason,
                delay,
            });
            self.sleeper.sleep(delay).await;
            attempt += 1;
        }
    }
}
