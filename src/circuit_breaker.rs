//! Circuit breaker ("health gate") implemented with lock-free atomics.
//!
//! One breaker guards one client. Callers ask for a [`CircuitPermit`] before touching the
//! upstream and settle the permit with the outcome of their logical attempt.
//!
//! - **Closed**: permits are always granted. `failure_threshold` consecutive failures open
//!   the breaker; any success resets the streak.
//! - **Open**: permits are refused with [`GuardError::CircuitOpen`] until `cooldown` has passed
//!   since the breaker opened. The cooldown is a deadline checked against the [`Clock`] on
//!   each acquire, not a timer.
//! - **HalfOpen**: exactly one probe permit is granted. Its success closes the breaker, its
//!   failure re-opens it and restarts the cooldown. A probe permit dropped without an outcome
//!   frees the slot for the next caller.

use crate::clock::{Clock, MonotonicClock};
use crate::config::{CircuitBreakerConfig, ConfigError};
use crate::error::{FailureReason, GuardError};
use crate::events::{CircuitStateChanged, EventBus, GuardEvent};
use crate::transport::HttpResponse;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the cooldown elapses.
    Open,
    /// One probe call decides between Closed and Open.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_CLOSED => CircuitState::Closed,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

/// Health verdict for one logical attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug)]
struct BreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    probe_in_flight: AtomicBool,
}

/// Circuit breaker shared by every request of one client.
///
/// Clones share the same underlying state via `Arc`.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<BreakerState>,
    config: Arc<CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl CircuitBreaker {
    /// Create a breaker, validating thresholds and cooldown.
    pub fn new(config: CircuitBreakerConfig, events: EventBus) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            state: Arc::new(BreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                probe_in_flight: AtomicBool::new(false),
            }),
            config: Arc::new(config),
            clock: Arc::new(MonotonicClock::default()),
            events,
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// State as last recorded. An elapsed cooldown shows as `Open` until the next acquire.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> usize {
        self.state.failure_count.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask permission to call the upstream.
    ///
    /// # Errors
    /// [`GuardError::CircuitOpen`] while open, or while half-open with the probe taken.
    pub fn acquire(&self) -> Result<CircuitPermit, GuardError> {
        if !self.config.enabled {
            return Ok(self.permit(false));
        }

        loop {
            match self.state() {
                CircuitState::Closed => return Ok(self.permit(false)),
                CircuitState::Open => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                    let cooldown = self.config.cooldown_ms;

                    if elapsed < cooldown {
                        return Err(GuardError::CircuitOpen {
                            failures: self.consecutive_failures(),
                            retry_in: Duration::from_millis(cooldown - elapsed),
                        });
                    }

                    if self
                        .state
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.transitioned(CircuitState::Open, CircuitState::HalfOpen);
                    }
                    // Re-read: either we moved it to half-open or somebody else changed it.
                }
                CircuitState::HalfOpen => {
                    if self
                        .state
                        .probe_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        tracing::debug!("circuit breaker: half-open probe granted");
                        return Ok(self.permit(true));
                    }
                    return Err(GuardError::CircuitOpen {
                        failures: self.consecutive_failures(),
                        retry_in: Duration::ZERO,
                    });
                }
            }
        }
    }

    /// Classify the result of one logical attempt.
    ///
    /// Transient transport failures, timeouts, and configured statuses are failures;
    /// everything else, including ordinary error statuses, is a success.
    pub fn classify(&self, result: &Result<HttpResponse, GuardError>) -> Outcome {
        let failing_status = |status: &u16| self.config.failure_statuses.contains(status);
        let failed = match result {
            Ok(response) => failing_status(&response.status),
            Err(GuardError::Timeout { .. }) => true,
            Err(GuardError::Upstream { reason, .. }) => match reason {
                FailureReason::Transport(e) => e.is_transient(),
                FailureReason::Status(status) => failing_status(status),
                FailureReason::LeaderLost => true,
            },
            Err(_) => false,
        };
        if failed {
            Outcome::Failure
        } else {
            Outcome::Success
        }
    }

    fn permit(&self, probe: bool) -> CircuitPermit {
        CircuitPermit { breaker: self.clone(), probe, settled: false }
    }

    fn on_success(&self, probe: bool) {
        if probe {
            if self
                .state
                .state
                .compare_exchange(
                    STATE_HALF_OPEN,
                    STATE_CLOSED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.state.failure_count.store(0, Ordering::Release);
                self.state.opened_at_millis.store(0, Ordering::Release);
                self.transitioned(CircuitState::HalfOpen, CircuitState::Closed);
            }
            self.state.probe_in_flight.store(false, Ordering::Release);
        } else if self.state() == CircuitState::Closed {
            self.state.failure_count.store(0, Ordering::Release);
        }
    }

    fn on_failure(&self, probe: bool) {
        if probe {
            self.state.failure_count.fetch_add(1, Ordering::AcqRel);
            self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
            if self
                .state
                .state
                .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.transitioned(CircuitState::HalfOpen, CircuitState::Open);
            }
            self.state.probe_in_flight.store(false, Ordering::Release);
            return;
        }

        if self.state() != CircuitState::Closed {
            return;
        }
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.config.failure_threshold {
            return;
        }
        self.state.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
        if self
            .state
            .state
            .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.state.probe_in_flight.store(false, Ordering::Release);
            self.transitioned(CircuitState::Closed, CircuitState::Open);
        }
    }

    fn transitioned(&self, from: CircuitState, to: CircuitState) {
        let failures = self.consecutive_failures();
        match to {
            CircuitState::Open => tracing::warn!(
                failures,
                threshold = self.config.failure_threshold,
                ?from,
                "circuit breaker → open"
            ),
            CircuitState::HalfOpen => tracing::info!("circuit breaker → half-open"),
            CircuitState::Closed => tracing::info!("circuit breaker → closed"),
        }
        self.events.emit(GuardEvent::CircuitStateChanged(CircuitStateChanged { from, to, failures }));
    }
}

/// Permission to make one logical upstream attempt.
///
/// Settle it with [`CircuitPermit::record`]. Dropping an unsettled probe permit frees the
/// half-open slot without changing state.
#[derive(Debug)]
pub struct CircuitPermit {
    breaker: CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CircuitPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record(mut self, outcome: Outcome) {
        self.settled = true;
        if !self.breaker.config.enabled {
            return;
        }
        match outcome {
            Outcome::Success => self.breaker.on_success(self.probe),
            Outcome::Failure => self.breaker.on_failure(self.probe),
        }
    }

    /// Classify `result` with the breaker's rules and record it.
    pub fn record_result(self, result: &Result<HttpResponse, GuardError>) {
        let outcome = self.breaker.classify(result);
        self.record(outcome);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.state.probe_in_flight.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::{EventName, EventRecorder};
    use crate::transport::TransportError;

    fn breaker(threshold: usize, cooldown_ms: u64) -> (CircuitBreaker, ManualClock, EventRecorder) {
        let clock = ManualClock::new();
        let bus = EventBus::new();
        let recorder = EventRecorder::new();
        recorder.attach(&bus);
        let config = CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown_ms,
            ..CircuitBreakerConfig::default()
        };
        let breaker = CircuitBreaker::new(config, bus).unwrap().with_clock(clock.clone());
        (breaker, clock, recorder)
    }

    fn fail(breaker: &CircuitBreaker) {
        breaker.acquire().expect("permit").record(Outcome::Failure);
    }

    #[test]
    fn rejects_invalid_config() {
        let config = CircuitBreakerConfig { failure_threshold: 0, ..Default::default() };
        assert!(CircuitBreaker::new(config, EventBus::new()).is_err());
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let (breaker, _clock, _) = breaker(3, 1_000);
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.acquire().unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err, GuardError::CircuitOpen { failures: 3, retry_in: Duration::from_secs(1) });
    }

    #[test]
    fn success_resets_streak() {
        let (breaker, _clock, _) = breaker(3, 1_000);
        fail(&breaker);
        fail(&breaker);
        breaker.acquire().unwrap().record(Outcome::Success);
        assert_eq!(breaker.consecutive_failures(), 0);
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn single_probe_after_cooldown() {
        let (breaker, clock, _) = breaker(1, 1_000);
        fail(&breaker);
        clock.advance(999);
        assert!(breaker.acquire().is_err());

        clock.advance(1);
        let probe = breaker.acquire().expect("probe");
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.acquire().unwrap_err().is_circuit_open());

        probe.record(Outcome::Success);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.acquire().unwrap().is_probe());
    }

    #[test]
    fn failed_probe_reopens_and_restarts_cooldown() {
        let (breaker, clock, _) = breaker(1, 500);
        fail(&breaker);
        clock.advance(600);
        breaker.acquire().unwrap().record(Outcome::Failure);
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(499);
        assert!(breaker.acquire().is_err());
        clock.advance(1);
        assert!(breaker.acquire().unwrap().is_probe());
    }

    #[test]
    fn dropped_probe_frees_the_slot() {
        let (breaker, clock, _) = breaker(1, 100);
        fail(&breaker);
        clock.advance(100);
        drop(breaker.acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.acquire().unwrap().is_probe());
    }

    #[test]
    fn disabled_breaker_never_opens() {
        let bus = EventBus::new();
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::disabled(), bus).unwrap();
        for _ in 0..100 {
            fail(&breaker);
        }
        assert!(breaker.acquire().is_ok());
    }

    #[test]
    fn transitions_are_emitted() {
        let (breaker, clock, recorder) = breaker(1, 10);
        fail(&breaker);
        clock.advance(10);
        breaker.acquire().unwrap().record(Outcome::Success);

        let transitions: Vec<(CircuitState, CircuitState)> = recorder
            .events()
            .into_iter()
            .filter_map(|e| match e {
                GuardEvent::CircuitStateChanged(c) => Some((c.from, c.to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
        assert_eq!(recorder.count(EventName::CircuitStateChanged), 3);
    }

    #[test]
    fn classification_follows_configured_statuses() {
        let bus = EventBus::new();
        let config =
            CircuitBreakerConfig { failure_statuses: vec![500], ..CircuitBreakerConfig::default() };
        let breaker = CircuitBreaker::new(config, bus).unwrap();

        assert_eq!(breaker.classify(&Ok(HttpResponse::new(500, ""))), Outcome::Failure);
        assert_eq!(breaker.classify(&Ok(HttpResponse::new(404, ""))), Outcome::Success);
        let timeout = GuardError::Upstream {
            attempts: 1,
            reason: FailureReason::Transport(TransportError::Timeout(Duration::from_millis(5))),
        };
        assert_eq!(breaker.classify(&Err(timeout)), Outcome::Failure);
        let other = GuardError::Upstream {
            attempts: 1,
            reason: FailureReason::Transport(TransportError::Other("bad header".into())),
        };
        assert_eq!(breaker.classify(&Err(other)), Outcome::Success);
    }

    #[test]
    fn threads_racing_for_the_probe_get_one_slot() {
        let (breaker, clock, _) = breaker(1, 5);
        fail(&breaker);
        clock.advance(5);

        let permits: Vec<CircuitPermit> = std::thread::scope(|scope| {
            let handles: Vec<_> =
                (0..16).map(|_| scope.spawn(|| breaker.acquire().ok())).collect();
            handles.into_iter().filter_map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(permits.len(), 1);
        assert!(permits[0].is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }
}
