//! Lifecycle events and the synchronous event bus.
//!
//! The bus is an explicit subscriber list owned by one client. [`EventBus::emit`] calls every
//! matching handler inline, in subscription order. Delivery is best-effort: a panicking handler
//! is logged and skipped, and the request pipeline carries on.
//!
//! # Event names
//!
//! | name                        | payload                  |
//! |-----------------------------|--------------------------|
//! | `request:start`             | [`RequestStart`]         |
//! | `request:success`           | [`RequestSuccess`]       |
//! | `request:failure`           | [`RequestFailure`]       |
//! | `request:rejected`          | [`RequestRejected`]      |
//! | `microcache:retry`          | [`MicrocacheRetry`]      |
//! | `microcache:refresh_failed` | [`RefreshFailed`]        |
//! | `circuit:state_changed`     | [`CircuitStateChanged`]  |
//!
//! ```rust
//! use outbound_guard::events::{EventBus, EventName, GuardEvent};
//!
//! let bus = EventBus::new();
//! bus.on(EventName::RequestFailure, |event: &GuardEvent| {
//!     if let GuardEvent::RequestFailure(failure) = event {
//!         eprintln!("request {} failed: {}", failure.request_id, failure.kind);
//!     }
//! });
//! ```

use crate::circuit_breaker::CircuitState;
use crate::error::{ErrorKind, GuardError};
use crate::microcache::ResponseSource;
use crate::transport::Method;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Names observers subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    RequestStart,
    RequestSuccess,
    RequestFailure,
    RequestRejected,
    MicrocacheRetry,
    MicrocacheRefreshFailed,
    CircuitStateChanged,
}

impl EventName {
    pub const ALL: [EventName; 7] = [
        EventName::RequestStart,
        EventName::RequestSuccess,
        EventName::RequestFailure,
        EventName::RequestRejected,
        EventName::MicrocacheRetry,
        EventName::MicrocacheRefreshFailed,
        EventName::CircuitStateChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::RequestStart => "request:start",
            EventName::RequestSuccess => "request:success",
            EventName::RequestFailure => "request:failure",
            EventName::RequestRejected => "request:rejected",
            EventName::MicrocacheRetry => "microcache:retry",
            EventName::MicrocacheRefreshFailed => "microcache:refresh_failed",
            EventName::CircuitStateChanged => "circuit:state_changed",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an event name nobody emits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event name: {0}")]
pub struct UnknownEvent(pub String);

impl FromStr for EventName {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownEvent(s.to_string()))
    }
}

/// A caller request entered the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestStart {
    pub request_id: u64,
    pub method: Method,
    pub url: String,
    pub probe: bool,
}

/// A caller request resolved with a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSuccess {
    pub request_id: u64,
    pub status: u16,
    pub duration: Duration,
    pub source: ResponseSource,
}

/// A caller request resolved with an error after admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFailure {
    pub request_id: u64,
    pub kind: ErrorKind,
    pub error: GuardError,
    pub duration: Duration,
}

/// A caller request never got an admission slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRejected {
    pub request_id: u64,
    pub kind: ErrorKind,
    pub error: GuardError,
    pub waited: Duration,
}

/// A leader is about to retry its upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicrocacheRetry {
    pub request_id: u64,
    pub key: String,
    pub url: String,
    /// 1-based index of the attempt that just failed.
    pub attempt: usize,
    pub max_attempts: usize,
    pub reason: String,
    pub delay: Duration,
}

/// A leader's refresh failed for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshFailed {
    pub request_id: u64,
    pub key: String,
    pub url: String,
    pub error: GuardError,
    /// `true` when waiters were served the stale value instead.
    pub served_stale: bool,
}

/// The circuit breaker moved between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitStateChanged {
    pub from: CircuitState,
    pub to: CircuitState,
    pub failures: usize,
}

/// Every event the guard emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardEvent {
    RequestStart(RequestStart),
    RequestSuccess(RequestSuccess),
    RequestFailure(RequestFailure),
    RequestRejected(RequestRejected),
    MicrocacheRetry(MicrocacheRetry),
    RefreshFailed(RefreshFailed),
    CircuitStateChanged(CircuitStateChanged),
}

impl GuardEvent {
    pub fn name(&self) -> EventName {
        match self {
            GuardEvent::RequestStart(_) => EventName::RequestStart,
            GuardEvent::RequestSuccess(_) => EventName::RequestSuccess,
            GuardEvent::RequestFailure(_) => EventName::RequestFailure,
            GuardEvent::RequestRejected(_) => EventName::RequestRejected,
            GuardEvent::MicrocacheRetry(_) => EventName::MicrocacheRetry,
            GuardEvent::RefreshFailed(_) => EventName::MicrocacheRefreshFailed,
            GuardEvent::CircuitStateChanged(_) => EventName::CircuitStateChanged,
        }
    }

    /// Request the event belongs to; breaker transitions belong to none.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            GuardEvent::RequestStart(e) => Some(e.request_id),
            GuardEvent::RequestSuccess(e) => Some(e.request_id),
            GuardEvent::RequestFailure(e) => Some(e.request_id),
            GuardEvent::RequestRejected(e) => Some(e.request_id),
            GuardEvent::MicrocacheRetry(e) => Some(e.request_id),
            GuardEvent::RefreshFailed(e) => Some(e.request_id),
            GuardEvent::CircuitStateChanged(_) => None,
        }
    }

    /// `true` for the three events that end a caller request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GuardEvent::RequestSuccess(_)
                | GuardEvent::RequestFailure(_)
                | GuardEvent::RequestRejected(_)
        )
    }
}

impl fmt::Display for GuardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardEvent::RequestStart(e) => {
                write!(f, "{}(#{}, {} {})", self.name(), e.request_id, e.method, e.url)
            }
            GuardEvent::RequestSuccess(e) => write!(
                f,
                "{}(#{}, status={}, source={:?}, duration={:?})",
                self.name(),
                e.request_id,
                e.status,
                e.source,
                e.duration
            ),
            GuardEvent::RequestFailure(e) => write!(
                f,
                "{}(#{}, {}, duration={:?})",
                self.name(),
                e.request_id,
                e.kind,
                e.duration
            ),
            GuardEvent::RequestRejected(e) => {
                write!(f, "{}(#{}, {}, waited={:?})", self.name(), e.request_id, e.kind, e.waited)
            }
            GuardEvent::MicrocacheRetry(e) => write!(
                f,
                "{}(#{}, {}/{}, reason={}, delay={:?})",
                self.name(),
                e.request_id,
                e.attempt,
                e.max_attempts,
                e.reason,
                e.delay
            ),
            GuardEvent::RefreshFailed(e) => write!(
                f,
                "{}(#{}, key={}, {}, stale={})",
                self.name(),
                e.request_id,
                e.key,
                e.error.kind(),
                e.served_stale
            ),
            GuardEvent::CircuitStateChanged(e) => {
                write!(f, "{}({:?} -> {:?}, failures={})", self.name(), e.from, e.to, e.failures)
            }
        }
    }
}

type Handler = Arc<dyn Fn(&GuardEvent) + Send + Sync>;

/// Handle returned by subscriptions, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    filter: Option<EventName>,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<Subscriber>>,
}

/// Observer registry scoped to one client. Clones share the same subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").field("subscribers", &self.subscriber_count()).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event name.
    pub fn on<F>(&self, name: EventName, handler: F) -> SubscriptionId
    where
        F: Fn(&GuardEvent) + Send + Sync + 'static,
    {
        self.add(Some(name), Arc::new(handler))
    }

    /// Subscribe to every event.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&GuardEvent) + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscribers =
            self.inner.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Log every event through `tracing` at INFO level.
    pub fn log_to_tracing(&self) -> SubscriptionId {
        self.subscribe_all(|event| tracing::info!(event = %event, "guard_event"))
    }

    /// Deliver `event` to every matching handler, inline.
    pub fn emit(&self, event: GuardEvent) {
        tracing::trace!(event = %event, "emit");
        let name = event.name();
        let handlers: Vec<Handler> = {
            let subscribers =
                self.inner.subscribers.read().unwrap_or_else(PoisonError::into_inner);
            subscribers
                .iter()
                .filter(|s| s.filter.is_none() || s.filter == Some(name))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::warn!(event = name.as_str(), "event handler panicked; skipping it");
            }
        }
    }

    fn add(&self, filter: Option<EventName>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { id, filter, handler });
        id
    }
}

/// Records every event in memory. Useful for tests and debugging.
#[derive(Debug, Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<GuardEvent>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start recording everything `bus` emits.
    pub fn attach(&self, bus: &EventBus) -> SubscriptionId {
        let events = Arc::clone(&self.events);
        bus.subscribe_all(move |event| {
            events.lock().unwrap_or_else(PoisonError::into_inner).push(event.clone());
        })
    }

    pub fn events(&self) -> Vec<GuardEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self, name: EventName) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    /// Terminal events recorded for one request id.
    pub fn terminal_for(&self, request_id: u64) -> Vec<GuardEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.is_terminal() && e.request_id() == Some(request_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
