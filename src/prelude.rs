//! Convenient re-exports for common outbound-guard types.
pub use crate::{
    client::{ClientSnapshot, RequestDescriptor, ResilientHttpClient},
    config::{CircuitBreakerConfig, GuardConfig, MicroCacheConfig, RetryConfig},
    error::{ErrorKind, GuardError},
    events::{EventName, GuardEvent},
    instant_get::{InstantGetStore, PollOptions, RetryBudget},
    jitter::Jitter,
    microcache::ResponseSource,
    transport::{HttpResponse, Method, Transport, TransportError, TransportRequest},
};
