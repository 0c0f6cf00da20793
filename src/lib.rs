#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Outbound Guard
//!
//! A resiliency layer between your service and an unreliable upstream HTTP dependency.
//!
//! ## Features
//!
//! - **Admission control**: bounded in-flight requests with a bounded FIFO wait queue
//! - **Circuit breaker** with a single half-open probe, lock-free via atomics
//! - **Micro-cache** with singleflight coalescing and stale-on-error
//! - **Retries** with capped exponential backoff and optional jitter
//! - **Lifecycle events** delivered synchronously to subscribed observers
//! - **Instant-get store**: a background poller with non-blocking reads
//!
//! The network itself is behind the [`Transport`] trait; plug in any
//! `tower::Service<TransportRequest>` with [`ServiceTransport`], or enable the `reqwest`
//! feature for [`transport::ReqwestTransport`].
//!
//! ## Quick Start
//!
//! ```rust
//! use outbound_guard::{
//!     EventName, GuardConfig, HttpResponse, RequestDescriptor, ResilientHttpClient,
//!     ServiceTransport, TransportError, TransportRequest,
//! };
//! use tower::service_fn;
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = ServiceTransport::new(service_fn(|_req: TransportRequest| async {
//!         Ok::<_, TransportError>(HttpResponse::new(200, "hello"))
//!     }));
//!     let client = ResilientHttpClient::new(transport, GuardConfig::default()).unwrap();
//!     client.on(EventName::RequestFailure, |event| eprintln!("{}", event));
//!
//!     let response = client
//!         .request(RequestDescriptor::get("https://upstream.example/greeting"))
//!         .await
//!         .unwrap();
//!     assert_eq!(response.text(), "hello");
//! }
//! ```

pub mod admission;
pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod instant_get;
pub mod jitter;
pub mod microcache;
pub mod prelude;
pub mod retry;
pub mod transport;

// Re-exports
pub use admission::{AdmissionController, AdmissionSlot};
pub use backoff::{BackoffError, BackoffLadder, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitPermit, CircuitState, Outcome};
pub use client::{ClientBuilder, ClientSnapshot, RequestDescriptor, ResilientHttpClient};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{CircuitBreakerConfig, ConfigError, GuardConfig, MicroCacheConfig, RetryConfig};
pub use error::{ErrorKind, FailureReason, GuardError};
pub use events::{EventBus, EventName, EventRecorder, GuardEvent, SubscriptionId};
pub use instant_get::{InstantGetStore, PollOptions, PollerSnapshot, RetryBudget};
pub use jitter::Jitter;
pub use microcache::{cache_key, Delivered, EntryState, MicroCache, ResponseSource};
pub use retry::{
    InstantSleeper, RetryAttempt, RetryExecutor, Sleeper, TokioSleeper, TrackingSleeper,
};
pub use transport::{
    Headers, HttpResponse, Method, ServiceTransport, Transport, TransportError, TransportRequest,
};
