//! The request-dispatch pipeline.
//!
//! ```text
//! request ─▶ admission ─▶ circuit breaker ─▶ micro-cache / singleflight ─▶ retry ─▶ transport
//!               │               │                       │
//!          rejected       circuit open            hit / follow
//! ```
//!
//! Every caller request gets a monotonic id, emits `request:start`, and ends with exactly one
//! of `request:success`, `request:failure`, or `request:rejected`. GET and HEAD go through the
//! micro-cache when it is enabled; other methods (or all methods with the cache disabled) call
//! the transport directly, retrying only idempotent methods.

use crate::admission::{AdmissionController, AdmissionSlot};
use crate::circuit_breaker::{CircuitBreaker, CircuitPermit, CircuitState, Outcome};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{ConfigError, GuardConfig};
use crate::error::GuardError;
use crate::events::{
    EventBus, EventName, GuardEvent, MicrocacheRetry, RequestFailure, RequestStart,
    RequestSuccess, SubscriptionId,
};
use crate::microcache::{cache_key, Delivered, MicroCache, Refresh, ResponseSource};
use crate::retry::{RetryExecutor, Sleeper, TokioSleeper};
use crate::transport::{Headers, HttpResponse, Method, Transport, TransportRequest};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::Instant;
use tower_service::Service;

/// One outbound request as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
    /// Overrides the client's `request_timeout_ms` for this request.
    pub timeout: Option<Duration>,
    /// Overrides the derived cache key.
    pub cache_key: Option<String>,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Headers::new(),
            body: None,
            timeout: None,
            cache_key: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new(Method::Head, url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new(Method::Post, url).with_body(body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Explicit key if one was given, otherwise method + normalized URL.
    pub fn key(&self) -> String {
        self.cache_key.clone().unwrap_or_else(|| cache_key(self.method, &self.url))
    }

    fn transport_request(&self, timeout: Duration) -> TransportRequest {
        TransportRequest {
            method: self.method,
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            timeout,
        }
    }
}

/// Point-in-time diagnostics. Reading it has no side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ClientSnapshot {
    pub circuit_state: CircuitState,
    pub consecutive_failures: usize,
    pub in_flight: usize,
    pub queued: usize,
    pub cache_size: usize,
    pub requests_started: u64,
}

struct Inner {
    config: GuardConfig,
    transport: Arc<dyn Transport>,
    admission: AdmissionController,
    breaker: CircuitBreaker,
    cache: Option<MicroCache>,
    direct_retry: RetryExecutor,
    single_attempt: RetryExecutor,
    events: EventBus,
    next_id: AtomicU64,
}

/// Guarded HTTP client. Cheap to clone; clones share every component.
#[derive(Clone)]
pub struct ResilientHttpClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ResilientHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientHttpClient")
            .field("config", &self.inner.config)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Builder for [`ResilientHttpClient`].
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    config: GuardConfig,
    events: EventBus,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl ClientBuilder {
    pub fn config(mut self, config: GuardConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing event bus instead of creating one.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Clock used for breaker cooldown and cache ages.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sleeper used between retries.
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Validate the configuration and assemble the pipeline.
    pub fn build(self) -> Result<ResilientHttpClient, ConfigError> {
        let config = self.config;
        config.validate()?;

        let breaker = CircuitBreaker::new(config.circuit_breaker.clone(), self.events.clone())?
            .with_shared_clock(Arc::clone(&self.clock));
        let admission = AdmissionController::new(
            config.max_in_flight,
            config.max_queue,
            config.enqueue_timeout(),
            self.events.clone(),
        );
        let direct_retry = RetryExecutor::from_config(&config.micro_cache.retry)?
            .with_shared_sleeper(Arc::clone(&self.sleeper));
        let cache = if config.micro_cache.enabled {
            Some(
                MicroCache::new(config.micro_cache.clone(), self.events.clone())?
                    .with_shared_clock(Arc::clone(&self.clock))
                    .with_retry(direct_retry.clone()),
            )
        } else {
            None
        };

        tracing::debug!(
            max_in_flight = config.max_in_flight,
            max_queue = config.max_queue,
            cache = config.micro_cache.enabled,
            breaker = config.circuit_breaker.enabled,
            "outbound guard ready"
        );

        Ok(ResilientHttpClient {
            inner: Arc::new(Inner {
                config,
                transport: self.transport,
                admission,
                breaker,
                cache,
                direct_retry,
                single_attempt: RetryExecutor::single_attempt(),
                events: self.events,
                next_id: AtomicU64::new(0),
            }),
        })
    }
}

/// Records a failure if the direct call is dropped before it settles (caller timeout).
struct Unsettled(Option<CircuitPermit>);

impl Drop for Unsettled {
    fn drop(&mut self) {
        if let Some(permit) = self.0.take() {
            permit.record(Outcome::Failure);
        }
    }
}

impl ResilientHttpClient {
    pub fn new<T: Transport + 'static>(
        transport: T,
        config: GuardConfig,
    ) -> Result<Self, ConfigError> {
        Self::builder(transport).config(config).build()
    }

    pub fn builder<T: Transport + 'static>(transport: T) -> ClientBuilder {
        ClientBuilder {
            transport: Arc::new(transport),
            config: GuardConfig::default(),
            events: EventBus::new(),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Subscribe to one event. See [`EventBus::on`].
    pub fn on<F>(&self, name: EventName, handler: F) -> SubscriptionId
    where
        F: Fn(&GuardEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(name, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.events.off(id)
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        let inner = &self.inner;
        ClientSnapshot {
            circuit_state: inner.breaker.state(),
            consecutive_failures: inner.breaker.consecutive_failures(),
            in_flight: inner.admission.in_flight(),
            queued: inner.admission.queued(),
            cache_size: inner.cache.as_ref().map_or(0, MicroCache::len),
            requests_started: inner.next_id.load(Ordering::Acquire),
        }
    }

    /// Perform `descriptor` through the whole pipeline.
    ///
    /// # Errors
    /// Any [`GuardError`]; each one has already been reported on the event bus.
    pub async fn request(&self, descriptor: RequestDescriptor) -> Result<HttpResponse, GuardError> {
        self.send(descriptor).await.map(|delivered| delivered.response)
    }

    /// GET `url` with default headers and timeout.
    pub async fn get(&self, url: impl Into<String>) -> Result<HttpResponse, GuardError> {
        self.request(RequestDescriptor::get(url)).await
    }

    /// Like [`request`](Self::request), also telling where the response came from.
    pub async fn send(&self, descriptor: RequestDescriptor) -> Result<Delivered, GuardError> {
        let inner = &self.inner;
        let request_id = self.start(&descriptor, false);
        let started = Instant::now();

        let slot = inner.admission.admit(request_id).await?;
        let timeout = descriptor.timeout.unwrap_or_else(|| inner.config.request_timeout());
        let admitted = Instant::now();
        let result =
            tokio::time::timeout(timeout, self.dispatch(request_id, &descriptor, slot, timeout))
                .await;
        self.finish(request_id, started, within_deadline(result, admitted, timeout))
    }

    /// Send one request straight to the transport to test a recovering upstream.
    ///
    /// Probes wait for an in-flight slot without queue limits, skip the micro-cache and
    /// retries, and settle the breaker with their outcome. The request timeout covers the
    /// slot wait as well as the call. While the breaker is open and the
    /// cooldown has not elapsed, a probe fails fast like any other request.
    pub async fn probe(&self, descriptor: RequestDescriptor) -> Result<HttpResponse, GuardError> {
        let inner = &self.inner;
        let request_id = self.start(&descriptor, true);
        let started = Instant::now();

        let timeout = descriptor.timeout.unwrap_or_else(|| inner.config.request_timeout());
        // The slot wait counts against the deadline too.
        let attempt = async {
            let _slot = inner.admission.admit_probe().await;
            let permit = inner.breaker.acquire()?;
            if permit.is_probe() {
                tracing::info!(request_id, url = %descriptor.url, "sending half-open probe");
            }
            let request = descriptor.transport_request(timeout);
            self.call_direct(request_id, &descriptor, request, permit, &inner.single_attempt).await
        };
        let result = tokio::time::timeout(timeout, attempt).await;
        self.finish(request_id, started, within_deadline(result, started, timeout))
            .map(|delivered| delivered.response)
    }

    fn start(&self, descriptor: &RequestDescriptor, probe: bool) -> u64 {
        let request_id = self.inner.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.events.emit(GuardEvent::RequestStart(RequestStart {
            request_id,
            method: descriptor.method,
            url: descriptor.url.clone(),
            probe,
        }));
        request_id
    }

    async fn dispatch(
        &self,
        request_id: u64,
        descriptor: &RequestDescriptor,
        slot: AdmissionSlot,
        timeout: Duration,
    ) -> Result<Delivered, GuardError> {
        let inner = &self.inner;
        let permit = inner.breaker.acquire()?;

        match &inner.cache {
            Some(cache) if descriptor.method.is_cacheable() => {
                // The refresh is shared, so its tries use the client-wide deadline.
                let request = descriptor.transport_request(inner.config.request_timeout());
                let refresh = Refresh {
                    request_id,
                    request,
                    transport: Arc::clone(&inner.transport),
                    permit,
                    slot,
                };
                cache.fetch(descriptor.key(), refresh).await
            }
            _ => {
                let request = descriptor.transport_request(timeout);
                let retry = if descriptor.method.is_idempotent() {
                    &inner.direct_retry
                } else {
                    &inner.single_attempt
                };
                let result =
                    self.call_direct(request_id, descriptor, request, permit, retry).await;
                drop(slot);
                result
            }
        }
    }

    async fn call_direct(
        &self,
        request_id: u64,
        descriptor: &RequestDescriptor,
        request: TransportRequest,
        permit: CircuitPermit,
        retry: &RetryExecutor,
    ) -> Result<Delivered, GuardError> {
        let inner = &self.inner;
        let mut pending = Unsettled(Some(permit));
        let result = retry
            .execute(inner.transport.as_ref(), &request, |r| {
                inner.events.emit(GuardEvent::MicrocacheRetry(MicrocacheRetry {
                    request_id,
                    key: descriptor.key(),
                    url: request.url.clone(),
                    attempt: r.attempt,
                    max_attempts: r.max_attempts,
                    reason: r.reason.label(),
                    delay: r.delay,
                }));
            })
            .await;
        if let Some(permit) = pending.0.take() {
            permit.record_result(&result);
        }
        result.map(|response| Delivered { response, source: ResponseSource::Upstream })
    }

    fn finish(
        &self,
        request_id: u64,
        started: Instant,
        result: Result<Delivered, GuardError>,
    ) -> Result<Delivered, GuardError> {
        let duration = started.elapsed();
        match &result {
            Ok(delivered) => {
                tracing::debug!(
                    request_id,
                    status = delivered.response.status,
                    source = ?delivered.source,
                    ?duration,
                    "request succeeded"
                );
                self.inner.events.emit(GuardEvent::RequestSuccess(RequestSuccess {
                    request_id,
                    status: delivered.response.status,
                    duration,
                    source: delivered.source,
                }));
            }
            Err(error) => {
                tracing::debug!(request_id, kind = %error.kind(), %error, ?duration, "request failed");
                self.inner.events.emit(GuardEvent::RequestFailure(RequestFailure {
                    request_id,
                    kind: error.kind(),
                    error: error.clone(),
                    duration,
                }));
            }
        }
        result
    }
}

/// Map the caller's deadline to [`GuardError::Timeout`]. A last try that timed out exactly at
/// the deadline is the same event seen from inside, and is reported the same way.
fn within_deadline(
    result: Result<Result<Delivered, GuardError>, Elapsed>,
    admitted: Instant,
    timeout: Duration,
) -> Result<Delivered, GuardError> {
    let elapsed = admitted.elapsed();
    match result {
        Ok(Err(err)) if err.is_transport_timeout() && elapsed >= timeout => {
            Err(GuardError::Timeout { elapsed, timeout })
        }
        Ok(result) => result,
        Err(_elapsed) => Err(GuardError::Timeout { elapsed, timeout }),
    }
}

impl Service<RequestDescriptor> for ResilientHttpClient {
    type Response = HttpResponse;
    type Error = GuardError;
    type Future = BoxFuture<'static, Result<HttpResponse, GuardError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Backpressure is applied inside `call` by the admission queue.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: RequestDescriptor) -> Self::Future {
        let client = self.clone();
        Box::pin(async move { client.request(request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, MicroCacheConfig};
    use crate::transport::{ServiceTransport, TransportError};
    use tower::{service_fn, ServiceExt};

    fn echo() -> impl Transport + 'static {
        ServiceTransport::new(service_fn(|req: TransportRequest| async move {
            Ok::<_, TransportError>(HttpResponse::new(200, req.url.into_bytes()))
        }))
    }

    #[test]
    fn descriptor_keys() {
        let plain = RequestDescriptor::get("http://upstream/a#x");
        assert_eq!(plain.key(), "GET http://upstream/a");
        let custom = plain.clone().with_cache_key("users");
        assert_eq!(custom.key(), "users");
        let post = RequestDescriptor::post("http://upstream/a", "{}");
        assert_eq!(post.body.as_deref(), Some(&b"{}"[..]));
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let config = GuardConfig { max_in_flight: 0, ..GuardConfig::default() };
        assert_eq!(
            ResilientHttpClient::new(echo(), config).unwrap_err(),
            ConfigError::ZeroMaxInFlight
        );
    }

    #[tokio::test]
    async fn request_ids_are_monotonic() {
        let client = ResilientHttpClient::new(echo(), GuardConfig::default()).unwrap();
        client.request(RequestDescriptor::get("http://upstream/1")).await.unwrap();
        client.request(RequestDescriptor::get("http://upstream/2")).await.unwrap();
        assert_eq!(client.snapshot().requests_started, 2);
        assert_eq!(client.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn works_as_a_tower_service() {
        let config = GuardConfig {
            micro_cache: MicroCacheConfig::disabled(),
            circuit_breaker: CircuitBreakerConfig::disabled(),
            ..GuardConfig::default()
        };
        let client = ResilientHttpClient::new(echo(), config).unwrap();
        let response =
            client.oneshot(RequestDescriptor::get("http://upstream/tower")).await.unwrap();
        assert_eq!(response.text(), "http://upstream/tower");
    }

    #[tokio::test]
    async fn get_shortcut_goes_through_the_cache() {
        let client = ResilientHttpClient::new(echo(), GuardConfig::default()).unwrap();
        let first = client.get("http://upstream/short").await.unwrap();
        assert_eq!(first.text(), "http://upstream/short");
        client.get("http://upstream/short").await.unwrap();
        assert_eq!(client.snapshot().cache_size, 1);
        assert_eq!(client.snapshot().requests_started, 2);
    }
}
