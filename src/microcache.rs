//! Micro-cache with singleflight request coalescing.
//!
//! Entries are keyed by [`cache_key`] (method + normalized URL) unless the caller supplies its
//! own key. For one key at any instant there is at most one *leader* refreshing it; everyone
//! else either gets the stored response or follows the leader.
//!
//! Lookup:
//! - stored value younger than `ttl` → returned as a cache hit, no upstream call;
//! - refresh already in flight → the caller follows it (at most `max_waiters` followers, each
//!   bounded by `follower_timeout`);
//! - otherwise the caller leads. A stale value is never handed to the leader, which waits for
//!   the refresh like everybody else. With `ttl = 0` this turns the cache into pure singleflight.
//!
//! The leader's refresh runs as a detached task, so a leader caller giving up does not cancel
//! work its followers depend on. When the refresh fails and a stored value is still inside
//! `ttl + max_stale`, that value is served to every waiter instead of the error. Staleness is
//! measured from the last successful store; failed refreshes never extend it.
//!
//! Only 2xx responses are stored. Values past `ttl + max_stale` are dropped lazily on lookup;
//! beyond `max_entries`, idle entries are evicted oldest-store-first.

use crate::admission::AdmissionSlot;
use crate::circuit_breaker::CircuitPermit;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{ConfigError, MicroCacheConfig};
use crate::error::{FailureReason, GuardError};
use crate::events::{EventBus, GuardEvent, MicrocacheRetry, RefreshFailed};
use crate::retry::RetryExecutor;
use crate::transport::{HttpResponse, Method, Transport, TransportRequest};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Where the response handed to a caller came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ResponseSource {
    /// This caller's own upstream call (leader or uncached request).
    Upstream,
    /// A stored response younger than the TTL.
    CacheHit,
    /// Another caller's in-flight refresh.
    Coalesced,
    /// A stored response served because its refresh failed.
    Stale,
}

/// Observable state of one cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Fresh,
    Stale,
    Refreshing,
}

/// Cache key for `method` + `url`: `"GET https://host/path?q"`.
///
/// The URL is normalized (scheme and host lowercased, default port and fragment dropped).
/// Text that does not parse as a URL is used trimmed, as given.
pub fn cache_key(method: Method, url: &str) -> String {
    match url::Url::parse(url.trim()) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            format!("{} {}", method, parsed)
        }
        Err(_) => format!("{} {}", method, url.trim()),
    }
}

/// A response and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub response: HttpResponse,
    pub source: ResponseSource,
}

type Outcome = Result<Delivered, GuardError>;

#[derive(Debug)]
struct Stored {
    response: HttpResponse,
    stored_at: u64,
}

#[derive(Debug)]
struct Flight {
    id: u64,
    tx: broadcast::Sender<Outcome>,
    waiters: usize,
    attempt: usize,
    next_delay: Duration,
}

#[derive(Debug, Default)]
struct Entry {
    stored: Option<Stored>,
    flight: Option<Flight>,
}

/// Everything a leader needs to run a refresh on its own.
pub(crate) struct Refresh {
    pub request_id: u64,
    pub request: TransportRequest,
    pub transport: Arc<dyn Transport>,
    pub permit: CircuitPermit,
    pub slot: AdmissionSlot,
}

enum Lookup {
    Hit(HttpResponse),
    Follow(broadcast::Receiver<Outcome>, FollowerGuard),
    Lead(u64, broadcast::Sender<Outcome>, broadcast::Receiver<Outcome>),
}

/// Keyed response cache shared by every request of one client. Clones share state.
#[derive(Debug, Clone)]
pub struct MicroCache {
    config: Arc<MicroCacheConfig>,
    entries: Arc<DashMap<String, Entry>>,
    next_flight: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
    retry: RetryExecutor,
    events: EventBus,
}

impl MicroCache {
    pub fn new(config: MicroCacheConfig, events: EventBus) -> Result<Self, ConfigError> {
        config.validate()?;
        let retry = RetryExecutor::from_config(&config.retry)?;
        Ok(Self {
            config: Arc::new(config),
            entries: Arc::new(DashMap::new()),
            next_flight: Arc::new(AtomicU64::new(1)),
            clock: Arc::new(MonotonicClock::default()),
            retry,
            events,
        })
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &MicroCacheConfig {
        &self.config
    }

    /// Keys currently held, including keys with only a refresh in flight.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// State of `key` right now, or `None` if nothing usable is held for it.
    pub fn entry_state(&self, key: &str) -> Option<EntryState> {
        let entry = self.entries.get(key)?;
        if entry.flight.is_some() {
            return Some(EntryState::Refreshing);
        }
        let age = self.clock.now_millis().saturating_sub(entry.stored.as_ref()?.stored_at);
        if age < self.config.ttl_ms {
            Some(EntryState::Fresh)
        } else if age < self.usable_window() {
            Some(EntryState::Stale)
        } else {
            None
        }
    }

    /// Retry progress of the refresh in flight for `key`: `(failed tries, next delay)`.
    pub fn refresh_progress(&self, key: &str) -> Option<(usize, Duration)> {
        let entry = self.entries.get(key)?;
        entry.flight.as_ref().map(|f| (f.attempt, f.next_delay))
    }

    /// Drop every stored value that is not being refreshed.
    pub fn clear(&self) {
        self.entries.retain(|_, entry| entry.flight.is_some());
    }

    fn usable_window(&self) -> u64 {
        self.config.ttl_ms.saturating_add(self.config.max_stale_ms)
    }

    /// Serve `key` from the cache, a running refresh, or a new refresh led by this caller.
    pub(crate) async fn fetch(&self, key: String, refresh: Refresh) -> Outcome {
        match self.lookup(&key)? {
            Lookup::Hit(response) => {
                tracing::trace!(%key, "micro-cache hit");
                Ok(Delivered { response, source: ResponseSource::CacheHit })
            }
            Lookup::Follow(rx, guard) => {
                drop(refresh.permit);
                let outcome = self.follow(&key, rx).await;
                drop(guard);
                drop(refresh.slot);
                outcome.map(|delivered| match delivered.source {
                    ResponseSource::Upstream => {
                        Delivered { source: ResponseSource::Coalesced, ..delivered }
                    }
                    _ => delivered,
                })
            }
            Lookup::Lead(flight, tx, rx) => {
                tracing::debug!(%key, flight, "micro-cache refresh");
                self.spawn_refresh(key, flight, tx, refresh);
                receive(rx).await
            }
        }
    }

    fn lookup(&self, key: &str) -> Result<Lookup, GuardError> {
        let now = self.clock.now_millis();
        let mut entry = self.entries.entry(key.to_string()).or_default();

        let expired = entry
            .stored
            .as_ref()
            .is_some_and(|s| now.saturating_sub(s.stored_at) >= self.usable_window());
        if expired {
            entry.stored = None;
        }

        if let Some(stored) = &entry.stored {
            if now.saturating_sub(stored.stored_at) < self.config.ttl_ms {
                return Ok(Lookup::Hit(stored.response.clone()));
            }
        }

        if let Some(flight) = entry.flight.as_mut() {
            if flight.waiters >= self.config.max_waiters {
                return Err(GuardError::Capacity {
                    key: key.to_string(),
                    max_waiters: self.config.max_waiters,
                });
            }
            flight.waiters += 1;
            let guard = FollowerGuard {
                entries: Arc::clone(&self.entries),
                key: key.to_string(),
                flight: flight.id,
            };
            return Ok(Lookup::Follow(flight.tx.subscribe(), guard));
        }

        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = broadcast::channel(1);
        entry.flight = Some(Flight {
            id,
            tx: tx.clone(),
            waiters: 0,
            attempt: 0,
            next_delay: Duration::ZERO,
        });
        Ok(Lookup::Lead(id, tx, rx))
    }

    async fn follow(&self, key: &str, rx: broadcast::Receiver<Outcome>) -> Outcome {
        let started = Instant::now();
        match tokio::time::timeout(self.config.follower_timeout(), receive(rx)).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                tracing::debug!(%key, "follower gave up waiting on refresh");
                Err(GuardError::FollowerTimeout { key: key.to_string(), waited: started.elapsed() })
            }
        }
    }

    fn spawn_refresh(
        &self,
        key: String,
        flight: u64,
        tx: broadcast::Sender<Outcome>,
        refresh: Refresh,
    ) {
        let cache = self.clone();
        tokio::spawn(async move {
            let Refresh { request_id, request, transport, permit, slot } = refresh;
            let mut guard = FlightGuard { cache: &cache, key: &key, flight, armed: true };

            let result = cache
                .retry
                .execute(transport.as_ref(), &request, |retry| {
                    cache.note_retry(&key, flight, retry.attempt, retry.delay);
                    cache.events.emit(GuardEvent::MicrocacheRetry(MicrocacheRetry {
                        request_id,
                        key: key.clone(),
                        url: request.url.clone(),
                        attempt: retry.attempt,
                        max_attempts: retry.max_attempts,
                        reason: retry.reason.label(),
                        delay: retry.delay,
                    }));
                })
                .await;
            permit.record_result(&result);

            let outcome = cache.settle(&key, flight, request_id, &request.url, result);
            guard.armed = false;
            // Nobody left listening is fine; the result is stored either way.
            let _ = tx.send(outcome);
            drop(slot);
        });
    }

    fn note_retry(&self, key: &str, flight: u64, attempt: usize, delay: Duration) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if let Some(f) = entry.flight.as_mut().filter(|f| f.id == flight) {
                f.attempt = attempt;
                f.next_delay = delay;
            }
        }
    }

    /// Publish the leader's result into the entry and decide what waiters get.
    fn settle(
        &self,
        key: &str,
        flight: u64,
        request_id: u64,
        url: &str,
        result: Result<HttpResponse, GuardError>,
    ) -> Outcome {
        let now = self.clock.now_millis();
        let usable_window = self.usable_window();
        let mut stored_new = false;

        let (outcome, failure) = {
            let mut entry = self.entries.entry(key.to_string()).or_default();
            if entry.flight.as_ref().is_some_and(|f| f.id == flight) {
                entry.flight = None;
            }
            match result {
                Ok(response) => {
                    if response.is_success() {
                        entry.stored = Some(Stored { response: response.clone(), stored_at: now });
                        stored_new = true;
                    }
                    (Ok(Delivered { response, source: ResponseSource::Upstream }), None)
                }
                Err(error) => {
                    let stale = entry
                        .stored
                        .as_ref()
                        .filter(|s| now.saturating_sub(s.stored_at) < usable_window)
                        .map(|s| s.response.clone());
                    if stale.is_none() {
                        entry.stored = None;
                    }
                    let served_stale = stale.is_some();
                    let outcome = match stale {
                        Some(response) => Ok(Delivered { response, source: ResponseSource::Stale }),
                        None => Err(error.clone()),
                    };
                    (outcome, Some((error, served_stale)))
                }
            }
        };

        self.entries.remove_if(key, |_, e| e.stored.is_none() && e.flight.is_none());
        if stored_new {
            self.evict_overflow();
        }

        if let Some((error, served_stale)) = failure {
            tracing::warn!(%key, %error, served_stale, "micro-cache refresh failed");
            self.events.emit(GuardEvent::RefreshFailed(RefreshFailed {
                request_id,
                key: key.to_string(),
                url: url.to_string(),
                error,
                served_stale,
            }));
        }
        outcome
    }

    fn abandon(&self, key: &str, flight: u64) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.flight.as_ref().is_some_and(|f| f.id == flight) {
                entry.flight = None;
            }
        }
        self.entries.remove_if(key, |_, e| e.stored.is_none() && e.flight.is_none());
        tracing::warn!(%key, flight, "micro-cache refresh ended without an outcome");
    }

    fn evict_overflow(&self) {
        loop {
            // Keys with only a refresh in flight hold nothing and do not count.
            let mut stored = 0;
            let mut oldest: Option<(String, u64)> = None;
            for e in self.entries.iter() {
                let Some(s) = &e.stored else { continue };
                stored += 1;
                let older = match &oldest {
                    Some((_, at)) => s.stored_at < *at,
                    None => true,
                };
                if e.flight.is_none() && older {
                    oldest = Some((e.key().clone(), s.stored_at));
                }
            }
            if stored <= self.config.max_entries {
                break;
            }
            let Some((key, _)) = oldest else { break };
            if self.entries.remove_if(&key, |_, e| e.flight.is_none()).is_some() {
                tracing::trace!(%key, "micro-cache evicted");
            }
        }
    }
}

async fn receive(mut rx: broadcast::Receiver<Outcome>) -> Outcome {
    match rx.recv().await {
        Ok(outcome) => outcome,
        Err(_) => Err(GuardError::Upstream { attempts: 0, reason: FailureReason::LeaderLost }),
    }
}

/// Clears the flight record if the refresh task ends without settling.
struct FlightGuard<'a> {
    cache: &'a MicroCache,
    key: &'a str,
    flight: u64,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.abandon(self.key, self.flight);
        }
    }
}

/// Gives the follower seat back when a follower stops waiting.
struct FollowerGuard {
    entries: Arc<DashMap<String, Entry>>,
    key: String,
    flight: u64,
}

impl Drop for FollowerGuard {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entries.get_mut(&self.key) {
            if let Some(flight) = entry.flight.as_mut().filter(|f| f.id == self.flight) {
                flight.waiters = flight.waiters.saturating_sub(1);
            }
        }
    }
}
