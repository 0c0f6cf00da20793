//! Background-polled "instant read" store for a single URL.
//!
//! [`InstantGetStore::start`] spawns a loop that GETs the URL, keeps the last 2xx response,
//! and reschedules itself: after `interval` on success, or after the next step of a
//! [`BackoffLadder`] (1s, 5s, 10s, 30s, 60s, capped) on failure. [`InstantGetStore::get`] never
//! waits; it returns the last good response unless that response is older than
//! `expire_after`, in which case it returns `None` even while polling keeps running.
//!
//! [`InstantGetStore::stop`] cancels the loop and freezes the stored value. Expiry still
//! applies to a frozen value.
//!
//! This store is independent of [`ResilientHttpClient`](crate::ResilientHttpClient): it talks
//! to its own transport and does not go through admission, the breaker, or the micro-cache.

use crate::backoff::BackoffLadder;
use crate::clock::{Clock, MonotonicClock};
use crate::transport::{Headers, HttpResponse, Method, Transport, TransportError, TransportRequest};
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How many consecutive failures the poller tolerates before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryBudget {
    /// Keep polling forever.
    #[default]
    Infinite,
    /// Stop once this many retries in a row have failed.
    Limited(usize),
}

impl RetryBudget {
    fn exhausted(&self, consecutive_errors: usize) -> bool {
        match self {
            RetryBudget::Infinite => false,
            RetryBudget::Limited(retries) => consecutive_errors > *retries,
        }
    }
}

/// Options for [`InstantGetStore::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOptions {
    /// Delay between polls while the upstream is healthy.
    pub interval: Duration,
    pub on_error: RetryBudget,
    /// Age past which [`InstantGetStore::get`] stops returning the stored value.
    pub expire_after: Duration,
    pub request_timeout: Duration,
    pub headers: Headers,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            on_error: RetryBudget::Infinite,
            expire_after: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
            headers: Headers::new(),
        }
    }
}

/// Point-in-time view of the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PollerSnapshot {
    pub url: Option<String>,
    pub running: bool,
    /// Store-clock milliseconds of the last 2xx.
    pub last_ok_at: Option<u64>,
    /// Delay before the next scheduled poll; `None` when nothing is scheduled.
    pub next_delay: Option<Duration>,
    pub last_error: Option<String>,
    pub consecutive_errors: usize,
}

#[derive(Debug)]
struct Stored {
    response: HttpResponse,
    stored_at: u64,
}

#[derive(Debug, Default)]
struct PollerState {
    url: Option<String>,
    generation: u64,
    running: bool,
    last_ok_at: Option<u64>,
    next_delay: Option<Duration>,
    last_error: Option<String>,
    consecutive_errors: usize,
}

struct Shared {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    ladder: BackoffLadder,
    value: ArcSwapOption<Stored>,
    expire_after_ms: AtomicU64,
    interval_ms: AtomicU64,
    // Every write to `value` happens under this lock, after checking the generation.
    state: Mutex<PollerState>,
    ready: watch::Sender<bool>,
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the delay before the next poll, or `None` if this loop must end.
    fn record_success(&self, generation: u64, response: HttpResponse) -> Option<Duration> {
        let mut state = self.state();
        if !state.running || state.generation != generation {
            return None;
        }
        let now = self.clock.now_millis();
        self.value.store(Some(Arc::new(Stored { response, stored_at: now })));
        state.last_ok_at = Some(now);
        state.consecutive_errors = 0;
        state.last_error = None;
        state.next_delay = Some(Duration::from_millis(self.interval_ms.load(Ordering::Acquire)));
        let delay = state.next_delay;
        drop(state);

        if !self.ready.send_replace(true) {
            tracing::info!("instant-get store ready");
        }
        delay
    }

    fn record_failure(
        &self,
        generation: u64,
        error: String,
        budget: RetryBudget,
    ) -> Option<Duration> {
        let mut state = self.state();
        if !state.running || state.generation != generation {
            return None;
        }
        state.consecutive_errors += 1;
        let streak = state.consecutive_errors;
        tracing::warn!(url = ?state.url, error = %error, streak, "instant-get poll failed");
        state.last_error = Some(error);

        if budget.exhausted(streak) {
            tracing::warn!(url = ?state.url, streak, "instant-get retry budget exhausted; polling stopped");
            state.running = false;
            state.next_delay = None;
            return None;
        }
        let delay = self.ladder.delay(streak);
        state.next_delay = Some(delay);
        Some(delay)
    }
}

/// Single-URL background poller with non-blocking reads.
pub struct InstantGetStore {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for InstantGetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantGetStore").field("snapshot", &self.snapshot()).finish()
    }
}

impl InstantGetStore {
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self::with_clock(transport, MonotonicClock::default())
    }

    pub fn with_clock<T, C>(transport: T, clock: C) -> Self
    where
        T: Transport + 'static,
        C: Clock + 'static,
    {
        let (ready, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                transport: Arc::new(transport),
                clock: Arc::new(clock),
                ladder: BackoffLadder::default(),
                value: ArcSwapOption::empty(),
                expire_after_ms: AtomicU64::new(0),
                interval_ms: AtomicU64::new(0),
                state: Mutex::new(PollerState::default()),
                ready,
            }),
            task: Mutex::new(None),
        }
    }

    /// Start polling `url`. A store that was already polling is restarted from scratch.
    pub fn start(&self, url: impl Into<String>, options: PollOptions) {
        let url = url.into();
        let generation = {
            let mut state = self.shared.state();
            let generation = state.generation + 1;
            *state = PollerState {
                url: Some(url.clone()),
                generation,
                running: true,
                ..PollerState::default()
            };
            self.shared.value.store(None);
            self.shared.expire_after_ms.store(millis(options.expire_after), Ordering::Release);
            self.shared.interval_ms.store(millis(options.interval), Ordering::Release);
            self.shared.ready.send_replace(false);
            generation
        };

        tracing::info!(%url, interval = ?options.interval, "instant-get polling started");
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(poll_loop(shared, generation, url, options));
        if let Some(previous) = self.task().replace(handle) {
            previous.abort();
        }
    }

    /// Cancel polling and freeze the stored value.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state();
            state.running = false;
            state.next_delay = None;
        }
        if let Some(handle) = self.task().take() {
            handle.abort();
            tracing::info!("instant-get polling stopped");
        }
    }

    /// Last good response, unless none exists yet or it has expired.
    pub fn get(&self) -> Option<HttpResponse> {
        let stored = self.shared.value.load_full()?;
        let age = self.shared.clock.now_millis().saturating_sub(stored.stored_at);
        if age >= self.shared.expire_after_ms.load(Ordering::Acquire) {
            return None;
        }
        Some(stored.response.clone())
    }

    /// Wait up to `timeout` for the first successful poll. Does not affect polling.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.ready.subscribe();
        let became_ready = async move {
            let seen = rx.wait_for(|ready| *ready).await;
            seen.is_ok()
        };
        tokio::time::timeout(timeout, became_ready).await.unwrap_or(false)
    }

    pub fn is_running(&self) -> bool {
        self.shared.state().running
    }

    pub fn snapshot(&self) -> PollerSnapshot {
        let state = self.shared.state();
        PollerSnapshot {
            url: state.url.clone(),
            running: state.running,
            last_ok_at: state.last_ok_at,
            next_delay: state.next_delay,
            last_error: state.last_error.clone(),
            consecutive_errors: state.consecutive_errors,
        }
    }

    fn task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for InstantGetStore {
    fn drop(&mut self) {
        if let Some(handle) = self.task().take() {
            handle.abort();
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn status_error_name(status: u16) -> String {
    format!("HttpStatusError({})", status)
}

async fn poll_loop(shared: Arc<Shared>, generation: u64, url: String, options: PollOptions) {
    loop {
        let request = TransportRequest {
            method: Method::Get,
            url: url.clone(),
            headers: options.headers.clone(),
            body: None,
            timeout: options.request_timeout,
        };
        let outcome =
            match tokio::time::timeout(options.request_timeout, shared.transport.perform(request))
                .await
            {
                Ok(result) => result,
                Err(_elapsed) => Err(TransportError::Timeout(options.request_timeout)),
            };

        let next = match outcome {
            Ok(response) if response.is_success() => shared.record_success(generation, response),
            Ok(response) => {
                shared.record_failure(generation, status_error_name(response.status), options.on_error)
            }
            Err(err) => shared.record_failure(generation, err.name().to_string(), options.on_error),
        };
        let Some(delay) = next else { break };
        tracing::trace!(%url, ?delay, "next instant-get poll");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Replies from a queue, then repeats `fallback`.
    struct Feed {
        replies: Mutex<VecDeque<u16>>,
        fallback: Mutex<u16>,
        calls: AtomicUsize,
    }

    impl Feed {
        fn new(replies: &[u16], fallback: u16) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().copied().collect()),
                fallback: Mutex::new(fallback),
                calls: AtomicUsize::new(0),
            })
        }

        fn set_fallback(&self, status: u16) {
            *self.fallback.lock().unwrap() = status;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for Feed {
        async fn perform(&self, _req: TransportRequest) -> Result<HttpResponse, TransportError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let status = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| *self.fallback.lock().unwrap());
            Ok(HttpResponse::new(status, format!("VALUE_{}", n)))
        }
    }

    const URL: &str = "http://upstream/config";

    #[tokio::test(start_paused = true)]
    async fn ready_after_first_success() {
        let feed = Feed::new(&[], 200);
        let store = InstantGetStore::new(Arc::clone(&feed));
        assert!(store.get().is_none());

        store.start(URL, PollOptions::default());
        assert!(store.wait_ready(Duration::from_secs(5)).await);
        assert_eq!(store.get().map(|r| r.text()), Some("VALUE_1".to_string()));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(feed.calls(), 3);
        assert_eq!(store.snapshot().next_delay, Some(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_times_out_while_failing() {
        let feed = Feed::new(&[], 500);
        let store = InstantGetStore::new(Arc::clone(&feed));
        store.start(URL, PollOptions::default());

        assert!(!store.wait_ready(Duration::from_secs(3)).await);
        assert!(store.get().is_none());
        assert!(store.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_walk_the_backoff_ladder() {
        let feed = Feed::new(&[200], 500);
        let store = InstantGetStore::new(Arc::clone(&feed));
        store.start(URL, PollOptions::default());
        assert!(store.wait_ready(Duration::from_secs(1)).await);

        // Polls at 1s (fail, +1s), 2s (fail, +5s), 7s (fail, +10s).
        tokio::time::sleep(Duration::from_millis(7_500)).await;
        let snap = store.snapshot();
        assert_eq!(snap.consecutive_errors, 3);
        assert_eq!(snap.next_delay, Some(Duration::from_secs(10)));
        assert_eq!(snap.last_error.as_deref(), Some("HttpStatusError(500)"));
        assert_eq!(store.get().map(|r| r.text()), Some("VALUE_1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn value_expires_while_polling_keeps_failing() {
        let feed = Feed::new(&[200], 500);
        let store = InstantGetStore::new(Arc::clone(&feed));
        store.start(URL, PollOptions { expire_after: Duration::from_secs(60), ..Default::default() });
        assert!(store.wait_ready(Duration::from_secs(1)).await);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(store.get().is_some());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.get().is_none());
        assert!(store.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_freezes_the_value() {
        let feed = Feed::new(&[200], 500);
        let store = InstantGetStore::new(Arc::clone(&feed));
        store.start(URL, PollOptions::default());
        assert!(store.wait_ready(Duration::from_secs(1)).await);

        store.stop();
        feed.set_fallback(200);
        let calls = feed.calls();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(feed.calls(), calls);
        assert_eq!(store.get().map(|r| r.text()), Some("VALUE_1".to_string()));
        let snap = store.snapshot();
        assert!(!snap.running);
        assert_eq!(snap.next_delay, None);
    }

    #[tokio::test(start_paused = true)]
    async fn limited_budget_stops_polling() {
        let feed = Feed::new(&[], 503);
        let store = InstantGetStore::new(Arc::clone(&feed));
        store.start(URL, PollOptions { on_error: RetryBudget::Limited(2), ..Default::default() });

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(feed.calls(), 3);
        assert!(!store.is_running());
        assert_eq!(store.snapshot().consecutive_errors, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resets_state() {
        let feed = Feed::new(&[500], 200);
        let store = InstantGetStore::new(Arc::clone(&feed));
        store.start(URL, PollOptions::default());
        tokio::task::yield_now().await;
        store.start("http://upstream/other", PollOptions::default());

        assert!(store.wait_ready(Duration::from_secs(2)).await);
        let snap = store.snapshot();
        assert_eq!(snap.url.as_deref(), Some("http://upstream/other"));
        assert_eq!(snap.consecutive_errors, 0);
    }
}
