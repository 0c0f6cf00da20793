#![allow(dead_code)]

use async_trait::async_trait;
use outbound_guard::{HttpResponse, Transport, TransportError, TransportRequest};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted upstream behavior.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(u16, String),
    Fail(TransportError),
    /// Never answers; the caller's timeout has to fire.
    Hang,
}

impl Step {
    pub fn ok(body: &str) -> Self {
        Step::Reply(200, body.to_string())
    }

    pub fn status(status: u16) -> Self {
        Step::Reply(status, String::new())
    }
}

/// Scripted upstream that counts calls and tracks peak concurrency.
pub struct MockUpstream {
    script: Mutex<VecDeque<Step>>,
    fallback: Mutex<Step>,
    latency: Mutex<Duration>,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl MockUpstream {
    pub fn new() -> Arc<Self> {
        Self::with_fallback(Step::ok("ok"))
    }

    pub fn with_fallback(fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            latency: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        })
    }

    pub fn statuses(statuses: &[u16]) -> Arc<Self> {
        let upstream = Self::new();
        for status in statuses {
            upstream.push(Step::status(*status));
        }
        upstream
    }

    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn set_fallback(&self, step: Step) {
        *self.fallback.lock().unwrap() = step;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockUpstream {
    async fn perform(&self, request: TransportRequest) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(request.url.clone());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        let step = {
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.lock().unwrap().clone())
        };
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match step {
            Step::Reply(status, body) => Ok(HttpResponse::new(status, body)),
            Step::Fail(err) => Err(err),
            Step::Hang => futures::future::pending().await,
        }
    }
}

/// Install a fmt subscriber once so failing tests show the guard's logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
