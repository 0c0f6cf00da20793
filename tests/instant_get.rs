mod common;

use common::{MockUpstream, Step};
use outbound_guard::{InstantGetStore, PollOptions, RetryBudget};
use std::sync::Arc;
use std::time::Duration;

const URL: &str = "http://upstream.test/config.json";

fn every_second() -> PollOptions {
    PollOptions { interval: Duration::from_secs(1), ..PollOptions::default() }
}

#[tokio::test(start_paused = true)]
async fn serves_last_good_value_through_an_outage() {
    common::init_tracing();
    let upstream = MockUpstream::with_fallback(Step::status(503));
    upstream.push(Step::ok("v1"));
    let store = InstantGetStore::new(Arc::clone(&upstream));
    assert!(store.get().is_none());

    store.start(URL, every_second());
    assert!(store.wait_ready(Duration::from_secs(1)).await);
    assert_eq!(store.get().unwrap().text(), "v1");

    // t=1s: the poll fails, the old value keeps being served.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let snap = store.snapshot();
    assert_eq!(snap.consecutive_errors, 1);
    assert_eq!(snap.last_error.as_deref(), Some("HttpStatusError(503)"));
    assert_eq!(snap.next_delay, Some(Duration::from_secs(1)));
    assert_eq!(store.get().unwrap().text(), "v1");

    // t=2s: the upstream is back.
    upstream.set_fallback(Step::ok("v2"));
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(store.get().unwrap().text(), "v2");
    let snap = store.snapshot();
    assert_eq!(snap.consecutive_errors, 0);
    assert_eq!(snap.url.as_deref(), Some(URL));
    assert!(snap.running);

    store.stop();
    let calls = upstream.calls();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!store.is_running());
    assert_eq!(upstream.calls(), calls);
    assert_eq!(store.get().unwrap().text(), "v2");
}

#[tokio::test(start_paused = true)]
async fn limited_budget_stops_polling() {
    let upstream = MockUpstream::with_fallback(Step::status(500));
    let store = InstantGetStore::new(Arc::clone(&upstream));

    store.start(URL, PollOptions { on_error: RetryBudget::Limited(1), ..every_second() });
    assert!(!store.wait_ready(Duration::from_secs(30)).await);

    assert_eq!(upstream.calls(), 2);
    assert!(!store.is_running());
    assert_eq!(store.snapshot().next_delay, None);
    assert!(store.get().is_none());
}

#[tokio::test(start_paused = true)]
async fn stale_value_expires_while_the_upstream_is_down() {
    let upstream = MockUpstream::with_fallback(Step::status(502));
    upstream.push(Step::ok("snapshot"));
    let store = InstantGetStore::new(Arc::clone(&upstream));

    store.start(
        URL,
        PollOptions { expire_after: Duration::from_secs(5), ..every_second() },
    );
    assert!(store.wait_ready(Duration::from_secs(1)).await);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(store.get().is_some());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(store.get().is_none());
    assert!(store.is_running());
}
