#![cfg(feature = "serde")]

mod common;

use common::MockUpstream;
use outbound_guard::{ConfigError, GuardConfig, Jitter, RequestDescriptor, ResilientHttpClient};
use serde_json::json;
use std::sync::Arc;

#[test]
fn partial_documents_fill_in_defaults() {
    let doc = json!({
        "max_in_flight": 4,
        "circuit_breaker": { "failure_statuses": [500, 502] },
        "micro_cache": { "ttl_ms": 250, "retry": { "jitter": "equal" } }
    });

    let config = GuardConfig::from_json_str(&doc.to_string()).unwrap();

    assert_eq!(config.max_in_flight, 4);
    assert_eq!(config.max_queue, GuardConfig::default().max_queue);
    assert_eq!(config.circuit_breaker.failure_statuses, vec![500, 502]);
    assert_eq!(config.circuit_breaker.failure_threshold, 3);
    assert_eq!(config.micro_cache.ttl_ms, 250);
    assert_eq!(config.micro_cache.retry.jitter, Jitter::Equal);
}

#[test]
fn invalid_documents_are_refused() {
    let zero = json!({ "max_in_flight": 0 }).to_string();
    assert_eq!(GuardConfig::from_json_str(&zero), Err(ConfigError::ZeroMaxInFlight));

    assert!(matches!(GuardConfig::from_json_str("{ not json"), Err(ConfigError::Parse(_))));
}

#[tokio::test]
async fn snapshot_serializes_for_diagnostics() {
    let upstream = MockUpstream::new();
    let client = ResilientHttpClient::new(Arc::clone(&upstream), GuardConfig::default()).unwrap();
    client.request(RequestDescriptor::get("http://upstream.test/a")).await.unwrap();

    let snapshot = serde_json::to_value(client.snapshot()).unwrap();

    assert_eq!(snapshot["circuit_state"], "CLOSED");
    assert_eq!(snapshot["requests_started"], 1);
    assert_eq!(snapshot["cache_size"], 1);
    assert_eq!(snapshot["in_flight"], 0);
}
