// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::{Matcher, Server};
use serde_json::json;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tcp_ingestion::forwarder::{ForwardOutcome, ForwardRequest, OutcomeObserver};
use tcp_ingestion::{
    validate, ClientDescriptor, ForwardError, Forwarder, ForwarderConfig, RetryStrategy,
};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration, Instant};

const FRAME: &str = "FEDC0116098522754E0000000103001E00000032000000640000000A";
const RAW_DATA_PATH: &str = "/api/sensor/raw-data";

fn config_for(base_url: &str, retry_strategy: RetryStrategy) -> ForwarderConfig {
    let mut config = ForwarderConfig::with_backend_url(format!("{base_url}{RAW_DATA_PATH}"));
    config.retry_strategy = retry_strategy;
    config
}

fn request(client: Option<&str>) -> ForwardRequest {
    ForwardRequest::new(
        validate(FRAME).expect("valid frame"),
        client.map(ClientDescriptor::from),
    )
}

#[derive(Default)]
struct CountingObserver {
    success: AtomicU64,
    failure: AtomicU64,
}

impl OutcomeObserver for CountingObserver {
    fn on_outcome(&self, _request: &ForwardRequest, outcome: &ForwardOutcome) {
        if outcome.success {
            self.success.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failure.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Accepts TCP connections and never answers them.
async fn start_hung_backend() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("unable to bind hung backend");
    let addr = listener.local_addr().expect("local addr");
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(stream);
        }
    });
    (format!("http://{addr}"), accepted)
}

#[cfg(test)]
#[tokio::test]
async fn forwards_payload_on_success() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", RAW_DATA_PATH)
        .match_header("content-type", "application/json; charset=UTF-8")
        .match_header("accept", "application/json")
        .match_body(Matcher::PartialJson(json!({
            "rawHexString": FRAME,
            "source": "tcp-daemon",
            "clientInfo": "10.0.0.7:41000",
        })))
        .with_status(200)
        .with_body(r#"{"status":"stored"}"#)
        .expect(1)
        .create_async()
        .await;

    let forwarder = Forwarder::new(config_for(&server.url(), RetryStrategy::default()))
        .expect("failed to create forwarder");
    let outcome = forwarder.forward(&request(Some("10.0.0.7:41000"))).await;

    assert_eq!(
        outcome,
        ForwardOutcome {
            success: true,
            attempts: 1
        }
    );
    let stats = forwarder.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.successful_requests, 1);
    mock.assert_async().await;
}

#[cfg(test)]
#[tokio::test]
async fn client_error_is_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", RAW_DATA_PATH)
        .with_status(400)
        .with_body("bad payload")
        .expect(1)
        .create_async()
        .await;

    let forwarder = Forwarder::new(config_for(&server.url(), RetryStrategy::LinearBackoff(3, 1)))
        .expect("failed to create forwarder");
    let outcome = forwarder.forward(&request(None)).await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(forwarder.stats().failed_requests, 1);
    mock.assert_async().await;
}

#[cfg(test)]
#[tokio::test]
async fn server_error_is_retried_with_linear_backoff() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", RAW_DATA_PATH)
        .with_status(503)
        .with_body("Service Unavailable")
        .expect(3)
        .create_async()
        .await;

    let forwarder = Forwarder::new(config_for(&server.url(), RetryStrategy::default()))
        .expect("failed to create forwarder");

    let started = Instant::now();
    let outcome = forwarder.forward(&request(None)).await;
    let elapsed = started.elapsed();

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 3);
    // 1000 ms after the first attempt, 2000 ms after the second
    assert!(elapsed >= Duration::from_millis(3000), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "elapsed {elapsed:?}");

    let stats = forwarder.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.failed_requests, 1);
    mock.assert_async().await;
}

#[cfg(test)]
#[tokio::test]
async fn recovers_after_transient_failure() {
    let mut server = Server::new_async().await;
    let failing = server
        .mock("POST", RAW_DATA_PATH)
        .with_status(500)
        .expect(1)
        .create_async()
        .await;
    let succeeding = server
        .mock("POST", RAW_DATA_PATH)
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    let forwarder = Forwarder::new(config_for(&server.url(), RetryStrategy::LinearBackoff(3, 1)))
        .expect("failed to create forwarder");
    let outcome = forwarder.forward(&request(None)).await;

    assert!(outcome.success);
    assert_eq!(outcome.attempts, 2);
    failing.assert_async().await;
    succeeding.assert_async().await;
}

#[cfg(test)]
#[tokio::test]
async fn unreachable_backend_counts_one_failure() {
    // nothing listens on the discard port
    let forwarder = Forwarder::new(config_for("http://127.0.0.1:9", RetryStrategy::Immediate(2)))
        .expect("failed to create forwarder");
    let outcome = forwarder.forward(&request(None)).await;

    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 2);
    let stats = forwarder.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.failed_requests, 1);
}

#[cfg(test)]
#[tokio::test]
async fn submitted_requests_resolve_through_handle_and_observer() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", RAW_DATA_PATH)
        .with_status(200)
        .expect(5)
        .create_async()
        .await;

    let observer = Arc::new(CountingObserver::default());
    let forwarder = Forwarder::with_observer(
        config_for(&server.url(), RetryStrategy::Immediate(1)),
        observer.clone(),
    )
    .expect("failed to create forwarder");

    let handles: Vec<_> = (0..5)
        .map(|_| {
            forwarder
                .submit(validate(FRAME).expect("valid frame"), None)
                .expect("submission refused")
        })
        .collect();

    for handle in handles {
        let outcome = timeout(Duration::from_secs(5), handle.outcome())
            .await
            .expect("timed out waiting for outcome")
            .expect("request abandoned");
        assert!(outcome.success);
    }

    assert_eq!(observer.success.load(Ordering::SeqCst), 5);
    assert_eq!(observer.failure.load(Ordering::SeqCst), 0);
    assert_eq!(forwarder.stats().successful_requests, 5);
    mock.assert_async().await;
}

#[cfg(test)]
#[tokio::test]
async fn pool_bounds_concurrent_requests() {
    let (url, accepted) = start_hung_backend().await;
    let mut config = config_for(&url, RetryStrategy::Immediate(1));
    config.workers = 2;
    let forwarder = Forwarder::new(config).expect("failed to create forwarder");

    for _ in 0..5 {
        forwarder
            .submit(validate(FRAME).expect("valid frame"), None)
            .expect("submission refused");
    }

    sleep(Duration::from_millis(500)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    assert_eq!(forwarder.in_flight(), 5);

    forwarder.shutdown(Duration::from_millis(50)).await;
    assert_eq!(forwarder.in_flight(), 0);
}

#[cfg(test)]
#[tokio::test]
async fn shutdown_abandons_requests_after_grace_period() {
    let (url, accepted) = start_hung_backend().await;
    let forwarder = Forwarder::new(config_for(&url, RetryStrategy::default()))
        .expect("failed to create forwarder");

    let handle = forwarder
        .submit(validate(FRAME).expect("valid frame"), None)
        .expect("submission refused");

    let in_flight = async {
        while accepted.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(2), in_flight)
        .await
        .expect("request never reached the backend");

    let started = Instant::now();
    forwarder.shutdown(Duration::from_millis(200)).await;
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(handle.outcome().await, None);
    assert_eq!(forwarder.stats().total_requests, 0);
    assert!(matches!(
        forwarder.submit(validate(FRAME).expect("valid frame"), None),
        Err(ForwardError::PoolClosed)
    ));
}

#[cfg(test)]
#[tokio::test]
async fn connectivity_check_uses_health_endpoint() {
    let mut server = Server::new_async().await;
    let health = server
        .mock("GET", "/api/sensor/health")
        .with_status(200)
        .with_body(r#"{"status":"healthy"}"#)
        .expect(1)
        .create_async()
        .await;

    let forwarder = Forwarder::new(config_for(&server.url(), RetryStrategy::default()))
        .expect("failed to create forwarder");
    assert!(forwarder.test_connectivity().await);
    health.assert_async().await;
}

#[cfg(test)]
#[tokio::test]
async fn connectivity_check_fails_on_non_200() {
    let mut server = Server::new_async().await;
    let _health = server
        .mock("GET", "/api/sensor/health")
        .with_status(503)
        .create_async()
        .await;

    let forwarder = Forwarder::new(config_for(&server.url(), RetryStrategy::default()))
        .expect("failed to create forwarder");
    assert!(!forwarder.test_connectivity().await);

    let unreachable = Forwarder::new(config_for("http://127.0.0.1:9", RetryStrategy::default()))
        .expect("failed to create forwarder");
    assert!(!unreachable.test_connectivity().await);
}
