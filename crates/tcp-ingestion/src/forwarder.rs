// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP relay of accepted frames to the ingestion backend.
//!
//! Frames are submitted without waiting: [`Forwarder::submit`] queues the
//! request on a pool bounded by a semaphore and returns a [`ForwardHandle`]
//! immediately. Each request then runs a short sequence of POST attempts:
//!
//! ```text
//!   attempt n ──> 2xx ─────────────> success
//!       │
//!       ├──────> 4xx ─────────────> failure (no retry)
//!       │
//!       └──────> 5xx / network ──> n < max ? sleep(n × base) and retry : failure
//! ```
//!
//! Every request resolves to exactly one [`ForwardOutcome`], unless the pool
//! is force-cancelled during shutdown, in which case the handle resolves to
//! `None`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use derive_more::Display;
use reqwest::header::{ACCEPT, CONNECTION, CONTENT_TYPE};
use reqwest::{redirect, StatusCode};
use serde::Serialize;
use tokio::sync::{oneshot, Semaphore};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ForwarderConfig;
use crate::errors::ForwardError;
use crate::frame::{preview, HexFrame};
use crate::stats::{ForwarderStats, ForwarderStatsSnapshot};

const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";
const USER_AGENT: &str = concat!("tcp-ingestion-daemon/", env!("CARGO_PKG_VERSION"));
const SOURCE: &str = "tcp-daemon";
const FRAME_PREVIEW_LEN: usize = 50;
const RESPONSE_PREVIEW_LEN: usize = 200;

/// How many attempts a request gets and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// `n` attempts, back to back.
    Immediate(u64),
    /// `n` attempts, sleeping `attempt × base_ms` milliseconds after each failed attempt.
    LinearBackoff(u64, u64),
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::LinearBackoff(3, 1000)
    }
}

impl RetryStrategy {
    pub fn max_attempts(&self) -> u64 {
        match self {
            RetryStrategy::Immediate(attempts) | RetryStrategy::LinearBackoff(attempts, _) => {
                *attempts
            }
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u64) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::LinearBackoff(_, base_ms) => {
                Duration::from_millis(base_ms.saturating_mul(attempt))
            }
        }
    }
}

/// Textual address of the client a frame came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub struct ClientDescriptor(String);

impl ClientDescriptor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SocketAddr> for ClientDescriptor {
    fn from(addr: SocketAddr) -> Self {
        ClientDescriptor(addr.to_string())
    }
}

impl From<&str> for ClientDescriptor {
    fn from(value: &str) -> Self {
        ClientDescriptor(value.to_string())
    }
}

/// A frame on its way to the backend. Owned by the forwarder once submitted.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub frame: HexFrame,
    pub client: Option<ClientDescriptor>,
    pub submitted_at: Instant,
}

impl ForwardRequest {
    pub fn new(frame: HexFrame, client: Option<ClientDescriptor>) -> Self {
        Self {
            frame,
            client,
            submitted_at: Instant::now(),
        }
    }
}

/// Final result of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub success: bool,
    pub attempts: u64,
}

/// Receives every resolved [`ForwardOutcome`].
pub trait OutcomeObserver: Send + Sync {
    fn on_outcome(&self, request: &ForwardRequest, outcome: &ForwardOutcome);
}

/// Result of a single POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered { status: StatusCode },
    Retryable { reason: String },
    Rejected { reason: String },
}

impl AttemptOutcome {
    pub fn from_status(status: StatusCode) -> Self {
        if status.is_success() {
            AttemptOutcome::Delivered { status }
        } else if status.is_client_error() {
            AttemptOutcome::Rejected {
                reason: format!("client error {status}"),
            }
        } else {
            AttemptOutcome::Retryable {
                reason: format!("unexpected status {status}"),
            }
        }
    }
}

/// What to do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Finish { success: bool },
    RetryAfter(Duration),
}

/// Decides whether the request is resolved after `attempt` (1-based) produced `outcome`.
pub fn next_step(outcome: &AttemptOutcome, attempt: u64, strategy: &RetryStrategy) -> NextStep {
    match outcome {
        AttemptOutcome::Delivered { .. } => NextStep::Finish { success: true },
        AttemptOutcome::Rejected { .. } => NextStep::Finish { success: false },
        AttemptOutcome::Retryable { .. } if attempt >= strategy.max_attempts() => {
            NextStep::Finish { success: false }
        }
        AttemptOutcome::Retryable { .. } => NextStep::RetryAfter(strategy.delay_after(attempt)),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RawDataPayload<'a> {
    raw_hex_string: &'a str,
    timestamp: String,
    source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_info: Option<&'a str>,
}

impl<'a> RawDataPayload<'a> {
    fn new(request: &'a ForwardRequest) -> Self {
        RawDataPayload {
            raw_hex_string: request.frame.as_str(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            source: SOURCE,
            client_info: request
                .client
                .as_ref()
                .map(ClientDescriptor::as_str)
                .filter(|info| !info.trim().is_empty()),
        }
    }
}

/// Resolves to the request's outcome once a worker finishes it.
#[derive(Debug)]
pub struct ForwardHandle {
    rx: oneshot::Receiver<ForwardOutcome>,
}

impl ForwardHandle {
    /// `None` when the request was abandoned by a forced shutdown.
    pub async fn outcome(self) -> Option<ForwardOutcome> {
        self.rx.await.ok()
    }
}

struct Delivery {
    client: reqwest::Client,
    config: ForwarderConfig,
    stats: Arc<ForwarderStats>,
    observer: Option<Arc<dyn OutcomeObserver>>,
}

impl Delivery {
    async fn forward(&self, request: &ForwardRequest) -> ForwardOutcome {
        let strategy = self.config.retry_strategy;
        let mut attempt = 0;
        let success = loop {
            attempt += 1;
            let outcome = self.attempt(request, attempt).await;
            match next_step(&outcome, attempt, &strategy) {
                NextStep::Finish { success } => break success,
                NextStep::RetryAfter(delay) => {
                    info!("Retrying in {}ms...", delay.as_millis());
                    sleep(delay).await;
                }
            }
        };

        if !success {
            error!(
                "Forwarding failed after {} attempt(s) for {}...",
                attempt,
                request.frame.preview(FRAME_PREVIEW_LEN)
            );
        }
        debug!(
            "Request resolved in {} ms",
            request.submitted_at.elapsed().as_millis()
        );

        self.stats.record(success);
        let outcome = ForwardOutcome {
            success,
            attempts: attempt,
        };
        if let Some(observer) = &self.observer {
            observer.on_outcome(request, &outcome);
        }
        outcome
    }

    async fn attempt(&self, request: &ForwardRequest, attempt: u64) -> AttemptOutcome {
        let url = &self.config.backend_url;
        let payload = RawDataPayload::new(request);
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                return AttemptOutcome::Rejected {
                    reason: format!("failed to serialize payload: {e}"),
                }
            }
        };

        info!(
            "[Attempt {}] Forwarding {}... to {}",
            attempt,
            request.frame.preview(FRAME_PREVIEW_LEN),
            url
        );

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(ACCEPT, "application/json")
            .header(CONNECTION, "close")
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let outcome = AttemptOutcome::from_status(status);
                match &outcome {
                    AttemptOutcome::Delivered { .. } => {
                        info!("[Attempt {attempt}] Backend success: {status}");
                        if !body.trim().is_empty() {
                            debug!("Response: {}", preview(&body, RESPONSE_PREVIEW_LEN));
                        }
                    }
                    AttemptOutcome::Rejected { .. } => {
                        error!("[Attempt {attempt}] Backend error: {status}, not retrying: {body}");
                    }
                    AttemptOutcome::Retryable { .. } => {
                        error!("[Attempt {attempt}] Backend error: {status}: {body}");
                    }
                }
                outcome
            }
            Err(e) => {
                let kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connect error"
                } else {
                    "network error"
                };
                error!("[Attempt {attempt}] {kind}: {e}");
                AttemptOutcome::Retryable {
                    reason: format!("{kind}: {e}"),
                }
            }
        }
    }
}

/// Relays frames to the backend on a bounded pool of workers.
pub struct Forwarder {
    delivery: Arc<Delivery>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel_token: CancellationToken,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Result<Self, ForwardError> {
        Self::build(config, None)
    }

    /// Like [`Forwarder::new`], reporting every outcome to `observer`.
    pub fn with_observer(
        config: ForwarderConfig,
        observer: Arc<dyn OutcomeObserver>,
    ) -> Result<Self, ForwardError> {
        Self::build(config, Some(observer))
    }

    fn build(
        config: ForwarderConfig,
        observer: Option<Arc<dyn OutcomeObserver>>,
    ) -> Result<Self, ForwardError> {
        config.validate()?;

        // One connection per attempt: no pooling, no redirects.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .pool_max_idle_per_host(0)
            .http1_only()
            .redirect(redirect::Policy::none())
            .user_agent(USER_AGENT)
            .build()
            .map_err(ForwardError::Client)?;

        info!(
            "HTTP forwarder initialized for {} with {} workers",
            config.backend_url, config.workers
        );

        Ok(Forwarder {
            permits: Arc::new(Semaphore::new(config.workers)),
            delivery: Arc::new(Delivery {
                client,
                config,
                stats: Arc::new(ForwarderStats::default()),
                observer,
            }),
            tracker: TaskTracker::new(),
            cancel_token: CancellationToken::new(),
        })
    }

    pub fn backend_url(&self) -> &str {
        &self.delivery.config.backend_url
    }

    pub fn stats(&self) -> ForwarderStatsSnapshot {
        self.delivery.stats.snapshot()
    }

    pub fn stats_handle(&self) -> Arc<ForwarderStats> {
        Arc::clone(&self.delivery.stats)
    }

    /// Requests submitted but not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Queues `frame` for delivery and returns at once.
    pub fn submit(
        &self,
        frame: HexFrame,
        client: Option<ClientDescriptor>,
    ) -> Result<ForwardHandle, ForwardError> {
        if self.tracker.is_closed() {
            return Err(ForwardError::PoolClosed);
        }

        let request = ForwardRequest::new(frame, client);
        let (tx, rx) = oneshot::channel();
        let delivery = Arc::clone(&self.delivery);
        let permits = Arc::clone(&self.permits);
        let cancel_token = self.cancel_token.clone();

        self.tracker.spawn(async move {
            let run = async {
                let _permit = permits.acquire().await.ok()?;
                Some(delivery.forward(&request).await)
            };
            tokio::select! {
                biased;
                () = cancel_token.cancelled() => {
                    warn!(
                        "Abandoning forward of {}... from {}: forwarder shut down",
                        request.frame.preview(FRAME_PREVIEW_LEN),
                        request.client.as_ref().map_or("unknown", ClientDescriptor::as_str),
                    );
                }
                outcome = run => {
                    if let Some(outcome) = outcome {
                        // the handle is usually dropped by fire-and-forget callers
                        let _ = tx.send(outcome);
                    }
                }
            }
        });

        Ok(ForwardHandle { rx })
    }

    /// Runs the full attempt sequence for `request` on the caller's task.
    pub async fn forward(&self, request: &ForwardRequest) -> ForwardOutcome {
        self.delivery.forward(request).await
    }

    /// GETs the health endpoint. Advisory only.
    pub async fn test_connectivity(&self) -> bool {
        let url = self.delivery.config.health_check_url();
        info!("Testing backend connection at {url}");

        let response = self
            .delivery
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .timeout(self.delivery.config.health_check_timeout)
            .send()
            .await;

        match response {
            Ok(response) if response.status() == StatusCode::OK => {
                let body = response.text().await.unwrap_or_default();
                info!("Backend health check passed");
                if !body.trim().is_empty() {
                    debug!("Response: {}", preview(&body, RESPONSE_PREVIEW_LEN));
                }
                true
            }
            Ok(response) => {
                error!("Backend health check failed: HTTP {}", response.status());
                false
            }
            Err(e) => {
                error!("Backend connection test failed: {e}");
                false
            }
        }
    }

    /// Refuses new submissions, waits up to `grace` for queued and running
    /// requests, then cancels whatever is left. Cancelled requests never
    /// resolve.
    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down HTTP forwarder");
        self.tracker.close();

        if timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "Forwarder grace period of {} ms elapsed, abandoning {} request(s)",
                grace.as_millis(),
                self.tracker.len()
            );
            self.cancel_token.cancel();
            self.tracker.wait().await;
        }

        info!("HTTP Forwarder Stats - {}", self.stats());
    }
}
