// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide counters and the periodic stats reporter.
//!
//! Counters are plain atomics; nothing here takes a lock. [`Stats`] holds the
//! daemon-level counters read by `STATUS` and by the reporter, while
//! [`ForwarderStats`] is owned by the forwarder and counts resolved requests.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use crate::forwarder::{ForwardOutcome, ForwardRequest, OutcomeObserver};

/// Daemon-level counters.
#[derive(Debug, Default)]
pub struct Stats {
    connections_total: AtomicU64,
    connections_rejected: AtomicU64,
    messages_total: AtomicU64,
    forward_success: AtomicU64,
    forward_failure: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_total: u64,
    pub connections_rejected: u64,
    pub messages_total: u64,
    pub forward_success: u64,
    pub forward_failure: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_connection(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward(&self, success: bool) {
        if success {
            self.forward_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.forward_failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            messages_total: self.messages_total.load(Ordering::Relaxed),
            forward_success: self.forward_success.load(Ordering::Relaxed),
            forward_failure: self.forward_failure.load(Ordering::Relaxed),
        }
    }
}

impl OutcomeObserver for Stats {
    fn on_outcome(&self, _request: &ForwardRequest, outcome: &ForwardOutcome) {
        self.record_forward(outcome.success);
    }
}

impl StatsSnapshot {
    /// Body of the `STATUS` reply.
    pub fn status_line(&self) -> String {
        format!(
            "OK - Messages: {}, Success: {}, Failed: {}",
            self.messages_total, self.forward_success, self.forward_failure
        )
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connections: {}, Rejected: {}, Messages: {}, Success: {}, Failed: {}",
            self.connections_total,
            self.connections_rejected,
            self.messages_total,
            self.forward_success,
            self.forward_failure
        )
    }
}

/// Counters kept by the forwarder, one increment per resolved request.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
}

impl ForwarderStats {
    pub fn record(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ForwarderStatsSnapshot {
        ForwarderStatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

impl ForwarderStatsSnapshot {
    /// Percentage of resolved requests that succeeded, 0 when nothing resolved yet.
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 * 100.0 / self.total_requests as f64
    }
}

impl fmt::Display for ForwarderStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total requests: {}, Successful: {}, Failed: {}, Success rate: {:.1}%",
            self.total_requests,
            self.successful_requests,
            self.failed_requests,
            self.success_rate()
        )
    }
}

/// Logs both snapshots every `period` until `cancel_token` fires.
///
/// The first report happens one full period after start.
pub fn spawn_reporter(
    stats: Arc<Stats>,
    forwarder_stats: Arc<ForwarderStats>,
    period: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    let report = async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    info!("Daemon Stats - {}", stats.snapshot());
                    info!("HTTP Forwarder Stats - {}", forwarder_stats.snapshot());
                }
            }
        }
        debug!("Stats reporter stopped");
    };
    tokio::spawn(report.in_current_span())
}
