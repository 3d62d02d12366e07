// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP ingestion of hex-encoded telemetry frames with an HTTP relay.
//!
//! Clients send newline-terminated lines over TCP. Lines that pass the
//! framing contract in [`frame`] are acknowledged at once and relayed to an
//! HTTP backend by the [`forwarder`], which retries transient failures with a
//! linear backoff. [`daemon::Daemon`] wires the listener, the forwarder and
//! the periodic stats reporter together.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod connection;
pub mod daemon;
pub mod errors;
pub mod forwarder;
pub mod frame;
pub mod listener;
pub mod stats;

pub use config::{DaemonConfig, ForwarderConfig, OverloadPolicy};
pub use daemon::{Daemon, DaemonState, RunningDaemon};
pub use errors::{ConfigError, DaemonError, ForwardError, FrameError};
pub use forwarder::{ClientDescriptor, ForwardHandle, ForwardOutcome, Forwarder, RetryStrategy};
pub use frame::{validate, HexFrame};
pub use stats::{Stats, StatsSnapshot};
