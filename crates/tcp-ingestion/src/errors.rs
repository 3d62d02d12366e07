// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types surfaced by the ingestion pipeline.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Reasons a received line is not accepted as a telemetry frame.
///
/// The variant is only ever logged; clients always receive the same generic
/// error line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("frame contains non-hex character {found:?} at position {position}")]
    NonHex { found: char, position: usize },
    #[error("frame too short: {length} chars, expected at least {minimum}")]
    TooShort { length: usize, minimum: usize },
    #[error("invalid protocol header {found:?}, expected {expected:?}")]
    BadHeader {
        found: String,
        expected: &'static str,
    },
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("line is not valid UTF-8")]
    NotUtf8,
}

/// Errors raised by the forwarder outside of a single delivery attempt.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("invalid forwarder configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("forwarder is shut down, submission refused")]
    PoolClosed,
}

/// Invalid daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("backend URL {0:?} is not a valid http(s) URL")]
    BackendUrl(String),
    #[error("{name} must be greater than zero")]
    ZeroCapacity { name: &'static str },
}

/// Fatal errors while starting the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to create forwarder: {0}")]
    Forwarder(#[from] ForwardError),
    #[error("failed to bind TCP listener at {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to read local address of listener: {0}")]
    LocalAddr(#[source] io::Error),
}
