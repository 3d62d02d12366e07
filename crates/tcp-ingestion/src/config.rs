// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use reqwest::Url;

use crate::errors::ConfigError;
use crate::forwarder::RetryStrategy;

pub const DEFAULT_PORT: u16 = 8081;
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:5000/api/sensor/raw-data";
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;
pub const DEFAULT_FORWARD_WORKERS: usize = 10;
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

const RAW_DATA_PATH: &str = "/raw-data";
const HEALTH_PATH: &str = "/health";

/// What the listener does when every connection slot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverloadPolicy {
    /// Stop accepting until a slot frees; pending clients wait in the kernel backlog.
    #[default]
    Block,
    /// Accept, answer `ERROR: Server busy` and close.
    Reject,
}

/// Settings for the HTTP forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderConfig {
    pub backend_url: String,
    pub workers: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub health_check_timeout: Duration,
    pub retry_strategy: RetryStrategy,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            workers: DEFAULT_FORWARD_WORKERS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            retry_strategy: RetryStrategy::default(),
        }
    }
}

impl ForwarderConfig {
    pub fn with_backend_url(backend_url: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            ..Self::default()
        }
    }

    /// Health endpoint derived from the ingestion URL by swapping `/raw-data` for `/health`.
    pub fn health_check_url(&self) -> String {
        self.backend_url.replace(RAW_DATA_PATH, HEALTH_PATH)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match Url::parse(&self.backend_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
            _ => return Err(ConfigError::BackendUrl(self.backend_url.clone())),
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroCapacity {
                name: "forward workers",
            });
        }
        if self.retry_strategy.max_attempts() == 0 {
            return Err(ConfigError::ZeroCapacity {
                name: "retry attempts",
            });
        }
        Ok(())
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    pub overload_policy: OverloadPolicy,
    pub stats_interval: Duration,
    pub shutdown_grace: Duration,
    pub forwarder: ForwarderConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            overload_policy: OverloadPolicy::default(),
            stats_interval: DEFAULT_STATS_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            forwarder: ForwarderConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Defaults listening on all interfaces at `port`, forwarding to `backend_url`.
    pub fn new(port: u16, backend_url: impl Into<String>) -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            forwarder: ForwarderConfig::with_backend_url(backend_url),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroCapacity {
                name: "max connections",
            });
        }
        if self.stats_interval.is_zero() {
            return Err(ConfigError::ZeroCapacity {
                name: "stats interval",
            });
        }
        self.forwarder.validate()
    }
}
