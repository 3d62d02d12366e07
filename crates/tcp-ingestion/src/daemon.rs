// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Daemon lifecycle: wiring, startup order and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use derive_more::Display;
use tokio::net::TcpListener;
use tokio::sync::{Mutex as TokioMutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;
use crate::errors::DaemonError;
use crate::forwarder::{Forwarder, OutcomeObserver};
use crate::listener::Listener;
use crate::stats::{spawn_reporter, Stats, StatsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DaemonState {
    Running,
    Stopping,
    Stopped,
}

/// A configured, not yet started daemon.
pub struct Daemon {
    config: DaemonConfig,
    stats: Arc<Stats>,
    forwarder: Arc<Forwarder>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        config.validate()?;
        let stats = Arc::new(Stats::new());
        let observer: Arc<dyn OutcomeObserver> = stats.clone();
        let forwarder = Forwarder::with_observer(config.forwarder.clone(), observer)?;
        Ok(Self {
            config,
            stats,
            forwarder: Arc::new(forwarder),
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Binds the listening socket, checks the backend once, starts the stats
    /// reporter and the accept loop.
    ///
    /// Only a bind failure is fatal; an unreachable backend is logged and
    /// frames are accepted anyway.
    pub async fn start(self) -> Result<RunningDaemon, DaemonError> {
        let addr = self.config.bind_addr;
        let socket = TcpListener::bind(addr)
            .await
            .map_err(|source| DaemonError::Bind { addr, source })?;
        let local_addr = socket.local_addr().map_err(DaemonError::LocalAddr)?;
        info!("TCP Ingestion Daemon listening on {local_addr}");
        info!("Forwarding data to {}", self.forwarder.backend_url());

        if !self.forwarder.test_connectivity().await {
            warn!("Backend connectivity test failed, frames will still be accepted");
        }

        let reporter_token = CancellationToken::new();
        let reporter = spawn_reporter(
            Arc::clone(&self.stats),
            self.forwarder.stats_handle(),
            self.config.stats_interval,
            reporter_token.clone(),
        );

        let stop = CancellationToken::new();
        let listener = Listener::new(
            socket,
            &self.config,
            Arc::clone(&self.stats),
            Arc::clone(&self.forwarder),
            stop.clone(),
        );
        let accept_loop = tokio::spawn(listener.run());

        info!(
            "Daemon started, max {} concurrent connections",
            self.config.max_connections
        );

        Ok(RunningDaemon {
            config: self.config,
            local_addr,
            stats: self.stats,
            forwarder: self.forwarder,
            state: RwLock::new(DaemonState::Running),
            stop,
            reporter_token,
            accept_loop: TokioMutex::new(Some(accept_loop)),
            reporter: TokioMutex::new(Some(reporter)),
            stopped: OnceCell::new(),
        })
    }
}

/// Handle to a started daemon.
pub struct RunningDaemon {
    config: DaemonConfig,
    local_addr: SocketAddr,
    stats: Arc<Stats>,
    forwarder: Arc<Forwarder>,
    state: RwLock<DaemonState>,
    stop: CancellationToken,
    reporter_token: CancellationToken,
    accept_loop: TokioMutex<Option<JoinHandle<()>>>,
    reporter: TokioMutex<Option<JoinHandle<()>>>,
    stopped: OnceCell<()>,
}

impl RunningDaemon {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn state(&self) -> DaemonState {
        *self.state.read().await
    }

    /// Stops accepting, drains connections and in-flight forwards within the
    /// configured grace period, then stops the reporter.
    ///
    /// Safe to call more than once; concurrent callers all return once the
    /// single shutdown run has finished.
    pub async fn stop(&self) {
        self.stopped.get_or_init(|| self.shutdown()).await;
    }

    async fn shutdown(&self) {
        info!("Shutting down TCP Ingestion Daemon");
        *self.state.write().await = DaemonState::Stopping;
        self.stop.cancel();

        let accept_loop = self.accept_loop.lock().await.take();
        if let Some(accept_loop) = accept_loop {
            if let Err(e) = accept_loop.await {
                error!("Accept loop terminated abnormally: {e}");
            }
        }

        self.forwarder.shutdown(self.config.shutdown_grace).await;

        self.reporter_token.cancel();
        let reporter = self.reporter.lock().await.take();
        if let Some(reporter) = reporter {
            if let Err(e) = reporter.await {
                error!("Stats reporter terminated abnormally: {e}");
            }
        }

        info!("Final Daemon Stats - {}", self.stats.snapshot());
        *self.state.write().await = DaemonState::Stopped;
        info!("TCP Ingestion Daemon stopped");
    }
}

impl Drop for RunningDaemon {
    fn drop(&mut self) {
        self.stop.cancel();
        self.reporter_token.cancel();
    }
}
