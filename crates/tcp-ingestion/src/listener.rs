// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP accept loop and the bounded pool of connection tasks.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{DaemonConfig, OverloadPolicy};
use crate::connection::{write_reply, ConnectionHandler, Reply};
use crate::forwarder::Forwarder;
use crate::stats::Stats;

const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// Accepts clients and runs a [`ConnectionHandler`] for each, at most
/// `max_connections` at a time.
pub struct Listener {
    listener: TcpListener,
    slots: Arc<Semaphore>,
    policy: OverloadPolicy,
    grace: Duration,
    stats: Arc<Stats>,
    forwarder: Arc<Forwarder>,
    connections: TaskTracker,
    stop: CancellationToken,
    force: CancellationToken,
}

impl Listener {
    pub fn new(
        listener: TcpListener,
        config: &DaemonConfig,
        stats: Arc<Stats>,
        forwarder: Arc<Forwarder>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            listener,
            slots: Arc::new(Semaphore::new(config.max_connections)),
            policy: config.overload_policy,
            grace: config.shutdown_grace,
            stats,
            forwarder,
            connections: TaskTracker::new(),
            stop,
            force: CancellationToken::new(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts until `stop` fires, then closes the socket and drains the
    /// connection tasks, cancelling any still running after the grace period.
    pub async fn run(self) {
        let Listener {
            listener,
            slots,
            policy,
            grace,
            stats,
            forwarder,
            connections,
            stop,
            force,
        } = self;

        let mut last_error = None::<io::ErrorKind>;
        loop {
            // Block: hold a slot before accepting so excess clients queue in the backlog.
            let reserved = match policy {
                OverloadPolicy::Block => tokio::select! {
                    () = stop.cancelled() => break,
                    permit = Arc::clone(&slots).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                OverloadPolicy::Reject => None,
            };

            let (stream, addr) = tokio::select! {
                () = stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => {
                        last_error = None;
                        accepted
                    }
                    Err(e) => {
                        let kind = e.kind();
                        if last_error != Some(kind) {
                            warn!("Error accepting client connection: {e}");
                        }
                        last_error = Some(kind);
                        sleep(ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };

            stats.record_connection();
            let permit = match reserved {
                Some(permit) => permit,
                None => match Arc::clone(&slots).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        stats.record_rejected_connection();
                        warn!("Connection limit reached, rejecting client {addr}");
                        connections.spawn(reject(stream, addr));
                        continue;
                    }
                },
            };

            let handler = ConnectionHandler::new(
                Some(addr.into()),
                Arc::clone(&stats),
                Arc::clone(&forwarder),
            );
            connections.spawn(serve(
                handler,
                stream,
                addr,
                permit,
                stop.clone(),
                force.clone(),
            ));
        }

        drop(listener);
        info!("TCP listener closed");

        connections.close();
        if timeout(grace, connections.wait()).await.is_err() {
            warn!(
                "Grace period of {} ms elapsed, cancelling {} connection(s)",
                grace.as_millis(),
                connections.len()
            );
            force.cancel();
            connections.wait().await;
        }
        debug!("All connection tasks finished");
    }
}

async fn serve(
    handler: ConnectionHandler,
    stream: TcpStream,
    addr: SocketAddr,
    _permit: OwnedSemaphorePermit,
    stop: CancellationToken,
    force: CancellationToken,
) {
    info!("New client connected: {addr}");
    tokio::select! {
        () = force.cancelled() => {
            warn!("Connection with {addr} cancelled during shutdown");
        }
        result = handler.run(stream, stop) => {
            if let Err(e) = result {
                debug!("Connection error with {addr}: {e}");
            }
            info!("Client disconnected: {addr}");
        }
    }
}

async fn reject(mut stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = write_reply(&mut stream, &Reply::Busy).await {
        debug!("Failed to notify rejected client {addr}: {e}");
    }
}
