// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::process::ExitCode;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::Parser;
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use tcp_ingestion::config::{
    DEFAULT_BACKEND_URL, DEFAULT_FORWARD_WORKERS, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT,
};
use tcp_ingestion::{Daemon, DaemonConfig, OverloadPolicy};

/// Accepts hex telemetry frames over TCP and relays them to an HTTP backend.
#[derive(Debug, Parser)]
#[command(name = "tcp-ingestion-daemon", version, about)]
struct Args {
    /// TCP port to listen on
    #[arg(
        short,
        long,
        env = "TCP_INGESTION_PORT",
        default_value_t = DEFAULT_PORT,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    port: u16,

    /// Backend ingestion URL frames are POSTed to
    #[arg(short, long, env = "TCP_INGESTION_BACKEND_URL", default_value = DEFAULT_BACKEND_URL)]
    backend: String,

    /// Seconds between periodic stats reports
    #[arg(long, env = "TCP_INGESTION_STATS_INTERVAL", default_value_t = 30)]
    stats_interval: u64,

    /// Maximum number of concurrently served connections
    #[arg(long, env = "TCP_INGESTION_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Maximum number of concurrent backend requests
    #[arg(long, env = "TCP_INGESTION_FORWARD_WORKERS", default_value_t = DEFAULT_FORWARD_WORKERS)]
    forward_workers: usize,

    /// Answer `ERROR: Server busy` instead of queueing clients when full
    #[arg(long, env = "TCP_INGESTION_REJECT_WHEN_FULL")]
    reject_when_full: bool,
}

impl Args {
    fn into_config(self) -> DaemonConfig {
        let mut config = DaemonConfig::new(self.port, self.backend);
        config.stats_interval = Duration::from_secs(self.stats_interval);
        config.max_connections = self.max_connections;
        config.forwarder.workers = self.forward_workers;
        if self.reject_when_full {
            config.overload_policy = OverloadPolicy::Reject;
        }
        config
    }
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    let log_level = env::var("TCP_INGESTION_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,hyper_util=off,reqwest=off,rustls=off,{log_level}");

    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("could not parse log level {log_level:?}: {e}");
            return ExitCode::FAILURE;
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let config = args.into_config();
    let daemon = match Daemon::new(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to start daemon: {e}");
            return ExitCode::FAILURE;
        }
    };
    let running = match daemon.start().await {
        Ok(running) => running,
        Err(e) => {
            error!("Failed to start daemon: {e}");
            return ExitCode::FAILURE;
        }
    };

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");
    running.stop().await;

    ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
