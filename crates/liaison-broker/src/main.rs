//! Liaison broker binary.
//!
//! Binds the WebSocket listener, runs the liveness sweep and health
//! recompute in the background, and shuts down gracefully on Ctrl+C or
//! SIGTERM: stop accepting, cancel pending popups, disconnect every session.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use liaison_broker::Broker;
use liaison_broker::health::spawn_recompute_task;
use liaison_broker::registry::sweep::spawn_sweep_task;
use liaison_broker::server;
use liaison_core::config::load_config;
use liaison_core::tracing_init::init_tracing;

/// How often the health status is re-thresholded in the background.
const HEALTH_RECOMPUTE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "liaison-broker")]
#[command(version, about = "Liaison broker - routes popups between requester and responder clients")]
struct Args {
    /// Address to listen on; overrides the configured port.
    #[arg(long, env = "LIAISON_ADDR")]
    addr: Option<SocketAddr>,

    /// Path to a settings.json replacing the global config file.
    #[arg(long, env = "LIAISON_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum number of identified sessions.
    #[arg(long, env = "LIAISON_MAX_CLIENTS")]
    max_clients: Option<usize>,

    /// Liveness sweep interval in seconds.
    #[arg(long, env = "LIAISON_HEARTBEAT_SECS")]
    heartbeat_secs: Option<u64>,

    /// Default popup timeout in milliseconds (0 disables it).
    #[arg(long, env = "LIAISON_POPUP_TIMEOUT_MS")]
    popup_timeout_ms: Option<u64>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    init_tracing(
        &format!("liaison_broker={}", config.broker.log_level),
        args.log_json,
    );
    if let Some(max_clients) = args.max_clients {
        config.broker.max_clients = max_clients;
    }
    if let Some(heartbeat_secs) = args.heartbeat_secs {
        config.broker.heartbeat_interval_secs = heartbeat_secs;
    }
    if let Some(popup_timeout_ms) = args.popup_timeout_ms {
        config.popups.default_timeout_ms = popup_timeout_ms;
    }
    let addr = args
        .addr
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], config.broker.port)));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        max_clients = config.broker.max_clients,
        heartbeat_secs = config.broker.heartbeat_interval_secs,
        "Starting liaison-broker"
    );

    let broker = Broker::new(&config);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let sweep_task = spawn_sweep_task(
        Arc::clone(broker.registry()),
        config.broker.heartbeat_interval(),
        shutdown_rx.clone(),
    );
    let health_task = spawn_recompute_task(
        Arc::clone(broker.health()),
        HEALTH_RECOMPUTE_PERIOD,
        shutdown_rx.clone(),
    );

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Listening for WebSocket connections");

    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        // Not running under systemd is the normal case.
        tracing::debug!(error = %e, "sd_notify skipped");
    }

    let serve_task = tokio::spawn(server::serve(
        listener,
        Arc::clone(&broker),
        shutdown_rx,
    ));

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C");
        }
        () = sigterm => {
            info!("Received SIGTERM");
        }
        result = serve_task => {
            match result {
                Ok(Ok(())) => info!("Listener stopped"),
                Ok(Err(e)) => warn!(error = %e, "Listener failed"),
                Err(e) => warn!(error = %e, "Listener task panicked"),
            }
            return Ok(());
        }
    }

    // Stop accepting, then tear down sessions gracefully.
    let _ = shutdown_tx.send(true);
    broker.shutdown().await;

    match sweep_task.await {
        Ok(()) => {}
        Err(e) => warn!(error = %e, "Sweep task ended abnormally"),
    }
    match health_task.await {
        Ok(()) => {}
        Err(e) => warn!(error = %e, "Health task ended abnormally"),
    }

    info!("Broker stopped");
    Ok(())
}
