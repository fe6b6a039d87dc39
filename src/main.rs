//! amqpool - AMQP 0-9-1 connection pooling proxy
//!
//! Sits between many short-lived AMQP clients and an upstream broker,
//! keeping a small pool of long-lived broker connections and multiplexing
//! client sessions onto them via AMQP channels.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

use amqpool::server::metrics::run_statsd_exporter;
use amqpool::{Config, Listener, ProxyMetrics, Result, Shutdown, UpstreamPool};

#[derive(Parser)]
#[command(name = "amqpool")]
#[command(version)]
#[command(about = "AMQP 0-9-1 connection pooling proxy")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// AMQP(S) URL of the upstream broker, e.g. amqp://broker:5672
    #[arg(short, long)]
    upstream: Option<String>,

    /// Override listen address
    #[arg(long)]
    listen_address: Option<String>,

    /// Override listen port
    #[arg(long)]
    listen_port: Option<u16>,

    /// Seconds an unused pooled upstream connection is kept alive
    #[arg(long)]
    idle_connection_timeout: Option<u64>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Statsd host for metrics export
    #[arg(long)]
    statsd_host: Option<String>,

    /// Statsd port for metrics export
    #[arg(long)]
    statsd_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(url) = cli.upstream {
        config.upstream.url = url;
    }
    if let Some(addr) = cli.listen_address {
        config.server.listen_address = addr;
    }
    if let Some(port) = cli.listen_port {
        config.server.listen_port = port;
    }
    if let Some(secs) = cli.idle_connection_timeout {
        config.upstream.idle_connection_timeout_secs = secs;
    }
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if let Some(host) = cli.statsd_host {
        config.statsd.host = host;
    }
    if let Some(port) = cli.statsd_port {
        config.statsd.port = port;
    }

    // Initialize logging; RUST_LOG wins over the configured level.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log.level.clone());
    tracing_subscriber::fmt().with_env_filter(&log_level).init();

    info!("Starting amqpool v{}", env!("CARGO_PKG_VERSION"));
    config.validate()?;

    let metrics = ProxyMetrics::shared();
    let (shutdown_tx, _) = broadcast::channel::<Shutdown>(4);

    let pool = Arc::new(UpstreamPool::new(&config, Arc::clone(&metrics))?);
    let reaper = UpstreamPool::start_reaper(Arc::clone(&pool), shutdown_tx.subscribe());

    if !config.statsd.host.is_empty() {
        let target = format!("{}:{}", config.statsd.host, config.statsd.port);
        info!("Exporting metrics to statsd at {}", target);
        tokio::spawn(run_statsd_exporter(
            Arc::clone(&metrics),
            target,
            shutdown_tx.subscribe(),
        ));
    }

    let listener = Listener::bind(
        &config,
        Arc::clone(&pool),
        Arc::clone(&metrics),
        shutdown_tx.clone(),
    )
    .await?;
    let tracker = listener.tracker();

    info!(
        "Proxy ready: {} -> {}",
        config.listen_addr(),
        config.upstream.url
    );

    let listener_handle = tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            error!("Listener error: {}", e);
        }
    });

    // First signal: stop accepting, let existing sessions drain.
    wait_for_signal().await;
    info!(
        "Shutdown signal received: no longer accepting clients, {} session(s) still live (signal again to disconnect them)",
        tracker.active()
    );
    let _ = shutdown_tx.send(Shutdown::StopAccepting);

    // Second signal (if it comes): forcibly disconnect every client.
    tokio::select! {
        _ = tracker.wait_idle() => {}
        _ = wait_for_signal() => {
            info!("Second shutdown signal: disconnecting {} client(s)", tracker.active());
            let _ = shutdown_tx.send(Shutdown::Disconnect);
            tracker.wait_idle().await;
        }
    }

    let _ = listener_handle.await;
    // Sessions are gone; stop the background tasks and drain the pool.
    let _ = shutdown_tx.send(Shutdown::Disconnect);
    pool.shutdown().await;
    let _ = reaper.await;

    info!("Shutdown complete: {}", metrics.snapshot());
    Ok(())
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM.
async fn wait_for_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => { sigterm.recv().await; }
                    Err(_) => std::future::pending::<()>().await,
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {}
    }
}
