//! Proxy metrics for observability.
//!
//! Metrics are collected with atomic counters for thread-safe, low-overhead
//! tracking; [`ProxyMetrics::snapshot`] produces a plain-value copy for
//! display. When a statsd host is configured, [`run_statsd_exporter`] ships
//! the counters as gauge lines over UDP on an interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use super::listener::Shutdown;

/// Atomic ordering used for metrics (Relaxed is sufficient for counters).
const METRIC_ORDERING: Ordering = Ordering::Relaxed;

/// Centralized metrics collection for the proxy.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    /// Total client connections accepted since startup
    pub connections_accepted: AtomicU64,
    /// Currently active client connections
    pub connections_active: AtomicU64,
    /// Client connections that failed the AMQP handshake
    pub handshake_failures: AtomicU64,
    /// Upstream broker connections dialed
    pub upstreams_created: AtomicU64,
    /// Borrow requests served from the idle pool
    pub upstreams_reused: AtomicU64,
    /// Idle upstream connections closed by the reaper
    pub upstreams_evicted: AtomicU64,
    /// Upstream connections lost while clients were bound
    pub upstream_errors: AtomicU64,
    /// Channels opened through the proxy
    pub channels_opened: AtomicU64,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, METRIC_ORDERING);
        self.connections_active.fetch_add(1, METRIC_ORDERING);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, METRIC_ORDERING);
    }

    pub fn handshake_failure(&self) {
        self.handshake_failures.fetch_add(1, METRIC_ORDERING);
    }

    pub fn upstream_created(&self) {
        self.upstreams_created.fetch_add(1, METRIC_ORDERING);
    }

    pub fn upstream_reused(&self) {
        self.upstreams_reused.fetch_add(1, METRIC_ORDERING);
    }

    pub fn upstream_evicted(&self) {
        self.upstreams_evicted.fetch_add(1, METRIC_ORDERING);
    }

    pub fn upstream_error(&self) {
        self.upstream_errors.fetch_add(1, METRIC_ORDERING);
    }

    pub fn channel_opened(&self) {
        self.channels_opened.fetch_add(1, METRIC_ORDERING);
    }

    /// Point-in-time copy of all metric values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(METRIC_ORDERING),
            connections_active: self.connections_active.load(METRIC_ORDERING),
            handshake_failures: self.handshake_failures.load(METRIC_ORDERING),
            upstreams_created: self.upstreams_created.load(METRIC_ORDERING),
            upstreams_reused: self.upstreams_reused.load(METRIC_ORDERING),
            upstreams_evicted: self.upstreams_evicted.load(METRIC_ORDERING),
            upstream_errors: self.upstream_errors.load(METRIC_ORDERING),
            channels_opened: self.channels_opened.load(METRIC_ORDERING),
        }
    }
}

/// Plain-value snapshot created by [`ProxyMetrics::snapshot`].
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub handshake_failures: u64,
    pub upstreams_created: u64,
    pub upstreams_reused: u64,
    pub upstreams_evicted: u64,
    pub upstream_errors: u64,
    pub channels_opened: u64,
}

impl MetricsSnapshot {
    /// Format as statsd gauge lines with an `amqpool.` prefix.
    fn to_statsd(&self) -> String {
        let mut out = String::with_capacity(512);
        for (name, value) in [
            ("connections.accepted", self.connections_accepted),
            ("connections.active", self.connections_active),
            ("handshake.failures", self.handshake_failures),
            ("upstreams.created", self.upstreams_created),
            ("upstreams.reused", self.upstreams_reused),
            ("upstreams.evicted", self.upstreams_evicted),
            ("upstreams.errors", self.upstream_errors),
            ("channels.opened", self.channels_opened),
        ] {
            out.push_str(&format!("amqpool.{name}:{value}|g\n"));
        }
        out
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "clients {}/{} (handshake failures {}), upstreams created {} reused {} evicted {} errors {}, channels {}",
            self.connections_active,
            self.connections_accepted,
            self.handshake_failures,
            self.upstreams_created,
            self.upstreams_reused,
            self.upstreams_evicted,
            self.upstream_errors,
            self.channels_opened,
        )
    }
}

/// Ship metric gauges to a statsd daemon over UDP until shutdown.
///
/// Send failures are logged and ignored; metrics export never interferes
/// with proxying.
pub async fn run_statsd_exporter(
    metrics: Arc<ProxyMetrics>,
    target: String,
    mut shutdown_rx: broadcast::Receiver<Shutdown>,
) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("statsd exporter disabled: cannot bind UDP socket: {}", e);
            return;
        }
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let payload = metrics.snapshot().to_statsd();
                if let Err(e) = socket.send_to(payload.as_bytes(), target.as_str()).await {
                    debug!("statsd send to {} failed: {}", target, e);
                }
            }
            msg = shutdown_rx.recv() => {
                match msg {
                    Ok(Shutdown::StopAccepting) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Ok(Shutdown::Disconnect) | Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
