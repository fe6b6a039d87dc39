//! TCP listener and shutdown choreography

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::upstream::pool::UpstreamPool;

use super::metrics::ProxyMetrics;
use super::session::ClientSession;
use super::tracker::ConnectionTracker;

/// Shutdown phases broadcast to the listener and every live session.
///
/// The first SIGINT/SIGTERM maps to [`Shutdown::StopAccepting`] (the
/// listener closes, existing sessions continue), the second to
/// [`Shutdown::Disconnect`] (every session sends the client a
/// Connection.Close and terminates).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    StopAccepting,
    Disconnect,
}

/// TCP listener that accepts downstream AMQP clients.
pub struct Listener {
    listener: TcpListener,
    pool: Arc<UpstreamPool>,
    metrics: Arc<ProxyMetrics>,
    tracker: Arc<ConnectionTracker>,
    shutdown_tx: broadcast::Sender<Shutdown>,
}

impl Listener {
    /// Bind to the configured address.
    pub async fn bind(
        config: &Config,
        pool: Arc<UpstreamPool>,
        metrics: Arc<ProxyMetrics>,
        shutdown_tx: broadcast::Sender<Shutdown>,
    ) -> Result<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::Config(format!("cannot listen on {addr}: {e}")))?;
        info!("Listening on {}", addr);
        Ok(Self {
            listener,
            pool,
            metrics,
            tracker: ConnectionTracker::shared(),
            shutdown_tx,
        })
    }

    /// The bound address; useful when listening on port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The live client connection count shared with spawned sessions.
    pub fn tracker(&self) -> Arc<ConnectionTracker> {
        Arc::clone(&self.tracker)
    }

    /// Run the accept loop until the first shutdown phase. Dropping the
    /// listener on return is what makes new connections get refused;
    /// existing sessions keep running on their own tasks.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted client connection from {}", addr);
                            self.metrics.connection_accepted();
                            let guard = self.tracker.guard();
                            let pool = Arc::clone(&self.pool);
                            let metrics = Arc::clone(&self.metrics);
                            let session_shutdown = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                let _guard = guard;
                                if let Err(e) =
                                    ClientSession::run(stream, addr, pool, Arc::clone(&metrics), session_shutdown)
                                        .await
                                {
                                    warn!("Client session from {} failed: {}", addr, e);
                                }
                                metrics.connection_closed();
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                msg = shutdown_rx.recv() => {
                    match msg {
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        _ => {
                            info!("Stopped accepting client connections");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
