//! Pool of idle upstream broker connections
//!
//! The pool holds only idle connections (zero bound channels); a session that
//! borrows one has exclusive use of it until it is checked back in. Lists are
//! most-recently-used first, so a busy credential set keeps riding the same
//! warm socket while stale ones age out and get reaped.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{Config, UpstreamAddr};
use crate::error::Result;
use crate::server::listener::Shutdown;
use crate::server::metrics::ProxyMetrics;
use crate::tls::TlsConnector;

use super::Upstream;

/// The tuple a downstream handshake produces, and the key upstream
/// connections are pooled under.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub vhost: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("vhost", &self.vhost)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Pool of idle upstream connections keyed by credentials.
pub struct UpstreamPool {
    idle: StdMutex<HashMap<Credentials, Vec<Arc<Upstream>>>>,
    addr: UpstreamAddr,
    tls: Option<TlsConnector>,
    idle_timeout: Duration,
    metrics: Arc<ProxyMetrics>,
}

impl UpstreamPool {
    pub fn new(config: &Config, metrics: Arc<ProxyMetrics>) -> Result<Self> {
        let addr = config.upstream_addr()?;
        let tls = if addr.tls {
            Some(if config.upstream.tls_insecure {
                TlsConnector::new_insecure()?
            } else {
                TlsConnector::new()?
            })
        } else {
            None
        };
        Ok(Self {
            idle: StdMutex::new(HashMap::new()),
            addr,
            tls,
            idle_timeout: Duration::from_secs(config.upstream.idle_connection_timeout_secs),
            metrics,
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Number of idle connections currently pooled.
    pub fn idle_count(&self) -> usize {
        self.lock().values().map(|list| list.len()).sum()
    }

    /// Pop the most recently used idle upstream for the credentials, or dial
    /// a fresh one. Dialing happens outside the pool lock so slow connects
    /// never serialize behind each other.
    pub async fn borrow(&self, creds: &Credentials) -> Result<Arc<Upstream>> {
        loop {
            let candidate = {
                let mut idle = self.lock();
                match idle.get_mut(creds) {
                    Some(list) if !list.is_empty() => Some(list.remove(0)),
                    _ => None,
                }
            };
            match candidate {
                Some(upstream) if upstream.is_closed() => {
                    debug!(
                        upstream = upstream.id(),
                        "Dropping dead upstream found in the pool"
                    );
                    continue;
                }
                Some(upstream) => {
                    upstream.touch();
                    self.metrics.upstream_reused();
                    debug!(upstream = upstream.id(), "Reusing pooled upstream connection");
                    return Ok(upstream);
                }
                None => break,
            }
        }

        let upstream =
            Upstream::connect(&self.addr, creds, self.tls.as_ref(), Arc::clone(&self.metrics))
                .await?;
        self.metrics.upstream_created();
        Ok(upstream)
    }

    /// Return a borrowed upstream to the idle list. The connection must have
    /// no bound channels; a dirty one is discarded instead of pooled.
    pub fn checkin(&self, creds: &Credentials, upstream: Arc<Upstream>) {
        if upstream.is_closed() {
            return;
        }
        if upstream.bound_channels() != 0 {
            warn!(
                upstream = upstream.id(),
                "Refusing to pool an upstream with bound channels"
            );
            upstream.mark_closed();
            return;
        }
        upstream.touch();
        self.lock().entry(creds.clone()).or_default().insert(0, upstream);
    }

    /// Close idle connections that outlived the timeout, and drop dead ones.
    async fn reap(&self) {
        let expired: Vec<Arc<Upstream>> = {
            let mut idle = self.lock();
            let mut expired = Vec::new();
            for list in idle.values_mut() {
                let mut keep = Vec::with_capacity(list.len());
                for upstream in list.drain(..) {
                    if upstream.is_closed() {
                        continue;
                    }
                    if upstream.idle_for() >= self.idle_timeout {
                        expired.push(upstream);
                    } else {
                        keep.push(upstream);
                    }
                }
                *list = keep;
            }
            idle.retain(|_, list| !list.is_empty());
            expired
        };

        for upstream in expired {
            debug!(upstream = upstream.id(), "Evicting idle upstream connection");
            self.metrics.upstream_evicted();
            upstream.close_gracefully().await;
        }
    }

    /// Periodically scan the idle lists until shutdown.
    pub fn start_reaper(
        pool: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<Shutdown>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = pool
                .idle_timeout
                .min(Duration::from_secs(1))
                .max(Duration::from_millis(100));
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.reap().await,
                    msg = shutdown_rx.recv() => match msg {
                        Ok(Shutdown::StopAccepting)
                        | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Ok(Shutdown::Disconnect)
                        | Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Gracefully close every idle connection. Called once at shutdown.
    pub async fn shutdown(&self) {
        let all: Vec<Arc<Upstream>> = {
            let mut idle = self.lock();
            idle.drain().flat_map(|(_, list)| list).collect()
        };
        for upstream in all {
            upstream.close_gracefully().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Credentials, Vec<Arc<Upstream>>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}
