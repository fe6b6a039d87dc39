//! amqpool - AMQP 0-9-1 connection pooling proxy
//!
//! This library provides the core functionality for a proxy that:
//! - Accepts downstream AMQP 0-9-1 clients and runs the server side of the
//!   handshake to learn their (vhost, user, password)
//! - Pools long-lived upstream broker connections keyed by those credentials
//! - Multiplexes client channels onto pooled connections with strict
//!   bidirectional channel-number translation
//! - Coordinates the two-phase graceful shutdown driven by signals

#[macro_use]
mod logging;

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tls;
pub mod upstream;

pub use config::Config;
pub use error::{ProxyError, Result};
pub use server::{
    ConnectionTracker, Listener, MetricsSnapshot, ProxyMetrics, SessionHandle, Shutdown,
};
pub use tls::TlsConnector;
pub use upstream::pool::{Credentials, UpstreamPool};
pub use upstream::Upstream;
