//! Server side of the proxy
//!
//! This module contains:
//! - TCP listener and shutdown choreography
//! - Client session handler (handshake + frame pump)
//! - Network stream abstraction (TCP/TLS)
//! - Live connection tracking
//! - Metrics collection

pub mod listener;
pub mod metrics;
pub mod session;
pub mod stream;
pub mod tracker;

pub use listener::{Listener, Shutdown};
pub use metrics::{MetricsSnapshot, ProxyMetrics};
pub use session::{ClientSession, SessionHandle};
pub use stream::NetworkStream;
pub use tracker::{ConnectionGuard, ConnectionTracker};
