//! Error types for amqpool

use thiserror::Error;

/// Main error type for the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    /// I/O error (network, file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// AMQP framing or method parsing error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Failure during the initial handshake on either hop
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// I/O problem on a downstream client socket
    #[error("Client connection error: {0}")]
    Client(String),

    /// I/O problem on an upstream broker socket
    #[error("Upstream connection error: {0}")]
    Upstream(String),

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    Tls(String),
}

/// Result type alias for ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;
