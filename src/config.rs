//! Configuration loading and validation
//!
//! Configuration comes from an optional YAML file with CLI overrides applied
//! on top (see `main.rs`). Only `upstream.url` is required.

use serde::Deserialize;
use std::path::Path;
use url::Url;

use crate::error::{ProxyError, Result};

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Downstream listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream broker configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Statsd metrics export (disabled when host is empty)
    #[serde(default)]
    pub statsd: StatsdConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen_address: String,
    pub listen_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "localhost".to_string(),
            listen_port: 5673,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    /// AMQP(S) URL of the broker, e.g. `amqp://broker.example.com:5672`.
    /// Client credentials are forwarded as-is; any userinfo or path in the
    /// URL is ignored.
    pub url: String,
    /// Seconds an unused pooled connection is kept before being closed.
    pub idle_connection_timeout_secs: u64,
    /// Skip TLS certificate verification for `amqps` upstreams.
    pub tls_insecure: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            idle_connection_timeout_secs: 5,
            tls_insecure: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Default log level; the RUST_LOG environment variable wins.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatsdConfig {
    pub host: String,
    pub port: u16,
}

impl Default for StatsdConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8125,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| ProxyError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Validate the configuration. Fatal at startup only.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.url.is_empty() {
            return Err(ProxyError::Config(
                "upstream.url is required (e.g. amqp://localhost:5672)".into(),
            ));
        }
        self.upstream_addr().map(|_| ())
    }

    /// The parsed broker endpoint.
    pub fn upstream_addr(&self) -> Result<UpstreamAddr> {
        UpstreamAddr::parse(&self.upstream.url)
    }

    /// The downstream listen address as `host:port`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.listen_address, self.server.listen_port)
    }
}

/// Broker endpoint derived from the upstream URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAddr {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl UpstreamAddr {
    /// Parse an `amqp://` or `amqps://` URL. Ports default to 5672 and 5671.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| ProxyError::Config(format!("invalid upstream URL {raw:?}: {e}")))?;

        let tls = match url.scheme() {
            "amqp" => false,
            "amqps" => true,
            other => {
                return Err(ProxyError::Config(format!(
                    "unsupported upstream scheme {other:?} (expected amqp or amqps)"
                )))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Config(format!("upstream URL {raw:?} has no host")))?
            .to_string();
        let port = url.port().unwrap_or(if tls { 5671 } else { 5672 });

        Ok(Self { host, port, tls })
    }
}
