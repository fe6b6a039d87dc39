//! TLS connector for `amqps` upstream connections
//!
//! Wraps `tokio_rustls::TlsConnector` with webpki root trust. The proxy only
//! dials a single configured broker, so there is no custom CA or client
//! certificate surface; `new_insecure` covers self-signed broker setups.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConfig;
use rustls::RootCertStore;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::error::{ProxyError, Result};

#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Create a connector that verifies the broker against the webpki roots.
    pub fn new() -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = rustls::crypto::ring::default_provider();
        let client_config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Tls(format!("failed to set protocol versions: {e}")))?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Create a connector that skips certificate verification.
    ///
    /// **WARNING**: only for brokers with self-signed certificates.
    pub fn new_insecure() -> Result<Self> {
        let provider = rustls::crypto::ring::default_provider();
        let client_config = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Tls(format!("failed to set protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth();

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Perform the TLS handshake with the broker. `server_name` is used for
    /// SNI and certificate verification.
    pub async fn connect(
        &self,
        stream: TcpStream,
        server_name: &str,
    ) -> Result<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ProxyError::Tls(format!("invalid server name: {server_name}")))?;

        self.inner
            .connect(server_name, stream)
            .await
            .map_err(|e| ProxyError::Tls(format!("TLS handshake failed: {e}")))
    }
}

/// Certificate verifier that accepts any certificate.
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
