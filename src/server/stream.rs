//! Network stream abstraction for TCP and TLS connections
//!
//! `NetworkStream` lets the upstream code work with a broker socket without
//! caring whether TLS is in use. Downstream client sockets are always plain
//! TCP, so only the client-side TLS variant exists.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// A broker-facing stream: plain TCP or TLS-encrypted.
///
/// The TLS variant is boxed to reduce the size difference between variants.
pub enum NetworkStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl NetworkStream {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, NetworkStream::Tls(_))
    }
}

impl AsyncRead for NetworkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            NetworkStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetworkStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            NetworkStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            NetworkStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetworkStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            NetworkStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
