//! Downstream handshake scenarios against a mock broker.

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use amqpool::protocol::constants::PROTOCOL_HEADER;
use common::{spawn_proxy, MockBroker, TestClient};

/// S1: full handshake, clean Connection.Close, socket closed by the proxy.
/// The handshake alone creates exactly one upstream connection.
#[tokio::test]
async fn test_handshake_and_clean_close() {
    let broker = MockBroker::start().await;
    let proxy = spawn_proxy(&broker.url(), 5).await;

    let client = TestClient::connect(proxy.addr, "guest", "guest", "/").await;
    client.close().await;

    assert_eq!(broker.accepted(), 1);
    let logins = broker.logins();
    assert_eq!(logins.len(), 1);
    assert_eq!(
        logins[0],
        ("guest".to_string(), "guest".to_string(), "/".to_string())
    );
}

/// The vhost from Connection.Open reaches the broker untouched.
#[tokio::test]
async fn test_vhost_forwarded() {
    let broker = MockBroker::start().await;
    let proxy = spawn_proxy(&broker.url(), 5).await;

    let client = TestClient::connect(proxy.addr, "app", "pw", "/staging").await;
    client.close().await;

    assert_eq!(
        broker.logins(),
        vec![("app".to_string(), "pw".to_string(), "/staging".to_string())]
    );
}

/// S5: a bad protocol header gets the canonical 8-byte AMQP 0-9-1 header
/// back, the socket is closed, and no upstream connection is opened.
#[tokio::test]
async fn test_bad_protocol_header() {
    let broker = MockBroker::start().await;
    let proxy = spawn_proxy(&broker.url(), 5).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(b"HTTP\0\0\0\0").await.unwrap();

    let mut answer = [0u8; 8];
    stream.read_exact(&mut answer).await.unwrap();
    assert_eq!(answer, PROTOCOL_HEADER);

    // Socket is closed after the header.
    let mut rest = [0u8; 1];
    assert!(stream.read_exact(&mut rest).await.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.accepted(), 0);
    assert_eq!(proxy.metrics.snapshot().handshake_failures, 1);
}

/// Heartbeat locality: a client heartbeat is echoed on the client hop and
/// never shows up on the broker hop.
#[tokio::test]
async fn test_heartbeat_is_hop_local() {
    let broker = MockBroker::start().await;
    let proxy = spawn_proxy(&broker.url(), 5).await;

    let mut client = TestClient::connect(proxy.addr, "guest", "guest", "/").await;
    client.heartbeat_roundtrip().await;
    client.heartbeat_roundtrip().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.heartbeats(), 0);

    client.close().await;
}
