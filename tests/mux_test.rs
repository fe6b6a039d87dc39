//! Channel multiplexing and upstream failure behavior.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use amqpool::config::UpstreamAddr;
use amqpool::{Credentials, ProxyMetrics, SessionHandle, Upstream};
use common::{spawn_proxy, MockBroker, TestClient};

/// S3: two serial clients on the same credentials publish over the SAME
/// broker connection but on DIFFERENT wire channel numbers (the free-channel
/// queue does not immediately reissue a freed number).
#[tokio::test]
async fn test_channel_multiplexing_serial_clients() {
    let broker = MockBroker::start().await;
    let proxy = spawn_proxy(&broker.url(), 5).await;

    let mut first = TestClient::connect(proxy.addr, "guest", "guest", "/").await;
    first.open_channel(1).await;
    first.publish(1, b"from-first").await;
    first.close_channel(1).await;
    first.close().await;

    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut second = TestClient::connect(proxy.addr, "guest", "guest", "/").await;
    second.open_channel(1).await;
    second.publish(1, b"from-second").await;
    second.close_channel(1).await;
    second.close().await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(broker.accepted(), 1, "one shared upstream connection");
    let publishes = broker.publishes();
    assert_eq!(publishes.len(), 2);
    assert_eq!(publishes[0].0, publishes[1].0, "same broker connection");
    assert_ne!(
        publishes[0].1, publishes[1].1,
        "distinct wire channel numbers"
    );
}

/// A channel number freed by one client is reissued only after the rest of
/// the range has been used.
#[tokio::test]
async fn test_channel_numbers_translate() {
    let broker = MockBroker::start().await;
    let proxy = spawn_proxy(&broker.url(), 5).await;

    let mut client = TestClient::connect(proxy.addr, "guest", "guest", "/").await;
    // The client's channel ids need not match the wire's.
    client.open_channel(7).await;
    client.open_channel(42).await;
    client.publish(7, b"a").await;
    client.publish(42, b"b").await;
    client.close_channel(7).await;
    client.close_channel(42).await;
    client.close().await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    let publishes = broker.publishes();
    assert_eq!(publishes.len(), 2);
    let wire_channels: HashSet<u16> = publishes.iter().map(|(_, ch)| *ch).collect();
    assert_eq!(wire_channels.len(), 2, "channels stay distinct on the wire");
}

/// Channel-number isolation: concurrent sessions binding channels on one
/// upstream get disjoint sets of wire channel numbers.
#[tokio::test]
async fn test_upstream_channel_isolation() {
    let broker = MockBroker::start().await;

    let addr = UpstreamAddr::parse(&broker.url()).unwrap();
    let creds = Credentials {
        vhost: "/".to_string(),
        user: "guest".to_string(),
        password: "guest".to_string(),
    };
    let upstream = Upstream::connect(&addr, &creds, None, ProxyMetrics::shared())
        .await
        .unwrap();

    let handle_a = session_handle(101).await;
    let handle_b = session_handle(102).await;

    let task_a = {
        let upstream = Arc::clone(&upstream);
        let handle = handle_a.clone();
        tokio::spawn(async move {
            (1..=50u16)
                .map(|c| upstream.open_channel(&handle, c).unwrap())
                .collect::<Vec<u16>>()
        })
    };
    let task_b = {
        let upstream = Arc::clone(&upstream);
        let handle = handle_b.clone();
        tokio::spawn(async move {
            (1..=50u16)
                .map(|c| upstream.open_channel(&handle, c).unwrap())
                .collect::<Vec<u16>>()
        })
    };

    let channels_a = task_a.await.unwrap();
    let channels_b = task_b.await.unwrap();

    let set_a: HashSet<u16> = channels_a.iter().copied().collect();
    let set_b: HashSet<u16> = channels_b.iter().copied().collect();
    assert_eq!(set_a.len(), 50, "no duplicates within a session");
    assert_eq!(set_b.len(), 50);
    assert!(set_a.is_disjoint(&set_b), "sessions never share a wire channel");

    // Double-opening a client channel is refused.
    assert!(upstream.open_channel(&handle_a, 1).is_err());

    for channel in set_a.iter().chain(set_b.iter()) {
        upstream.release_channel(*channel);
    }
    assert_eq!(upstream.bound_channels(), 0);
    assert!(!upstream.has_bindings_for(101));
    assert!(!upstream.has_bindings_for(102));
}

/// S6: the broker socket dies while a client holds a channel. The client
/// receives a Connection.Close mentioning UPSTREAM_ERROR and the dead
/// upstream never returns to the pool.
#[tokio::test]
async fn test_upstream_crash_notifies_client() {
    let broker = MockBroker::start().await;
    let proxy = spawn_proxy(&broker.url(), 5).await;

    let mut client = TestClient::connect(proxy.addr, "guest", "guest", "/").await;
    client.open_channel(1).await;

    broker.kill_connections();

    let (reply_code, reply_text) = client.expect_connection_close().await;
    assert_eq!(reply_code, 320);
    assert!(
        reply_text.contains("UPSTREAM_ERROR"),
        "reply-text was {reply_text:?}"
    );
    drop(client);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(proxy.pool.idle_count(), 0, "dead upstream is not pooled");
    assert_eq!(proxy.metrics.snapshot().upstream_errors, 1);

    // A fresh client gets a fresh broker connection.
    let replacement = TestClient::connect(proxy.addr, "guest", "guest", "/").await;
    replacement.close().await;
    assert_eq!(broker.accepted(), 2);
}

/// A frame on a channel that was never opened is a protocol violation: the
/// proxy answers with a descriptive Connection.Close.
#[tokio::test]
async fn test_frame_on_unbound_channel_closes_session() {
    let broker = MockBroker::start().await;
    let proxy = spawn_proxy(&broker.url(), 5).await;

    let mut client = TestClient::connect(proxy.addr, "guest", "guest", "/").await;
    client.send_unbound_frame(9).await;

    let (reply_code, reply_text) = client.expect_connection_close().await;
    assert_eq!(reply_code, 503);
    assert!(reply_text.contains("unbound channel"));
}

async fn session_handle(id: u64) -> SessionHandle {
    // SessionHandle needs a real socket write half; pair one up locally.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let _peer = accepted.unwrap().0;
    let (_rd, wr) = tokio::io::split(connected.unwrap());
    SessionHandle::new(id, wr)
}
