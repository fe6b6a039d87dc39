//! Shared fixtures for the integration tests: a mock AMQP broker, a raw
//! frame-level test client, and a proxy harness wired the way `main` wires
//! the real binary.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};

use amqpool::protocol::constants::*;
use amqpool::protocol::frame::{Decoded, Frame};
use amqpool::{Config, ConnectionTracker, Listener, ProxyMetrics, Shutdown, UpstreamPool};

// ============================================================================
// Mock broker
// ============================================================================

#[derive(Default)]
struct BrokerState {
    accepted: AtomicUsize,
    closed: AtomicUsize,
    heartbeats: AtomicUsize,
    killed: AtomicBool,
    kill: Notify,
    /// (connection index, wire channel) per Basic.Publish seen
    publishes: Mutex<Vec<(usize, u16)>>,
    /// (user, password, vhost) per connection
    logins: Mutex<Vec<(String, String, String)>>,
}

/// A minimal in-process AMQP 0-9-1 broker: accepts any credentials, opens
/// any channel, and records what it sees.
pub struct MockBroker {
    pub addr: SocketAddr,
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(BrokerState::default());

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let conn_index = accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(
                    stream,
                    conn_index,
                    Arc::clone(&accept_state),
                ));
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("amqp://{}", self.addr)
    }

    /// TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Connections that have ended (Connection.Close or EOF).
    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Heartbeat frames received from the proxy.
    pub fn heartbeats(&self) -> usize {
        self.state.heartbeats.load(Ordering::SeqCst)
    }

    pub fn publishes(&self) -> Vec<(usize, u16)> {
        self.state.publishes.lock().unwrap().clone()
    }

    pub fn logins(&self) -> Vec<(String, String, String)> {
        self.state.logins.lock().unwrap().clone()
    }

    /// Drop every live broker socket without a Connection.Close, simulating
    /// a broker crash.
    pub fn kill_connections(&self) {
        self.state.killed.store(true, Ordering::SeqCst);
        self.state.kill.notify_waiters();
    }
}

async fn serve_connection(stream: TcpStream, conn_index: usize, state: Arc<BrokerState>) {
    let (mut rd, mut wr) = stream.into_split();

    let mut header = [0u8; 8];
    if rd.read_exact(&mut header).await.is_err() || header != PROTOCOL_HEADER {
        return;
    }

    // Server side of the handshake, as a permissive broker.
    if Frame::connection_start().write_to(&mut wr).await.is_err() {
        return;
    }
    let Some(start_ok) = read_frame(&mut rd).await else {
        return;
    };
    let (mut user, mut password) = (String::new(), String::new());
    if let Ok(Decoded::ConnectionStartOk {
        mechanism,
        response,
    }) = start_ok.decode()
    {
        if mechanism != "PLAIN" {
            return;
        }
        let parts: Vec<&[u8]> = response.splitn(3, |b| *b == 0).collect();
        if parts.len() == 3 {
            user = String::from_utf8_lossy(parts[1]).to_string();
            password = String::from_utf8_lossy(parts[2]).to_string();
        }
    }
    if Frame::connection_tune(2047, DEFAULT_FRAME_MAX, 0)
        .write_to(&mut wr)
        .await
        .is_err()
    {
        return;
    }
    let Some(_tune_ok) = read_frame(&mut rd).await else {
        return;
    };
    let Some(open) = read_frame(&mut rd).await else {
        return;
    };
    if let Ok(Decoded::ConnectionOpen { vhost }) = open.decode() {
        state.logins.lock().unwrap().push((user, password, vhost));
    }
    if Frame::connection_open_ok().write_to(&mut wr).await.is_err() {
        return;
    }

    loop {
        if state.killed.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            _ = state.kill.notified() => return,
            read = Frame::read_from(&mut rd, DEFAULT_FRAME_MAX) => {
                let frame = match read {
                    Ok(Some(frame)) => frame,
                    _ => {
                        state.closed.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                };
                match frame.decode().unwrap_or(Decoded::Passthrough) {
                    Decoded::Heartbeat => {
                        state.heartbeats.fetch_add(1, Ordering::SeqCst);
                    }
                    Decoded::ChannelOpen => {
                        let _ = Frame::channel_open_ok(frame.channel).write_to(&mut wr).await;
                    }
                    Decoded::ChannelClose { .. } => {
                        let _ = Frame::channel_close_ok(frame.channel).write_to(&mut wr).await;
                    }
                    Decoded::ChannelCloseOk => {}
                    Decoded::ConnectionClose { .. } => {
                        let _ = Frame::connection_close_ok().write_to(&mut wr).await;
                        state.closed.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                    Decoded::Passthrough => {
                        if frame.class_method() == Some((60, 40)) {
                            state
                                .publishes
                                .lock()
                                .unwrap()
                                .push((conn_index, frame.channel));
                        }
                        // content header/body frames are ignored
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn read_frame(rd: &mut tokio::net::tcp::OwnedReadHalf) -> Option<Frame> {
    Frame::read_from(rd, DEFAULT_FRAME_MAX).await.ok().flatten()
}

// ============================================================================
// Proxy harness
// ============================================================================

/// A running proxy instance wired like the real binary.
pub struct ProxyHarness {
    pub addr: SocketAddr,
    pub shutdown_tx: broadcast::Sender<Shutdown>,
    pub tracker: Arc<ConnectionTracker>,
    pub pool: Arc<UpstreamPool>,
    pub metrics: Arc<ProxyMetrics>,
}

pub async fn spawn_proxy(upstream_url: &str, idle_timeout_secs: u64) -> ProxyHarness {
    let mut config = Config::default();
    config.server.listen_address = "127.0.0.1".to_string();
    config.server.listen_port = 0;
    config.upstream.url = upstream_url.to_string();
    config.upstream.idle_connection_timeout_secs = idle_timeout_secs;

    let metrics = ProxyMetrics::shared();
    let (shutdown_tx, _) = broadcast::channel(4);
    let pool = Arc::new(UpstreamPool::new(&config, Arc::clone(&metrics)).unwrap());
    UpstreamPool::start_reaper(Arc::clone(&pool), shutdown_tx.subscribe());

    let listener = Listener::bind(
        &config,
        Arc::clone(&pool),
        Arc::clone(&metrics),
        shutdown_tx.clone(),
    )
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();
    let tracker = listener.tracker();
    tokio::spawn(listener.run());

    ProxyHarness {
        addr,
        shutdown_tx,
        tracker,
        pool,
        metrics,
    }
}

// ============================================================================
// Test client
// ============================================================================

/// A frame-level AMQP client driven directly over TCP.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    /// Connect and complete the full downstream handshake. Asserts the
    /// proxy's fixed tune values on the way (broker tuning never leaks
    /// through).
    pub async fn connect(addr: SocketAddr, user: &str, password: &str, vhost: &str) -> Self {
        let mut stream = TcpStream::connect(addr).await.expect("connect to proxy");
        stream.write_all(&PROTOCOL_HEADER).await.unwrap();

        let start = Frame::read_from(&mut stream, DEFAULT_FRAME_MAX)
            .await
            .unwrap()
            .expect("Connection.Start");
        assert_eq!(start.decode().unwrap(), Decoded::ConnectionStart);

        Frame::connection_start_ok_plain(user, password)
            .write_to(&mut stream)
            .await
            .unwrap();

        let tune = Frame::read_from(&mut stream, DEFAULT_FRAME_MAX)
            .await
            .unwrap()
            .expect("Connection.Tune");
        assert_eq!(
            tune.decode().unwrap(),
            Decoded::ConnectionTune {
                channel_max: 0,
                frame_max: DEFAULT_FRAME_MAX,
                heartbeat: 0
            }
        );

        Frame::connection_tune_ok(0, DEFAULT_FRAME_MAX, 0)
            .write_to(&mut stream)
            .await
            .unwrap();
        Frame::connection_open(vhost)
            .write_to(&mut stream)
            .await
            .unwrap();

        let open_ok = Frame::read_from(&mut stream, DEFAULT_FRAME_MAX)
            .await
            .unwrap()
            .expect("Connection.OpenOk");
        assert_eq!(open_ok.decode().unwrap(), Decoded::ConnectionOpenOk);

        Self { stream }
    }

    pub async fn read_frame(&mut self) -> Option<Frame> {
        Frame::read_from(&mut self.stream, DEFAULT_FRAME_MAX)
            .await
            .expect("frame read")
    }

    pub async fn open_channel(&mut self, channel: u16) {
        Frame::channel_open(channel)
            .write_to(&mut self.stream)
            .await
            .unwrap();
        let frame = self.read_frame().await.expect("Channel.OpenOk");
        assert_eq!(frame.channel, channel);
        assert_eq!(frame.decode().unwrap(), Decoded::ChannelOpenOk);
    }

    pub async fn close_channel(&mut self, channel: u16) {
        Frame::channel_close(channel, REPLY_SUCCESS, "bye")
            .write_to(&mut self.stream)
            .await
            .unwrap();
        let frame = self.read_frame().await.expect("Channel.CloseOk");
        assert_eq!(frame.channel, channel);
        assert_eq!(frame.decode().unwrap(), Decoded::ChannelCloseOk);
    }

    /// Basic.Publish plus content header and body; all pass-through frames
    /// from the proxy's point of view.
    pub async fn publish(&mut self, channel: u16, body: &[u8]) {
        let mut args = Vec::new();
        args.extend_from_slice(&0u16.to_be_bytes()); // reserved
        args.push(0); // exchange ""
        args.push(1);
        args.push(b'q'); // routing key "q"
        args.push(0); // mandatory/immediate flags
        Frame::method(channel, 60, 40, &args)
            .write_to(&mut self.stream)
            .await
            .unwrap();

        let mut header = Vec::new();
        header.extend_from_slice(&60u16.to_be_bytes()); // class
        header.extend_from_slice(&0u16.to_be_bytes()); // weight
        header.extend_from_slice(&(body.len() as u64).to_be_bytes());
        header.extend_from_slice(&0u16.to_be_bytes()); // property flags
        Frame {
            frame_type: FRAME_CONTENT_HEADER,
            channel,
            payload: header,
        }
        .write_to(&mut self.stream)
        .await
        .unwrap();

        Frame {
            frame_type: FRAME_CONTENT_BODY,
            channel,
            payload: body.to_vec(),
        }
        .write_to(&mut self.stream)
        .await
        .unwrap();
    }

    /// A single content-body frame on a channel the session never opened.
    pub async fn send_unbound_frame(&mut self, channel: u16) {
        Frame {
            frame_type: FRAME_CONTENT_BODY,
            channel,
            payload: b"never opened".to_vec(),
        }
        .write_to(&mut self.stream)
        .await
        .unwrap();
    }

    pub async fn heartbeat_roundtrip(&mut self) {
        Frame::heartbeat().write_to(&mut self.stream).await.unwrap();
        let frame = self.read_frame().await.expect("heartbeat echo");
        assert_eq!(frame.decode().unwrap(), Decoded::Heartbeat);
    }

    /// Read frames until a Connection.Close arrives; returns (code, text).
    pub async fn expect_connection_close(&mut self) -> (u16, String) {
        loop {
            let frame = self.read_frame().await.expect("Connection.Close");
            if let Decoded::ConnectionClose {
                reply_code,
                reply_text,
            } = frame.decode().unwrap()
            {
                return (reply_code, reply_text);
            }
        }
    }

    /// Clean close: Connection.Close -> CloseOk, then the proxy closes the
    /// socket.
    pub async fn close(mut self) {
        Frame::connection_close(REPLY_SUCCESS, "bye")
            .write_to(&mut self.stream)
            .await
            .unwrap();
        let frame = self.read_frame().await.expect("Connection.CloseOk");
        assert_eq!(frame.decode().unwrap(), Decoded::ConnectionCloseOk);
        assert!(self.read_frame().await.is_none(), "proxy should close the socket");
    }
}
