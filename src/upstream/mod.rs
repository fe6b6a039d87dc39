//! Upstream broker connections
//!
//! An [`Upstream`] owns one TCP (optionally TLS) connection to the broker:
//! it runs the client side of the AMQP 0-9-1 handshake, allocates channel
//! numbers on behalf of downstream sessions, and its read loop dispatches
//! broker frames back to whichever session is bound to each channel.
//!
//! Channel numbers are handed out from a FIFO queue over `[1, channel_max]`
//! so a freed number is not immediately reissued. The binding table and its
//! reverse index live under one mutex, which keeps the session-side view of
//! the mapping symmetric with the broker-side view by construction.

pub mod pool;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

use crate::config::UpstreamAddr;
use crate::error::{ProxyError, Result};
use crate::protocol::constants::*;
use crate::protocol::frame::{Decoded, Frame};
use crate::server::metrics::ProxyMetrics;
use crate::server::session::SessionHandle;
use crate::server::stream::NetworkStream;
use crate::tls::TlsConnector;

use pool::Credentials;

static NEXT_UPSTREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Tuning parameters negotiated with the broker. Zero values from the wire
/// ("no limit") are already substituted with usable bounds.
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

/// The downstream endpoint of one wire channel.
struct ChannelBinding {
    session: SessionHandle,
    client_channel: u16,
    /// Channel.OpenOk has passed through.
    open: bool,
}

struct UpstreamState {
    /// upstream channel number -> downstream binding
    bindings: HashMap<u16, ChannelBinding>,
    /// (session id, client channel) -> upstream channel number
    by_client: HashMap<(u64, u16), u16>,
    free_channels: VecDeque<u16>,
    last_used: Instant,
}

/// One pooled connection to the broker.
pub struct Upstream {
    id: u64,
    peer: String,
    tuning: Tuning,
    writer: Mutex<WriteHalf<NetworkStream>>,
    state: StdMutex<UpstreamState>,
    closed: AtomicBool,
    /// Signaled whenever bindings are removed; release waits on this.
    drained: Notify,
    metrics: Arc<ProxyMetrics>,
}

impl Upstream {
    /// Dial the broker, run the client side of the AMQP handshake with the
    /// given credentials, and spawn the read loop.
    pub async fn connect(
        addr: &UpstreamAddr,
        creds: &Credentials,
        tls: Option<&TlsConnector>,
        metrics: Arc<ProxyMetrics>,
    ) -> Result<Arc<Self>> {
        let tcp = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| {
                ProxyError::Upstream(format!("connect to {}:{} failed: {e}", addr.host, addr.port))
            })?;
        tcp.set_nodelay(true).ok();

        let mut stream = match tls {
            Some(connector) => {
                NetworkStream::Tls(Box::new(connector.connect(tcp, &addr.host).await?))
            }
            None => NetworkStream::Tcp(tcp),
        };

        let tuning = negotiate(&mut stream, creds).await?;

        let (read_half, write_half) = tokio::io::split(stream);
        let upstream = Arc::new(Self {
            id: NEXT_UPSTREAM_ID.fetch_add(1, Ordering::Relaxed),
            peer: format!("{}:{}", addr.host, addr.port),
            tuning,
            writer: Mutex::new(write_half),
            state: StdMutex::new(UpstreamState {
                bindings: HashMap::new(),
                by_client: HashMap::new(),
                free_channels: (1..=tuning.channel_max).collect(),
                last_used: Instant::now(),
            }),
            closed: AtomicBool::new(false),
            drained: Notify::new(),
            metrics,
        });

        debug!(
            upstream = upstream.id,
            peer = %upstream.peer,
            channel_max = tuning.channel_max,
            frame_max = tuning.frame_max,
            tls = addr.tls,
            "Upstream connection established"
        );
        tokio::spawn(Arc::clone(&upstream).read_loop(read_half));
        Ok(upstream)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tuning(&self) -> Tuning {
        self.tuning
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark dead. Returns whether the connection was already marked.
    pub fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn touch(&self) {
        self.state().last_used = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.state().last_used.elapsed()
    }

    pub fn bound_channels(&self) -> usize {
        self.state().bindings.len()
    }

    fn state(&self) -> MutexGuard<'_, UpstreamState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate an upstream channel number for a session's logical channel
    /// and install the binding.
    pub fn open_channel(&self, session: &SessionHandle, client_channel: u16) -> Result<u16> {
        let mut state = self.state();
        if state
            .by_client
            .contains_key(&(session.id(), client_channel))
        {
            return Err(ProxyError::Protocol(format!(
                "channel {client_channel} is already open"
            )));
        }
        let upstream_channel = state.free_channels.pop_front().ok_or_else(|| {
            ProxyError::Protocol("no free channels left on the upstream connection".into())
        })?;
        state
            .by_client
            .insert((session.id(), client_channel), upstream_channel);
        state.bindings.insert(
            upstream_channel,
            ChannelBinding {
                session: session.clone(),
                client_channel,
                open: false,
            },
        );
        state.last_used = Instant::now();
        Ok(upstream_channel)
    }

    /// The upstream channel currently carrying a session's logical channel.
    pub fn client_binding(&self, session_id: u64, client_channel: u16) -> Option<u16> {
        self.state()
            .by_client
            .get(&(session_id, client_channel))
            .copied()
    }

    /// Free an upstream channel and drop its binding.
    pub fn release_channel(&self, upstream_channel: u16) {
        self.take_binding(upstream_channel);
    }

    fn take_binding(&self, upstream_channel: u16) -> Option<ChannelBinding> {
        let binding = {
            let mut state = self.state();
            let binding = state.bindings.remove(&upstream_channel)?;
            state
                .by_client
                .remove(&(binding.session.id(), binding.client_channel));
            state.free_channels.push_back(upstream_channel);
            state.last_used = Instant::now();
            binding
        };
        self.drained.notify_waiters();
        Some(binding)
    }

    pub fn has_bindings_for(&self, session_id: u64) -> bool {
        self.state()
            .bindings
            .values()
            .any(|b| b.session.id() == session_id)
    }

    /// Upstream channel numbers currently bound for a session.
    pub fn channels_for(&self, session_id: u64) -> Vec<u16> {
        self.state()
            .bindings
            .iter()
            .filter(|(_, b)| b.session.id() == session_id)
            .map(|(u, _)| *u)
            .collect()
    }

    /// Drop every binding a session still holds, freeing the channels.
    pub fn purge_session(&self, session_id: u64) {
        let channels = self.channels_for(session_id);
        for upstream_channel in channels {
            self.take_binding(upstream_channel);
        }
    }

    /// Wait until the session has no bindings left. Returns false if the
    /// timeout expired or the connection died first.
    pub async fn wait_session_drained(&self, session_id: u64, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.drained.notified();
            if !self.has_bindings_for(session_id) {
                return true;
            }
            if self.is_closed() {
                return false;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !self.has_bindings_for(session_id);
            }
        }
    }

    /// Write a frame to the broker. The writer mutex wraps the complete
    /// encode+flush, so frames are atomic at frame boundaries.
    pub async fn write_frame(&self, frame: &Frame) -> Result<()> {
        if self.is_closed() {
            return Err(ProxyError::Upstream(
                "upstream connection is closed".into(),
            ));
        }
        if let Err(e) = self.send_raw(frame).await {
            self.mark_closed();
            return Err(ProxyError::Upstream(format!("write to broker failed: {e}")));
        }
        Ok(())
    }

    async fn send_raw(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        frame.write_to(&mut *writer).await
    }

    /// Best-effort graceful shutdown of an idle connection: Connection.Close
    /// is sent and the read loop consumes the broker's CloseOk as it exits.
    pub async fn close_gracefully(&self) {
        if self.mark_closed() {
            return;
        }
        debug!(upstream = self.id, "Closing upstream connection");
        let close = Frame::connection_close(REPLY_SUCCESS, "connection idle timeout");
        let _ = self.send_raw(&close).await;
    }

    /// Close the write half so the broker (and our read loop) observe EOF.
    pub async fn shutdown_socket(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Single reader per upstream: consumes broker frames and dispatches
    /// them to bound sessions with the channel number rewritten.
    async fn read_loop(self: Arc<Self>, mut reader: ReadHalf<NetworkStream>) {
        let max_payload = self.tuning.frame_max.max(DEFAULT_FRAME_MAX);
        loop {
            let frame = match Frame::read_from(&mut reader, max_payload).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.broker_gone("broker closed the connection").await;
                    return;
                }
                Err(e) => {
                    self.broker_gone(&format!("broker read failed: {e}")).await;
                    return;
                }
            };

            let decoded = match frame.decode() {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.broker_gone(&format!("undecodable broker frame: {e}"))
                        .await;
                    return;
                }
            };

            match decoded {
                Decoded::Heartbeat => {
                    // Heartbeats are hop-by-hop: answer the broker, never
                    // forward downstream.
                    let _ = self.write_frame(&Frame::heartbeat()).await;
                }
                Decoded::ConnectionClose {
                    reply_code,
                    reply_text,
                } => {
                    debug!(
                        upstream = self.id,
                        code = reply_code,
                        text = %reply_text,
                        "Broker closed the connection"
                    );
                    let _ = self.send_raw(&Frame::connection_close_ok()).await;
                    self.mark_closed();
                    self.fan_out_close(reply_code, &reply_text).await;
                    return;
                }
                Decoded::ConnectionCloseOk => {
                    self.mark_closed();
                    debug!(upstream = self.id, "Upstream connection closed cleanly");
                    return;
                }
                Decoded::ChannelCloseOk => {
                    if let Some(binding) = self.take_binding(frame.channel) {
                        let mut frame = frame;
                        frame.channel = binding.client_channel;
                        let _ = binding.session.write_frame(&frame).await;
                    }
                }
                Decoded::ChannelOpenOk => {
                    let target = {
                        let mut state = self.state();
                        state.bindings.get_mut(&frame.channel).and_then(|binding| {
                            if binding.open {
                                // duplicate OpenOk, drop it
                                return None;
                            }
                            binding.open = true;
                            Some((binding.session.clone(), binding.client_channel))
                        })
                    };
                    self.forward(frame, target).await;
                }
                // Channel.Close from the broker and every pass-through frame
                // travel the same path: translate the channel, hand it to the
                // bound session.
                _ => {
                    if frame.channel == 0 {
                        trace!(
                            upstream = self.id,
                            "Discarding unexpected channel-0 frame from broker"
                        );
                        continue;
                    }
                    let target = {
                        let state = self.state();
                        state
                            .bindings
                            .get(&frame.channel)
                            .map(|binding| (binding.session.clone(), binding.client_channel))
                    };
                    self.forward(frame, target).await;
                }
            }
        }
    }

    async fn forward(&self, mut frame: Frame, target: Option<(SessionHandle, u16)>) {
        match target {
            Some((session, client_channel)) => {
                frame.channel = client_channel;
                // A failed client write means that session is going away; its
                // own pump notices and releases.
                let _ = session.write_frame(&frame).await;
            }
            None => {
                // Race with a client disconnect; the channel is already free.
                trace!(
                    upstream = self.id,
                    channel = frame.channel,
                    "Discarding frame for unbound channel"
                );
            }
        }
    }

    /// The broker went away or closed us: purge every binding and tell the
    /// affected clients their connection is gone.
    async fn broker_gone(&self, reason: &str) {
        let was_closed = self.mark_closed();
        if !was_closed {
            debug!(upstream = self.id, reason = %reason, "Upstream connection lost");
        }
        self.fan_out_close(
            REPLY_CONNECTION_FORCED,
            &format!("UPSTREAM_ERROR - {reason}"),
        )
        .await;
    }

    async fn fan_out_close(&self, reply_code: u16, reply_text: &str) {
        let bindings: Vec<ChannelBinding> = {
            let mut state = self.state();
            let drained: Vec<(u16, ChannelBinding)> = state.bindings.drain().collect();
            state.by_client.clear();
            for (upstream_channel, _) in &drained {
                state.free_channels.push_back(*upstream_channel);
            }
            drained.into_iter().map(|(_, binding)| binding).collect()
        };
        self.drained.notify_waiters();

        if bindings.is_empty() {
            return;
        }
        self.metrics.upstream_error();
        warn!(
            upstream = self.id,
            code = reply_code,
            text = %reply_text,
            channels = bindings.len(),
            "Upstream connection ended with bound channels"
        );

        let close = Frame::connection_close(reply_code, reply_text);
        let mut notified = HashSet::new();
        for binding in bindings {
            if notified.insert(binding.session.id()) {
                let _ = binding.session.write_frame(&close).await;
            }
        }
    }
}

/// Client side of the AMQP handshake, §4.2 style: we present the downstream
/// client's credentials to the broker over PLAIN.
async fn negotiate(stream: &mut NetworkStream, creds: &Credentials) -> Result<Tuning> {
    stream.write_all(&PROTOCOL_HEADER).await?;
    stream.flush().await?;

    let frame = expect_frame(stream, "Connection.Start").await?;
    match frame.decode()? {
        Decoded::ConnectionStart => {}
        _ => return Err(unexpected(&frame, "Connection.Start")),
    }

    Frame::connection_start_ok_plain(&creds.user, &creds.password)
        .write_to(stream)
        .await?;

    let frame = expect_frame(stream, "Connection.Tune").await?;
    let proposed = match frame.decode()? {
        Decoded::ConnectionTune {
            channel_max,
            frame_max,
            heartbeat,
        } => Tuning {
            channel_max,
            frame_max,
            heartbeat,
        },
        Decoded::ConnectionClose {
            reply_code,
            reply_text,
        } => {
            // authentication_failure_close: the broker refused the
            // credentials instead of tuning.
            let _ = Frame::connection_close_ok().write_to(stream).await;
            return Err(ProxyError::Negotiation(format!(
                "broker rejected the connection: {reply_code} {reply_text}"
            )));
        }
        _ => return Err(unexpected(&frame, "Connection.Tune")),
    };

    // TuneOk copies the broker's values verbatim; the zeros meaning
    // "no limit" only get substituted in the tuning we keep.
    Frame::connection_tune_ok(proposed.channel_max, proposed.frame_max, proposed.heartbeat)
        .write_to(stream)
        .await?;
    Frame::connection_open(&creds.vhost).write_to(stream).await?;

    let frame = expect_frame(stream, "Connection.OpenOk").await?;
    match frame.decode()? {
        Decoded::ConnectionOpenOk => {}
        Decoded::ConnectionClose {
            reply_code,
            reply_text,
        } => {
            let _ = Frame::connection_close_ok().write_to(stream).await;
            return Err(ProxyError::Negotiation(format!(
                "broker refused vhost {:?}: {reply_code} {reply_text}",
                creds.vhost
            )));
        }
        _ => return Err(unexpected(&frame, "Connection.OpenOk")),
    }

    Ok(Tuning {
        channel_max: if proposed.channel_max == 0 {
            DEFAULT_CHANNEL_MAX
        } else {
            proposed.channel_max
        },
        frame_max: if proposed.frame_max == 0 {
            DEFAULT_FRAME_MAX
        } else {
            proposed.frame_max
        },
        heartbeat: proposed.heartbeat,
    })
}

async fn expect_frame(stream: &mut NetworkStream, what: &str) -> Result<Frame> {
    match Frame::read_from(stream, DEFAULT_FRAME_MAX).await? {
        Some(frame) => Ok(frame),
        None => Err(ProxyError::Negotiation(format!(
            "broker hung up while waiting for {what}"
        ))),
    }
}

fn unexpected(frame: &Frame, wanted: &str) -> ProxyError {
    ProxyError::Negotiation(format!(
        "expected {wanted} from broker, got frame type {} class/method {:?}",
        frame.frame_type,
        frame.class_method()
    ))
}
