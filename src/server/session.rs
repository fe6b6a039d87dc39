//! Downstream client sessions
//!
//! One [`ClientSession`] per accepted socket. The session first runs the
//! server side of the AMQP 0-9-1 handshake to learn `(vhost, user,
//! password)`, borrows an upstream connection for those credentials, then
//! pumps frames: channel numbers are translated on the way up, and the
//! upstream read loop writes broker responses back through the session's
//! [`SessionHandle`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};

use crate::error::{ProxyError, Result};
use crate::protocol::constants::*;
use crate::protocol::frame::{Decoded, Frame};
use crate::protocol::table;
use crate::upstream::pool::{Credentials, UpstreamPool};
use crate::upstream::Upstream;

use super::listener::Shutdown;
use super::metrics::ProxyMetrics;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Bound on waiting for the broker to acknowledge channel closes when a
/// session releases its upstream.
const RELEASE_TIMEOUT: Duration = Duration::from_millis(500);

/// Cheap, cloneable handle to a session's downstream socket: the write half
/// behind a mutex plus a closed flag. Upstream read loops hold one per
/// binding; dropping a handle never tears the session down.
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    writer: Arc<Mutex<WriteHalf<TcpStream>>>,
    closed: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(id: u64, writer: WriteHalf<TcpStream>) -> Self {
        Self {
            id,
            writer: Arc::new(Mutex::new(writer)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Write one frame to the client. The mutex wraps the complete
    /// encode+flush, keeping frames atomic at frame boundaries.
    pub async fn write_frame(&self, frame: &Frame) -> Result<()> {
        if self.is_closed() {
            return Err(ProxyError::Client("session is closed".into()));
        }
        let mut writer = self.writer.lock().await;
        frame.write_to(&mut *writer).await.map_err(|e| {
            self.closed.store(true, Ordering::SeqCst);
            ProxyError::Client(format!("write to client failed: {e}"))
        })
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Why a session's pump loop ended.
#[derive(Debug)]
enum SessionEnd {
    /// Clean Connection.Close / CloseOk exchange with the client
    ClientClose,
    /// EOF or I/O error on the client socket
    ClientGone,
    /// Second-phase shutdown signal
    Shutdown,
    /// The client broke protocol; it gets a descriptive Connection.Close
    Violation { reply_code: u16, reply_text: String },
    /// The borrowed upstream died under us
    UpstreamLost(String),
}

/// One live downstream connection.
pub struct ClientSession {
    handle: SessionHandle,
    peer: SocketAddr,
    credentials: Credentials,
    upstream: Option<Arc<Upstream>>,
    pool: Arc<UpstreamPool>,
    metrics: Arc<ProxyMetrics>,
}

impl ClientSession {
    /// Drive one accepted socket to completion: handshake, upstream borrow,
    /// frame pump, release.
    pub async fn run(
        mut stream: TcpStream,
        peer: SocketAddr,
        pool: Arc<UpstreamPool>,
        metrics: Arc<ProxyMetrics>,
        mut shutdown_rx: broadcast::Receiver<Shutdown>,
    ) -> Result<()> {
        stream.set_nodelay(true).ok();

        let credentials = match negotiate(&mut stream).await {
            Ok(credentials) => credentials,
            Err(e) => {
                metrics.handshake_failure();
                return Err(e);
            }
        };
        let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            session = session_id,
            client = %peer,
            vhost = %credentials.vhost,
            user = %credentials.user,
            "Client session negotiated"
        );

        // Borrow eagerly: a fresh pool ends up with exactly one broker
        // connection per credential set even before any channel opens.
        let upstream = match pool.borrow(&credentials).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let close = Frame::connection_close(
                    REPLY_INTERNAL_ERROR,
                    "INTERNAL_ERROR - upstream connection failed",
                );
                let _ = close.write_to(&mut stream).await;
                return Err(e);
            }
        };

        let (mut reader, writer) = tokio::io::split(stream);
        let mut session = Self {
            handle: SessionHandle::new(session_id, writer),
            peer,
            credentials,
            upstream: Some(upstream),
            pool,
            metrics,
        };
        let end = session.pump(&mut reader, &mut shutdown_rx).await;
        session.finish(end).await;
        Ok(())
    }

    async fn pump(
        &mut self,
        reader: &mut ReadHalf<TcpStream>,
        shutdown_rx: &mut broadcast::Receiver<Shutdown>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                _ = recv_disconnect(shutdown_rx) => return SessionEnd::Shutdown,
                read = Frame::read_from(reader, DEFAULT_FRAME_MAX) => {
                    let frame = match read {
                        Ok(Some(frame)) => frame,
                        Ok(None) => return SessionEnd::ClientGone,
                        Err(ProxyError::Protocol(msg)) => return violation(&msg),
                        Err(_) => return SessionEnd::ClientGone,
                    };
                    match self.handle_frame(frame).await {
                        Ok(None) => {}
                        Ok(Some(end)) => return end,
                        Err(ProxyError::Protocol(msg)) => return violation(&msg),
                        Err(ProxyError::Client(_)) => return SessionEnd::ClientGone,
                        Err(e) => return SessionEnd::UpstreamLost(e.to_string()),
                    }
                }
            }
        }
    }

    /// Dispatch one client frame. `Ok(Some(_))` ends the session.
    async fn handle_frame(&mut self, mut frame: Frame) -> Result<Option<SessionEnd>> {
        match frame.decode()? {
            Decoded::Heartbeat => {
                // Heartbeats are hop-by-hop: echo downstream, never forward.
                self.handle.write_frame(&Frame::heartbeat()).await?;
            }
            Decoded::ConnectionClose { .. } => {
                let _ = self
                    .handle
                    .write_frame(&Frame::connection_close_ok())
                    .await;
                return Ok(Some(SessionEnd::ClientClose));
            }
            Decoded::ConnectionCloseOk => return Ok(Some(SessionEnd::ClientClose)),
            Decoded::ChannelOpen => {
                if frame.channel == 0 {
                    return Ok(Some(violation("Channel.Open on channel 0")));
                }
                let upstream = self.upstream().await?;
                let upstream_channel = match upstream.open_channel(&self.handle, frame.channel) {
                    Ok(n) => n,
                    Err(e) => {
                        return Ok(Some(SessionEnd::Violation {
                            reply_code: REPLY_CHANNEL_ERROR,
                            reply_text: format!("CHANNEL_ERROR - {e}"),
                        }))
                    }
                };
                frame.channel = upstream_channel;
                if let Err(e) = upstream.write_frame(&frame).await {
                    upstream.release_channel(upstream_channel);
                    return Err(e);
                }
                self.metrics.channel_opened();
            }
            Decoded::ChannelCloseOk => {
                let Some((upstream, upstream_channel)) = self.bound(frame.channel) else {
                    return Ok(Some(unbound(frame.channel)));
                };
                frame.channel = upstream_channel;
                let write = upstream.write_frame(&frame).await;
                // The client's CloseOk finishes a broker-initiated close;
                // nothing further arrives for this channel.
                upstream.release_channel(upstream_channel);
                write?;
            }
            // Channel.Close waits for the broker's CloseOk to free the
            // binding; content and pass-through methods just translate.
            _ => {
                if frame.channel == 0 {
                    return Ok(Some(violation("unexpected frame on channel 0")));
                }
                let Some((upstream, upstream_channel)) = self.bound(frame.channel) else {
                    return Ok(Some(unbound(frame.channel)));
                };
                frame.channel = upstream_channel;
                upstream.write_frame(&frame).await?;
            }
        }
        Ok(None)
    }

    /// The session's upstream, borrowing one if none is assigned yet.
    async fn upstream(&mut self) -> Result<Arc<Upstream>> {
        if let Some(upstream) = &self.upstream {
            return Ok(Arc::clone(upstream));
        }
        let upstream = self.pool.borrow(&self.credentials).await?;
        self.upstream = Some(Arc::clone(&upstream));
        Ok(upstream)
    }

    fn bound(&self, client_channel: u16) -> Option<(Arc<Upstream>, u16)> {
        let upstream = self.upstream.as_ref()?;
        let upstream_channel = upstream.client_binding(self.handle.id(), client_channel)?;
        Some((Arc::clone(upstream), upstream_channel))
    }

    async fn finish(mut self, end: SessionEnd) {
        match &end {
            SessionEnd::Violation {
                reply_code,
                reply_text,
            } => {
                let _ = self
                    .handle
                    .write_frame(&Frame::connection_close(*reply_code, reply_text))
                    .await;
            }
            SessionEnd::Shutdown => {
                let _ = self
                    .handle
                    .write_frame(&Frame::connection_close(
                        REPLY_CONNECTION_FORCED,
                        "CONNECTION_FORCED - proxy is shutting down",
                    ))
                    .await;
            }
            SessionEnd::UpstreamLost(reason) => {
                let _ = self
                    .handle
                    .write_frame(&Frame::connection_close(
                        REPLY_CONNECTION_FORCED,
                        &format!("UPSTREAM_ERROR - {reason}"),
                    ))
                    .await;
            }
            SessionEnd::ClientClose | SessionEnd::ClientGone => {}
        }
        self.handle.mark_closed();
        self.release().await;
        self.handle.shutdown().await;
        debug!(
            session = self.handle.id(),
            client = %self.peer,
            reason = ?end,
            "Client session ended"
        );
    }

    /// Hand the upstream back to the pool in a clean state, or discard it.
    async fn release(&mut self) {
        let Some(upstream) = self.upstream.take() else {
            return;
        };
        let session_id = self.handle.id();

        if upstream.is_closed() {
            upstream.purge_session(session_id);
            return;
        }

        // Close surviving channels best-effort, then give the broker a
        // bounded window to acknowledge before the connection is pooled.
        for upstream_channel in upstream.channels_for(session_id) {
            let close =
                Frame::channel_close(upstream_channel, REPLY_SUCCESS, "client disconnected");
            if upstream.write_frame(&close).await.is_err() {
                break;
            }
        }
        let drained = upstream
            .wait_session_drained(session_id, RELEASE_TIMEOUT)
            .await;

        if drained && !upstream.is_closed() {
            self.pool.checkin(&self.credentials, upstream);
        } else {
            debug!(
                session = session_id,
                upstream = upstream.id(),
                "Discarding upstream that did not drain cleanly"
            );
            upstream.mark_closed();
            upstream.purge_session(session_id);
            upstream.shutdown_socket().await;
        }
    }
}

fn violation(msg: &str) -> SessionEnd {
    SessionEnd::Violation {
        reply_code: REPLY_COMMAND_INVALID,
        reply_text: format!("COMMAND_INVALID - {msg}"),
    }
}

fn unbound(client_channel: u16) -> SessionEnd {
    SessionEnd::Violation {
        reply_code: REPLY_COMMAND_INVALID,
        reply_text: format!("COMMAND_INVALID - frame on unbound channel {client_channel}"),
    }
}

/// Resolves only on the Disconnect phase, so an in-flight frame read is
/// never cancelled by the StopAccepting broadcast.
async fn recv_disconnect(rx: &mut broadcast::Receiver<Shutdown>) {
    loop {
        match rx.recv().await {
            Ok(Shutdown::Disconnect) | Err(broadcast::error::RecvError::Closed) => return,
            Ok(Shutdown::StopAccepting) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
        }
    }
}

/// Server side of the AMQP 0-9-1 handshake, producing the client's
/// credentials. On any failure the socket is abandoned without an upstream
/// ever being acquired.
pub(crate) async fn negotiate<S>(stream: &mut S) -> Result<Credentials>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 8];
    if let Err(e) = stream.read_exact(&mut header).await {
        return Err(ProxyError::Negotiation(format!(
            "client hung up before sending a protocol header: {e}"
        )));
    }
    if header != PROTOCOL_HEADER && header != PROTOCOL_HEADER_090 {
        // AMQP's error-response convention: answer with the header we
        // support, then close.
        let _ = stream.write_all(&PROTOCOL_HEADER).await;
        let _ = stream.flush().await;
        return Err(ProxyError::Negotiation(
            "unrecognized protocol header".into(),
        ));
    }

    Frame::connection_start().write_to(stream).await?;

    let frame = expect_frame(stream, "Connection.StartOk").await?;
    let (mechanism, response) = match frame.decode()? {
        Decoded::ConnectionStartOk {
            mechanism,
            response,
        } => (mechanism, response),
        _ => return Err(unexpected(&frame, "Connection.StartOk")),
    };
    let (user, password) = parse_sasl_response(&mechanism, &response)?;

    // channel_max 0 and heartbeat 0: no limit imposed downstream and no
    // heartbeating required of clients. The broker's tuning is never
    // propagated here.
    Frame::connection_tune(0, DEFAULT_FRAME_MAX, 0)
        .write_to(stream)
        .await?;

    let frame = expect_frame(stream, "Connection.TuneOk").await?;
    match frame.decode()? {
        Decoded::ConnectionTuneOk => {}
        _ => return Err(unexpected(&frame, "Connection.TuneOk")),
    }

    let frame = expect_frame(stream, "Connection.Open").await?;
    let vhost = match frame.decode()? {
        Decoded::ConnectionOpen { vhost } => vhost,
        _ => return Err(unexpected(&frame, "Connection.Open")),
    };
    Frame::connection_open_ok().write_to(stream).await?;

    Ok(Credentials {
        vhost,
        user,
        password,
    })
}

fn parse_sasl_response(mechanism: &str, response: &[u8]) -> Result<(String, String)> {
    match mechanism {
        "PLAIN" => {
            // \0 user \0 password, split on the first two NULs
            let mut parts = response.splitn(3, |b| *b == 0);
            let _authzid = parts.next();
            match (parts.next(), parts.next()) {
                (Some(user), Some(password)) => {
                    Ok((utf8(user, "PLAIN user")?, utf8(password, "PLAIN password")?))
                }
                _ => Err(ProxyError::Negotiation("malformed PLAIN response".into())),
            }
        }
        "AMQPLAIN" => {
            let fields = table::decode_table(response)
                .map_err(|e| ProxyError::Negotiation(format!("malformed AMQPLAIN table: {e}")))?;
            let mut user = None;
            let mut password = None;
            for (key, value) in fields {
                match key.as_str() {
                    "LOGIN" => user = value.as_str(),
                    "PASSWORD" => password = value.as_str(),
                    _ => {}
                }
            }
            match (user, password) {
                (Some(user), Some(password)) => Ok((user, password)),
                _ => Err(ProxyError::Negotiation(
                    "AMQPLAIN response is missing LOGIN or PASSWORD".into(),
                )),
            }
        }
        other => Err(ProxyError::Negotiation(format!(
            "unsupported SASL mechanism {other:?}"
        ))),
    }
}

fn utf8(bytes: &[u8], what: &str) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ProxyError::Negotiation(format!("{what} is not valid UTF-8")))
}

async fn expect_frame<S>(stream: &mut S, what: &str) -> Result<Frame>
where
    S: AsyncRead + Unpin,
{
    match Frame::read_from(stream, DEFAULT_FRAME_MAX).await? {
        Some(frame) => Ok(frame),
        None => Err(ProxyError::Negotiation(format!(
            "client disconnected while waiting for {what}"
        ))),
    }
}

fn unexpected(frame: &Frame, wanted: &str) -> ProxyError {
    ProxyError::Negotiation(format!(
        "expected {wanted} from client, got frame type {} class/method {:?}",
        frame.frame_type,
        frame.class_method()
    ))
}
