//! AMQP 0-9-1 frame reading, writing, and method decoding
//!
//! A [`Frame`] is the raw unit of transmission: type octet, channel number,
//! and payload. [`Frame::decode`] classifies a frame into the tagged
//! [`Decoded`] variant the proxying state machines dispatch on; methods the
//! proxy does not interpret decode to [`Decoded::Passthrough`] and are
//! forwarded with only the channel number rewritten.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};

use super::constants::*;
use super::table::{self, Decoder, TableValue};

/// One AMQP frame: 7-byte header, payload, frame-end octet on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_type: u8,
    pub channel: u16,
    pub payload: Vec<u8>,
}

/// Classification of a frame into the methods the proxy interprets.
///
/// One variant per method the proxying state machines act on, plus a
/// catch-all for everything forwarded verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Heartbeat,
    ConnectionStart,
    ConnectionStartOk { mechanism: String, response: Vec<u8> },
    ConnectionTune { channel_max: u16, frame_max: u32, heartbeat: u16 },
    ConnectionTuneOk,
    ConnectionOpen { vhost: String },
    ConnectionOpenOk,
    ConnectionClose { reply_code: u16, reply_text: String },
    ConnectionCloseOk,
    ChannelOpen,
    ChannelOpenOk,
    ChannelClose { reply_code: u16, reply_text: String },
    ChannelCloseOk,
    /// Any other method, content header, or content body.
    Passthrough,
}

impl Frame {
    /// Build a method frame from a class id, method id, and argument bytes.
    pub fn method(channel: u16, class_id: u16, method_id: u16, args: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(4 + args.len());
        payload.extend_from_slice(&class_id.to_be_bytes());
        payload.extend_from_slice(&method_id.to_be_bytes());
        payload.extend_from_slice(args);
        Self {
            frame_type: FRAME_METHOD,
            channel,
            payload,
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            frame_type: FRAME_HEARTBEAT,
            channel: 0,
            payload: Vec::new(),
        }
    }

    /// The (class, method) pair of a method frame.
    pub fn class_method(&self) -> Option<(u16, u16)> {
        if self.frame_type != FRAME_METHOD || self.payload.len() < 4 {
            return None;
        }
        let class_id = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let method_id = u16::from_be_bytes([self.payload[2], self.payload[3]]);
        Some((class_id, method_id))
    }

    /// Read one frame. `Ok(None)` means the peer closed the connection at a
    /// frame boundary; an EOF mid-frame is an error.
    pub async fn read_from<R>(reader: &mut R, max_payload: u32) -> Result<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 7];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let frame_type = header[0];
        let channel = u16::from_be_bytes([header[1], header[2]]);
        let size = u32::from_be_bytes([header[3], header[4], header[5], header[6]]);

        if size > max_payload {
            return Err(ProxyError::Protocol(format!(
                "frame of {size} bytes exceeds the {max_payload}-byte limit"
            )));
        }

        let mut payload = vec![0u8; size as usize];
        reader.read_exact(&mut payload).await?;

        let mut end = [0u8; 1];
        reader.read_exact(&mut end).await?;
        if end[0] != FRAME_END {
            return Err(ProxyError::Protocol(format!(
                "bad frame-end octet 0x{:02X}",
                end[0]
            )));
        }

        Ok(Some(Frame {
            frame_type,
            channel,
            payload,
        }))
    }

    /// Write the frame as one contiguous buffer and flush. Callers serialize
    /// writes per socket, so a frame is never interleaved with another.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(8 + self.payload.len());
        buf.push(self.frame_type);
        buf.extend_from_slice(&self.channel.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.push(FRAME_END);
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Classify the frame for dispatch.
    pub fn decode(&self) -> Result<Decoded> {
        match self.frame_type {
            FRAME_HEARTBEAT => Ok(Decoded::Heartbeat),
            FRAME_CONTENT_HEADER | FRAME_CONTENT_BODY => Ok(Decoded::Passthrough),
            FRAME_METHOD => self.decode_method(),
            other => Err(ProxyError::Protocol(format!(
                "unknown frame type {other}"
            ))),
        }
    }

    fn decode_method(&self) -> Result<Decoded> {
        let (class_id, method_id) = self
            .class_method()
            .ok_or_else(|| ProxyError::Protocol("method frame shorter than 4 bytes".into()))?;
        let args = &self.payload[4..];

        let decoded = match (class_id, method_id) {
            (CLASS_CONNECTION, CONNECTION_START) => Decoded::ConnectionStart,
            (CLASS_CONNECTION, CONNECTION_START_OK) => {
                let mut decoder = Decoder::new(args);
                let table_len = decoder.u32()? as usize;
                decoder.skip(table_len)?; // client-properties, not interpreted
                let mechanism = decoder.short_str()?;
                let response = decoder.long_str()?.to_vec();
                Decoded::ConnectionStartOk {
                    mechanism,
                    response,
                }
            }
            (CLASS_CONNECTION, CONNECTION_TUNE) => {
                let mut decoder = Decoder::new(args);
                Decoded::ConnectionTune {
                    channel_max: decoder.u16()?,
                    frame_max: decoder.u32()?,
                    heartbeat: decoder.u16()?,
                }
            }
            (CLASS_CONNECTION, CONNECTION_TUNE_OK) => Decoded::ConnectionTuneOk,
            (CLASS_CONNECTION, CONNECTION_OPEN) => {
                let mut decoder = Decoder::new(args);
                Decoded::ConnectionOpen {
                    vhost: decoder.short_str()?,
                }
            }
            (CLASS_CONNECTION, CONNECTION_OPEN_OK) => Decoded::ConnectionOpenOk,
            (CLASS_CONNECTION, CONNECTION_CLOSE) => {
                let (reply_code, reply_text) = decode_close_args(args)?;
                Decoded::ConnectionClose {
                    reply_code,
                    reply_text,
                }
            }
            (CLASS_CONNECTION, CONNECTION_CLOSE_OK) => Decoded::ConnectionCloseOk,
            (CLASS_CHANNEL, CHANNEL_OPEN) => Decoded::ChannelOpen,
            (CLASS_CHANNEL, CHANNEL_OPEN_OK) => Decoded::ChannelOpenOk,
            (CLASS_CHANNEL, CHANNEL_CLOSE) => {
                let (reply_code, reply_text) = decode_close_args(args)?;
                Decoded::ChannelClose {
                    reply_code,
                    reply_text,
                }
            }
            (CLASS_CHANNEL, CHANNEL_CLOSE_OK) => Decoded::ChannelCloseOk,
            _ => Decoded::Passthrough,
        };
        Ok(decoded)
    }

    // ------------------------------------------------------------------
    // Builders for the methods the proxy originates
    // ------------------------------------------------------------------

    /// Connection.Start sent to downstream clients.
    pub fn connection_start() -> Self {
        let capabilities: Vec<(String, TableValue)> = [
            "consumer_priorities",
            "exchange_exchange_bindings",
            "connection.blocked",
            "authentication_failure_close",
            "per_consumer_qos",
            "basic.nack",
            "direct_reply_to",
            "publisher_confirms",
            "consumer_cancel_notify",
        ]
        .iter()
        .map(|name| (name.to_string(), TableValue::Bool(true)))
        .collect();

        let server_properties = vec![
            (
                "capabilities".to_string(),
                TableValue::Table(capabilities),
            ),
            (
                "product".to_string(),
                TableValue::LongStr(b"amqpool".to_vec()),
            ),
            (
                "version".to_string(),
                TableValue::LongStr(env!("CARGO_PKG_VERSION").as_bytes().to_vec()),
            ),
        ];

        let mut args = Args::new();
        args.u8(0); // version-major
        args.u8(9); // version-minor
        args.table(&server_properties);
        args.long_str(b"PLAIN AMQPLAIN");
        args.long_str(b"en_US");
        Self::method(0, CLASS_CONNECTION, CONNECTION_START, &args.finish())
    }

    /// Connection.StartOk sent to the broker, PLAIN mechanism.
    pub fn connection_start_ok_plain(user: &str, password: &str) -> Self {
        let client_properties = vec![
            (
                "capabilities".to_string(),
                TableValue::Table(vec![(
                    "authentication_failure_close".to_string(),
                    TableValue::Bool(true),
                )]),
            ),
            (
                "product".to_string(),
                TableValue::LongStr(b"amqpool".to_vec()),
            ),
            (
                "version".to_string(),
                TableValue::LongStr(env!("CARGO_PKG_VERSION").as_bytes().to_vec()),
            ),
        ];

        let mut response = Vec::with_capacity(2 + user.len() + password.len());
        response.push(0);
        response.extend_from_slice(user.as_bytes());
        response.push(0);
        response.extend_from_slice(password.as_bytes());

        let mut args = Args::new();
        args.table(&client_properties);
        args.short_str("PLAIN");
        args.long_str(&response);
        args.short_str("en_US");
        Self::method(0, CLASS_CONNECTION, CONNECTION_START_OK, &args.finish())
    }

    pub fn connection_tune(channel_max: u16, frame_max: u32, heartbeat: u16) -> Self {
        let mut args = Args::new();
        args.u16(channel_max);
        args.u32(frame_max);
        args.u16(heartbeat);
        Self::method(0, CLASS_CONNECTION, CONNECTION_TUNE, &args.finish())
    }

    pub fn connection_tune_ok(channel_max: u16, frame_max: u32, heartbeat: u16) -> Self {
        let mut args = Args::new();
        args.u16(channel_max);
        args.u32(frame_max);
        args.u16(heartbeat);
        Self::method(0, CLASS_CONNECTION, CONNECTION_TUNE_OK, &args.finish())
    }

    pub fn connection_open(vhost: &str) -> Self {
        let mut args = Args::new();
        args.short_str(vhost);
        args.short_str(""); // reserved (capabilities)
        args.u8(0); // reserved (insist)
        Self::method(0, CLASS_CONNECTION, CONNECTION_OPEN, &args.finish())
    }

    pub fn connection_open_ok() -> Self {
        let mut args = Args::new();
        args.short_str(""); // reserved (known-hosts)
        Self::method(0, CLASS_CONNECTION, CONNECTION_OPEN_OK, &args.finish())
    }

    pub fn connection_close(reply_code: u16, reply_text: &str) -> Self {
        let mut args = Args::new();
        args.u16(reply_code);
        args.short_str(reply_text);
        args.u16(0); // failing class id
        args.u16(0); // failing method id
        Self::method(0, CLASS_CONNECTION, CONNECTION_CLOSE, &args.finish())
    }

    pub fn connection_close_ok() -> Self {
        Self::method(0, CLASS_CONNECTION, CONNECTION_CLOSE_OK, &[])
    }

    pub fn channel_open(channel: u16) -> Self {
        let mut args = Args::new();
        args.short_str(""); // reserved
        Self::method(channel, CLASS_CHANNEL, CHANNEL_OPEN, &args.finish())
    }

    pub fn channel_open_ok(channel: u16) -> Self {
        let mut args = Args::new();
        args.long_str(&[]); // reserved
        Self::method(channel, CLASS_CHANNEL, CHANNEL_OPEN_OK, &args.finish())
    }

    pub fn channel_close(channel: u16, reply_code: u16, reply_text: &str) -> Self {
        let mut args = Args::new();
        args.u16(reply_code);
        args.short_str(reply_text);
        args.u16(0);
        args.u16(0);
        Self::method(channel, CLASS_CHANNEL, CHANNEL_CLOSE, &args.finish())
    }

    pub fn channel_close_ok(channel: u16) -> Self {
        Self::method(channel, CLASS_CHANNEL, CHANNEL_CLOSE_OK, &[])
    }
}

fn decode_close_args(args: &[u8]) -> Result<(u16, String)> {
    let mut decoder = Decoder::new(args);
    let reply_code = decoder.u16()?;
    let reply_text = decoder.short_str()?;
    Ok((reply_code, reply_text))
}

/// Method-argument encoder. Short strings are truncated to the 255-byte
/// wire limit rather than producing a corrupt length octet.
struct Args {
    buf: Vec<u8>,
}

impl Args {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn short_str(&mut self, s: &str) {
        let mut end = s.len().min(255);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.buf.push(end as u8);
        self.buf.extend_from_slice(&s.as_bytes()[..end]);
    }

    fn long_str(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(bytes);
    }

    fn table(&mut self, entries: &[(String, TableValue)]) {
        table::encode_table(&mut self.buf, entries);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}
