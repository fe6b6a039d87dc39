//! AMQP field-table encoding and decoding
//!
//! The proxy only builds tables for the handshake (server/client properties)
//! and only reads them to pull LOGIN/PASSWORD out of an AMQPLAIN SASL
//! response, but the decoder understands the full set of standard value tags
//! so tables from arbitrary clients are read or skipped correctly.

use crate::error::{ProxyError, Result};

/// A field-table value. Variants the proxy never produces still decode, so
/// that unknown entries in a client table can be stepped over.
#[derive(Debug, Clone, PartialEq)]
pub enum TableValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    ShortStr(String),
    LongStr(Vec<u8>),
    Timestamp(u64),
    Table(Vec<(String, TableValue)>),
    Void,
}

impl TableValue {
    /// The UTF-8 string content of a string-like value, if any.
    pub fn as_str(&self) -> Option<String> {
        match self {
            TableValue::ShortStr(s) => Some(s.clone()),
            TableValue::LongStr(bytes) => String::from_utf8(bytes.clone()).ok(),
            _ => None,
        }
    }
}

/// Append a field table (including its u32 size prefix) to `buf`.
pub fn encode_table(buf: &mut Vec<u8>, entries: &[(String, TableValue)]) {
    let mut body = Vec::new();
    for (key, value) in entries {
        encode_short_str(&mut body, key);
        encode_value(&mut body, value);
    }
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
}

fn encode_short_str(buf: &mut Vec<u8>, s: &str) {
    buf.push(s.len() as u8);
    buf.extend_from_slice(s.as_bytes());
}

fn encode_value(buf: &mut Vec<u8>, value: &TableValue) {
    match value {
        TableValue::Bool(v) => {
            buf.push(b't');
            buf.push(u8::from(*v));
        }
        TableValue::Int(v) => {
            buf.push(b'I');
            buf.extend_from_slice(&v.to_be_bytes());
        }
        TableValue::Long(v) => {
            buf.push(b'l');
            buf.extend_from_slice(&v.to_be_bytes());
        }
        TableValue::Float(v) => {
            buf.push(b'f');
            buf.extend_from_slice(&v.to_be_bytes());
        }
        TableValue::Double(v) => {
            buf.push(b'd');
            buf.extend_from_slice(&v.to_be_bytes());
        }
        TableValue::ShortStr(s) => {
            buf.push(b's');
            encode_short_str(buf, s);
        }
        TableValue::LongStr(bytes) => {
            buf.push(b'S');
            buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            buf.extend_from_slice(bytes);
        }
        TableValue::Timestamp(v) => {
            buf.push(b'T');
            buf.extend_from_slice(&v.to_be_bytes());
        }
        TableValue::Table(entries) => {
            buf.push(b'F');
            encode_table(buf, entries);
        }
        TableValue::Void => buf.push(b'V'),
    }
}

/// Decode a field table from its body (the bytes after the u32 size prefix).
///
/// An AMQPLAIN SASL response is exactly such a body: a table without its own
/// size prefix, bounded by the enclosing long string instead.
pub fn decode_table(body: &[u8]) -> Result<Vec<(String, TableValue)>> {
    let mut decoder = Decoder::new(body);
    let mut entries = Vec::new();
    while decoder.has_remaining() {
        let key = decoder.short_str()?;
        let value = decode_value(&mut decoder)?;
        entries.push((key, value));
    }
    Ok(entries)
}

fn decode_value(decoder: &mut Decoder<'_>) -> Result<TableValue> {
    let tag = decoder.u8()?;
    let value = match tag {
        b't' => TableValue::Bool(decoder.u8()? != 0),
        b'b' | b'B' => TableValue::Int(i32::from(decoder.u8()? as i8)),
        b'U' | b'u' => TableValue::Int(i32::from(decoder.u16()? as i16)),
        b'I' | b'i' => TableValue::Int(decoder.u32()? as i32),
        b'L' | b'l' => TableValue::Long(decoder.u64()? as i64),
        b'f' => TableValue::Float(f32::from_be_bytes(decoder.array::<4>()?)),
        b'd' => TableValue::Double(f64::from_be_bytes(decoder.array::<8>()?)),
        b'D' => {
            // decimal: scale octet + u32 value; the proxy has no use for it
            decoder.skip(5)?;
            TableValue::Void
        }
        b's' => TableValue::ShortStr(decoder.short_str()?),
        b'S' => TableValue::LongStr(decoder.long_str()?.to_vec()),
        b'x' | b'A' => {
            let len = decoder.u32()? as usize;
            decoder.skip(len)?;
            TableValue::Void
        }
        b'T' => TableValue::Timestamp(decoder.u64()?),
        b'F' => {
            let len = decoder.u32()? as usize;
            TableValue::Table(decode_table(decoder.take(len)?)?)
        }
        b'V' => TableValue::Void,
        other => {
            return Err(ProxyError::Protocol(format!(
                "unknown field-table value tag 0x{other:02X}"
            )))
        }
    };
    Ok(value)
}

/// Bounds-checked big-endian cursor over a byte slice.
pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn has_remaining(&self) -> bool {
        self.pos < self.buf.len()
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub(crate) fn short_str(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProxyError::Protocol("short string is not valid UTF-8".into()))
    }

    pub(crate) fn long_str(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(ProxyError::Protocol("truncated frame payload".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }
}
