//! AMQP 0-9-1 protocol constants

/// Protocol header the proxy speaks and answers with on a mismatch.
pub const PROTOCOL_HEADER: [u8; 8] = [b'A', b'M', b'Q', b'P', 0, 0, 9, 1];

/// Legacy 0-9-0 header, accepted from downstream clients for compatibility.
pub const PROTOCOL_HEADER_090: [u8; 8] = [b'A', b'M', b'Q', b'P', 0, 0, 9, 0];

/// Every frame ends with this octet.
pub const FRAME_END: u8 = 0xCE;

pub const FRAME_METHOD: u8 = 1;
pub const FRAME_CONTENT_HEADER: u8 = 2;
pub const FRAME_CONTENT_BODY: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 8;

pub const CLASS_CONNECTION: u16 = 10;
pub const CONNECTION_START: u16 = 10;
pub const CONNECTION_START_OK: u16 = 11;
pub const CONNECTION_TUNE: u16 = 30;
pub const CONNECTION_TUNE_OK: u16 = 31;
pub const CONNECTION_OPEN: u16 = 40;
pub const CONNECTION_OPEN_OK: u16 = 41;
pub const CONNECTION_CLOSE: u16 = 50;
pub const CONNECTION_CLOSE_OK: u16 = 51;

pub const CLASS_CHANNEL: u16 = 20;
pub const CHANNEL_OPEN: u16 = 10;
pub const CHANNEL_OPEN_OK: u16 = 11;
pub const CHANNEL_CLOSE: u16 = 40;
pub const CHANNEL_CLOSE_OK: u16 = 41;

pub const REPLY_SUCCESS: u16 = 200;
pub const REPLY_CONNECTION_FORCED: u16 = 320;
pub const REPLY_COMMAND_INVALID: u16 = 503;
pub const REPLY_CHANNEL_ERROR: u16 = 504;
pub const REPLY_INTERNAL_ERROR: u16 = 541;

/// Frame size advertised to downstream clients and assumed for a broker
/// that tunes frame_max to 0.
pub const DEFAULT_FRAME_MAX: u32 = 131_072;

/// Channel range assumed for a broker that tunes channel_max to 0
/// ("no limit"); the allocator needs a finite range.
pub const DEFAULT_CHANNEL_MAX: u16 = u16::MAX;
