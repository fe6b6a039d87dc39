//! AMQP 0-9-1 wire protocol support
//!
//! This module contains everything the proxy needs to speak AMQP 0-9-1 on
//! both hops: frame reading/writing, the handful of connection and channel
//! methods the proxy interprets, and field-table encoding/decoding for the
//! handshake. Every other method and all content frames pass through
//! opaquely with only the channel number rewritten.
//!
//! Reference: <https://www.rabbitmq.com/resources/specs/amqp0-9-1.pdf>

pub mod constants;
pub mod frame;
pub mod table;
