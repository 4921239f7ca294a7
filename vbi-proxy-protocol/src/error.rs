//! Error types for the VBI proxy protocol.

use thiserror::Error;

use crate::types::MessageType;

/// Protocol-level errors that can occur during communication.
///
/// All of these are fatal to the connection they occur on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Invalid magic bytes in a handshake.
    #[error("Invalid magic bytes: {0:?}")]
    InvalidMagic([u8; 8]),

    /// Message type is unknown or unsupported.
    #[error("Unknown message type: 0x{0:04X}")]
    UnknownMessageType(u16),

    /// Declared body length is outside the bounds of its message type.
    #[error("Invalid length {length} for {message_type:?} (allowed {min}..={max})")]
    InvalidLength {
        message_type: MessageType,
        length: u32,
        min: u32,
        max: u32,
    },

    /// Message body is incomplete.
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Message body carries bytes beyond its last field.
    #[error("{extra} trailing bytes after {message_type:?}")]
    TrailingBytes {
        message_type: MessageType,
        extra: usize,
    },

    /// Message was decoded for the wrong direction.
    #[error("{0:?} is not valid in this direction")]
    WrongDirection(MessageType),

    /// A field holds a value outside its domain.
    #[error("Invalid value {value} for field '{field}'")]
    InvalidValue { field: &'static str, value: u32 },

    /// A variable-length field exceeds its maximum.
    #[error("Field '{field}' too long: {len} bytes (max: {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// Failed to decode message payload.
    #[error("Failed to decode message: {0}")]
    DecodeError(String),

    /// A message is already being written on this connection.
    #[error("A write is already pending")]
    WritePending,
}
