//! Wire protocol definitions for the VBI proxy broker.
//!
//! This crate defines the binary protocol spoken between the `vbi-proxyd`
//! daemon and its clients over a UNIX-domain (or TCP) stream socket.
//!
//! # Message Format
//!
//! ```text
//! +--------+--------+------------------+
//! | Length | Type   |       Body       |
//! | u32 LE | u16 LE |    (variable)    |
//! +--------+--------+------------------+
//! ```
//!
//! Connect and daemon-pid requests open with a handshake block carrying the
//! `"VBIPROXY"` magic, the protocol version and an endianness probe.
//!
//! # Example
//!
//! ```rust
//! use vbi_proxy_protocol::{
//!     decode_client_message, decode_header, encode_client_message, ClientMessage,
//!     ServiceSet, Strictness, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE,
//! };
//!
//! let msg = ClientMessage::ServiceReq {
//!     reset: true,
//!     commit: true,
//!     strictness: Strictness::Default,
//!     services: ServiceSet::TELETEXT_B | ServiceSet::VPS,
//! };
//! let encoded = encode_client_message(&msg).unwrap();
//!
//! let header = decode_header(&encoded, DEFAULT_MAX_MESSAGE_SIZE).unwrap().unwrap();
//! let decoded = decode_client_message(header.message_type, encoded.slice(HEADER_SIZE..)).unwrap();
//! assert_eq!(decoded, msg);
//! ```

pub mod codec;
pub mod error;
pub mod framing;
pub mod socket;
pub mod types;

pub use codec::{
    decode_client_message, decode_header, decode_server_message, encode_client_message,
    encode_server_message, FrameHeader, HEADER_SIZE,
};
pub use error::ProtocolError;
pub use framing::{Frame, FrameBuffer, FrameWriter};
pub use socket::{socket_path_for_device, DEFAULT_SOCKET_DIR};
pub use types::{
    sub_priority, ChannelNotifyFlags, ChannelPriority, ChannelProfile, ClientFlags,
    ClientMessage, Handshake, MessageType, SamplingParams, ServerMessage, ServiceSet,
    SlicedFrame, SlicedLine, Strictness, TokenReply, TokenStatus, DEFAULT_MAX_MESSAGE_SIZE,
    ENDIAN_MAGIC, ENDIAN_MAGIC_SWAPPED, MAGIC, MAX_CLIENT_NAME, MAX_ERROR_TEXT, MAX_IOCTL_ARG,
    PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR, SCANNING_525, SCANNING_625,
    SLICED_DATA_SIZE, STRICTNESS_LEVELS,
};
