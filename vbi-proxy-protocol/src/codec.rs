//! Codec for encoding and decoding protocol messages.
//!
//! Message format (all multi-byte fields little-endian):
//! ```text
//! +--------+--------+------------------+
//! | Length | Type   |       Body       |
//! | u32 LE | u16 LE |    (variable)    |
//! +--------+--------+------------------+
//! | 4 bytes| 2 bytes|  Length bytes    |
//! ```
//!
//! The byte order is fixed, so peers never swap fields at runtime. A peer
//! writing the opposite order is detected through the handshake's endian
//! magic and rejected.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::*;

/// Message header size: 4 (length) + 2 (type) = 6 bytes.
pub const HEADER_SIZE: usize = 6;

/// Size of one encoded sliced line.
const SLICED_LINE_SIZE: usize = 4 + 4 + SLICED_DATA_SIZE;

/// Encode a client message into bytes.
pub fn encode_client_message(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
    let mut body = BytesMut::new();

    match msg {
        ClientMessage::ConnectReq {
            handshake,
            client_name,
            pid,
            flags,
            scanning,
            services,
            strictness,
        } => {
            encode_handshake(&mut body, handshake);
            encode_string(&mut body, "client_name", client_name, MAX_CLIENT_NAME)?;
            body.put_u32_le(*pid);
            body.put_u32_le(flags.0);
            body.put_u16_le(*scanning);
            body.put_u32_le(services.0);
            body.put_u8(*strictness as u8);
        }
        ClientMessage::DaemonPidReq { handshake } => {
            encode_handshake(&mut body, handshake);
        }
        ClientMessage::CloseReq => {
            // Empty body
        }
        ClientMessage::ServiceReq {
            reset,
            commit,
            strictness,
            services,
        } => {
            body.put_u8(u8::from(*reset));
            body.put_u8(u8::from(*commit));
            body.put_u8(*strictness as u8);
            body.put_u32_le(services.0);
        }
        ClientMessage::ChnTokenReq { priority, profile } => {
            body.put_u8(*priority as u8);
            body.put_u8(u8::from(profile.is_valid));
            body.put_u8(profile.sub_prio);
            body.put_u32_le(profile.min_duration);
            body.put_u32_le(profile.exp_duration);
        }
        ClientMessage::ChnNotifyReq { flags, scanning } => {
            body.put_u32_le(flags.0);
            body.put_u16_le(*scanning);
        }
        ClientMessage::ChnReclaimCnf => {
            // Empty body
        }
        ClientMessage::ChnIoctlReq { request, arg } => {
            body.put_u32_le(*request);
            encode_blob(&mut body, "ioctl_arg", arg, MAX_IOCTL_ARG)?;
        }
    }

    encode_frame(msg.message_type(), body.freeze())
}

/// Encode a server message into bytes.
pub fn encode_server_message(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
    let mut body = BytesMut::new();

    match msg {
        ServerMessage::ConnectCnf {
            version_major,
            version_minor,
            daemon_pid,
            services,
            params,
        } => {
            body.put_u16_le(*version_major);
            body.put_u16_le(*version_minor);
            body.put_u32_le(*daemon_pid);
            body.put_u32_le(services.0);
            encode_params(&mut body, params);
        }
        ServerMessage::ConnectRej { reason } => {
            encode_reason(&mut body, reason);
        }
        ServerMessage::DaemonPidCnf { pid } => {
            body.put_u32_le(*pid);
        }
        ServerMessage::ServiceCnf { services, params } => {
            body.put_u32_le(services.0);
            encode_params(&mut body, params);
        }
        ServerMessage::ServiceRej { services, reason } => {
            body.put_u32_le(services.0);
            encode_reason(&mut body, reason);
        }
        ServerMessage::SlicedInd(frame) => {
            body.reserve(8 + 4 + frame.lines.len() * SLICED_LINE_SIZE + 1);
            body.put_f64_le(frame.timestamp);
            body.put_u32_le(frame.lines.len() as u32);
            for line in &frame.lines {
                body.put_u32_le(line.id);
                body.put_u32_le(line.line);
                body.put_slice(&line.data);
            }
            match &frame.raw {
                Some(raw) => {
                    body.put_u8(1);
                    body.put_u32_le(raw.len() as u32);
                    body.put_slice(raw);
                }
                None => body.put_u8(0),
            }
        }
        ServerMessage::ChnTokenCnf(reply) => {
            body.put_u8(reply.status as u8);
            body.put_u8(u8::from(reply.permitted));
            body.put_u8(u8::from(reply.non_exclusive));
        }
        ServerMessage::ChnTokenInd | ServerMessage::ChnReclaimReq => {
            // Empty body
        }
        ServerMessage::ChnNotifyCnf { flags, scanning }
        | ServerMessage::ChnChangeInd { flags, scanning } => {
            body.put_u32_le(flags.0);
            body.put_u16_le(*scanning);
        }
        ServerMessage::ChnIoctlCnf { result, errno, arg } => {
            body.put_i32_le(*result);
            body.put_i32_le(*errno);
            encode_blob(&mut body, "ioctl_arg", arg, MAX_IOCTL_ARG)?;
        }
        ServerMessage::ChnIoctlRej { reason } => {
            encode_reason(&mut body, reason);
        }
    }

    encode_frame(msg.message_type(), body.freeze())
}

/// Encode a message with length and type header.
fn encode_frame(msg_type: MessageType, body: Bytes) -> Result<Bytes, ProtocolError> {
    let body_len = u32::try_from(body.len()).map_err(|_| ProtocolError::InvalidLength {
        message_type: msg_type,
        length: u32::MAX,
        min: 0,
        max: u32::MAX,
    })?;
    let (min, max) = msg_type.body_limits(u32::MAX);
    if body_len < min || body_len > max {
        return Err(ProtocolError::InvalidLength {
            message_type: msg_type,
            length: body_len,
            min,
            max,
        });
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + body.len());
    frame.put_u32_le(body_len);
    frame.put_u16_le(msg_type.into());
    frame.put_slice(&body);

    Ok(frame.freeze())
}

fn encode_handshake(buf: &mut BytesMut, h: &Handshake) {
    buf.put_slice(&h.magic);
    buf.put_u16_le(h.version_major);
    buf.put_u16_le(h.version_minor);
    buf.put_u32_le(h.endian_magic);
}

fn encode_params(buf: &mut BytesMut, p: &SamplingParams) {
    buf.put_u16_le(p.scanning);
    buf.put_u32_le(p.sampling_format);
    buf.put_u32_le(p.sampling_rate);
    buf.put_u32_le(p.bytes_per_line);
    buf.put_u32_le(p.offset);
    buf.put_i32_le(p.start[0]);
    buf.put_i32_le(p.start[1]);
    buf.put_u32_le(p.count[0]);
    buf.put_u32_le(p.count[1]);
    buf.put_u8(u8::from(p.interlaced));
    buf.put_u8(u8::from(p.synchronous));
}

fn encode_string(
    buf: &mut BytesMut,
    field: &'static str,
    s: &str,
    max: usize,
) -> Result<(), ProtocolError> {
    encode_blob(buf, field, s.as_bytes(), max)
}

fn encode_blob(
    buf: &mut BytesMut,
    field: &'static str,
    bytes: &[u8],
    max: usize,
) -> Result<(), ProtocolError> {
    if bytes.len() > max {
        return Err(ProtocolError::FieldTooLong {
            field,
            len: bytes.len(),
            max,
        });
    }
    buf.put_u16_le(bytes.len() as u16);
    buf.put_slice(bytes);
    Ok(())
}

/// Reasons are informational, so overlong text is cut instead of refused.
fn encode_reason(buf: &mut BytesMut, reason: &str) {
    let mut end = reason.len().min(MAX_ERROR_TEXT);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let bytes = &reason.as_bytes()[..end];
    buf.put_u16_le(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn need(buf: &Bytes, n: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        return Err(ProtocolError::IncompleteFrame {
            expected: n,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

fn decode_handshake(buf: &mut Bytes) -> Result<Handshake, ProtocolError> {
    need(buf, Handshake::ENCODED_SIZE)?;
    let mut magic = [0u8; 8];
    buf.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(ProtocolError::InvalidMagic(magic));
    }
    Ok(Handshake {
        magic,
        version_major: buf.get_u16_le(),
        version_minor: buf.get_u16_le(),
        endian_magic: buf.get_u32_le(),
    })
}

fn decode_params(buf: &mut Bytes) -> Result<SamplingParams, ProtocolError> {
    need(buf, SamplingParams::ENCODED_SIZE)?;
    Ok(SamplingParams {
        scanning: buf.get_u16_le(),
        sampling_format: buf.get_u32_le(),
        sampling_rate: buf.get_u32_le(),
        bytes_per_line: buf.get_u32_le(),
        offset: buf.get_u32_le(),
        start: [buf.get_i32_le(), buf.get_i32_le()],
        count: [buf.get_u32_le(), buf.get_u32_le()],
        interlaced: buf.get_u8() != 0,
        synchronous: buf.get_u8() != 0,
    })
}

fn decode_blob(buf: &mut Bytes, field: &'static str, max: usize) -> Result<Vec<u8>, ProtocolError> {
    need(buf, 2)?;
    let len = buf.get_u16_le() as usize;
    if len > max {
        return Err(ProtocolError::FieldTooLong { field, len, max });
    }
    need(buf, len)?;
    Ok(buf.copy_to_bytes(len).to_vec())
}

fn decode_string(buf: &mut Bytes, field: &'static str, max: usize) -> Result<String, ProtocolError> {
    let bytes = decode_blob(buf, field, max)?;
    String::from_utf8(bytes).map_err(|e| ProtocolError::DecodeError(e.to_string()))
}

fn decode_strictness(value: u8) -> Result<Strictness, ProtocolError> {
    Strictness::try_from(value).map_err(|v| ProtocolError::InvalidValue {
        field: "strictness",
        value: v as u32,
    })
}

fn decode_sliced(buf: &mut Bytes) -> Result<SlicedFrame, ProtocolError> {
    need(buf, 12)?;
    let timestamp = buf.get_f64_le();
    let count = buf.get_u32_le() as usize;
    // Bound the allocation by what the body can actually hold.
    need(buf, count.saturating_mul(SLICED_LINE_SIZE))?;
    let mut lines = Vec::with_capacity(count);
    for _ in 0..count {
        let id = buf.get_u32_le();
        let line = buf.get_u32_le();
        let mut data = [0u8; SLICED_DATA_SIZE];
        buf.copy_to_slice(&mut data);
        lines.push(SlicedLine { id, line, data });
    }
    need(buf, 1)?;
    let raw = if buf.get_u8() != 0 {
        need(buf, 4)?;
        let len = buf.get_u32_le() as usize;
        need(buf, len)?;
        Some(buf.copy_to_bytes(len).to_vec())
    } else {
        None
    };
    Ok(SlicedFrame {
        timestamp,
        lines,
        raw,
    })
}

fn finish<T>(msg_type: MessageType, body: &Bytes, value: T) -> Result<T, ProtocolError> {
    if body.has_remaining() {
        return Err(ProtocolError::TrailingBytes {
            message_type: msg_type,
            extra: body.remaining(),
        });
    }
    Ok(value)
}

/// Message header information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub body_len: u32,
    pub message_type: MessageType,
}

/// Try to decode a message header from the buffer.
///
/// Returns `None` if there's not enough data yet. The declared length is
/// checked against the bounds of the message type and `max_message_size`
/// here, so callers can reject a message before reserving storage for it.
pub fn decode_header(buf: &[u8], max_message_size: u32) -> Result<Option<FrameHeader>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let body_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let type_val = u16::from_le_bytes([buf[4], buf[5]]);
    let message_type = MessageType::try_from(type_val).map_err(ProtocolError::UnknownMessageType)?;

    let (min, max) = message_type.body_limits(max_message_size);
    if body_len < min || body_len > max {
        return Err(ProtocolError::InvalidLength {
            message_type,
            length: body_len,
            min,
            max,
        });
    }

    Ok(Some(FrameHeader {
        body_len,
        message_type,
    }))
}

/// Decode a client message from a complete body.
pub fn decode_client_message(
    msg_type: MessageType,
    mut body: Bytes,
) -> Result<ClientMessage, ProtocolError> {
    let msg = match msg_type {
        MessageType::ConnectReq => {
            let handshake = decode_handshake(&mut body)?;
            let client_name = decode_string(&mut body, "client_name", MAX_CLIENT_NAME)?;
            need(&body, 15)?;
            let pid = body.get_u32_le();
            let flags = ClientFlags(body.get_u32_le());
            let scanning = body.get_u16_le();
            let services = ServiceSet(body.get_u32_le());
            let strictness = decode_strictness(body.get_u8())?;
            ClientMessage::ConnectReq {
                handshake,
                client_name,
                pid,
                flags,
                scanning,
                services,
                strictness,
            }
        }
        MessageType::DaemonPidReq => ClientMessage::DaemonPidReq {
            handshake: decode_handshake(&mut body)?,
        },
        MessageType::CloseReq => ClientMessage::CloseReq,
        MessageType::ServiceReq => {
            need(&body, 7)?;
            let reset = body.get_u8() != 0;
            let commit = body.get_u8() != 0;
            let strictness = decode_strictness(body.get_u8())?;
            let services = ServiceSet(body.get_u32_le());
            ClientMessage::ServiceReq {
                reset,
                commit,
                strictness,
                services,
            }
        }
        MessageType::ChnTokenReq => {
            need(&body, 11)?;
            let prio = body.get_u8();
            let priority = ChannelPriority::try_from(prio).map_err(|v| ProtocolError::InvalidValue {
                field: "priority",
                value: v as u32,
            })?;
            let profile = ChannelProfile {
                is_valid: body.get_u8() != 0,
                sub_prio: body.get_u8(),
                min_duration: body.get_u32_le(),
                exp_duration: body.get_u32_le(),
            };
            ClientMessage::ChnTokenReq { priority, profile }
        }
        MessageType::ChnNotifyReq => {
            need(&body, 6)?;
            ClientMessage::ChnNotifyReq {
                flags: ChannelNotifyFlags(body.get_u32_le()),
                scanning: body.get_u16_le(),
            }
        }
        MessageType::ChnReclaimCnf => ClientMessage::ChnReclaimCnf,
        MessageType::ChnIoctlReq => {
            need(&body, 4)?;
            let request = body.get_u32_le();
            let arg = decode_blob(&mut body, "ioctl_arg", MAX_IOCTL_ARG)?;
            ClientMessage::ChnIoctlReq { request, arg }
        }
        other => return Err(ProtocolError::WrongDirection(other)),
    };
    finish(msg_type, &body, msg)
}

/// Decode a server message from a complete body.
pub fn decode_server_message(
    msg_type: MessageType,
    mut body: Bytes,
) -> Result<ServerMessage, ProtocolError> {
    let msg = match msg_type {
        MessageType::ConnectCnf => {
            need(&body, 12)?;
            let version_major = body.get_u16_le();
            let version_minor = body.get_u16_le();
            let daemon_pid = body.get_u32_le();
            let services = ServiceSet(body.get_u32_le());
            let params = decode_params(&mut body)?;
            ServerMessage::ConnectCnf {
                version_major,
                version_minor,
                daemon_pid,
                services,
                params,
            }
        }
        MessageType::ConnectRej => ServerMessage::ConnectRej {
            reason: decode_string(&mut body, "reason", MAX_ERROR_TEXT)?,
        },
        MessageType::DaemonPidCnf => {
            need(&body, 4)?;
            ServerMessage::DaemonPidCnf {
                pid: body.get_u32_le(),
            }
        }
        MessageType::ServiceCnf => {
            need(&body, 4)?;
            let services = ServiceSet(body.get_u32_le());
            let params = decode_params(&mut body)?;
            ServerMessage::ServiceCnf { services, params }
        }
        MessageType::ServiceRej => {
            need(&body, 4)?;
            let services = ServiceSet(body.get_u32_le());
            let reason = decode_string(&mut body, "reason", MAX_ERROR_TEXT)?;
            ServerMessage::ServiceRej { services, reason }
        }
        MessageType::SlicedInd => ServerMessage::SlicedInd(decode_sliced(&mut body)?),
        MessageType::ChnTokenCnf => {
            need(&body, 3)?;
            let status = TokenStatus::try_from(body.get_u8()).map_err(|v| {
                ProtocolError::InvalidValue {
                    field: "token_status",
                    value: v as u32,
                }
            })?;
            ServerMessage::ChnTokenCnf(TokenReply {
                status,
                permitted: body.get_u8() != 0,
                non_exclusive: body.get_u8() != 0,
            })
        }
        MessageType::ChnTokenInd => ServerMessage::ChnTokenInd,
        MessageType::ChnNotifyCnf => {
            need(&body, 6)?;
            ServerMessage::ChnNotifyCnf {
                flags: ChannelNotifyFlags(body.get_u32_le()),
                scanning: body.get_u16_le(),
            }
        }
        MessageType::ChnReclaimReq => ServerMessage::ChnReclaimReq,
        MessageType::ChnChangeInd => {
            need(&body, 6)?;
            ServerMessage::ChnChangeInd {
                flags: ChannelNotifyFlags(body.get_u32_le()),
                scanning: body.get_u16_le(),
            }
        }
        MessageType::ChnIoctlCnf => {
            need(&body, 8)?;
            let result = body.get_i32_le();
            let errno = body.get_i32_le();
            let arg = decode_blob(&mut body, "ioctl_arg", MAX_IOCTL_ARG)?;
            ServerMessage::ChnIoctlCnf { result, errno, arg }
        }
        MessageType::ChnIoctlRej => ServerMessage::ChnIoctlRej {
            reason: decode_string(&mut body, "reason", MAX_ERROR_TEXT)?,
        },
        other => return Err(ProtocolError::WrongDirection(other)),
    };
    finish(msg_type, &body, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_client(msg: &ClientMessage) -> ClientMessage {
        let encoded = encode_client_message(msg).unwrap();
        let header = decode_header(&encoded, DEFAULT_MAX_MESSAGE_SIZE).unwrap().unwrap();
        assert_eq!(header.body_len as usize, encoded.len() - HEADER_SIZE);
        decode_client_message(header.message_type, encoded.slice(HEADER_SIZE..)).unwrap()
    }

    fn roundtrip_server(msg: &ServerMessage) -> ServerMessage {
        let encoded = encode_server_message(msg).unwrap();
        let header = decode_header(&encoded, DEFAULT_MAX_MESSAGE_SIZE).unwrap().unwrap();
        decode_server_message(header.message_type, encoded.slice(HEADER_SIZE..)).unwrap()
    }

    #[test]
    fn test_encode_decode_connect_req() {
        let msg = ClientMessage::ConnectReq {
            handshake: Handshake::current(),
            client_name: "vbi-capture".to_string(),
            pid: 4242,
            flags: ClientFlags::NO_TIMEOUTS | ClientFlags::RAW_DATA,
            scanning: 625,
            services: ServiceSet::TELETEXT_B | ServiceSet::VPS,
            strictness: Strictness::Strict,
        };
        let encoded = encode_client_message(&msg).unwrap();

        // Verify header
        assert_eq!(&encoded[4..6], &0x0001u16.to_le_bytes());
        assert_eq!(&encoded[HEADER_SIZE..HEADER_SIZE + 8], &MAGIC);

        assert_eq!(roundtrip_client(&msg), msg);
    }

    #[test]
    fn test_encode_decode_sliced_ind() {
        let frame = SlicedFrame {
            timestamp: 1_700_000_000.04,
            lines: vec![
                SlicedLine::new(ServiceSet::TELETEXT_B_L10_625, 7, &[0x55; 42]),
                SlicedLine::new(ServiceSet::WSS_625, 23, &[0x12, 0x34]),
            ],
            raw: Some(vec![0x80; 32]),
        };
        let msg = ServerMessage::SlicedInd(frame);
        let encoded = encode_server_message(&msg).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE + 8 + 4 + 2 * 64 + 1 + 4 + 32);
        assert_eq!(roundtrip_server(&msg), msg);
    }

    #[test]
    fn test_encode_decode_channel_messages() {
        let req = ClientMessage::ChnTokenReq {
            priority: ChannelPriority::Background,
            profile: ChannelProfile {
                is_valid: true,
                sub_prio: sub_priority::UPDATE,
                min_duration: 10,
                exp_duration: 60,
            },
        };
        assert_eq!(roundtrip_client(&req), req);

        let cnf = ServerMessage::ChnTokenCnf(TokenReply {
            status: TokenStatus::Pending,
            permitted: false,
            non_exclusive: true,
        });
        assert_eq!(roundtrip_server(&cnf), cnf);

        let ind = ServerMessage::ChnChangeInd {
            flags: ChannelNotifyFlags::FLUSH | ChannelNotifyFlags::NORM,
            scanning: 525,
        };
        assert_eq!(roundtrip_server(&ind), ind);
    }

    #[test]
    fn test_reject_reason_is_truncated() {
        let msg = ServerMessage::ConnectRej {
            reason: "x".repeat(400),
        };
        match roundtrip_server(&msg) {
            ServerMessage::ConnectRej { reason } => assert_eq!(reason.len(), MAX_ERROR_TEXT),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_client_name_too_long() {
        let msg = ClientMessage::ConnectReq {
            handshake: Handshake::current(),
            client_name: "n".repeat(MAX_CLIENT_NAME + 1),
            pid: 1,
            flags: ClientFlags::default(),
            scanning: 0,
            services: ServiceSet::VPS,
            strictness: Strictness::Default,
        };
        assert!(matches!(
            encode_client_message(&msg),
            Err(ProtocolError::FieldTooLong { field: "client_name", .. })
        ));
    }

    #[test]
    fn test_invalid_magic() {
        let msg = ClientMessage::DaemonPidReq {
            handshake: Handshake {
                magic: *b"NOTPROXY",
                ..Handshake::current()
            },
        };
        let encoded = encode_client_message(&msg).unwrap();
        let result = decode_client_message(MessageType::DaemonPidReq, encoded.slice(HEADER_SIZE..));
        assert!(matches!(result, Err(ProtocolError::InvalidMagic(_))));
    }

    #[test]
    fn test_incomplete_header() {
        let partial = [0x10u8, 0x00, 0x00];
        assert!(decode_header(&partial, DEFAULT_MAX_MESSAGE_SIZE).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_rejected_in_header() {
        let mut header = Vec::new();
        header.extend_from_slice(&(2 * 1024 * 1024u32).to_le_bytes());
        header.extend_from_slice(&u16::from(MessageType::SlicedInd).to_le_bytes());
        let result = decode_header(&header, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidLength {
                message_type: MessageType::SlicedInd,
                ..
            })
        ));
    }

    #[test]
    fn test_undersized_length_rejected_in_header() {
        let mut header = Vec::new();
        header.extend_from_slice(&3u32.to_le_bytes());
        header.extend_from_slice(&u16::from(MessageType::ServiceReq).to_le_bytes());
        assert!(decode_header(&header, DEFAULT_MAX_MESSAGE_SIZE).is_err());
    }

    #[test]
    fn test_unknown_type() {
        let header = [0u8, 0, 0, 0, 0xEE, 0xEE];
        assert_eq!(
            decode_header(&header, DEFAULT_MAX_MESSAGE_SIZE),
            Err(ProtocolError::UnknownMessageType(0xEEEE))
        );
    }

    #[test]
    fn test_wrong_direction() {
        let result = decode_client_message(MessageType::ChnTokenInd, Bytes::new());
        assert_eq!(result, Err(ProtocolError::WrongDirection(MessageType::ChnTokenInd)));
        let result = decode_server_message(MessageType::CloseReq, Bytes::new());
        assert_eq!(result, Err(ProtocolError::WrongDirection(MessageType::CloseReq)));
    }

    #[test]
    fn test_trailing_bytes() {
        let body = Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0xFF]);
        let result = decode_client_message(MessageType::ChnNotifyReq, body);
        assert!(matches!(result, Err(ProtocolError::TrailingBytes { extra: 1, .. })));
    }

    #[test]
    fn test_sliced_line_count_larger_than_body() {
        let mut body = BytesMut::new();
        body.put_f64_le(0.0);
        body.put_u32_le(1_000_000);
        body.put_u8(0);
        let result = decode_server_message(MessageType::SlicedInd, body.freeze());
        assert!(matches!(result, Err(ProtocolError::IncompleteFrame { .. })));
    }
}
