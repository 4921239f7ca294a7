//! Incremental message framing over a byte stream.
//!
//! [`FrameBuffer`] accumulates partial reads and yields complete messages.
//! Its state machine validates a header before reserving room for the
//! body, so a peer declaring an oversized message is refused without the
//! receiver ever allocating for it.
//!
//! [`FrameWriter`] holds the single message in flight towards the peer.

use bytes::{Bytes, BytesMut};

use crate::codec::{decode_header, FrameHeader, HEADER_SIZE};
use crate::error::ProtocolError;

/// Initial receive capacity; enough for every fixed-size message.
const INITIAL_CAPACITY: usize = 4 * 1024;

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForHeader,
    WaitingForBody { header: FrameHeader },
}

/// A complete message: validated header and raw body.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_message_size: u32,
}

impl FrameBuffer {
    pub fn new(max_message_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            state: State::WaitingForHeader,
            max_message_size,
        }
    }

    /// Read target for `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Append data to the buffer without extracting frames.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract a single frame.
    ///
    /// Returns `Ok(None)` if more data is needed and an error on a
    /// protocol violation. After an error the buffer must be discarded.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    let header = match decode_header(&self.buffer, self.max_message_size)? {
                        Some(h) => h,
                        None => return Ok(None),
                    };
                    let _ = self.buffer.split_to(HEADER_SIZE);
                    let body_len = header.body_len as usize;
                    if self.buffer.len() < body_len {
                        self.buffer.reserve(body_len - self.buffer.len());
                    }
                    self.state = State::WaitingForBody { header };
                }
                State::WaitingForBody { header } => {
                    let body_len = header.body_len as usize;
                    if self.buffer.len() < body_len {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(body_len).freeze();
                    self.state = State::WaitingForHeader;
                    return Ok(Some(Frame { header, body }));
                }
            }
        }
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes currently reserved for receiving.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }
}

/// Outbound side of a connection: at most one message in flight.
#[derive(Debug, Default)]
pub struct FrameWriter {
    pending: Option<Bytes>,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self { pending: None }
    }

    /// Queue an encoded message. Fails if the previous one is not fully written.
    pub fn queue(&mut self, frame: Bytes) -> Result<(), ProtocolError> {
        if self.pending.is_some() {
            return Err(ProtocolError::WritePending);
        }
        if !frame.is_empty() {
            self.pending = Some(frame);
        }
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Bytes still to be written.
    pub fn remaining(&self) -> &[u8] {
        self.pending.as_deref().unwrap_or(&[])
    }

    /// Record that `n` bytes were written.
    pub fn advance(&mut self, n: usize) {
        if let Some(buf) = self.pending.as_mut() {
            let n = n.min(buf.len());
            let _ = buf.split_to(n);
            if buf.is_empty() {
                self.pending = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_client_message, encode_server_message};
    use crate::types::*;

    fn close_req() -> Bytes {
        encode_client_message(&ClientMessage::CloseReq).unwrap()
    }

    #[test]
    fn test_fragmented_frames() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_client_message(&ClientMessage::ChnNotifyReq {
            flags: ChannelNotifyFlags::TOKEN,
            scanning: 625,
        })
        .unwrap());
        stream.extend_from_slice(&close_req());

        let mut fb = FrameBuffer::new(DEFAULT_MAX_MESSAGE_SIZE);
        let mut frames = Vec::new();
        for byte in &stream {
            fb.extend(std::slice::from_ref(byte));
            while let Some(frame) = fb.next_frame().unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].header.message_type, MessageType::ChnNotifyReq);
        assert_eq!(frames[0].body.len(), 6);
        assert_eq!(frames[1].header.message_type, MessageType::CloseReq);
        assert!(fb.is_empty());
    }

    #[test]
    fn test_oversized_declaration_reserves_nothing() {
        let mut fb = FrameBuffer::new(64 * 1024);
        let before = fb.capacity();

        let mut header = Vec::new();
        header.extend_from_slice(&(512 * 1024u32).to_le_bytes());
        header.extend_from_slice(&u16::from(MessageType::SlicedInd).to_le_bytes());
        fb.extend(&header);

        assert!(matches!(fb.next_frame(), Err(ProtocolError::InvalidLength { .. })));
        assert_eq!(fb.capacity(), before);
    }

    #[test]
    fn test_body_reserved_after_header() {
        let frame = SlicedFrame {
            timestamp: 0.0,
            lines: vec![SlicedLine::new(ServiceSet::VPS, 16, &[1; 13]); 100],
            raw: None,
        };
        let encoded = encode_server_message(&ServerMessage::SlicedInd(frame)).unwrap();

        let mut fb = FrameBuffer::new(DEFAULT_MAX_MESSAGE_SIZE);
        fb.extend(&encoded[..HEADER_SIZE]);
        assert!(fb.next_frame().unwrap().is_none());
        assert!(fb.capacity() >= encoded.len() - HEADER_SIZE);

        fb.extend(&encoded[HEADER_SIZE..]);
        let frame = fb.next_frame().unwrap().unwrap();
        assert_eq!(frame.body.len(), encoded.len() - HEADER_SIZE);
    }

    #[test]
    fn test_writer_one_outstanding() {
        let mut w = FrameWriter::new();
        assert!(!w.is_pending());
        w.queue(close_req()).unwrap();
        assert_eq!(w.queue(close_req()), Err(ProtocolError::WritePending));

        w.advance(4);
        assert!(w.is_pending());
        assert_eq!(w.remaining().len(), HEADER_SIZE - 4);
        w.advance(2);
        assert!(!w.is_pending());
        assert!(w.remaining().is_empty());
        w.queue(close_req()).unwrap();
    }
}
