//! # Message Envelope
//!
//! Every frame payload on an established link starts with a [`MessageHeader`]:
//!
//! ```text
//! [Size(4, LE)] [Channel(1)] [Body(Size)]
//! ```
//!
//! Channel 0 carries control traffic. Bodies on any other channel start with a
//! call tag ([`CallKind`]) so replies can be matched to their requests:
//!
//! ```text
//! [Kind(1)] [Token(4, LE) if Kind != Oneway] [Application bytes]
//! ```

use bytes::Bytes;

use crate::core::buffer::WireBuffer;
use crate::core::stream::{BinaryStream, WireFormat};
use crate::error::{constants, ProtocolError, Result};

/// Reserved channel for multiplexing-protocol messages
pub const CONTROL_CHANNEL: u8 = 0;

/// Encoded size of [`MessageHeader`]
pub const HEADER_LEN: usize = 5;

/// Header prefixed to every frame payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Length of the body that follows the header
    pub size: u32,
    pub channel: u8,
}

impl WireFormat for MessageHeader {
    fn encode(&self, stream: &mut BinaryStream<'_>) -> Result<()> {
        stream.put_u32(self.size)?;
        stream.put_u8(self.channel)
    }

    fn decode(stream: &mut BinaryStream<'_>) -> Result<Self> {
        let size = stream.get_u32()?;
        let channel = stream.get_u8()?;
        Ok(Self { size, channel })
    }
}

/// A decoded frame payload: header channel plus body bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub channel: u8,
    pub body: Bytes,
}

impl Envelope {
    pub fn new(channel: u8, body: impl Into<Bytes>) -> Self {
        Self {
            channel,
            body: body.into(),
        }
    }

    pub fn is_control(&self) -> bool {
        self.channel == CONTROL_CHANNEL
    }

    /// Build a body with `write` and wrap it in a header addressed to `channel`.
    ///
    /// The header size is reserved up front and back-filled once the body is
    /// written. When `body_len` is exact the payload is built in one block and
    /// returned without a copy.
    pub fn build<F>(channel: u8, body_len: usize, write: F) -> Result<Bytes>
    where
        F: FnOnce(&mut BinaryStream<'_>) -> Result<()>,
    {
        let mut buf = WireBuffer::with_block_size(HEADER_LEN + body_len);
        {
            let mut stream = BinaryStream::new(&mut buf);
            let size_pos = stream.put_placeholder(4)?;
            stream.put_u8(channel)?;
            write(&mut stream)?;
            let body_len = stream.total_write() - HEADER_LEN;
            let size = u32::try_from(body_len).map_err(|_| ProtocolError::BufferOverflow {
                requested: body_len,
                limit: u32::MAX as usize,
            })?;
            stream.patch(size_pos, &size.to_le_bytes())?;
        }
        Ok(buf.into_bytes())
    }

    /// Encode header and body into a frame payload
    pub fn to_payload(&self) -> Result<Bytes> {
        Self::build(self.channel, self.body.len(), |s| s.put_bytes(&self.body))
    }

    /// Decode a frame payload, checking the header size against the frame length.
    pub fn decode_from(stream: &mut BinaryStream<'_>) -> Result<Self> {
        let header = Self::decode_header(stream)?;
        let body = stream.get_bytes(header.size as usize)?;
        Ok(Self {
            channel: header.channel,
            body,
        })
    }

    /// Read the header of a frame payload, leaving the stream at the body.
    ///
    /// `stream` must be limited to the frame; the declared size has to match
    /// what is left of it.
    pub fn decode_header(stream: &mut BinaryStream<'_>) -> Result<MessageHeader> {
        let available = stream.remaining();
        if available < HEADER_LEN {
            return Err(ProtocolError::ProtocolViolation(format!(
                "frame of {available} bytes is shorter than the message header"
            )));
        }
        let header = MessageHeader::decode(stream)?;
        if header.size as usize != stream.remaining() {
            return Err(ProtocolError::ProtocolViolation(format!(
                "{}: header {} vs frame {}",
                constants::ERR_HEADER_SIZE_MISMATCH,
                header.size,
                stream.remaining()
            )));
        }
        Ok(header)
    }

    /// Decode a standalone frame payload
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let mut buf = WireBuffer::from_slice(payload);
        let mut stream = BinaryStream::with_read_limit(&mut buf, payload.len());
        Self::decode_from(&mut stream)
    }
}

/// Tag at the start of every data-channel body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallKind {
    /// Fire-and-forget message
    Oneway = 0,
    /// Message expecting a reply with the same token
    Request = 1,
    /// Successful reply
    Reply = 2,
    /// Explicit error reply; the bytes are a UTF-8 message
    ErrorReply = 3,
}

impl CallKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(CallKind::Oneway),
            1 => Some(CallKind::Request),
            2 => Some(CallKind::Reply),
            3 => Some(CallKind::ErrorReply),
            _ => None,
        }
    }

    pub fn has_token(self) -> bool {
        !matches!(self, CallKind::Oneway)
    }
}

/// Parsed data-channel body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub kind: CallKind,
    /// Correlation token; 0 for one-way messages
    pub token: u32,
    pub payload: Bytes,
}

impl DataMessage {
    pub fn oneway(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: CallKind::Oneway,
            token: 0,
            payload: payload.into(),
        }
    }

    pub fn with_token(kind: CallKind, token: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            token,
            payload: payload.into(),
        }
    }

    /// Encoded body length
    pub fn encoded_len(&self) -> usize {
        let token = if self.kind.has_token() { 4 } else { 0 };
        1 + token + self.payload.len()
    }

    /// Full frame payload (header included) for `channel`
    pub fn to_payload(&self, channel: u8) -> Result<Bytes> {
        Envelope::build(channel, self.encoded_len(), |s| self.encode(s))
    }

    pub fn from_body(body: &[u8]) -> Result<Self> {
        let mut buf = WireBuffer::from_slice(body);
        let mut stream = BinaryStream::with_read_limit(&mut buf, body.len());
        Self::decode(&mut stream)
    }
}

impl WireFormat for DataMessage {
    fn encode(&self, stream: &mut BinaryStream<'_>) -> Result<()> {
        stream.put_u8(self.kind as u8)?;
        if self.kind.has_token() {
            stream.put_u32(self.token)?;
        }
        stream.put_bytes(&self.payload)
    }

    fn decode(stream: &mut BinaryStream<'_>) -> Result<Self> {
        let raw = stream.get_u8()?;
        let kind = CallKind::from_byte(raw).ok_or_else(|| {
            ProtocolError::ProtocolViolation(format!(
                "{}: {raw}",
                constants::ERR_UNKNOWN_CALL_KIND
            ))
        })?;
        let token = if kind.has_token() {
            stream.get_u32()?
        } else {
            0
        };
        let payload = stream.get_rest()?;
        Ok(Self {
            kind,
            token,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_layout() {
        let payload = Envelope::new(3, &b"hi"[..]).to_payload().unwrap();
        assert_eq!(payload.as_ref(), &[2, 0, 0, 0, 3, b'h', b'i']);
        let back = Envelope::from_payload(&payload).unwrap();
        assert_eq!(back.channel, 3);
        assert_eq!(back.body.as_ref(), b"hi");
        assert!(!back.is_control());
    }

    #[test]
    fn test_envelope_size_mismatch_is_violation() {
        let bad = [9u8, 0, 0, 0, 1, 0xAA];
        assert!(matches!(
            Envelope::from_payload(&bad),
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_envelope_short_frame_is_violation() {
        assert!(matches!(
            Envelope::from_payload(&[1, 0]),
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_data_message_tokens() {
        let req = DataMessage::with_token(CallKind::Request, 0xDEAD_BEEF, &b"q"[..]);
        let payload = req.to_payload(4).unwrap();
        let env = Envelope::from_payload(&payload).unwrap();
        assert_eq!(env.channel, 4);
        assert_eq!(DataMessage::from_body(&env.body).unwrap(), req);

        let oneway = DataMessage::oneway(&b"x"[..]);
        let env = Envelope::from_payload(&oneway.to_payload(1).unwrap()).unwrap();
        assert_eq!(env.body.as_ref(), &[0, b'x']);
    }

    #[test]
    fn test_unknown_call_kind() {
        assert!(matches!(
            DataMessage::from_body(&[7, 0, 0, 0, 0]),
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_encoded_len_matches_body() {
        for message in [
            DataMessage::oneway(&b"abc"[..]),
            DataMessage::with_token(CallKind::Request, 9, &b"abc"[..]),
            DataMessage::with_token(CallKind::ErrorReply, 9, Bytes::new()),
        ] {
            let payload = message.to_payload(2).unwrap();
            assert_eq!(payload.len(), HEADER_LEN + message.encoded_len());
            let env = Envelope::from_payload(&payload).unwrap();
            assert_eq!(DataMessage::from_body(&env.body).unwrap(), message);
        }
    }
}
