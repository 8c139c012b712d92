//! Control-channel messages.
//!
//! Everything on channel 0 is one of these, encoded field by field:
//!
//! ```text
//! OpenChannel         [0x01] [id(1)] [flags(1)] [name\0 if flags&1] [type\0 if flags&2]
//! OpenChannelResponse [0x02] [result(1)] [requested_id(1)] [actual_id(1)]
//! CloseChannel        [0x03] [id(1)]
//! ```

use bytes::Bytes;

use crate::core::buffer::WireBuffer;
use crate::core::envelope::{Envelope, CONTROL_CHANNEL};
use crate::core::stream::{BinaryStream, WireFormat};
use crate::error::{constants, ProtocolError, Result};

const OP_OPEN_CHANNEL: u8 = 0x01;
const OP_OPEN_CHANNEL_RESPONSE: u8 = 0x02;
const OP_CLOSE_CHANNEL: u8 = 0x03;

const FLAG_SERVICE_NAME: u8 = 0x01;
const FLAG_SERVICE_TYPE: u8 = 0x02;

/// Outcome carried by an open response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpenResult {
    Ok = 0,
    Error = 1,
}

impl OpenResult {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(OpenResult::Ok),
            1 => Ok(OpenResult::Error),
            other => Err(ProtocolError::ProtocolViolation(format!(
                "invalid open result: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    OpenChannel {
        id: u8,
        service_name: Option<String>,
        service_type: Option<String>,
    },
    OpenChannelResponse {
        result: OpenResult,
        requested_id: u8,
        actual_id: u8,
    },
    CloseChannel {
        id: u8,
    },
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::OpenChannel { .. } => "OPEN_CHANNEL",
            ControlMessage::OpenChannelResponse { .. } => "OPEN_CHANNEL_RESPONSE",
            ControlMessage::CloseChannel { .. } => "CLOSE_CHANNEL",
        }
    }

    pub fn rejected(requested_id: u8) -> Self {
        ControlMessage::OpenChannelResponse {
            result: OpenResult::Error,
            requested_id,
            actual_id: 0,
        }
    }

    pub fn accepted(requested_id: u8, actual_id: u8) -> Self {
        ControlMessage::OpenChannelResponse {
            result: OpenResult::Ok,
            requested_id,
            actual_id,
        }
    }

    /// Encoded body length
    pub fn encoded_len(&self) -> usize {
        match self {
            ControlMessage::OpenChannel {
                service_name,
                service_type,
                ..
            } => {
                let cstr = |s: &Option<String>| s.as_ref().map_or(0, |s| s.len() + 1);
                3 + cstr(service_name) + cstr(service_type)
            }
            ControlMessage::OpenChannelResponse { .. } => 4,
            ControlMessage::CloseChannel { .. } => 2,
        }
    }

    /// Frame payload on the control channel
    pub fn to_payload(&self) -> Result<Bytes> {
        Envelope::build(CONTROL_CHANNEL, self.encoded_len(), |s| self.encode(s))
    }

    /// Decode a control-channel body; trailing bytes are a violation.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let mut buf = WireBuffer::from_slice(body);
        let mut stream = BinaryStream::with_read_limit(&mut buf, body.len());
        Self::decode_body(&mut stream)
    }

    /// Decode one control message that must use up the rest of `stream`
    pub fn decode_body(stream: &mut BinaryStream<'_>) -> Result<Self> {
        let msg = Self::decode(stream)?;
        if stream.remaining() != 0 {
            return Err(ProtocolError::ProtocolViolation(format!(
                "{} ({} after {})",
                constants::ERR_TRAILING_BYTES,
                stream.remaining(),
                msg.name()
            )));
        }
        Ok(msg)
    }
}

fn optional_cstr(stream: &mut BinaryStream<'_>, present: bool) -> Result<Option<String>> {
    if present {
        Ok(Some(stream.get_cstr()?))
    } else {
        Ok(None)
    }
}

impl WireFormat for ControlMessage {
    fn encode(&self, stream: &mut BinaryStream<'_>) -> Result<()> {
        match self {
            ControlMessage::OpenChannel {
                id,
                service_name,
                service_type,
            } => {
                let mut flags = 0u8;
                if service_name.is_some() {
                    flags |= FLAG_SERVICE_NAME;
                }
                if service_type.is_some() {
                    flags |= FLAG_SERVICE_TYPE;
                }
                stream.put_u8(OP_OPEN_CHANNEL)?;
                stream.put_u8(*id)?;
                stream.put_u8(flags)?;
                if let Some(name) = service_name {
                    stream.put_cstr(name)?;
                }
                if let Some(ty) = service_type {
                    stream.put_cstr(ty)?;
                }
                Ok(())
            }
            ControlMessage::OpenChannelResponse {
                result,
                requested_id,
                actual_id,
            } => {
                stream.put_u8(OP_OPEN_CHANNEL_RESPONSE)?;
                stream.put_u8(*result as u8)?;
                stream.put_u8(*requested_id)?;
                stream.put_u8(*actual_id)
            }
            ControlMessage::CloseChannel { id } => {
                stream.put_u8(OP_CLOSE_CHANNEL)?;
                stream.put_u8(*id)
            }
        }
    }

    fn decode(stream: &mut BinaryStream<'_>) -> Result<Self> {
        let opcode = stream.get_u8()?;
        match opcode {
            OP_OPEN_CHANNEL => {
                let id = stream.get_u8()?;
                let flags = stream.get_u8()?;
                let service_name = optional_cstr(stream, flags & FLAG_SERVICE_NAME != 0)?;
                let service_type = optional_cstr(stream, flags & FLAG_SERVICE_TYPE != 0)?;
                Ok(ControlMessage::OpenChannel {
                    id,
                    service_name,
                    service_type,
                })
            }
            OP_OPEN_CHANNEL_RESPONSE => {
                let result = OpenResult::from_byte(stream.get_u8()?)?;
                let requested_id = stream.get_u8()?;
                let actual_id = stream.get_u8()?;
                Ok(ControlMessage::OpenChannelResponse {
                    result,
                    requested_id,
                    actual_id,
                })
            }
            OP_CLOSE_CHANNEL => Ok(ControlMessage::CloseChannel {
                id: stream.get_u8()?,
            }),
            other => Err(ProtocolError::ProtocolViolation(format!(
                "{}: {other:#04x}",
                constants::ERR_UNKNOWN_CONTROL
            ))),
        }
    }
}
