//! # Frame Codec
//!
//! Length-prefixed framing for the byte stream of one connection.
//!
//! ## Wire Format
//! ```text
//! [Length(4, LE)] [Payload(Length)]
//! ```
//!
//! `max_frame` bounds the whole frame (prefix included) and matches the
//! receiver's fixed receive-buffer capacity. A declared length beyond it is a
//! fatal protocol violation for the link.
//!
//! Two decoders share the same rules:
//! - [`FrameCodec`] implements tokio-util's `Encoder`/`Decoder` over `BytesMut`
//!   and drives the write half of every connection.
//! - [`FrameAssembler`] reassembles frames in a [`WireBuffer`] for the receive
//!   loop and hands each frame to a decoder through a read-limited stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::core::buffer::WireBuffer;
use crate::core::stream::{BinaryStream, StreamMode};
use crate::error::{ProtocolError, Result};

/// Size of the little-endian length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default receive buffer capacity (64KB)
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

#[inline]
fn check_frame_len(len: usize, max_frame: usize) -> Result<()> {
    if len.saturating_add(LENGTH_PREFIX_LEN) > max_frame {
        return Err(ProtocolError::OversizedFrame {
            size: len,
            max: max_frame.saturating_sub(LENGTH_PREFIX_LEN),
        });
    }
    Ok(())
}

#[inline]
fn length_prefix(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| ProtocolError::BufferOverflow {
        requested: len,
        limit: u32::MAX as usize,
    })
}

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    let prefix = length_prefix(payload.len())?;
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    out.put_u32_le(prefix);
    out.extend_from_slice(payload);
    Ok(out.freeze())
}

/// tokio-util codec for `u32 LE` length-prefixed frames
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl FrameCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let len = u32::from_le_bytes(prefix) as usize;
        check_frame_len(len, self.max_frame)?;

        if src.len() < LENGTH_PREFIX_LEN + len {
            src.reserve(LENGTH_PREFIX_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        check_frame_len(payload.len(), self.max_frame)?;
        let prefix = length_prefix(payload.len())?;
        dst.reserve(LENGTH_PREFIX_LEN + payload.len());
        dst.put_u32_le(prefix);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Reassembles frames from arbitrarily sized socket reads.
#[derive(Debug)]
pub struct FrameAssembler {
    buf: WireBuffer,
    max_frame: usize,
    mode: StreamMode,
}

impl FrameAssembler {
    pub fn new(max_frame: usize, block_size: usize) -> Self {
        Self {
            buf: WireBuffer::with_block_size(block_size),
            max_frame,
            mode: StreamMode::Strict,
        }
    }

    /// Stream mode handed to frame decoders
    pub fn with_mode(mut self, mode: StreamMode) -> Self {
        self.mode = mode;
        self
    }

    /// Append bytes received from the socket
    pub fn push(&mut self, data: &[u8]) {
        self.buf.write(data);
    }

    /// Bytes buffered but not yet returned as frames
    pub fn buffered(&self) -> usize {
        self.buf.size()
    }

    /// Payload length of the next frame once its prefix and payload have fully arrived.
    fn complete_frame_len(&self) -> Result<Option<usize>> {
        if self.buf.size() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        self.buf.copy(&mut prefix)?;
        let len = u32::from_le_bytes(prefix) as usize;
        check_frame_len(len, self.max_frame)?;

        if self.buf.size() < LENGTH_PREFIX_LEN + len {
            return Ok(None);
        }
        Ok(Some(len))
    }

    /// Run `decode` over the next complete frame.
    ///
    /// The stream given to `decode` cannot read past the frame, and whatever
    /// it leaves unread is discarded so the following frame starts clean.
    pub fn decode_next<T, F>(&mut self, decode: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut BinaryStream<'_>) -> Result<T>,
    {
        let Some(len) = self.complete_frame_len()? else {
            return Ok(None);
        };
        self.buf.skip(LENGTH_PREFIX_LEN)?;

        let (result, consumed, latched) = {
            let mut stream = BinaryStream::with_read_limit(&mut self.buf, len).mode(self.mode);
            let result = decode(&mut stream);
            let latched = stream.take_error();
            (result, stream.total_read(), latched)
        };

        if consumed < len {
            trace!(unread = len - consumed, "Discarding unread frame bytes");
            self.buf.skip(len - consumed)?;
        }

        match latched {
            Some(err) => Err(err),
            None => result.map(Some),
        }
    }

    /// Next complete frame payload, if one has fully arrived
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        self.decode_next(|stream| stream.get_rest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_roundtrip() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"abc"), &mut buf).unwrap();
        codec.encode(Bytes::new(), &mut buf).unwrap();
        assert_eq!(&buf[..4], &3u32.to_le_bytes());

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().as_ref(), b"abc");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().len(), 0);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_partial_prefix_waits() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[5u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_codec_rejects_oversized() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32_le(13);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::OversizedFrame { size: 13, max: 12 })
        ));
        assert!(codec
            .encode(Bytes::from(vec![0u8; 13]), &mut BytesMut::new())
            .is_err());
        assert!(codec
            .encode(Bytes::from(vec![0u8; 12]), &mut BytesMut::new())
            .is_ok());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_length_prefix_refuses_to_wrap() {
        assert_eq!(length_prefix(u32::MAX as usize).unwrap(), u32::MAX);
        let err = length_prefix(u32::MAX as usize + 1).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BufferOverflow { requested, .. } if requested == u32::MAX as usize + 1
        ));
    }

    #[test]
    fn test_assembler_byte_by_byte() {
        let mut asm = FrameAssembler::new(1024, 3);
        let mut wire = encode_frame(b"first").unwrap().to_vec();
        wire.extend_from_slice(&encode_frame(b"second").unwrap());

        let mut frames = Vec::new();
        for byte in wire {
            asm.push(&[byte]);
            while let Some(frame) = asm.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![Bytes::from("first"), Bytes::from("second")]);
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn test_assembler_surplus_kept_for_next_frame() {
        let mut asm = FrameAssembler::new(1024, 8);
        let mut wire = encode_frame(b"one").unwrap().to_vec();
        wire.extend_from_slice(&encode_frame(b"two").unwrap()[..3]);
        asm.push(&wire);

        assert_eq!(asm.next_frame().unwrap().unwrap().as_ref(), b"one");
        assert!(asm.next_frame().unwrap().is_none());
        assert_eq!(asm.buffered(), 3);
        asm.push(&encode_frame(b"two").unwrap()[3..]);
        assert_eq!(asm.next_frame().unwrap().unwrap().as_ref(), b"two");
    }

    #[test]
    fn test_assembler_decode_cannot_overread() {
        let mut asm = FrameAssembler::new(1024, 8);
        asm.push(&encode_frame(&[1, 2]).unwrap());
        asm.push(&encode_frame(&[3, 4]).unwrap());

        let err = asm.decode_next(|s| s.get_u32()).unwrap_err();
        assert!(matches!(err, ProtocolError::ReadLimitExceeded { .. }));
        // the failed frame was discarded, the next one is intact
        let next = asm.decode_next(|s| s.get_u16()).unwrap();
        assert_eq!(next, Some(u16::from_le_bytes([3, 4])));
    }

    #[test]
    fn test_assembler_discards_unread_remainder() {
        let mut asm = FrameAssembler::new(1024, 8);
        asm.push(&encode_frame(&[1, 2, 3, 4]).unwrap());
        asm.push(&encode_frame(&[9]).unwrap());
        assert_eq!(asm.decode_next(|s| s.get_u8()).unwrap(), Some(1));
        assert_eq!(asm.next_frame().unwrap().unwrap().as_ref(), &[9]);
    }

    #[test]
    fn test_assembler_lenient_mode_surfaces_latched_error() {
        let mut asm = FrameAssembler::new(1024, 8).with_mode(StreamMode::Lenient);
        asm.push(&encode_frame(&[1]).unwrap());
        assert!(matches!(
            asm.decode_next(|s| s.get_u32()),
            Err(ProtocolError::ReadLimitExceeded { .. }) | Err(ProtocolError::BufferUnderrun { .. })
        ));
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn test_assembler_rejects_oversized_declaration() {
        let mut asm = FrameAssembler::new(64, 8);
        asm.push(&1000u32.to_le_bytes());
        assert!(matches!(
            asm.next_frame(),
            Err(ProtocolError::OversizedFrame { size: 1000, .. })
        ));
    }
}
