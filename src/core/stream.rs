//! # Binary Stream
//!
//! Typed little-endian reads and writes over a [`WireBuffer`].
//!
//! A stream borrows its buffer for its whole lifetime and counts the bytes it
//! moved (`total_read`, `total_write`). An optional read limit caps how many
//! bytes the stream may consume, so a decoder handed a buffer that holds
//! several back-to-back frames cannot run into the next one.
//!
//! Every read checks, in order:
//! 1. `total_read + n` stays within the read limit (`ReadLimitExceeded`)
//! 2. the buffer holds at least the requested bytes (`BufferUnderrun`)
//!
//! The limit marks a frame boundary, so a decoder running past the end of its
//! frame always sees `ReadLimitExceeded`, however many bytes the buffer holds.
//! A failed check leaves the buffer untouched.
//!
//! ## Error modes
//! - [`StreamMode::Strict`]: failures are returned as `Err`.
//! - [`StreamMode::Lenient`]: the first failure is latched in [`BinaryStream::error`],
//!   the read yields a default value, and every later read short-circuits.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::buffer::WireBuffer;
use crate::error::{ProtocolError, Result};

/// How a stream reports a failed read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Failures are returned as errors (default)
    #[default]
    Strict,
    /// Failures mark the stream and reads return default values
    Lenient,
}

/// Types with an explicit field-by-field wire encoding.
pub trait WireFormat: Sized {
    fn encode(&self, stream: &mut BinaryStream<'_>) -> Result<()>;
    fn decode(stream: &mut BinaryStream<'_>) -> Result<Self>;
}

/// Cursor over a borrowed [`WireBuffer`].
pub struct BinaryStream<'a> {
    buf: &'a mut WireBuffer,
    total_read: usize,
    total_write: usize,
    read_limit: Option<usize>,
    write_limit: Option<usize>,
    mode: StreamMode,
    error: Option<ProtocolError>,
}

macro_rules! put_le {
    ($name:ident, $ty:ty) => {
        #[doc = concat!("Write a little-endian `", stringify!($ty), "`")]
        pub fn $name(&mut self, value: $ty) -> Result<()> {
            self.put_bytes(&value.to_le_bytes())
        }
    };
}

macro_rules! get_le {
    ($name:ident, $ty:ty) => {
        #[doc = concat!("Read a little-endian `", stringify!($ty), "`")]
        pub fn $name(&mut self) -> Result<$ty> {
            let mut raw = [0u8; std::mem::size_of::<$ty>()];
            if self.read_into(&mut raw)? {
                Ok(<$ty>::from_le_bytes(raw))
            } else {
                Ok(<$ty>::default())
            }
        }
    };
}

impl<'a> BinaryStream<'a> {
    pub fn new(buf: &'a mut WireBuffer) -> Self {
        Self {
            buf,
            total_read: 0,
            total_write: 0,
            read_limit: None,
            write_limit: None,
            mode: StreamMode::Strict,
            error: None,
        }
    }

    /// Stream that may consume at most `limit` bytes
    pub fn with_read_limit(buf: &'a mut WireBuffer, limit: usize) -> Self {
        let mut stream = Self::new(buf);
        stream.read_limit = Some(limit);
        stream
    }

    pub fn mode(mut self, mode: StreamMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn set_read_limit(&mut self, limit: Option<usize>) {
        self.read_limit = limit;
    }

    pub fn set_write_limit(&mut self, limit: Option<usize>) {
        self.write_limit = limit;
    }

    pub fn read_limit(&self) -> Option<usize> {
        self.read_limit
    }

    pub fn total_read(&self) -> usize {
        self.total_read
    }

    pub fn total_write(&self) -> usize {
        self.total_write
    }

    /// Bytes this stream may still read, bounded by the buffer and the read limit
    pub fn remaining(&self) -> usize {
        let available = self.buf.size();
        match self.read_limit {
            Some(limit) => available.min(limit.saturating_sub(self.total_read)),
            None => available,
        }
    }

    /// Whether a lenient stream has latched a failure
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&ProtocolError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<ProtocolError> {
        self.error.take()
    }

    /// Mutable access to the underlying buffer
    pub fn buffer(&mut self) -> &mut WireBuffer {
        &mut *self.buf
    }

    // ----- reads -----

    fn check_read(&self, n: usize) -> Result<()> {
        if let Some(limit) = self.read_limit {
            let remaining = limit.saturating_sub(self.total_read);
            if n > remaining {
                return Err(ProtocolError::ReadLimitExceeded {
                    requested: n,
                    remaining,
                });
            }
        }
        let available = self.buf.size();
        if n > available {
            return Err(ProtocolError::BufferUnderrun {
                requested: n,
                available,
            });
        }
        Ok(())
    }

    /// Report `err` according to the stream mode. `Ok(false)` means the
    /// caller should hand back a default value.
    fn fail(&mut self, err: ProtocolError) -> Result<bool> {
        match self.mode {
            StreamMode::Strict => Err(err),
            StreamMode::Lenient => {
                if self.error.is_none() {
                    self.error = Some(err);
                }
                Ok(false)
            }
        }
    }

    /// Gate for every read. `Ok(true)` means `n` bytes may be consumed.
    fn admit(&mut self, n: usize) -> Result<bool> {
        if self.error.is_some() {
            return Ok(false);
        }
        match self.check_read(n) {
            Ok(()) => Ok(true),
            Err(err) => self.fail(err),
        }
    }

    fn read_into(&mut self, dest: &mut [u8]) -> Result<bool> {
        if !self.admit(dest.len())? {
            return Ok(false);
        }
        self.buf.read(dest)?;
        self.total_read += dest.len();
        Ok(true)
    }

    get_le!(get_u8, u8);
    get_le!(get_u16, u16);
    get_le!(get_u32, u32);
    get_le!(get_u64, u64);
    get_le!(get_i8, i8);
    get_le!(get_i16, i16);
    get_le!(get_i32, i32);
    get_le!(get_i64, i64);
    get_le!(get_f32, f32);
    get_le!(get_f64, f64);

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Read exactly `n` bytes
    pub fn get_bytes(&mut self, n: usize) -> Result<Bytes> {
        if !self.admit(n)? {
            return Ok(Bytes::new());
        }
        let bytes = self.buf.take(n)?;
        self.total_read += n;
        Ok(bytes)
    }

    /// Read everything this stream is still allowed to read
    pub fn get_rest(&mut self) -> Result<Bytes> {
        let n = self.remaining();
        self.get_bytes(n)
    }

    /// Read a null-terminated string. Reading stops at the first NUL or when
    /// the readable bytes run out; the terminator is consumed but not returned.
    pub fn get_cstr(&mut self) -> Result<String> {
        if self.error.is_some() {
            return Ok(String::new());
        }
        let window = self.remaining();
        let (len, terminated) = match self.buf.find(0, window) {
            Some(pos) => (pos, true),
            None => (window, false),
        };
        let raw = self.get_bytes(len)?;
        if terminated {
            self.skip(1)?;
        }
        match String::from_utf8(raw.to_vec()) {
            Ok(s) => Ok(s),
            Err(e) => {
                self.fail(ProtocolError::DeserializeError(e.to_string()))?;
                Ok(String::new())
            }
        }
    }

    /// Read a u32-length-prefixed byte range
    pub fn get_blob(&mut self) -> Result<Bytes> {
        let len = self.get_u32()? as usize;
        self.get_bytes(len)
    }

    /// Read a u32-length-prefixed bincode value
    pub fn get_serde<T: DeserializeOwned + Default>(&mut self) -> Result<T> {
        let raw = self.get_blob()?;
        if self.error.is_some() {
            return Ok(T::default());
        }
        match bincode::deserialize(&raw) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.fail(ProtocolError::DeserializeError(e.to_string()))?;
                Ok(T::default())
            }
        }
    }

    /// Consume `n` bytes without copying them
    pub fn skip(&mut self, n: usize) -> Result<()> {
        if !self.admit(n)? {
            return Ok(());
        }
        self.buf.skip(n)?;
        self.total_read += n;
        Ok(())
    }

    // ----- writes -----

    fn check_write(&self, n: usize) -> Result<()> {
        if let Some(limit) = self.write_limit {
            let requested = self.total_write + n;
            if requested > limit {
                return Err(ProtocolError::BufferOverflow { requested, limit });
            }
        }
        Ok(())
    }

    /// Append a raw byte range
    pub fn put_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.check_write(data.len())?;
        self.buf.write(data);
        self.total_write += data.len();
        Ok(())
    }

    put_le!(put_u8, u8);
    put_le!(put_u16, u16);
    put_le!(put_u32, u32);
    put_le!(put_u64, u64);
    put_le!(put_i8, i8);
    put_le!(put_i16, i16);
    put_le!(put_i32, i32);
    put_le!(put_i64, i64);
    put_le!(put_f32, f32);
    put_le!(put_f64, f64);

    pub fn put_bool(&mut self, value: bool) -> Result<()> {
        self.put_u8(u8::from(value))
    }

    /// Write a string followed by a NUL terminator
    pub fn put_cstr(&mut self, value: &str) -> Result<()> {
        if value.as_bytes().contains(&0) {
            return Err(ProtocolError::SerializeError(
                "string contains an interior NUL byte".into(),
            ));
        }
        self.check_write(value.len() + 1)?;
        self.put_bytes(value.as_bytes())?;
        self.put_u8(0)
    }

    /// Write a u32-length-prefixed byte range
    pub fn put_blob(&mut self, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| ProtocolError::BufferOverflow {
            requested: data.len(),
            limit: u32::MAX as usize,
        })?;
        self.check_write(4 + data.len())?;
        self.put_u32(len)?;
        self.put_bytes(data)
    }

    /// Write a u32-length-prefixed bincode value
    pub fn put_serde<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let raw = bincode::serialize(value)?;
        self.put_blob(&raw)
    }

    /// Reserve `n` zeroed bytes and return their buffer position
    pub fn put_placeholder(&mut self, n: usize) -> Result<usize> {
        self.check_write(n)?;
        self.total_write += n;
        Ok(self.buf.reserve(n))
    }

    /// Fill a placeholder returned by [`put_placeholder`](Self::put_placeholder)
    pub fn patch(&mut self, pos: usize, data: &[u8]) -> Result<()> {
        self.buf.overwrite(pos, data)
    }

    pub fn put<T: WireFormat>(&mut self, value: &T) -> Result<()> {
        value.encode(self)
    }

    pub fn get<T: WireFormat>(&mut self) -> Result<T> {
        T::decode(self)
    }
}
