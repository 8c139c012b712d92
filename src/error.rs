//! # Error Types
//!
//! Error handling for every layer of the link: buffers, streams, framing,
//! the channel protocol and tracked requests.
//!
//! ## Error Categories
//! - **Buffer/Stream Errors**: underrun, overflow and read-limit violations.
//!   These are local and reported to the caller immediately.
//! - **Protocol Errors**: bad headers, oversized frames, unknown control messages.
//!   These close the offending link and nothing else.
//! - **Channel Errors**: rejected opens, id collisions, traffic for closed channels.
//!   These are reported to the initiating handler and leave the link up.
//! - **Link Errors**: `LinkGone` and `LinkTimeout`, delivered exactly once to the
//!   callback of every outstanding tracked request.
//!
//! ## Example Usage
//! ```rust
//! use peer_link::core::buffer::WireBuffer;
//! use peer_link::error::{ProtocolError, Result};
//!
//! fn first_byte(buf: &mut WireBuffer) -> Result<u8> {
//!     let mut out = [0u8; 1];
//!     buf.read(&mut out)?;
//!     Ok(out[0])
//! }
//!
//! let mut buf = WireBuffer::new();
//! assert!(matches!(first_byte(&mut buf), Err(ProtocolError::BufferUnderrun { .. })));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Registry-related error messages
    pub const ERR_REGISTRY_WRITE_LOCK: &str = "Failed to acquire write lock on handler registry";
    pub const ERR_REGISTRY_READ_LOCK: &str = "Failed to acquire read lock on handler registry";

    /// Protocol validation errors
    pub const ERR_HEADER_SIZE_MISMATCH: &str = "Message header size does not match frame length";
    pub const ERR_UNKNOWN_CONTROL: &str = "Unknown control message opcode";
    pub const ERR_UNKNOWN_CALL_KIND: &str = "Unknown data message kind";
    pub const ERR_TRAILING_BYTES: &str = "Control message has trailing bytes";

    /// Connection errors
    pub const ERR_ALREADY_STARTED: &str = "Receive loop already started";
    pub const ERR_CONNECT_TIMEOUT: &str = "Timed out connecting to peer";
}

/// Failures of the channel-multiplexing protocol that leave the link intact.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Peer rejected open of channel {requested}")]
    Rejected { requested: u8 },

    #[error("Channel {requested} was renumbered to {actual}, which is already in use")]
    Collision { requested: u8, actual: u8 },

    #[error("Channel table is full")]
    TableFull,

    #[error("Invalid channel id: {0}")]
    InvalidId(u8),

    #[error("Channel {0} is not open")]
    NotOpen(u8),
}

// ProtocolError is the primary error type for all link operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Buffer underrun: requested {requested} bytes, {available} available")]
    BufferUnderrun { requested: usize, available: usize },

    #[error("Buffer overflow: requested {requested} bytes, limit {limit}")]
    BufferOverflow { requested: usize, limit: usize },

    #[error("Read limit exceeded: requested {requested} bytes, {remaining} remaining in message")]
    ReadLimitExceeded { requested: usize, remaining: usize },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    OversizedFrame { size: usize, max: usize },

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Link gone")]
    LinkGone,

    #[error("Link timed out waiting for a reply")]
    LinkTimeout,

    #[error("Remote error: {0}")]
    RemoteError(String),

    #[error("Handler already registered: name={name} type={service_type}")]
    DuplicateHandler { name: String, service_type: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error must terminate the link it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::ReadLimitExceeded { .. }
                | ProtocolError::ProtocolViolation(_)
                | ProtocolError::OversizedFrame { .. }
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
