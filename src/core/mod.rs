//! # Core Wire Components
//!
//! Byte storage, typed streams, framing and the message envelope.
//!
//! ## Components
//! - **WireBuffer**: block-chained byte queue with O(1) append/consume
//! - **BinaryStream**: bounds-checked typed (de)serialization with a read limit
//! - **Codec**: length-prefixed framing and frame reassembly
//! - **Envelope**: message header, channel addressing and call tags
//! - **Serialization**: bincode application payloads
//!
//! ## Wire Format
//! ```text
//! [Length(4, LE)] [Size(4, LE)] [Channel(1)] [Body(Size)]
//! ```
//!
//! ## Safety
//! - Frame length validated against the receive capacity before buffering
//! - Header size must match the frame length exactly
//! - Decoders cannot read past the frame they were given

pub mod buffer;
pub mod codec;
pub mod envelope;
pub mod serialization;
pub mod stream;
