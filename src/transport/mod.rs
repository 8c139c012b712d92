//! # Transport Layer
//!
//! Framed connections and the TCP endpoints that create them.
//!
//! ## Components
//! - **Connection**: send FIFO plus receive loop over any async byte stream
//! - **TCP**: listening server with graceful shutdown, and an outbound dialer
//!
//! ## Failure Semantics
//! Transport is best-effort: an I/O error or EOF closes the connection and
//! anything still queued is discarded. Channels must be reopened on a new link.

pub mod connection;
pub mod tcp;
