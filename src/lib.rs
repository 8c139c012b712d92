//! # peer-link
//!
//! Channel-multiplexed peer-to-peer RPC transport over TCP.
//!
//! One TCP connection carries many independent logical channels. Each side
//! registers service [`Handler`](protocol::handler::Handler)s; a peer opens a
//! channel by service type or name, and the two handlers then exchange
//! one-way messages and tracked requests over it.
//!
//! ## Layers
//! - [`core`]: wire buffer, binary stream, frame codec, message envelope
//! - [`transport`]: framed connections and TCP endpoints
//! - [`protocol`]: channel table, control messages, handler registry, request tracker, peer task
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging, metrics
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use peer_link::config::NetworkConfig;
//! use peer_link::protocol::handler::{Handler, Incoming};
//! use peer_link::protocol::peer::ChannelLink;
//! use peer_link::protocol::registry::HandlerRegistry;
//! use peer_link::transport::tcp;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn name(&self) -> &str { "echo" }
//!     fn service_type(&self) -> &str { "Echo" }
//!     fn on_message(&self, link: &ChannelLink, message: Incoming) {
//!         if message.expects_reply() {
//!             let _ = link.reply(message.token, message.payload);
//!         }
//!     }
//! }
//!
//! # async fn run() -> peer_link::error::Result<()> {
//! let config = NetworkConfig::default();
//! let registry = HandlerRegistry::new();
//! let peer = tcp::connect(&config.client, &config.link, registry).await?;
//! let channel = peer.open_channel("Echo", Arc::new(Echo)).await?;
//! let reply = peer.request(channel, &b"ping"[..], config.link.request_timeout).await?;
//! assert_eq!(reply.as_ref(), b"ping");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::config::{LinkConfig, NetworkConfig};
pub use crate::error::{ChannelError, ProtocolError, Result};
pub use crate::protocol::handler::{CloseReason, Handler, Incoming};
pub use crate::protocol::peer::{ChannelLink, PeerHandle, RemotePeer};
pub use crate::protocol::registry::HandlerRegistry;
pub use crate::transport::connection::Connection;
