//! Service-side handler capability.
//!
//! A service registers one [`Handler`] per logical endpoint with the
//! [`HandlerRegistry`](crate::protocol::registry::HandlerRegistry). When a peer
//! opens a channel naming that service, the handler is bound to the channel and
//! receives its traffic. All callbacks for one peer run on that peer's task, in
//! frame order, and must not block.

use bytes::Bytes;

use crate::core::envelope::CallKind;
use crate::core::serialization::Payload;
use crate::error::{ProtocolError, Result};
use crate::protocol::peer::ChannelLink;

/// Why a channel stopped being open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote side sent `CloseChannel`
    RemoteClosed,
    /// A local `close_channel` call
    LocalClosed,
    /// The connection went away
    LinkLost,
    /// Renumbering collided with a channel already in use
    Collision,
}

/// Inbound data message delivered to a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub kind: CallKind,
    /// Correlation token to answer with; 0 for one-way messages
    pub token: u32,
    pub payload: Bytes,
}

impl Incoming {
    /// Whether the sender is waiting for a reply
    pub fn expects_reply(&self) -> bool {
        self.kind == CallKind::Request
    }

    /// Decode the payload as a bincode value
    pub fn decode<T: Payload>(&self) -> Result<T> {
        T::from_payload(&self.payload)
    }
}

pub trait Handler: Send + Sync + 'static {
    /// Exact service name used for lookups
    fn name(&self) -> &str;

    /// Service type used when no name is given
    fn service_type(&self) -> &str;

    /// The channel this handler is bound to reached the open state.
    fn on_link_up(&self, _link: &ChannelLink) {}

    /// A data message arrived on an open channel.
    fn on_message(&self, link: &ChannelLink, message: Incoming);

    /// The channel is no longer open.
    fn on_link_down(&self, _link: &ChannelLink, _reason: CloseReason) {}

    /// An open attempt through this handler failed.
    fn on_channel_error(&self, _error: &ProtocolError) {}
}
