//! # Remote Peer
//!
//! One [`RemotePeer`] task per connection owns the channel table and the
//! request tracker. Everything that touches them runs on that task:
//!
//! ```text
//!   Connection reader ─Inbound─▶ ┌──────────────┐
//!   Connection close ──LinkDown─▶│  RemotePeer  │──▶ Handler callbacks
//!   PeerHandle / ChannelLink ───▶│  event loop  │──▶ Connection::send
//!                     Command    └──────────────┘
//!                                  ▲  sweep timer
//! ```
//!
//! ## Channel negotiation
//! The opener takes the lowest free id and marks it `HalfOpen`. The receiver
//! binds a handler and answers with the id it actually used: the requested one
//! if free there, otherwise the next free id above it. The opener moves its
//! entry to that id; if the id is taken locally as well, both ids are reset
//! and a `CloseChannel` for it goes back to the receiver.
//!
//! An open the peer never answers fails with `LinkTimeout` once the link's
//! request timeout passes. If its acceptance turns up later anyway, the
//! channel the peer bound is closed again.
//!
//! ## Shutdown
//! When the link drops (or `close` is requested) every open channel's handler
//! gets `on_link_down`, pending opens fail with `LinkGone`, every tracked
//! request fails with `LinkGone`, and only then is the socket closed.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::LinkConfig;
use crate::core::envelope::{CallKind, DataMessage, Envelope, CONTROL_CHANNEL};
use crate::core::serialization::Payload;
use crate::core::stream::{BinaryStream, WireFormat};
use crate::error::{ChannelError, ProtocolError, Result};
use crate::protocol::channel::{ChannelState, ChannelTable, Released};
use crate::protocol::control::{ControlMessage, OpenResult};
use crate::protocol::handler::{CloseReason, Handler, Incoming};
use crate::protocol::registry::HandlerRegistry;
use crate::protocol::tracker::{ReplyCallback, RequestTracker};
use crate::transport::connection::Connection;
use crate::utils::metrics::LinkMetrics;

/// Input to the peer task
enum PeerEvent {
    Inbound(Inbound),
    Command(PeerCommand),
    LinkDown,
}

/// A frame payload, decoded on the connection's reader task
enum Inbound {
    Control(ControlMessage),
    Data { channel: u8, message: DataMessage },
}

impl Inbound {
    fn decode(stream: &mut BinaryStream<'_>) -> Result<Self> {
        let header = Envelope::decode_header(stream)?;
        if header.channel == CONTROL_CHANNEL {
            return ControlMessage::decode_body(stream).map(Inbound::Control);
        }
        let message = DataMessage::decode(stream)?;
        Ok(Inbound::Data {
            channel: header.channel,
            message,
        })
    }
}

enum PeerCommand {
    Open {
        service_name: Option<String>,
        service_type: Option<String>,
        handler: Arc<dyn Handler>,
        reply: oneshot::Sender<Result<u8>>,
    },
    CloseChannel {
        channel: u8,
    },
    Send {
        channel: u8,
        message: DataMessage,
    },
    SendTracked {
        channel: u8,
        payload: Bytes,
        timeout: Duration,
        callback: ReplyCallback,
    },
    State {
        channel: u8,
        reply: oneshot::Sender<ChannelState>,
    },
    Close,
}

impl PeerCommand {
    /// Deliver `LinkGone` to whoever is waiting on this command.
    fn abandon(self) {
        match self {
            PeerCommand::Open { reply, .. } => {
                let _ = reply.send(Err(ProtocolError::LinkGone));
            }
            PeerCommand::SendTracked { callback, .. } => callback(Err(ProtocolError::LinkGone)),
            _ => {}
        }
    }
}

/// Cloneable handle to a running peer.
///
/// Every method only queues work for the peer task, so handles can be used
/// from any task and from inside handler callbacks.
#[derive(Clone)]
pub struct PeerHandle {
    events: mpsc::UnboundedSender<PeerEvent>,
    closed: CancellationToken,
    peer: Arc<str>,
    request_timeout: Duration,
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerHandle {
    fn command(&self, command: PeerCommand) -> Result<()> {
        self.events
            .send(PeerEvent::Command(command))
            .map_err(|_| ProtocolError::LinkGone)
    }

    /// Remote address or label
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Default deadline used by [`ChannelLink::request`]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Open a channel to the first handler of `service_type` on the peer.
    pub async fn open_channel(&self, service_type: &str, handler: Arc<dyn Handler>) -> Result<u8> {
        self.open(None, Some(service_type.to_string()), handler).await
    }

    /// Open a channel to a handler by exact name, falling back to `service_type`.
    pub async fn open_named_channel(
        &self,
        service_name: &str,
        service_type: Option<&str>,
        handler: Arc<dyn Handler>,
    ) -> Result<u8> {
        self.open(
            Some(service_name.to_string()),
            service_type.map(str::to_string),
            handler,
        )
        .await
    }

    async fn open(
        &self,
        service_name: Option<String>,
        service_type: Option<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<u8> {
        let (reply, rx) = oneshot::channel();
        self.command(PeerCommand::Open {
            service_name,
            service_type,
            handler,
            reply,
        })?;
        rx.await.unwrap_or(Err(ProtocolError::LinkGone))
    }

    /// Close a channel locally and tell the peer.
    pub fn close_channel(&self, channel: u8) -> Result<()> {
        self.command(PeerCommand::CloseChannel { channel })
    }

    /// One-way message; dropped with a warning if the channel is not open.
    pub fn send(&self, channel: u8, payload: impl Into<Bytes>) -> Result<()> {
        self.command(PeerCommand::Send {
            channel,
            message: DataMessage::oneway(payload),
        })
    }

    /// One-way message carrying a bincode-encoded value
    pub fn send_message<T: Payload>(&self, channel: u8, value: &T) -> Result<()> {
        self.send(channel, value.to_payload()?)
    }

    /// Send a request and deliver its outcome to `callback`.
    ///
    /// `callback` runs exactly once: with the reply, with `RemoteError` for an
    /// error reply, with `LinkTimeout` after `timeout`, with `LinkGone` if the
    /// link drops first, or with `ChannelError::NotOpen` if the channel is not
    /// open. It runs on the peer task and must not block.
    pub fn send_tracked<F>(&self, channel: u8, payload: impl Into<Bytes>, timeout: Duration, callback: F)
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        let command = PeerCommand::SendTracked {
            channel,
            payload: payload.into(),
            timeout,
            callback: Box::new(callback),
        };
        if let Err(mpsc::error::SendError(PeerEvent::Command(command))) =
            self.events.send(PeerEvent::Command(command))
        {
            command.abandon();
        }
    }

    /// Send a request and wait for its reply.
    pub async fn request(&self, channel: u8, payload: impl Into<Bytes>, timeout: Duration) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.send_tracked(channel, payload, timeout, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or(Err(ProtocolError::LinkGone))
    }

    /// Answer the request that carried `token`.
    pub fn reply(&self, channel: u8, token: u32, payload: impl Into<Bytes>) -> Result<()> {
        self.command(PeerCommand::Send {
            channel,
            message: DataMessage::with_token(CallKind::Reply, token, payload),
        })
    }

    /// Answer the request that carried `token` with an error message.
    pub fn reply_error(&self, channel: u8, token: u32, message: &str) -> Result<()> {
        self.command(PeerCommand::Send {
            channel,
            message: DataMessage::with_token(
                CallKind::ErrorReply,
                token,
                Bytes::copy_from_slice(message.as_bytes()),
            ),
        })
    }

    /// Current state of `channel` in the local table
    pub async fn channel_state(&self, channel: u8) -> Result<ChannelState> {
        let (reply, rx) = oneshot::channel();
        self.command(PeerCommand::State { channel, reply })?;
        rx.await.map_err(|_| ProtocolError::LinkGone)
    }

    /// Tear the link down. Handlers are notified before the socket closes.
    pub fn close(&self) {
        let _ = self.command(PeerCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the peer has fully shut down.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// What a handler sees of its channel
#[derive(Clone, Debug)]
pub struct ChannelLink {
    peer: PeerHandle,
    channel: u8,
}

impl ChannelLink {
    pub fn new(peer: PeerHandle, channel: u8) -> Self {
        Self { peer, channel }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    pub fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.peer.send(self.channel, payload)
    }

    pub fn send_message<T: Payload>(&self, value: &T) -> Result<()> {
        self.peer.send_message(self.channel, value)
    }

    /// Tracked request with the peer's default timeout
    pub fn request<F>(&self, payload: impl Into<Bytes>, callback: F)
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        self.peer
            .send_tracked(self.channel, payload, self.peer.request_timeout(), callback)
    }

    pub fn reply(&self, token: u32, payload: impl Into<Bytes>) -> Result<()> {
        self.peer.reply(self.channel, token, payload)
    }

    pub fn reply_error(&self, token: u32, message: &str) -> Result<()> {
        self.peer.reply_error(self.channel, token, message)
    }

    pub fn close(&self) -> Result<()> {
        self.peer.close_channel(self.channel)
    }
}

/// The per-connection protocol engine
pub struct RemotePeer {
    handle: PeerHandle,
    connection: Connection,
    registry: HandlerRegistry,
    channels: ChannelTable,
    tracker: RequestTracker,
    metrics: Arc<LinkMetrics>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

impl RemotePeer {
    /// Start the receive loop on `connection` and spawn the peer task.
    pub fn spawn(
        connection: Connection,
        registry: HandlerRegistry,
        config: &LinkConfig,
        metrics: Arc<LinkMetrics>,
    ) -> Result<PeerHandle> {
        let (events, rx) = mpsc::unbounded_channel();
        let handle = PeerHandle {
            events: events.clone(),
            closed: CancellationToken::new(),
            peer: Arc::from(connection.peer()),
            request_timeout: config.request_timeout,
        };

        let link_down = events.clone();
        connection.on_close(move || {
            let _ = link_down.send(PeerEvent::LinkDown);
        });
        connection.start_decoding(Inbound::decode, move |inbound| {
            let _ = events.send(PeerEvent::Inbound(inbound));
        })?;

        metrics.link_up();
        let peer = RemotePeer {
            handle: handle.clone(),
            connection,
            registry,
            channels: ChannelTable::new(config.channel_table_size),
            tracker: RequestTracker::new(),
            metrics,
            events: rx,
        };
        tokio::spawn(peer.run());
        Ok(handle)
    }

    fn link(&self, channel: u8) -> ChannelLink {
        ChannelLink::new(self.handle.clone(), channel)
    }

    #[instrument(skip_all, fields(peer = %self.handle.peer))]
    async fn run(mut self) {
        info!("Peer link up");
        loop {
            let deadline = match (self.tracker.next_deadline(), self.channels.next_open_deadline()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let event = tokio::select! {
                event = self.events.recv() => event,
                _ = expiry(deadline) => {
                    self.expire(Instant::now());
                    continue;
                }
            };

            match event {
                Some(PeerEvent::Inbound(inbound)) => {
                    if let Err(e) = self.on_inbound(inbound) {
                        if e.is_fatal() {
                            warn!(error = %e, "Protocol violation, closing link");
                            self.metrics.protocol_error();
                            break;
                        }
                        debug!(error = %e, "Frame rejected");
                    }
                }
                Some(PeerEvent::Command(PeerCommand::Close)) => {
                    debug!("Close requested");
                    break;
                }
                Some(PeerEvent::Command(command)) => self.on_command(command),
                Some(PeerEvent::LinkDown) | None => break,
            }
        }
        self.shutdown();
    }

    /// Time out overdue requests and opens.
    fn expire(&mut self, now: Instant) {
        let expired = self.tracker.sweep(now);
        if expired > 0 {
            self.metrics.requests_timed_out(expired);
        }
        for released in self.channels.expire_opens(now) {
            warn!(channel = released.id, "Channel open timed out");
            self.fail_open(released, ProtocolError::LinkTimeout);
        }
    }

    fn on_inbound(&mut self, inbound: Inbound) -> Result<()> {
        match inbound {
            Inbound::Control(message) => {
                trace!(message = message.name(), "Control message");
                self.on_control(message)
            }
            Inbound::Data { channel, message } => {
                self.on_data(channel, message);
                Ok(())
            }
        }
    }

    fn send_control(&self, message: &ControlMessage) -> Result<()> {
        self.connection.send(message.to_payload()?)
    }

    fn on_control(&mut self, message: ControlMessage) -> Result<()> {
        match message {
            ControlMessage::OpenChannel {
                id,
                service_name,
                service_type,
            } => self.on_open_request(id, service_name.as_deref(), service_type.as_deref()),
            ControlMessage::OpenChannelResponse {
                result,
                requested_id,
                actual_id,
            } => {
                self.on_open_response(result, requested_id, actual_id);
                Ok(())
            }
            ControlMessage::CloseChannel { id } => {
                self.on_remote_close(id);
                Ok(())
            }
        }
    }

    fn on_open_request(
        &mut self,
        requested: u8,
        service_name: Option<&str>,
        service_type: Option<&str>,
    ) -> Result<()> {
        let Some(handler) = self.registry.resolve(service_name, service_type) else {
            warn!(
                channel = requested,
                service_name, service_type, "No handler for open request"
            );
            self.metrics.channel_rejected();
            return self.send_control(&ControlMessage::rejected(requested));
        };

        if !self.channels.is_valid(requested) {
            warn!(channel = requested, "Open request for invalid channel id");
            self.metrics.channel_rejected();
            return self.send_control(&ControlMessage::rejected(requested));
        }

        let actual = if self.channels.state(requested) == ChannelState::Empty {
            Some(requested)
        } else {
            self.channels.next_free_after(requested)
        };
        let Some(actual) = actual else {
            warn!(channel = requested, "Channel table full, rejecting open");
            self.metrics.channel_rejected();
            return self.send_control(&ControlMessage::rejected(requested));
        };

        self.channels.bind(actual, handler.clone())?;
        if actual != requested {
            debug!(requested, actual, "Renumbered inbound channel");
        }
        self.send_control(&ControlMessage::accepted(requested, actual))?;

        self.metrics.channel_opened();
        info!(channel = actual, handler = handler.name(), "Channel opened by peer");
        handler.on_link_up(&self.link(actual));
        Ok(())
    }

    /// Report a failed local open to its handler, then to its waiter.
    fn fail_open(&self, released: Released, error: ProtocolError) {
        if let Some(handler) = &released.handler {
            handler.on_channel_error(&error);
        }
        if let Some(waiter) = released.waiter {
            let _ = waiter.send(Err(error));
        }
    }

    fn on_open_response(&mut self, result: OpenResult, requested: u8, actual: u8) {
        if self.channels.state(requested) != ChannelState::HalfOpen {
            warn!(channel = requested, "Open response for a channel that is not half-open");
            // the peer bound a channel nobody here is waiting for
            if result == OpenResult::Ok
                && self.channels.is_valid(actual)
                && self.channels.state(actual) == ChannelState::Empty
            {
                if let Err(e) = self.send_control(&ControlMessage::CloseChannel { id: actual }) {
                    debug!(channel = actual, error = %e, "Could not close unwanted channel");
                }
            }
            return;
        }

        if result != OpenResult::Ok {
            info!(channel = requested, "Peer rejected channel open");
            self.metrics.channel_rejected();
            if let Some(released) = self.channels.reset(requested) {
                self.fail_open(released, ChannelError::Rejected { requested }.into());
            }
            return;
        }

        let channel = if actual == requested {
            requested
        } else {
            match self.channels.relocate(requested, actual) {
                Ok(()) => {
                    debug!(requested, actual, "Peer renumbered channel");
                    actual
                }
                Err(error @ ChannelError::Collision { .. }) => {
                    warn!(requested, actual, "Renumbered channel collides, closing it");
                    self.release(actual, CloseReason::Collision);
                    if let Err(e) = self.send_control(&ControlMessage::CloseChannel { id: actual }) {
                        debug!(error = %e, "Could not send close for collided channel");
                    }
                    self.metrics.channel_rejected();
                    if let Some(released) = self.channels.reset(requested) {
                        self.fail_open(released, error.into());
                    }
                    return;
                }
                Err(error) => {
                    warn!(requested, actual, %error, "Peer answered with an unusable channel id");
                    self.metrics.channel_rejected();
                    if let Some(released) = self.channels.reset(requested) {
                        self.fail_open(released, error.into());
                    }
                    return;
                }
            }
        };

        match self.channels.confirm(channel) {
            Ok(waiter) => {
                self.metrics.channel_opened();
                info!(channel, "Channel open");
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(channel));
                }
                if let Some(handler) = self.channels.open_handler(channel) {
                    handler.on_link_up(&self.link(channel));
                }
            }
            Err(error) => warn!(channel, %error, "Could not confirm channel"),
        }
    }

    /// Reset `channel`, telling whoever held it why.
    fn release(&mut self, channel: u8, reason: CloseReason) -> bool {
        let Some(released) = self.channels.reset(channel) else {
            return false;
        };
        match released.state {
            ChannelState::Empty => false,
            ChannelState::Open => {
                if let Some(handler) = &released.handler {
                    handler.on_link_down(&self.link(channel), reason);
                }
                true
            }
            ChannelState::HalfOpen => {
                let error = match reason {
                    CloseReason::LinkLost => ProtocolError::LinkGone,
                    _ => ProtocolError::Channel(ChannelError::NotOpen(channel)),
                };
                if let Some(handler) = &released.handler {
                    handler.on_channel_error(&error);
                }
                if let Some(waiter) = released.waiter {
                    let _ = waiter.send(Err(error));
                }
                true
            }
        }
    }

    fn on_remote_close(&mut self, channel: u8) {
        if self.release(channel, CloseReason::RemoteClosed) {
            info!(channel, "Channel closed by peer");
        } else {
            warn!(channel, "Close for a channel that is not in use, ignoring");
        }
    }

    fn on_data(&mut self, channel: u8, message: DataMessage) {
        let Some(handler) = self.channels.open_handler(channel) else {
            warn!(
                channel,
                bytes = message.payload.len(),
                "Dropping message for channel that is not open"
            );
            self.metrics.message_dropped();
            return;
        };

        match message.kind {
            CallKind::Oneway | CallKind::Request => {
                let incoming = Incoming {
                    kind: message.kind,
                    token: message.token,
                    payload: message.payload,
                };
                handler.on_message(&self.link(channel), incoming);
            }
            CallKind::Reply => {
                if !self.tracker.resolve(message.token, channel, Ok(message.payload)) {
                    debug!(channel, token = message.token, "Discarding late or unknown reply");
                }
            }
            CallKind::ErrorReply => {
                let text = String::from_utf8_lossy(&message.payload).into_owned();
                if !self
                    .tracker
                    .resolve(message.token, channel, Err(ProtocolError::RemoteError(text)))
                {
                    debug!(channel, token = message.token, "Discarding late or unknown error reply");
                }
            }
        }
    }

    fn on_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::Open {
                service_name,
                service_type,
                handler,
                reply,
            } => {
                let Some(id) = self.channels.allocate() else {
                    warn!("Channel table full, open not sent");
                    let error = ProtocolError::Channel(ChannelError::TableFull);
                    handler.on_channel_error(&error);
                    let _ = reply.send(Err(error));
                    return;
                };
                let message = ControlMessage::OpenChannel {
                    id,
                    service_name,
                    service_type,
                };
                let deadline = Instant::now() + self.handle.request_timeout;
                if let Err(error) = self.channels.begin_open(id, handler, Some(reply), deadline) {
                    warn!(channel = id, %error, "Could not begin open");
                    return;
                }
                debug!(channel = id, "Opening channel");
                if let Err(e) = self.send_control(&message) {
                    warn!(channel = id, error = %e, "Could not send open");
                    if let Some(released) = self.channels.reset(id) {
                        self.fail_open(released, e);
                    }
                }
            }
            PeerCommand::CloseChannel { channel } => {
                if self.release(channel, CloseReason::LocalClosed) {
                    info!(channel, "Channel closed");
                    if let Err(e) = self.send_control(&ControlMessage::CloseChannel { id: channel }) {
                        debug!(channel, error = %e, "Could not send close");
                    }
                } else {
                    warn!(channel, "Close for a channel that is not in use, ignoring");
                }
            }
            PeerCommand::Send { channel, message } => {
                if self.channels.state(channel) != ChannelState::Open {
                    warn!(channel, "Not sending on a channel that is not open");
                    self.metrics.message_dropped();
                    return;
                }
                let sent = message
                    .to_payload(channel)
                    .and_then(|payload| self.connection.send(payload));
                if let Err(e) = sent {
                    warn!(channel, error = %e, "Send failed");
                }
            }
            PeerCommand::SendTracked {
                channel,
                payload,
                timeout,
                callback,
            } => self.send_tracked(channel, payload, timeout, callback),
            PeerCommand::State { channel, reply } => {
                let _ = reply.send(self.channels.state(channel));
            }
            PeerCommand::Close => {}
        }
    }

    fn send_tracked(&mut self, channel: u8, payload: Bytes, timeout: Duration, callback: ReplyCallback) {
        if self.channels.state(channel) != ChannelState::Open {
            callback(Err(ProtocolError::Channel(ChannelError::NotOpen(channel))));
            return;
        }

        let token = self.tracker.next_token();
        let sent = DataMessage::with_token(CallKind::Request, token, payload)
            .to_payload(channel)
            .and_then(|frame| self.connection.send(frame));
        match sent {
            Ok(()) => {
                self.tracker.register(token, channel, timeout, callback);
                self.metrics.request_tracked();
            }
            Err(e) => callback(Err(e)),
        }
    }

    fn shutdown(mut self) {
        for channel in self.channels.active_ids() {
            self.release(channel, CloseReason::LinkLost);
        }
        let failed = self.tracker.fail_all();
        self.connection.close();

        self.events.close();
        while let Ok(event) = self.events.try_recv() {
            if let PeerEvent::Command(command) = event {
                command.abandon();
            }
        }

        self.metrics.link_down();
        self.handle.closed.cancel();
        info!(failed_requests = failed, "Peer link down");
    }
}
