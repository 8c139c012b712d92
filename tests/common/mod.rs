//! Shared helpers for link integration tests

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use peer_link::config::LinkConfig;
use peer_link::core::codec::FrameCodec;
use peer_link::core::envelope::{DataMessage, Envelope};
use peer_link::protocol::control::ControlMessage;
use peer_link::protocol::handler::{CloseReason, Handler, Incoming};
use peer_link::protocol::peer::{ChannelLink, PeerHandle, RemotePeer};
use peer_link::protocol::registry::HandlerRegistry;
use peer_link::transport::connection::Connection;
use peer_link::utils::metrics::LinkMetrics;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// What a [`Recorder`] saw
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Up(u8),
    Message(u8, Incoming),
    Down(u8, CloseReason),
    Error(String),
}

/// Handler that reports every callback and optionally echoes requests
pub struct Recorder {
    name: &'static str,
    service_type: &'static str,
    echo: bool,
    events: mpsc::UnboundedSender<Event>,
}

pub fn recorder(
    name: &'static str,
    service_type: &'static str,
    echo: bool,
) -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
    let (events, rx) = mpsc::unbounded_channel();
    (
        Arc::new(Recorder {
            name,
            service_type,
            echo,
            events,
        }),
        rx,
    )
}

impl Handler for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn service_type(&self) -> &str {
        self.service_type
    }

    fn on_link_up(&self, link: &ChannelLink) {
        let _ = self.events.send(Event::Up(link.channel()));
    }

    fn on_message(&self, link: &ChannelLink, message: Incoming) {
        if self.echo && message.expects_reply() {
            link.reply(message.token, message.payload.clone()).unwrap();
        }
        let _ = self.events.send(Event::Message(link.channel(), message));
    }

    fn on_link_down(&self, link: &ChannelLink, reason: CloseReason) {
        let _ = self.events.send(Event::Down(link.channel(), reason));
    }

    fn on_channel_error(&self, error: &peer_link::ProtocolError) {
        let _ = self.events.send(Event::Error(error.to_string()));
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event in time")
        .expect("recorder alive")
}

/// Scripted remote end of an in-memory link
pub struct FakePeer {
    framed: Framed<DuplexStream, FrameCodec>,
}

impl FakePeer {
    pub async fn send_payload(&mut self, payload: Bytes) {
        self.framed.send(payload).await.unwrap();
    }

    pub async fn send_control(&mut self, message: ControlMessage) {
        self.send_payload(message.to_payload().unwrap()).await;
    }

    pub async fn send_data(&mut self, channel: u8, message: DataMessage) {
        self.send_payload(message.to_payload(channel).unwrap()).await;
    }

    pub async fn recv(&mut self) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("valid frame");
        Envelope::from_payload(&frame).unwrap()
    }

    pub async fn recv_control(&mut self) -> ControlMessage {
        let envelope = self.recv().await;
        assert!(envelope.is_control(), "expected control, got {envelope:?}");
        ControlMessage::from_body(&envelope.body).unwrap()
    }

    pub async fn recv_data(&mut self) -> (u8, DataMessage) {
        let envelope = self.recv().await;
        assert!(!envelope.is_control(), "expected data, got {envelope:?}");
        (envelope.channel, DataMessage::from_body(&envelope.body).unwrap())
    }

    /// Whether the other side has closed the stream
    pub async fn is_eof(&mut self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(5), self.framed.next()).await,
            Ok(None) | Ok(Some(Err(_)))
        )
    }
}

/// A running peer wired to a [`FakePeer`]
pub fn spawn_peer(registry: HandlerRegistry) -> (PeerHandle, FakePeer, Arc<LinkMetrics>) {
    spawn_peer_with(registry, LinkConfig::default())
}

pub fn spawn_peer_with(
    registry: HandlerRegistry,
    config: LinkConfig,
) -> (PeerHandle, FakePeer, Arc<LinkMetrics>) {
    let (local, remote) = duplex(256 * 1024);
    let metrics = Arc::new(LinkMetrics::new());
    let connection = Connection::from_io(local, "fake-peer", &config).with_metrics(metrics.clone());
    let handle = RemotePeer::spawn(connection, registry, &config, metrics.clone()).unwrap();
    let fake = FakePeer {
        framed: Framed::new(remote, FrameCodec::new(config.receive_buffer_size)),
    };
    (handle, fake, metrics)
}
