//! End-to-end tests over loopback TCP

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::time::Duration;

use common::{next_event, recorder, Event};
use peer_link::config::{ClientConfig, LinkConfig, ServerConfig};
use peer_link::protocol::channel::ChannelState;
use peer_link::protocol::handler::CloseReason;
use peer_link::protocol::registry::HandlerRegistry;
use peer_link::transport::tcp::{self, Server};
use peer_link::{ChannelError, ProtocolError};
use tokio::sync::mpsc;

struct Running {
    client: ClientConfig,
    shutdown: mpsc::Sender<()>,
    server: tokio::task::JoinHandle<peer_link::Result<()>>,
    metrics: std::sync::Arc<peer_link::utils::LinkMetrics>,
}

async fn start_server(registry: HandlerRegistry, max_connections: usize) -> Running {
    let config = ServerConfig {
        address: "127.0.0.1:0".to_string(),
        max_connections,
        shutdown_timeout: Duration::from_secs(2),
    };
    let server = Server::bind(&config, LinkConfig::default(), registry)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let metrics = server.metrics();
    let (shutdown, shutdown_rx) = mpsc::channel(1);
    let server = tokio::spawn(server.run(shutdown_rx));
    Running {
        client: ClientConfig {
            address: addr.to_string(),
            connect_timeout: Duration::from_secs(2),
        },
        shutdown,
        server,
        metrics,
    }
}

#[tokio::test]
async fn test_echo_over_tcp() {
    let registry = HandlerRegistry::new();
    let (echo, mut server_events) = recorder("echo", "Echo", true);
    registry.register(echo).unwrap();
    let running = start_server(registry, 16).await;

    let link = LinkConfig::default();
    let peer = tcp::connect(&running.client, &link, HandlerRegistry::new())
        .await
        .unwrap();
    let (client_handler, mut client_events) = recorder("echo-client", "Echo", false);
    let channel = peer.open_channel("Echo", client_handler).await.unwrap();
    assert_eq!(channel, 1);
    assert_eq!(next_event(&mut client_events).await, Event::Up(1));
    assert_eq!(next_event(&mut server_events).await, Event::Up(1));

    let reply = peer
        .request(channel, &b"ping"[..], Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), b"ping");

    running.shutdown.send(()).await.unwrap();
    running.server.await.unwrap().unwrap();
    peer.closed().await;
    assert_eq!(
        next_event(&mut client_events).await,
        Event::Down(1, CloseReason::LinkLost)
    );
    assert_eq!(running.metrics.snapshot().links_active, 0);
}

#[tokio::test]
async fn test_open_for_unregistered_service_rejected() {
    let running = start_server(HandlerRegistry::new(), 16).await;
    let peer = tcp::connect(&running.client, &LinkConfig::default(), HandlerRegistry::new())
        .await
        .unwrap();

    let (handler, mut events) = recorder("account-client", "Account", false);
    let err = peer.open_channel("Account", handler).await.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Channel(ChannelError::Rejected { requested: 1 })
    ));
    assert!(matches!(next_event(&mut events).await, Event::Error(_)));
    assert_eq!(peer.channel_state(1).await.unwrap(), ChannelState::Empty);
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn test_both_sides_open_channels() {
    let server_registry = HandlerRegistry::new();
    let (realm, _realm_events) = recorder("realm", "Realm", true);
    server_registry.register(realm).unwrap();
    let running = start_server(server_registry, 16).await;

    let client_registry = HandlerRegistry::new();
    let peer = tcp::connect(&running.client, &LinkConfig::default(), client_registry)
        .await
        .unwrap();

    let (a, _a_events) = recorder("a", "Realm", false);
    let (b, _b_events) = recorder("b", "Realm", false);
    let first = peer.open_channel("Realm", a).await.unwrap();
    let second = peer.open_channel("Realm", b).await.unwrap();
    assert_eq!((first, second), (1, 2));

    peer.close_channel(first).unwrap();
    let (c, _c_events) = recorder("c", "Realm", false);
    assert_eq!(peer.open_channel("Realm", c).await.unwrap(), 1);

    let reply = peer
        .request(second, &b"still here"[..], Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply.as_ref(), b"still here");
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = ClientConfig {
        address: addr.to_string(),
        connect_timeout: Duration::from_secs(2),
    };
    let result = tcp::connect(&client, &LinkConfig::default(), HandlerRegistry::new()).await;
    assert!(matches!(result, Err(ProtocolError::Io(_))));
}

#[tokio::test]
async fn test_connection_limit() {
    let running = start_server(HandlerRegistry::new(), 1).await;
    let link = LinkConfig::default();

    let first = tcp::connect(&running.client, &link, HandlerRegistry::new())
        .await
        .unwrap();
    // make sure the server has registered the first link
    let (h, _e) = recorder("x", "Nothing", false);
    assert!(first.open_channel("Nothing", h).await.is_err());

    let second = tcp::connect(&running.client, &link, HandlerRegistry::new())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), second.closed())
        .await
        .expect("second link dropped by server");
    assert!(!first.is_closed());
}
