//! TCP endpoints.
//!
//! [`Server`] accepts sockets and runs one [`RemotePeer`] per connection;
//! [`connect`] dials out and returns the peer handle for the new link.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ClientConfig, LinkConfig, ServerConfig};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::peer::{PeerHandle, RemotePeer};
use crate::protocol::registry::HandlerRegistry;
use crate::transport::connection::Connection;
use crate::utils::metrics::LinkMetrics;
use crate::utils::timeout::with_timeout;

/// Listening endpoint
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    link: LinkConfig,
    registry: HandlerRegistry,
    metrics: Arc<LinkMetrics>,
}

impl Server {
    /// Bind to `config.address`; port 0 picks an ephemeral port.
    #[instrument(skip_all, fields(address = %config.address))]
    pub async fn bind(config: &ServerConfig, link: LinkConfig, registry: HandlerRegistry) -> Result<Self> {
        let listener = TcpListener::bind(&config.address).await?;
        info!(address = %listener.local_addr()?, "Listening");
        Ok(Self {
            listener,
            config: config.clone(),
            link,
            registry,
            metrics: Arc::new(LinkMetrics::new()),
        })
    }

    /// Share an existing metrics instance instead of a fresh one.
    pub fn with_metrics(mut self, metrics: Arc<LinkMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn metrics(&self) -> Arc<LinkMetrics> {
        self.metrics.clone()
    }

    /// Run until CTRL+C.
    pub async fn run_until_ctrl_c(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                let _ = shutdown_tx.send(()).await;
            }
        });
        self.run(shutdown_rx).await
    }

    /// Accept links until `shutdown_rx` fires, then close every live peer and
    /// wait up to `shutdown_timeout` for them to finish.
    #[instrument(skip_all)]
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let mut peers: Vec<PeerHandle> = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(links = peers.len(), "Shutting down server. Closing links...");
                    for peer in &peers {
                        peer.close();
                    }
                    let drained = futures::future::join_all(peers.iter().map(|p| p.closed()));
                    if tokio::time::timeout(self.config.shutdown_timeout, drained).await.is_err() {
                        warn!("Shutdown timeout reached, forcing exit");
                    } else {
                        info!("All links closed, shutting down");
                    }
                    self.metrics.log_metrics();
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                            continue;
                        }
                    };

                    peers.retain(|p| !p.is_closed());
                    if peers.len() >= self.config.max_connections {
                        warn!(%addr, limit = self.config.max_connections, "Connection limit reached, dropping link");
                        continue;
                    }

                    match self.accept_link(stream) {
                        Ok(peer) => {
                            debug!(%addr, links = peers.len() + 1, "Link accepted");
                            peers.push(peer);
                        }
                        Err(e) => warn!(%addr, error = %e, "Failed to set up link"),
                    }
                }
            }
        }
    }

    fn accept_link(&self, stream: TcpStream) -> Result<PeerHandle> {
        let connection = Connection::new(stream, &self.link)?.with_metrics(self.metrics.clone());
        RemotePeer::spawn(connection, self.registry.clone(), &self.link, self.metrics.clone())
    }
}

/// Dial `config.address` and start a peer on the new link.
pub async fn connect(config: &ClientConfig, link: &LinkConfig, registry: HandlerRegistry) -> Result<PeerHandle> {
    connect_with_metrics(config, link, registry, Arc::new(LinkMetrics::new())).await
}

#[instrument(skip_all, fields(address = %config.address))]
pub async fn connect_with_metrics(
    config: &ClientConfig,
    link: &LinkConfig,
    registry: HandlerRegistry,
    metrics: Arc<LinkMetrics>,
) -> Result<PeerHandle> {
    let dial = async { TcpStream::connect(&config.address).await.map_err(ProtocolError::from) };
    let stream = match with_timeout(config.connect_timeout, dial).await {
        Ok(stream) => stream,
        Err(ProtocolError::LinkTimeout) => {
            warn!(timeout = ?config.connect_timeout, "{}", constants::ERR_CONNECT_TIMEOUT);
            return Err(ProtocolError::LinkTimeout);
        }
        Err(e) => return Err(e),
    };

    let connection = Connection::new(stream, link)?.with_metrics(metrics.clone());
    info!(peer = connection.peer(), "Connected");
    RemotePeer::spawn(connection, registry, link, metrics)
}
