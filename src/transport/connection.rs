//! Framed byte-stream connection.
//!
//! A [`Connection`] owns one socket (or any `AsyncRead + AsyncWrite` stream)
//! and runs two tasks once started:
//!
//! - the **writer** drains the send FIFO one frame at a time through a
//!   `FramedWrite<_, FrameCodec>`, in enqueue order;
//! - the **reader** pushes socket reads into a [`FrameAssembler`], decodes
//!   every complete frame in place and hands the result to the receive
//!   callback, in wire order.
//!
//! Any I/O error, EOF, framing violation or undecodable frame closes the
//! connection. Closing
//! cancels both tasks, discards whatever is still queued and runs the close
//! callback exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::config::LinkConfig;
use crate::core::codec::{FrameAssembler, FrameCodec, LENGTH_PREFIX_LEN};
use crate::core::stream::{BinaryStream, StreamMode};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::metrics::LinkMetrics;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Halves waiting for `start`
struct Pending {
    reader: BoxReader,
    writer: BoxWriter,
    queue: mpsc::UnboundedReceiver<Bytes>,
}

struct Inner {
    id: u64,
    peer: String,
    max_frame: usize,
    block_size: usize,
    mode: StreamMode,
    queue: mpsc::UnboundedSender<Bytes>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    on_close: Mutex<Option<CloseCallback>>,
    pending: Mutex<Option<Pending>>,
    metrics: Option<Arc<LinkMetrics>>,
}

impl Inner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        debug!(conn = self.id, peer = %self.peer, "Connection closed");

        let callback = self
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Cloneable handle to one framed connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Wrap a TCP stream; disables Nagle so small frames go out immediately.
    pub fn new(stream: TcpStream, config: &LinkConfig) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|addr: SocketAddr| addr.to_string())
            .unwrap_or_else(|_| String::from("unknown"));
        let (reader, writer) = stream.into_split();
        Ok(Self::from_parts(Box::new(reader), Box::new(writer), peer, config))
    }

    /// Wrap any duplex byte stream, e.g. `tokio::io::duplex` in tests.
    pub fn from_io<T>(io: T, peer: impl Into<String>, config: &LinkConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::from_parts(Box::new(reader), Box::new(writer), peer.into(), config)
    }

    fn from_parts(reader: BoxReader, writer: BoxWriter, peer: String, config: &LinkConfig) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer,
                max_frame: config.receive_buffer_size,
                block_size: config.block_size,
                mode: config.stream_mode,
                queue,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                on_close: Mutex::new(None),
                pending: Mutex::new(Some(Pending {
                    reader,
                    writer,
                    queue: rx,
                })),
                metrics: None,
            }),
        }
    }

    /// Count frames and bytes into `metrics`. Only effective before the
    /// connection is shared.
    pub fn with_metrics(mut self, metrics: Arc<LinkMetrics>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.metrics = Some(metrics);
        }
        self
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Remote address or label
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Largest frame accepted in either direction, length prefix included
    pub fn max_frame(&self) -> usize {
        self.inner.max_frame
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// Register the close callback. Runs immediately if already closed.
    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self
            .inner
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            drop(slot);
            callback();
        } else {
            *slot = Some(Box::new(callback));
        }
    }

    /// Queue a frame payload for writing.
    ///
    /// Frames are written in the order they are queued. Fails with `LinkGone`
    /// once closed, or `OversizedFrame` if the payload can never fit the
    /// peer's receive buffer.
    pub fn send(&self, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::LinkGone);
        }
        if payload.len() + LENGTH_PREFIX_LEN > self.inner.max_frame {
            return Err(ProtocolError::OversizedFrame {
                size: payload.len(),
                max: self.inner.max_frame.saturating_sub(LENGTH_PREFIX_LEN),
            });
        }
        self.inner
            .queue
            .send(payload)
            .map_err(|_| ProtocolError::LinkGone)
    }

    /// Start the reader and writer tasks; `handler` receives every frame payload.
    pub fn start<F>(&self, handler: F) -> Result<()>
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        self.start_decoding(|stream: &mut BinaryStream<'_>| stream.get_rest(), handler)
    }

    /// Start the reader and writer tasks, decoding each frame straight out of
    /// the receive buffer.
    ///
    /// `decode` sees a stream limited to one frame payload. A decode error is
    /// treated like a framing violation and closes the connection.
    pub fn start_decoding<T, D, F>(&self, decode: D, handler: F) -> Result<()>
    where
        T: Send + 'static,
        D: FnMut(&mut BinaryStream<'_>) -> Result<T> + Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ProtocolError::Custom(constants::ERR_ALREADY_STARTED.to_string()))?;

        tokio::spawn(write_loop(self.inner.clone(), pending.writer, pending.queue));
        tokio::spawn(read_loop(self.inner.clone(), pending.reader, decode, handler));
        Ok(())
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

#[instrument(skip_all, fields(conn = inner.id, peer = %inner.peer))]
async fn write_loop(inner: Arc<Inner>, writer: BoxWriter, mut queue: mpsc::UnboundedReceiver<Bytes>) {
    let mut framed = FramedWrite::new(writer, FrameCodec::new(inner.max_frame));

    loop {
        let payload = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(payload) => payload,
                None => break,
            },
        };

        let len = payload.len();
        let sent = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            sent = framed.send(payload) => sent,
        };
        match sent {
            Ok(()) => {
                trace!(bytes = len, "Frame written");
                if let Some(metrics) = &inner.metrics {
                    metrics.frame_sent(len);
                }
            }
            Err(e) => {
                debug!(error = %e, "Write failed");
                break;
            }
        }
    }

    let discarded = queue.len();
    if discarded > 0 {
        debug!(frames = discarded, "Discarding unsent frames");
    }
    let _ = framed.get_mut().shutdown().await;
    inner.close();
}

#[instrument(skip_all, fields(conn = inner.id, peer = %inner.peer))]
async fn read_loop<T, D, F>(inner: Arc<Inner>, mut reader: BoxReader, mut decode: D, mut handler: F)
where
    T: Send + 'static,
    D: FnMut(&mut BinaryStream<'_>) -> Result<T> + Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    let mut assembler = FrameAssembler::new(inner.max_frame, inner.block_size).with_mode(inner.mode);
    let mut chunk = vec![0u8; inner.block_size.max(LENGTH_PREFIX_LEN)];

    'read: loop {
        let read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            read = reader.read(&mut chunk) => read,
        };

        match read {
            Ok(0) => {
                debug!("Peer closed the stream");
                break;
            }
            Ok(n) => {
                assembler.push(&chunk[..n]);
                loop {
                    let mut frame_len = 0;
                    let decoded = assembler.decode_next(|stream| {
                        frame_len = stream.remaining();
                        decode(stream)
                    });
                    match decoded {
                        Ok(Some(message)) => {
                            trace!(bytes = frame_len, "Frame received");
                            if let Some(metrics) = &inner.metrics {
                                metrics.frame_received(frame_len);
                            }
                            handler(message);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Bad frame, closing link");
                            if let Some(metrics) = &inner.metrics {
                                metrics.protocol_error();
                            }
                            break 'read;
                        }
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "Read failed");
                break;
            }
        }
    }

    inner.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::encode_frame;
    use std::time::Duration;
    use tokio::io::duplex;

    fn config() -> LinkConfig {
        LinkConfig {
            receive_buffer_size: 64,
            block_size: 8,
            ..LinkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_frames_delivered_in_order() {
        let (local, mut remote) = duplex(256);
        let conn = Connection::from_io(local, "test", &config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.start(move |frame| {
            let _ = tx.send(frame);
        })
        .unwrap();

        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_frame(b"first").unwrap());
        wire.extend_from_slice(&encode_frame(b"second frame spans blocks").unwrap());
        remote.write_all(&wire).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().as_ref(), b"first");
        assert_eq!(rx.recv().await.unwrap().as_ref(), b"second frame spans blocks");
    }

    #[tokio::test]
    async fn test_send_writes_prefixed_frames() {
        let (local, mut remote) = duplex(256);
        let conn = Connection::from_io(local, "test", &config());
        conn.send(Bytes::from_static(b"ab")).unwrap();
        conn.send(Bytes::from_static(b"c")).unwrap();
        conn.start(|_| {}).unwrap();

        let mut out = [0u8; 11];
        remote.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, &[2, 0, 0, 0, b'a', b'b', 1, 0, 0, 0, b'c']);
    }

    #[tokio::test]
    async fn test_oversized_inbound_frame_closes() {
        let (local, mut remote) = duplex(256);
        let conn = Connection::from_io(local, "test", &config());
        let (tx, rx) = tokio::sync::oneshot::channel();
        conn.on_close(move || {
            let _ = tx.send(());
        });
        conn.start(|_| panic!("no frame expected")).unwrap();

        remote.write_all(&61u32.to_le_bytes()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send(Bytes::from_static(b"x")),
            Err(ProtocolError::LinkGone)
        ));
    }

    #[tokio::test]
    async fn test_oversized_outbound_rejected_locally() {
        let (local, _remote) = duplex(256);
        let conn = Connection::from_io(local, "test", &config());
        assert!(matches!(
            conn.send(Bytes::from(vec![0u8; 61])),
            Err(ProtocolError::OversizedFrame { size: 61, max: 60 })
        ));
        assert!(conn.send(Bytes::from(vec![0u8; 60])).is_ok());
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_eof_closes_once() {
        let (local, remote) = duplex(256);
        let conn = Connection::from_io(local, "test", &config());
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        conn.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        conn.start(|_| {}).unwrap();

        drop(remote);
        conn.closed().await;
        conn.close();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // late registration fires immediately
        let late = calls.clone();
        conn.on_close(move || {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_frames_decoded_in_place() {
        let (local, mut remote) = duplex(256);
        let conn = Connection::from_io(local, "test", &config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.start_decoding(
            |stream: &mut BinaryStream<'_>| {
                let tag = stream.get_u8()?;
                let value = stream.get_u16()?;
                Ok((tag, value))
            },
            move |decoded| {
                let _ = tx.send(decoded);
            },
        )
        .unwrap();

        // trailing bytes past the decoder are dropped with the frame
        let mut wire = encode_frame(&[1, 0x34, 0x12, 0xFF]).unwrap().to_vec();
        wire.extend_from_slice(&encode_frame(&[2, 7, 0]).unwrap());
        remote.write_all(&wire).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), (1, 0x1234));
        assert_eq!(rx.recv().await.unwrap(), (2, 7));
    }

    #[tokio::test]
    async fn test_undecodable_frame_closes() {
        let (local, mut remote) = duplex(256);
        let metrics = Arc::new(LinkMetrics::new());
        let conn = Connection::from_io(local, "test", &config()).with_metrics(metrics.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.start_decoding(
            |stream: &mut BinaryStream<'_>| stream.get_u32(),
            move |decoded| {
                let _ = tx.send(decoded);
            },
        )
        .unwrap();

        let mut wire = encode_frame(&[1, 0, 0, 0]).unwrap().to_vec();
        wire.extend_from_slice(&encode_frame(&[1, 2]).unwrap());
        wire.extend_from_slice(&encode_frame(&[2, 0, 0, 0]).unwrap());
        remote.write_all(&wire).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), 1);
        tokio::time::timeout(Duration::from_secs(1), conn.closed())
            .await
            .unwrap();
        assert!(rx.recv().await.is_none());
        assert_eq!(metrics.snapshot().protocol_errors, 1);
        assert_eq!(metrics.snapshot().frames_received, 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (local, _remote) = duplex(64);
        let conn = Connection::from_io(local, "test", &config());
        conn.start(|_| {}).unwrap();
        assert!(matches!(conn.start(|_| {}), Err(ProtocolError::Custom(_))));
    }
}
