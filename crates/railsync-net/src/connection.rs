//! One TCP connection: a fill loop, a decode loop and a locked write path.
//!
//! The fill loop copies socket bytes into a channel, the decode loop feeds them
//! through a [`FrameDecoder`] and surfaces decoded messages as
//! [`ConnectionEvent`]s. Both loops and the writer share one cancellation
//! signal; whichever ends first takes the others down with it. Every exit path
//! runs the same shutdown sequence: the state turns
//! [`ConnectionState::Disconnected`], the owner receives
//! [`ConnectionEvent::Closed`], and the socket halves are released.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, watch};

use crate::codec::WireMessage;
use crate::framing::{FrameConfig, FrameDecoder, FrameError, write_frame};
use crate::listener::ConnectionId;
use crate::platform::{SocketConfig, configure_stream};

/// Chunks buffered between the fill loop and the decode loop.
const FILL_QUEUE_DEPTH: usize = 64;

/// Whether a connection can still carry frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Closed locally or by the peer. Final.
    Disconnected,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the stream.
    PeerClosed,
    /// A socket error (reset, keepalive timeout, ...).
    Io(std::io::ErrorKind),
    /// Closed locally.
    Cancelled,
}

/// Everything a connection reports to its owner.
#[derive(Debug)]
pub enum ConnectionEvent<M> {
    /// The connection is up; sent before any message from it.
    Opened {
        /// Connection identifier.
        id: ConnectionId,
        /// Remote address.
        peer: SocketAddr,
    },
    /// A decoded message, in receipt order.
    Message {
        /// Connection identifier.
        id: ConnectionId,
        /// The decoded message.
        message: M,
    },
    /// The connection is gone; sent exactly once.
    Closed {
        /// Connection identifier.
        id: ConnectionId,
        /// Why it ended.
        reason: CloseReason,
    },
}

enum Fill {
    Bytes(Vec<u8>),
    Failed(std::io::Error),
}

enum Outbound {
    Frame(Arc<[u8]>),
    Close,
}

/// Handle to a live connection.
///
/// Cloned freely behind an [`Arc`]; dropping handles does not close the
/// socket, [`Connection::close`] does.
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    /// Serialises writes so concurrent senders never interleave partial frames.
    writer: Mutex<OwnedWriteHalf>,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl Connection {
    /// Connect to `addr` and start the connection loops.
    pub async fn connect<M: WireMessage>(
        id: ConnectionId,
        addr: SocketAddr,
        socket: &SocketConfig,
        frame: &FrameConfig,
        events: mpsc::Sender<ConnectionEvent<M>>,
    ) -> std::io::Result<Arc<Self>> {
        let stream = TcpStream::connect(addr).await?;
        configure_stream(&stream, socket)?;
        Self::spawn(id, stream, frame, events)
    }

    /// Take ownership of an established stream and start the connection loops.
    pub fn spawn<M: WireMessage>(
        id: ConnectionId,
        stream: TcpStream,
        frame: &FrameConfig,
        events: mpsc::Sender<ConnectionEvent<M>>,
    ) -> std::io::Result<Arc<Self>> {
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let conn = Arc::new(Self {
            id,
            peer,
            writer: Mutex::new(writer),
            outbound: outbound_tx,
            state: watch::Sender::new(ConnectionState::Connected),
            shutdown_tx,
        });

        let (fill_tx, fill_rx) = mpsc::channel(FILL_QUEUE_DEPTH);
        tokio::spawn(Self::fill_loop(reader, fill_tx, shutdown_rx.clone()));
        tokio::spawn(Self::decode_loop(
            Arc::clone(&conn),
            fill_rx,
            FrameDecoder::new(frame),
            events,
            shutdown_rx.clone(),
        ));
        tokio::spawn(Self::write_loop(Arc::clone(&conn), outbound_rx, shutdown_rx));

        tracing::debug!(id = id.0, %peer, "connection started");
        Ok(conn)
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Follow the state, e.g. to wait for the link to drop.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    /// Encode and write one message, waiting for the write to finish.
    pub async fn send<M: WireMessage>(&self, message: &M) -> Result<(), FrameError> {
        let frame = message
            .to_frame()
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        self.send_encoded(&frame.encode()).await
    }

    /// Write one encoded frame under the connection's write lock.
    pub async fn send_encoded(&self, encoded: &[u8]) -> Result<(), FrameError> {
        if !self.is_connected() {
            return Err(FrameError::Io(std::io::ErrorKind::NotConnected.into()));
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = write_frame(&mut *writer, encoded).await {
            drop(writer);
            tracing::warn!(id = self.id.0, error = %e, "write failed, closing connection");
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// Queue an encoded frame without waiting. Frames queued on one
    /// connection are written in order.
    pub fn enqueue(&self, encoded: Arc<[u8]>) -> bool {
        self.is_connected() && self.outbound.send(Outbound::Frame(encoded)).is_ok()
    }

    /// Close after every frame queued so far has been written.
    pub fn close_after_flush(&self) {
        if self.outbound.send(Outbound::Close).is_err() {
            self.close();
        }
    }

    /// Cancel all loops and release the socket.
    pub fn close(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
        let _ = self.shutdown_tx.send(true);
    }

    async fn fill_loop(
        mut reader: OwnedReadHalf,
        fill: mpsc::Sender<Fill>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                result = reader.read(&mut buf) => {
                    let item = match result {
                        Ok(0) => break,
                        Ok(n) => Fill::Bytes(buf[..n].to_vec()),
                        Err(e) => Fill::Failed(e),
                    };
                    let failed = matches!(item, Fill::Failed(_));
                    if fill.send(item).await.is_err() || failed {
                        break;
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }

    async fn decode_loop<M: WireMessage>(
        conn: Arc<Self>,
        mut fill: mpsc::Receiver<Fill>,
        mut decoder: FrameDecoder,
        events: mpsc::Sender<ConnectionEvent<M>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let id = conn.id;
        if events
            .send(ConnectionEvent::Opened {
                id,
                peer: conn.peer,
            })
            .await
            .is_err()
        {
            conn.close();
            return;
        }

        let reason = loop {
            tokio::select! {
                item = fill.recv() => match item {
                    Some(Fill::Bytes(bytes)) => {
                        decoder.push(&bytes);
                        if !Self::drain(id, &mut decoder, &events).await {
                            break CloseReason::Cancelled;
                        }
                    }
                    Some(Fill::Failed(e)) => {
                        tracing::warn!(id = id.0, error = %e, "socket read failed");
                        break CloseReason::Io(e.kind());
                    }
                    None => {
                        // Stream closed: whatever is left is the final message.
                        if let Some(frame) = decoder.finish() {
                            match M::from_frame(&frame) {
                                Ok(message) => {
                                    let _ = events.send(ConnectionEvent::Message { id, message }).await;
                                }
                                Err(e) => tracing::warn!(id = id.0, error = %e, "dropping truncated message"),
                            }
                        }
                        break CloseReason::PeerClosed;
                    }
                },
                _ = shutdown_rx.changed() => break CloseReason::Cancelled,
            }
        };

        conn.close();
        tracing::info!(id = id.0, peer = %conn.peer, ?reason, "connection closed");
        let _ = events.send(ConnectionEvent::Closed { id, reason }).await;
    }

    /// Hand every complete frame to the owner. Returns `false` once the
    /// owner stopped listening.
    async fn drain<M: WireMessage>(
        id: ConnectionId,
        decoder: &mut FrameDecoder,
        events: &mpsc::Sender<ConnectionEvent<M>>,
    ) -> bool {
        while let Some(result) = decoder.next_frame() {
            match result {
                Ok(frame) => match M::from_frame(&frame) {
                    Ok(message) => {
                        if events
                            .send(ConnectionEvent::Message { id, message })
                            .await
                            .is_err()
                        {
                            return false;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(id = id.0, kind = %frame.kind, error = %e, "dropping undecodable message");
                    }
                },
                Err(e) => tracing::warn!(id = id.0, error = %e, "skipping malformed frame"),
            }
        }
        decoder.compact();
        true
    }

    async fn write_loop(
        conn: Arc<Self>,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                item = outbound.recv() => match item {
                    Some(Outbound::Frame(encoded)) => {
                        if conn.send_encoded(&encoded).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => break,
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        conn.close();
        let _ = conn.writer.lock().await.shutdown().await;
    }
}
