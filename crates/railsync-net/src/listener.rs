//! Dispatcher accept loop and the map of live peer links.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc, watch};

use crate::codec::WireMessage;
use crate::connection::{Connection, ConnectionEvent};
use crate::framing::FrameConfig;
use crate::platform::{SocketConfig, bind_address, configure_stream, create_listener};

/// Process-unique id of one peer link. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Returned by [`ConnectionMap::insert`] when every slot is taken.
#[derive(Debug, thiserror::Error)]
#[error("all {0} player slots are in use")]
pub struct ConnectionLimitReached(pub usize);

/// Live peer links of a dispatcher (or the single link of a client), shared
/// between the accept loop and the session driver.
pub struct ConnectionMap {
    links: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl ConnectionMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Hand out a fresh id, starting at 1.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn insert(&self, conn: Arc<Connection>) -> Result<(), ConnectionLimitReached> {
        let mut links = self.links.write().await;
        if links.len() >= self.capacity {
            return Err(ConnectionLimitReached(self.capacity));
        }
        links.insert(conn.id(), conn);
        Ok(())
    }

    pub async fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.links.write().await.remove(id)
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.links.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.links.read().await.is_empty()
    }

    /// Queue an encoded frame for one peer. `false` if the peer is gone or
    /// its queue is closed.
    pub async fn send_to(&self, id: &ConnectionId, encoded: Arc<[u8]>) -> bool {
        match self.get(id).await {
            Some(conn) => conn.enqueue(encoded),
            None => false,
        }
    }

    /// Queue an encoded frame for every peer except `except`.
    ///
    /// Fire-and-forget: a slow or broken peer only affects its own queue.
    /// Returns the number of peers the frame was queued for.
    pub async fn broadcast(&self, encoded: Arc<[u8]>, except: Option<ConnectionId>) -> usize {
        let links = self.links.read().await;
        links
            .values()
            .filter(|conn| Some(conn.id()) != except)
            .filter(|conn| conn.enqueue(Arc::clone(&encoded)))
            .count()
    }

    /// Close every link once its queued frames are written, and forget them.
    pub async fn close_all_after_flush(&self) {
        let mut links = self.links.write().await;
        for (_, conn) in links.drain() {
            conn.close_after_flush();
        }
    }

    /// Close every link immediately and forget them.
    pub async fn close_all(&self) {
        let mut links = self.links.write().await;
        for (_, conn) in links.drain() {
            conn.close();
        }
    }
}

/// Settings of the dispatcher's accept loop.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Player slots. Connections beyond this are dropped on accept.
    pub max_connections: usize,
    pub socket: SocketConfig,
    pub frame: FrameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: bind_address(30000),
            max_connections: 32,
            socket: SocketConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}

/// Dispatcher accept loop. Every accepted peer gets a [`Connection`] that
/// reports into the shared event channel, and a slot in the [`ConnectionMap`].
pub struct Listener {
    config: ServerConfig,
    connections: Arc<ConnectionMap>,
    stop: watch::Sender<bool>,
}

impl Listener {
    pub fn new(config: ServerConfig, connections: Arc<ConnectionMap>) -> Self {
        Self {
            config,
            connections,
            stop: watch::Sender::new(false),
        }
    }

    pub fn bind(&self) -> std::io::Result<TcpListener> {
        create_listener(self.config.bind_addr, &self.config.socket)
    }

    /// Accept peers on `listener` until [`Listener::shutdown`], then close
    /// every link.
    pub async fn run_with_listener<M: WireMessage>(
        &self,
        listener: TcpListener,
        events: mpsc::Sender<ConnectionEvent<M>>,
    ) -> std::io::Result<()> {
        let mut stop = self.stop.subscribe();
        tracing::info!(addr = ?listener.local_addr().ok(), "dispatcher listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer, &events).await,
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("dispatcher listener stopped");
        self.connections.close_all().await;
        Ok(())
    }

    async fn admit<M: WireMessage>(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        events: &mpsc::Sender<ConnectionEvent<M>>,
    ) {
        if self.connections.len().await >= self.config.max_connections {
            tracing::warn!(%peer, slots = self.config.max_connections, "session full, peer dropped");
            return;
        }
        if let Err(e) = configure_stream(&stream, &self.config.socket) {
            tracing::warn!(%peer, error = %e, "socket options not applied");
        }

        let id = self.connections.next_id();
        let conn = match Connection::spawn(id, stream, &self.config.frame, events.clone()) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "peer dropped before start");
                return;
            }
        };
        if let Err(e) = self.connections.insert(Arc::clone(&conn)).await {
            tracing::warn!(%peer, error = %e, "peer dropped");
            conn.close();
            return;
        }
        tracing::info!(connection = id.0, %peer, "peer accepted");
    }

    /// Stop accepting and close every link.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::Text;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    struct Harness {
        addr: SocketAddr,
        listener: Arc<Listener>,
        connections: Arc<ConnectionMap>,
        events: mpsc::Receiver<ConnectionEvent<Text>>,
    }

    async fn dispatcher(slots: usize) -> Harness {
        let connections = Arc::new(ConnectionMap::new(slots));
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections: slots,
            ..ServerConfig::default()
        };
        let listener = Arc::new(Listener::new(config, Arc::clone(&connections)));
        let tcp = listener.bind().unwrap();
        let addr = tcp.local_addr().unwrap();
        let (tx, events) = mpsc::channel(64);
        let accept = Arc::clone(&listener);
        tokio::spawn(async move { accept.run_with_listener(tcp, tx).await });
        Harness {
            addr,
            listener,
            connections,
            events,
        }
    }

    async fn wait_for_opened(events: &mut mpsc::Receiver<ConnectionEvent<Text>>, count: usize) -> Vec<ConnectionId> {
        let mut ids = Vec::new();
        while ids.len() < count {
            match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
                Ok(Some(ConnectionEvent::Opened { id, .. })) => ids.push(id),
                Ok(Some(_)) => {}
                _ => panic!("peers did not open"),
            }
        }
        ids
    }

    #[tokio::test]
    async fn test_each_peer_gets_a_distinct_id() {
        let mut h = dispatcher(8).await;
        let _peers = [
            TcpStream::connect(h.addr).await.unwrap(),
            TcpStream::connect(h.addr).await.unwrap(),
            TcpStream::connect(h.addr).await.unwrap(),
        ];
        let mut ids = wait_for_opened(&mut h.events, 3).await;
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.connections.len().await, 3);
    }

    #[tokio::test]
    async fn test_full_session_drops_extra_peer() {
        let mut h = dispatcher(1).await;
        let _first = TcpStream::connect(h.addr).await.unwrap();
        wait_for_opened(&mut h.events, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = TcpStream::connect(h.addr).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))), "extra peer should see the socket close");
        assert_eq!(h.connections.len().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_skips_the_sender() {
        let mut h = dispatcher(8).await;
        let mut anna = TcpStream::connect(h.addr).await.unwrap();
        let mut bob = TcpStream::connect(h.addr).await.unwrap();
        let ids = wait_for_opened(&mut h.events, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frame: Arc<[u8]> = crate::framing::encode_frame("TEXT", b"hi").into();
        assert_eq!(h.connections.broadcast(frame, Some(ids[0])).await, 1);

        let mut buf = [0u8; 32];
        let got_anna = tokio::time::timeout(Duration::from_millis(200), anna.read(&mut buf)).await.is_ok();
        let got_bob = tokio::time::timeout(Duration::from_millis(200), bob.read(&mut buf)).await.is_ok();
        assert!(got_anna ^ got_bob, "exactly one peer receives the frame");
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_peers() {
        let mut h = dispatcher(8).await;
        let mut peer = TcpStream::connect(h.addr).await.unwrap();
        wait_for_opened(&mut h.events, 1).await;

        h.listener.shutdown();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(h.connections.is_empty().await);
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let map = ConnectionMap::new(4);
        assert_eq!(map.next_id(), ConnectionId(1));
        assert_eq!(map.next_id(), ConnectionId(2));
    }
}
