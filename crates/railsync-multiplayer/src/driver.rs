//! Glue between a [`Session`] and the TCP transport.
//!
//! The driver owns the connection map and a bounded inbox that every
//! connection task feeds. [`Driver::pump`] runs once per game tick: it drains
//! the inbox into the session, ticks it, and writes the outbox to the wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use railsync_config::NetworkConfig;
use railsync_net::{
    Connection, ConnectionEvent, ConnectionId, ConnectionMap, FrameConfig, Listener, ServerConfig,
    SocketConfig, bind_address, resolve_address,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::SessionError;
use crate::messages::Message;
use crate::session::{Outgoing, Recipient, Role, Session, SessionEvent};

/// Runs a session over TCP.
pub struct Driver {
    session: Session,
    socket: SocketConfig,
    frame: FrameConfig,
    max_connections: usize,
    connections: Arc<ConnectionMap>,
    listener: Option<Arc<Listener>>,
    dispatcher: Option<Arc<Connection>>,
    inbox_tx: mpsc::Sender<ConnectionEvent<Message>>,
    inbox_rx: mpsc::Receiver<ConnectionEvent<Message>>,
}

impl Driver {
    pub fn new(session: Session, network: &NetworkConfig, inbox_capacity: usize) -> Self {
        let socket = SocketConfig {
            tcp_nodelay: network.tcp_nodelay,
            keepalive_idle: (network.keepalive_secs > 0).then(|| Duration::from_secs(network.keepalive_secs)),
            ..SocketConfig::default()
        };
        let frame = FrameConfig {
            max_payload_size: network.max_payload_size,
        };
        let max_connections = network.max_players as usize;
        let (inbox_tx, inbox_rx) = mpsc::channel(inbox_capacity.max(1));
        Self {
            session,
            socket,
            frame,
            max_connections,
            connections: Arc::new(ConnectionMap::new(max_connections)),
            listener: None,
            dispatcher: None,
            inbox_tx,
            inbox_rx,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Start dispatching on `port` (0 picks a free port). Returns the bound
    /// address.
    pub fn host(&mut self, port: u16) -> std::io::Result<SocketAddr> {
        let config = ServerConfig {
            bind_addr: bind_address(port),
            max_connections: self.max_connections,
            socket: self.socket.clone(),
            frame: self.frame.clone(),
        };
        let listener = Arc::new(Listener::new(config, Arc::clone(&self.connections)));
        let bound = listener.bind()?;
        let addr = bound.local_addr()?;

        let accept = Arc::clone(&listener);
        let events = self.inbox_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = accept.run_with_listener(bound, events).await {
                tracing::error!(error = %e, "accept loop failed");
            }
        });
        self.listener = Some(listener);
        self.session.start_dispatcher();
        Ok(addr)
    }

    /// Open the link to a dispatcher. On failure the session falls back to
    /// single-player and `false` is returned.
    pub async fn connect(&mut self, address: &str, port: u16) -> bool {
        self.session.begin_connect();
        let addr = match resolve_address(address, port).await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(address, port, error = %e, "dispatcher address did not resolve");
                self.session.connect_failed(e.to_string());
                return false;
            }
        };
        let id = self.connections.next_id();
        match Connection::connect(id, addr, &self.socket, &self.frame, self.inbox_tx.clone()).await {
            Ok(link) => {
                tracing::info!(%addr, "dispatcher link open");
                self.dispatcher = Some(link);
                self.session.connected();
                true
            }
            Err(e) => {
                tracing::warn!(%addr, error = %e, "could not reach dispatcher");
                self.session.connect_failed(e.to_string());
                false
            }
        }
    }

    /// Announce the local train. Written on the next [`Driver::pump`].
    pub fn join_game(&mut self, user: &str, route: &str, code: &str) -> Result<(), SessionError> {
        self.session.join_game(user, route, code)
    }

    /// One tick: apply received messages, advance the session to
    /// `local_clock`, and send what it produced.
    pub async fn pump(&mut self, local_clock: f64) -> Vec<SessionEvent> {
        loop {
            match self.inbox_rx.try_recv() {
                Ok(event) => self.on_connection_event(event).await,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        self.session.tick(local_clock);
        self.flush().await;
        self.session.take_events()
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent<Message>) {
        match event {
            ConnectionEvent::Opened { id, peer } => {
                tracing::debug!(connection = id.0, %peer, "peer connected");
            }
            ConnectionEvent::Message { id, message } => {
                if let Err(e) = self.session.handle(id, message) {
                    tracing::warn!(connection = id.0, error = %e, category = ?e.category(), "message rejected");
                }
            }
            ConnectionEvent::Closed { id, reason } => {
                tracing::info!(connection = id.0, ?reason, "link closed");
                if self.dispatcher.as_ref().is_some_and(|link| link.id() == id) {
                    self.dispatcher = None;
                    self.session.on_link_lost(format!("dispatcher link closed: {reason:?}"));
                } else {
                    self.connections.remove(&id).await;
                    self.session.on_peer_disconnected(id);
                }
            }
        }
    }

    /// Write the session outbox. Each message is encoded once.
    async fn flush(&mut self) {
        for outgoing in self.session.take_outbox() {
            match outgoing {
                Outgoing::Send { recipient, message } => {
                    let encoded: Arc<[u8]> = match message.encode() {
                        Ok(frame) => frame.encode().into(),
                        Err(e) => {
                            tracing::error!(kind = message.kind().as_str(), error = %e, "encode failed");
                            continue;
                        }
                    };
                    self.deliver(recipient, encoded).await;
                }
                Outgoing::Close(recipient) => self.close(recipient).await,
            }
        }
    }

    async fn deliver(&self, recipient: Recipient, encoded: Arc<[u8]>) {
        match recipient {
            Recipient::All => {
                self.connections.broadcast(encoded, None).await;
            }
            Recipient::AllExcept(id) => {
                self.connections.broadcast(encoded, Some(id)).await;
            }
            Recipient::Connection(id) => {
                if !self.connections.send_to(&id, encoded).await {
                    tracing::debug!(connection = id.0, "frame for a closed connection dropped");
                }
            }
            Recipient::Dispatcher => match &self.dispatcher {
                Some(link) => {
                    link.enqueue(encoded);
                }
                None => tracing::debug!("no dispatcher link, frame dropped"),
            },
        }
    }

    async fn close(&mut self, recipient: Recipient) {
        match recipient {
            Recipient::All | Recipient::AllExcept(_) => self.connections.close_all_after_flush().await,
            Recipient::Connection(id) => {
                if let Some(conn) = self.connections.remove(&id).await {
                    conn.close_after_flush();
                }
            }
            Recipient::Dispatcher => {
                if let Some(link) = self.dispatcher.take() {
                    link.close_after_flush();
                }
            }
        }
    }

    /// Leave the session: send the quit, close links, stop accepting.
    pub async fn stop(&mut self) {
        let was_dispatcher = self.session.role() == Role::Dispatcher;
        self.session.stop();
        self.flush().await;
        if was_dispatcher && let Some(listener) = self.listener.take() {
            listener.shutdown();
        }
    }

    /// Id of the dispatcher link, if connected.
    pub fn dispatcher_link(&self) -> Option<ConnectionId> {
        self.dispatcher.as_ref().map(|link| link.id())
    }
}
