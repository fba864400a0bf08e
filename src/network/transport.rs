use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use uuid::Uuid;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::connection::{Connection, ConnectionInfo};
use super::protocol::{Discovery, Handshake, Heartbeat, Inbound, Message, MessageKind, Unhandled};
use crate::blockchain::crypto::{PeerId, SignatureRecord, SignatureScheme};
use crate::clock::Clock;
use crate::consensus::messages::SignedMessage;
use crate::logging::LogSink;

/// Errors that can occur in the peer transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Refusing to connect to self")]
    SelfConnection,

    #[error("Already connected to {0}")]
    DuplicatePeer(PeerId),

    #[error("Transport is already listening on {0}")]
    AlreadyStarted(SocketAddr),

    #[error("Expected peer {expected}, remote is {actual}")]
    UnexpectedPeer { expected: PeerId, actual: PeerId },
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}

fn default_discovery_interval_ms() -> u64 {
    60_000
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_connect_retries() -> u32 {
    3
}

/// Transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// Listening port, 0 picks a free one
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bound on the handshake and on each connect attempt
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Connections without a pong for this long are evicted
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,

    /// First retry delay; doubles on every attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            host: default_host(),
            port: default_port(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            discovery_interval_ms: default_discovery_interval_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            connect_retries: default_connect_retries(),
        }
    }
}

impl TransportConfig {
    /// Delay before the retry that follows failed attempt `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// A listening address announced by a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeer {
    pub peer_id: PeerId,
    pub address: String,
    pub last_seen: u64,
}

/// Largest accepted gap between a handshake's timestamp and the local clock
pub const HANDSHAKE_MAX_SKEW_MS: u64 = 300_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Inner {
    config: TransportConfig,
    peer_id: PeerId,
    signer: Arc<dyn SignatureScheme>,
    clock: Arc<dyn Clock>,
    log: Arc<dyn LogSink>,

    /// The only place sockets live
    connections: Mutex<HashMap<PeerId, Connection>>,

    routes: Mutex<HashMap<MessageKind, mpsc::UnboundedSender<Inbound>>>,
    unhandled: Mutex<Option<mpsc::UnboundedSender<Unhandled>>>,
    discovered: DashMap<PeerId, DiscoveredPeer>,

    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// WebSocket transport between peers
///
/// Cheap to clone; clones share the same connection table.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(
        config: TransportConfig,
        signer: Arc<dyn SignatureScheme>,
        clock: Arc<dyn Clock>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Transport {
            inner: Arc::new(Inner {
                config,
                peer_id: signer.peer_id().clone(),
                signer,
                clock,
                log,
                connections: Mutex::new(HashMap::new()),
                routes: Mutex::new(HashMap::new()),
                unhandled: Mutex::new(None),
                discovered: DashMap::new(),
                local_addr: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }

    /// Binds the listener and starts the accept, heartbeat and discovery loops
    ///
    /// # Arguments
    ///
    /// * `port` - Port to listen on, 0 picks a free one
    pub async fn start(&self, port: u16) -> Result<SocketAddr, TransportError> {
        if let Some(addr) = self.local_addr() {
            return Err(TransportError::AlreadyStarted(addr));
        }

        let listener = TcpListener::bind((self.inner.config.host.as_str(), port)).await?;
        let addr = listener.local_addr()?;
        *lock(&self.inner.local_addr) = Some(addr);

        let accept = tokio::spawn(accept_loop(self.inner.clone(), listener));
        let heartbeat = tokio::spawn(heartbeat_loop(self.inner.clone()));
        let discovery = tokio::spawn(discovery_loop(self.inner.clone()));
        lock(&self.inner.tasks).extend([accept, heartbeat, discovery]);

        self.inner
            .log
            .info("transport listening", json!({ "address": addr.to_string() }));
        Ok(addr)
    }

    /// Connects to a peer, retrying with exponential backoff
    ///
    /// # Arguments
    ///
    /// * `address` - `host:port` or a `ws://` URL
    /// * `expected` - Peer id the remote must prove, if known
    /// * `retries` - Total attempts, at least one is made
    ///
    /// # Returns
    ///
    /// true once a handshake completed; failures are logged, never raised
    pub async fn connect(&self, address: &str, expected: Option<&PeerId>, retries: u32) -> bool {
        let attempts = retries.max(1);

        for attempt in 0..attempts {
            let outcome = timeout(
                self.inner.config.handshake_timeout(),
                self.inner.clone().dial(address, expected),
            )
            .await;

            if let Ok(Err(TransportError::UnexpectedPeer { .. })) = &outcome {
                // A different identity will not change on retry
                self.inner.log.warn(
                    "peer identity mismatch",
                    json!({ "address": address, "expected": expected }),
                );
                return false;
            }

            let reason = match outcome {
                Ok(Ok(peer)) => {
                    self.inner.log.info(
                        "connected to peer",
                        json!({ "peer": peer, "address": address }),
                    );
                    return true;
                }
                Ok(Err(err)) => err.to_string(),
                Err(_) => TransportError::HandshakeTimeout.to_string(),
            };

            self.inner.log.warn(
                "connect attempt failed",
                json!({ "address": address, "attempt": attempt + 1, "reason": reason }),
            );

            if attempt + 1 < attempts {
                sleep(self.inner.config.backoff(attempt)).await;
            }
        }

        self.inner.log.warn(
            "giving up on peer",
            json!({ "address": address, "attempts": attempts }),
        );
        false
    }

    /// Closes the connection to a peer
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        let removed = lock(&self.inner.connections).remove(peer);
        match removed {
            Some(_) => {
                self.inner.log.info("disconnected peer", json!({ "peer": peer }));
                true
            }
            None => false,
        }
    }

    /// Sends a message to every connection, or only to `targets`
    ///
    /// # Returns
    ///
    /// The number of connections the message was queued on
    pub fn broadcast(&self, message: &Message, targets: Option<&[PeerId]>) -> usize {
        self.inner.broadcast(message, targets)
    }

    /// Sends a message to one peer
    pub fn send_to(&self, peer: &PeerId, message: &Message) -> bool {
        self.inner.send_to(peer, message)
    }

    /// Routes every inbound message of `kind` to `sender`
    pub fn register_handler(&self, kind: MessageKind, sender: mpsc::UnboundedSender<Inbound>) {
        lock(&self.inner.routes).insert(kind, sender);
    }

    /// Receives well-formed frames that no handler claimed
    pub fn on_unhandled(&self, sender: mpsc::UnboundedSender<Unhandled>) {
        *lock(&self.inner.unhandled) = Some(sender);
    }

    /// Evicts stale connections, then pings the rest
    ///
    /// # Returns
    ///
    /// The evicted peers
    pub fn heartbeat_tick(&self) -> Vec<PeerId> {
        self.inner.heartbeat_tick()
    }

    /// Announces the listening port to every connection
    pub fn announce(&self) -> usize {
        self.inner.announce()
    }

    /// Listening addresses announced by peers
    pub fn discovered_peers(&self) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<DiscoveredPeer> = self
            .inner
            .discovered
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<ConnectionInfo> = lock(&self.inner.connections)
            .values()
            .map(Connection::info)
            .collect();
        connections.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        connections
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections().into_iter().map(|info| info.peer_id).collect()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        lock(&self.inner.connections).contains_key(peer)
    }

    /// Stops the background loops and drops every connection
    pub fn shutdown(&self) {
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        lock(&self.inner.connections).clear();
        *lock(&self.inner.local_addr) = None;
    }
}

impl Inner {
    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn handshake(&self, session_id: String) -> Message {
        let mut handshake = Handshake {
            peer_id: self.peer_id.clone(),
            session_id,
            timestamp: self.now(),
            signature: SignatureRecord::unsigned(),
        };
        handshake.signature = self.signer.sign(&handshake.signing_bytes());
        Message::Handshake(handshake)
    }

    /// Checks that a handshake is signed by the peer it names and is recent
    fn check_handshake(&self, handshake: &Handshake) -> Result<(), TransportError> {
        handshake
            .verify(self.signer.as_ref())
            .map_err(|err| TransportError::HandshakeFailed(err.to_string()))?;

        if self.now().abs_diff(handshake.timestamp) > HANDSHAKE_MAX_SKEW_MS {
            return Err(TransportError::HandshakeFailed(
                "handshake timestamp is out of range".to_string(),
            ));
        }
        Ok(())
    }

    /// Opens a socket, sends our handshake and waits for the echo
    async fn dial(
        self: Arc<Self>,
        address: &str,
        expected: Option<&PeerId>,
    ) -> Result<PeerId, TransportError> {
        let url = if address.starts_with("ws://") || address.starts_with("wss://") {
            address.to_string()
        } else {
            format!("ws://{}", address)
        };

        let (mut socket, _) = connect_async(url.as_str()).await?;

        let session_id = Uuid::new_v4().to_string();
        let hello = self.handshake(session_id.clone()).encode()?;
        socket.send(WsMessage::Text(hello.into())).await?;

        let reply = read_handshake(&mut socket).await?;
        if reply.session_id != session_id {
            return Err(TransportError::HandshakeFailed(
                "session id was not echoed".to_string(),
            ));
        }
        self.check_handshake(&reply)?;
        if reply.peer_id == self.peer_id {
            return Err(TransportError::SelfConnection);
        }
        if let Some(expected) = expected {
            if &reply.peer_id != expected {
                let _ = socket.close(None).await;
                return Err(TransportError::UnexpectedPeer {
                    expected: expected.clone(),
                    actual: reply.peer_id,
                });
            }
        }

        let peer = reply.peer_id.clone();
        self.register(reply, address.to_string(), socket)?;
        Ok(peer)
    }

    /// Waits for the initiator's handshake and echoes its session id
    async fn answer(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) -> Result<PeerId, TransportError> {
        let mut socket = accept_async(stream).await?;
        let hello = read_handshake(&mut socket).await?;
        self.check_handshake(&hello)?;

        if hello.peer_id == self.peer_id {
            return Err(TransportError::SelfConnection);
        }
        if lock(&self.connections).contains_key(&hello.peer_id) {
            return Err(TransportError::DuplicatePeer(hello.peer_id));
        }

        let echo = self.handshake(hello.session_id.clone()).encode()?;
        socket.send(WsMessage::Text(echo.into())).await?;

        let peer = hello.peer_id.clone();
        self.register(hello, remote.to_string(), socket)?;
        Ok(peer)
    }

    /// Stores a handshaken socket and starts its reader and writer
    ///
    /// The existing connection wins when the peer is already connected.
    fn register<S>(
        self: &Arc<Self>,
        handshake: Handshake,
        address: String,
        socket: WebSocketStream<S>,
    ) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let peer = handshake.peer_id;

        {
            let mut connections = lock(&self.connections);
            if connections.contains_key(&peer) {
                return Err(TransportError::DuplicatePeer(peer));
            }

            tokio::spawn(write_loop(sink, queue));
            let reader = tokio::spawn(read_loop(
                self.clone(),
                peer.clone(),
                handshake.session_id.clone(),
                stream,
            ));

            connections.insert(
                peer.clone(),
                Connection::new(
                    peer.clone(),
                    handshake.session_id,
                    address,
                    self.now(),
                    outbound,
                    Some(reader.abort_handle()),
                ),
            );
        }

        if let Some(port) = lock(&self.local_addr).map(|addr| addr.port()) {
            self.send_to(&peer, &self.discovery(port));
        }
        Ok(())
    }

    /// Drops a connection if it is still the session that ended
    fn remove_session(&self, peer: &PeerId, session_id: &str) {
        let mut connections = lock(&self.connections);
        let current = connections
            .get(peer)
            .map_or(false, |connection| connection.session_id == session_id);

        if current {
            connections.remove(peer);
            drop(connections);
            self.log.info("peer connection closed", json!({ "peer": peer }));
        }
    }

    fn broadcast(&self, message: &Message, targets: Option<&[PeerId]>) -> usize {
        let text = match message.encode() {
            Ok(text) => text,
            Err(err) => {
                self.log.error("failed to encode message", json!({ "reason": err.to_string() }));
                return 0;
            }
        };

        lock(&self.connections)
            .values()
            .filter(|connection| targets.map_or(true, |targets| targets.contains(&connection.peer_id)))
            .filter(|connection| connection.send_text(&text))
            .count()
    }

    fn send_to(&self, peer: &PeerId, message: &Message) -> bool {
        let text = match message.encode() {
            Ok(text) => text,
            Err(err) => {
                self.log.error("failed to encode message", json!({ "reason": err.to_string() }));
                return false;
            }
        };

        lock(&self.connections)
            .get(peer)
            .map_or(false, |connection| connection.send_text(&text))
    }

    fn discovery(&self, port: u16) -> Message {
        Message::Discovery(Discovery {
            peer_id: self.peer_id.clone(),
            port,
            timestamp: self.now(),
        })
    }

    fn announce(&self) -> usize {
        let port = lock(&self.local_addr).map(|addr| addr.port());
        match port {
            Some(port) => self.broadcast(&self.discovery(port), None),
            None => 0,
        }
    }

    fn heartbeat_tick(&self) -> Vec<PeerId> {
        let now = self.now();
        let timeout_ms = self.config.heartbeat_timeout_ms;

        let mut connections = lock(&self.connections);
        let stale: Vec<PeerId> = connections
            .values()
            .filter(|connection| connection.is_stale(now, timeout_ms))
            .map(|connection| connection.peer_id.clone())
            .collect();

        for peer in &stale {
            connections.remove(peer);
        }

        let ping = Message::Ping(Heartbeat { timestamp: now }).encode();
        if let Ok(ping) = ping {
            for connection in connections.values() {
                connection.send_text(&ping);
            }
        }
        drop(connections);

        for peer in &stale {
            self.log
                .warn("evicting peer after heartbeat timeout", json!({ "peer": peer }));
        }
        stale
    }

    /// Decodes one text frame and dispatches it on its `type`
    fn handle_frame(&self, peer: &PeerId, text: &str) {
        let body: Value = match serde_json::from_str(text) {
            Ok(body) => body,
            Err(err) => {
                self.log.warn(
                    "dropping malformed frame",
                    json!({ "peer": peer, "reason": err.to_string() }),
                );
                return;
            }
        };

        let kind = match body.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None => {
                self.log.warn(
                    "dropping malformed frame",
                    json!({ "peer": peer, "reason": "missing string type" }),
                );
                return;
            }
        };

        let Some(known) = MessageKind::parse(&kind) else {
            self.deliver_unhandled(peer, kind, body);
            return;
        };

        let message: Message = match serde_json::from_value(body.clone()) {
            Ok(message) => message,
            Err(err) => {
                self.log.warn(
                    "dropping malformed frame",
                    json!({ "peer": peer, "type": kind, "reason": err.to_string() }),
                );
                return;
            }
        };

        match message {
            Message::Handshake(_) => {
                self.log.debug("ignoring late handshake", json!({ "peer": peer }));
            }
            Message::Ping(_) => {
                let pong = Message::Pong(Heartbeat {
                    timestamp: self.now(),
                });
                self.send_to(peer, &pong);
            }
            Message::Pong(_) => {
                let now = self.now();
                if let Some(connection) = lock(&self.connections).get_mut(peer) {
                    connection.refresh(now);
                }
            }
            Message::Discovery(announcement) => self.record_discovery(peer, announcement),
            message => {
                let route = lock(&self.routes).get(&known).cloned();
                let delivered = route.map_or(false, |route| {
                    route
                        .send(Inbound {
                            peer_id: peer.clone(),
                            message,
                        })
                        .is_ok()
                });

                if !delivered {
                    self.deliver_unhandled(peer, kind, body);
                }
            }
        }
    }

    fn record_discovery(&self, peer: &PeerId, announcement: Discovery) {
        if announcement.peer_id == self.peer_id {
            return;
        }

        let host = lock(&self.connections)
            .get(peer)
            .map(|connection| host_of(&connection.address))
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let address = format!("{}:{}", host, announcement.port);
        self.log.debug(
            "discovered peer",
            json!({ "peer": announcement.peer_id, "address": address }),
        );

        self.discovered.insert(
            announcement.peer_id.clone(),
            DiscoveredPeer {
                peer_id: announcement.peer_id,
                address,
                last_seen: self.now(),
            },
        );
    }

    fn deliver_unhandled(&self, peer: &PeerId, kind: String, body: Value) {
        let sender = lock(&self.unhandled).clone();
        let delivered = sender.map_or(false, |sender| {
            sender
                .send(Unhandled {
                    peer_id: peer.clone(),
                    kind: kind.clone(),
                    body,
                })
                .is_ok()
        });

        if !delivered {
            self.log
                .debug("no handler for message", json!({ "peer": peer, "type": kind }));
        }
    }
}

/// Host part of a `host:port` or `ws://host:port` address
fn host_of(address: &str) -> String {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }

    let trimmed = address
        .trim_start_matches("ws://")
        .trim_start_matches("wss://");
    let authority = trimmed.split('/').next().unwrap_or(trimmed);
    match authority.rsplit_once(':') {
        Some((host, _)) => host.to_string(),
        None => authority.to_string(),
    }
}

/// Reads frames until the first text frame, which must be a handshake
async fn read_handshake<S>(socket: &mut WebSocketStream<S>) -> Result<Handshake, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = socket.next().await {
        match frame? {
            WsMessage::Text(text) => {
                return match serde_json::from_str::<Message>(text.as_str()) {
                    Ok(Message::Handshake(handshake)) => Ok(handshake),
                    Ok(other) => Err(TransportError::HandshakeFailed(format!(
                        "expected handshake, got {}",
                        other.kind()
                    ))),
                    Err(err) => Err(TransportError::HandshakeFailed(err.to_string())),
                };
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    Err(TransportError::ConnectionClosed)
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut queue: mpsc::UnboundedReceiver<WsMessage>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = queue.recv().await {
        if sink.send(frame).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<S>(
    inner: Arc<Inner>,
    peer: PeerId,
    session_id: String,
    mut stream: SplitStream<WebSocketStream<S>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => inner.handle_frame(&peer, text.as_str()),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                inner.log.debug(
                    "peer socket error",
                    json!({ "peer": peer, "reason": err.to_string() }),
                );
                break;
            }
        }
    }

    inner.remove_session(&peer, &session_id);
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                inner
                    .log
                    .warn("failed to accept connection", json!({ "reason": err.to_string() }));
                continue;
            }
        };

        let inner = inner.clone();
        tokio::spawn(async move {
            let limit = inner.config.handshake_timeout();
            let result = timeout(limit, inner.clone().answer(stream, remote)).await;

            let reason = match result {
                Ok(Ok(peer)) => {
                    inner.log.info(
                        "accepted peer",
                        json!({ "peer": peer, "address": remote.to_string() }),
                    );
                    return;
                }
                Ok(Err(err)) => err.to_string(),
                Err(_) => TransportError::HandshakeTimeout.to_string(),
            };
            inner.log.warn(
                "refused inbound connection",
                json!({ "address": remote.to_string(), "reason": reason }),
            );
        });
    }
}

async fn heartbeat_loop(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(Duration::from_millis(inner.config.heartbeat_interval_ms.max(1)));
    interval.tick().await;

    loop {
        interval.tick().await;
        inner.heartbeat_tick();
    }
}

async fn discovery_loop(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(Duration::from_millis(inner.config.discovery_interval_ms.max(1)));
    interval.tick().await;

    loop {
        interval.tick().await;
        inner.announce();
    }
}
