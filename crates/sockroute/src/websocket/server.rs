//! WebSocket server: connection registry, dispatch and lifecycle
//!
//! The server moves through `Created → Running → ShuttingDown → Closed` and
//! never goes back. Connections are accepted in the first two states only.
//! Server-wide broadcasts are queued and fanned out by a background task, so
//! [`Server::emit`] returns once the message is queued.

use super::channel::Channel;
use super::codec::{self, Role};
use super::connection::Connection;
use super::reader;
use super::router::Router;
use super::types::{
    CloseCode, ConnectionId, DataKind, Frame, Message, WebSocketError, WebSocketResult,
};
use crate::config::{ConfigError, WebSocketConfig};
use bytes::Bytes;
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Created = 0,
    Running = 1,
    ShuttingDown = 2,
    Closed = 3,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Closed,
        }
    }

    pub fn accepts_connections(self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

pub struct Server {
    config: WebSocketConfig,
    state: AtomicU8,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    router: Router,
    broadcast_tx: mpsc::Sender<Bytes>,
    broadcast_rx: parking_lot::Mutex<Option<mpsc::Receiver<Bytes>>>,
    broadcaster: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    pub(crate) tasks: TaskTracker,
}

impl Server {
    /// Server with default configuration
    pub fn new() -> Arc<Self> {
        Self::build(WebSocketConfig::default())
    }

    /// Server with a validated configuration
    pub fn with_config(config: WebSocketConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: WebSocketConfig) -> Arc<Self> {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_queue_size.max(1));

        Arc::new(Self {
            config,
            state: AtomicU8::new(ServerState::Created as u8),
            connections: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            router: Router::default(),
            broadcast_tx,
            broadcast_rx: parking_lot::Mutex::new(Some(broadcast_rx)),
            broadcaster: parking_lot::Mutex::new(None),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Register a handler for messages named `name`; the last registration wins
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Connection>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WebSocketResult<()>> + Send + 'static,
    {
        self.router.on(name, handler);
    }

    /// Handler for binary data, empty payloads and text that is not an
    /// envelope; echoes the payload back when unset
    pub fn on_message<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Connection>, DataKind, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WebSocketResult<()>> + Send + 'static,
    {
        self.router.set_raw(handler);
    }

    /// Handler for envelopes with an unregistered name; replies with a
    /// `"not found"` message when unset
    pub fn on_not_found<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Connection>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WebSocketResult<()>> + Send + 'static,
    {
        self.router.set_not_found(handler);
    }

    pub fn on_connect<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.router.set_on_connect(handler);
    }

    /// Hook run after a connection has left the registry and every channel
    pub fn on_disconnect<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.router.set_on_disconnect(handler);
    }

    /// Start the broadcast task; calling it again while running is a no-op
    pub fn start(self: &Arc<Self>) -> WebSocketResult<()> {
        match self.state.compare_exchange(
            ServerState::Created as u8,
            ServerState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(current) if ServerState::from_u8(current) == ServerState::Running => return Ok(()),
            Err(_) => return Err(WebSocketError::ServerShutdown),
        }

        let Some(rx) = self.broadcast_rx.lock().take() else {
            return Ok(());
        };

        let handle = tokio::spawn(broadcast_loop(
            Arc::downgrade(self),
            rx,
            self.shutdown.clone(),
            self.config.broadcast_concurrency.max(1),
        ));
        *self.broadcaster.lock() = Some(handle);

        info!("WebSocket server running");
        Ok(())
    }

    /// Start, and shut down once `token` is cancelled
    pub fn start_with(self: &Arc<Self>, token: CancellationToken) -> WebSocketResult<()> {
        self.start()?;

        let server = Arc::downgrade(self);
        let stopped = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Some(server) = server.upgrade() {
                        if let Err(e) = server.shutdown().await {
                            debug!("Shutdown on cancellation skipped: {}", e);
                        }
                    }
                }
                _ = stopped.cancelled() => {}
            }
        });

        Ok(())
    }

    /// Take ownership of an upgraded stream and serve it until it closes
    ///
    /// Registers the connection, runs the connect hook, drives the read loop
    /// on the calling task and deregisters afterwards.
    pub async fn accept<S>(
        self: &Arc<Self>,
        io: S,
        params: HashMap<String, String>,
    ) -> WebSocketResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (source, sink) = codec::split(io, Role::Server, self.config.max_frame_size);
        let conn = Connection::new(
            params,
            sink,
            self.config.write_timeout(),
            self.config.close_timeout(),
        );

        {
            let mut connections = self.connections.write().await;
            if !self.state().accepts_connections() {
                drop(connections);
                conn.terminate(CloseCode::GOING_AWAY, "server shutting down").await;
                return Err(WebSocketError::ServerShutdown);
            }
            connections.insert(conn.id(), conn.clone());
        }
        info!(connection_id = %conn.id(), "WebSocket connection registered");

        if let Some(interval) = self.config.ping_interval() {
            conn.start_keepalive(interval);
        }

        self.router.connected(&conn).await;
        reader::run(self, &conn, source).await;
        self.deregister(&conn).await;

        Ok(())
    }

    /// Close a connection and remove it from the registry and every channel
    ///
    /// Safe to race: only the caller that removes the registry entry runs
    /// the disconnect hook.
    pub(crate) async fn deregister(&self, conn: &Arc<Connection>) {
        conn.terminate(CloseCode::NORMAL, "").await;

        let removed = self.connections.write().await.remove(&conn.id()).is_some();
        if !removed {
            return;
        }

        let channels: Vec<Arc<Channel>> = self.channels.read().await.values().cloned().collect();
        for channel in channels {
            channel.forget(conn.id()).await;
        }

        info!(connection_id = %conn.id(), "WebSocket connection deregistered");
        self.router.disconnected(conn).await;
    }

    pub(crate) async fn dispatch(&self, conn: &Arc<Connection>, kind: DataKind, payload: Bytes) {
        self.router.dispatch(conn, kind, payload).await;
    }

    /// Queue a named message for every registered connection
    ///
    /// Returns once queued. A connection that cannot be written to is closed
    /// and deregistered; that never fails the broadcast. Messages queued
    /// before [`start`](Self::start) are delivered once the server runs.
    pub async fn emit<T: Serialize>(&self, name: &str, data: T) -> WebSocketResult<()> {
        if !self.state().accepts_connections() {
            return Err(WebSocketError::ServerShutdown);
        }

        let payload = Message::new(name, data)?.encode()?;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(WebSocketError::ServerShutdown),
            sent = self.broadcast_tx.send(payload) => {
                sent.map_err(|_| WebSocketError::ServerShutdown)
            }
        }
    }

    /// Number of registered connections
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&id).cloned()
    }

    async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Create a channel; fails while a live channel holds the name
    pub async fn new_channel(&self, name: impl Into<String>) -> WebSocketResult<Arc<Channel>> {
        if !self.state().accepts_connections() {
            return Err(WebSocketError::ServerShutdown);
        }

        let name = name.into();
        let mut channels = self.channels.write().await;
        if channels.get(&name).is_some_and(|existing| !existing.is_closed()) {
            return Err(WebSocketError::ChannelExists(name));
        }

        let channel = Arc::new(Channel::new(name.clone()));
        channels.insert(name, channel.clone());
        debug!(channel = %channel.name(), "Channel created");
        Ok(channel)
    }

    pub async fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .await
            .get(name)
            .filter(|channel| !channel.is_closed())
            .cloned()
    }

    /// Purge a channel and drop it from the server
    pub async fn remove_channel(&self, name: &str) -> WebSocketResult<()> {
        let removed = self.channels.write().await.remove(name);
        match removed {
            Some(channel) => {
                channel.purge().await;
                Ok(())
            }
            None => Err(WebSocketError::ChannelNotFound(name.to_string())),
        }
    }

    /// Close every connection and stop background processing
    ///
    /// Terminal: later or concurrent calls return `ServerShutdown`. Returns
    /// after every connection is closed and deregistered and all tracked
    /// tasks have finished, so it must not be awaited from inside a message
    /// handler or hook.
    pub async fn shutdown(&self) -> WebSocketResult<()> {
        let began = [ServerState::Created, ServerState::Running]
            .into_iter()
            .any(|from| {
                self.state
                    .compare_exchange(
                        from as u8,
                        ServerState::ShuttingDown as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
            });
        if !began {
            return Err(WebSocketError::ServerShutdown);
        }

        info!("WebSocket server shutting down");
        self.shutdown.cancel();

        let connections = self.snapshot().await;
        join_all(
            connections
                .iter()
                .map(|conn| conn.terminate(CloseCode::GOING_AWAY, "server shutdown")),
        )
        .await;
        join_all(connections.iter().map(|conn| self.deregister(conn))).await;

        self.tasks.close();
        self.tasks.wait().await;

        let broadcaster = self.broadcaster.lock().take();
        if let Some(handle) = broadcaster {
            if let Err(e) = handle.await {
                warn!("Broadcast task ended abnormally: {}", e);
            }
        }

        self.state
            .store(ServerState::Closed as u8, Ordering::SeqCst);
        info!(closed = connections.len(), "WebSocket server closed");
        Ok(())
    }
}

/// Drain the broadcast queue one payload at a time
///
/// A payload reaches every target before the next one is dequeued, so
/// messages to a single connection keep their emit order. Failed targets are
/// deregistered on tracked tasks so disconnect hooks never stall the queue.
async fn broadcast_loop(
    weak: Weak<Server>,
    mut rx: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
    concurrency: usize,
) {
    loop {
        let payload = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(payload) => payload,
                None => break,
            },
        };

        let Some(server) = weak.upgrade() else { break };
        let targets = server.snapshot().await;
        debug!(targets = targets.len(), "Broadcasting message");

        let fan_out = stream::iter(targets).for_each_concurrent(concurrency, |conn| {
            let frame = Frame::text(payload.clone());
            let server = &server;
            async move {
                if conn.write_frame(frame).await.is_err() {
                    let owner = server.clone();
                    server.tasks.spawn(async move { owner.deregister(&conn).await });
                }
            }
        });

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = fan_out => {}
        }
    }

    debug!("Broadcast task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::test_support::{duplex_client, wait_for_count, ClientEnd};
    use crate::websocket::types::{CloseFrame, OpCode};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_server() -> Arc<Server> {
        Server::with_config(WebSocketConfig::default().with_ping_interval(0)).unwrap()
    }

    fn connect(server: &Arc<Server>) -> (JoinHandle<WebSocketResult<()>>, ClientEnd) {
        let (io, client) = duplex_client();
        let server = server.clone();
        let handle = tokio::spawn(async move { server.accept(io, HashMap::new()).await });
        (handle, client)
    }

    async fn read_close(client: &mut ClientEnd) -> Option<CloseFrame> {
        loop {
            match client.source.read_frame().await {
                Ok(Some(frame)) if frame.opcode == OpCode::Close => {
                    return CloseFrame::parse(&frame.payload).unwrap()
                }
                Ok(Some(_)) => continue,
                other => panic!(
                    "expected close frame, got {:?}",
                    other.map(|f| f.map(|f| f.opcode))
                ),
            }
        }
    }

    #[tokio::test]
    async fn test_lifecycle_hooks_and_count() {
        let server = test_server();
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));

        let counter = connects.clone();
        server.on_connect(move |_conn| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let counter = disconnects.clone();
        let observer = server.clone();
        server.on_disconnect(move |conn| {
            let counter = counter.clone();
            let observer = observer.clone();
            async move {
                assert!(conn.emit("late", ()).await.is_err());
                assert!(observer.connection(conn.id()).await.is_none());
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let (handle, mut client) = connect(&server);
        wait_for_count(&server, 1).await;
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        client
            .sink
            .write_frame(Frame::close(CloseCode::NORMAL, ""))
            .await
            .unwrap();
        let echoed = read_close(&mut client).await.unwrap();
        assert_eq!(echoed.code, CloseCode::NORMAL);

        handle.await.unwrap().unwrap();
        assert_eq!(server.count().await, 0);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            Server::with_config(WebSocketConfig::default().with_write_timeout(0)),
            Err(ConfigError::ValidationFailed { .. })
        ));
        assert!(matches!(
            Server::with_config(WebSocketConfig::default().with_broadcast_concurrency(0)),
            Err(ConfigError::ValidationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let server = test_server();
        let (_handle, mut client) = connect(&server);

        client.sink.write_frame(Frame::ping("beat")).await.unwrap();
        let frame = client.source.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Pong);
        assert_eq!(&frame.payload[..], b"beat");
    }

    #[tokio::test]
    async fn test_invalid_utf8_closes_without_dispatch() {
        let server = test_server();
        let dispatched = Arc::new(AtomicUsize::new(0));
        let counter = dispatched.clone();
        server.on_message(move |_conn, _kind, _payload| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let (handle, mut client) = connect(&server);
        client
            .sink
            .write_frame(Frame::new(false, OpCode::Text, vec![b'o', b'k']))
            .await
            .unwrap();
        client
            .sink
            .write_frame(Frame::continuation(true, vec![0xff]))
            .await
            .unwrap();

        let close = read_close(&mut client).await.unwrap();
        assert_eq!(close.code, CloseCode::INVALID_PAYLOAD);
        handle.await.unwrap().unwrap();
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
        assert_eq!(server.count().await, 0);
    }

    #[tokio::test]
    async fn test_unmasked_frame_is_protocol_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let server = test_server();
        let (io, mut client) = tokio::io::duplex(4096);
        let accept = {
            let server = server.clone();
            tokio::spawn(async move { server.accept(io, HashMap::new()).await })
        };

        client.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x88);
        assert_eq!(
            u16::from_be_bytes([reply[2], reply[3]]),
            CloseCode::PROTOCOL_ERROR
        );

        accept.await.unwrap().unwrap();
        assert_eq!(server.count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let server = test_server();
        server.start().unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(connect(&server).1);
        }
        wait_for_count(&server, 3).await;

        server.emit("ping", "go").await.unwrap();

        for client in clients.iter_mut() {
            let frame = client.source.read_frame().await.unwrap().unwrap();
            let msg = Message::decode(&frame.payload).unwrap();
            assert_eq!(msg, Message::new("ping", "go").unwrap());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_broadcasts_keep_order_per_connection() {
        const MESSAGES: u64 = 300;

        let server = Server::with_config(
            WebSocketConfig::default()
                .with_ping_interval(0)
                .with_broadcast_concurrency(4),
        )
        .unwrap();
        server.start().unwrap();

        let mut clients = Vec::new();
        for _ in 0..8 {
            clients.push(connect(&server).1);
        }
        wait_for_count(&server, 8).await;

        let readers: Vec<_> = clients
            .into_iter()
            .map(|mut client| {
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while (seen.len() as u64) < MESSAGES {
                        let frame = client.source.read_frame().await.unwrap().unwrap();
                        let msg = Message::decode(&frame.payload).unwrap();
                        seen.push(msg.data_as::<u64>().unwrap());
                    }
                    seen
                })
            })
            .collect();

        for i in 0..MESSAGES {
            server.emit("seq", i).await.unwrap();
        }

        for reader in readers {
            let seen = reader.await.unwrap();
            assert_eq!(seen, (0..MESSAGES).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_broadcast_drops_dead_connection() {
        let server = test_server();
        server.start().unwrap();

        let (_a, mut alive) = connect(&server);
        let (_b, dead) = connect(&server);
        wait_for_count(&server, 2).await;
        drop(dead);

        server.emit("news", 1).await.unwrap();
        let frame = alive.source.read_frame().await.unwrap().unwrap();
        assert_eq!(Message::decode(&frame.payload).unwrap().name, "news");

        wait_for_count(&server, 1).await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let server = test_server();
        server.start().unwrap();

        let mut clients = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let (handle, client) = connect(&server);
            handles.push(handle);
            clients.push(client);
        }
        wait_for_count(&server, 3).await;

        server.shutdown().await.unwrap();
        assert_eq!(server.count().await, 0);
        assert_eq!(server.state(), ServerState::Closed);

        for client in clients.iter_mut() {
            let close = read_close(client).await.unwrap();
            assert_eq!(close.code, CloseCode::GOING_AWAY);
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(matches!(
            server.shutdown().await,
            Err(WebSocketError::ServerShutdown)
        ));
        assert!(matches!(
            server.emit("late", ()).await,
            Err(WebSocketError::ServerShutdown)
        ));
        assert!(matches!(
            server.start(),
            Err(WebSocketError::ServerShutdown)
        ));

        let (io, _client) = duplex_client();
        assert!(matches!(
            server.accept(io, HashMap::new()).await,
            Err(WebSocketError::ServerShutdown)
        ));
    }

    #[tokio::test]
    async fn test_start_with_token_triggers_shutdown() {
        let server = test_server();
        let token = CancellationToken::new();
        server.start_with(token.clone()).unwrap();

        let (handle, _client) = connect(&server);
        wait_for_count(&server, 1).await;

        token.cancel();
        handle.await.unwrap().unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while server.state() != ServerState::Closed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(server.count().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_propagates_to_channels() {
        let server = test_server();
        let room = server.new_channel("room").await.unwrap();
        let lobby = server.new_channel("lobby").await.unwrap();

        let joiner = room.clone();
        let also = lobby.clone();
        server.on_connect(move |conn| {
            let room = joiner.clone();
            let lobby = also.clone();
            async move {
                room.add(&conn).await.unwrap();
                lobby.add(&conn).await.unwrap();
            }
        });

        let (handle, client) = connect(&server);
        wait_for_count(&server, 1).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while lobby.members().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(room.count().await, 1);

        drop(client);
        handle.await.unwrap().unwrap();

        assert!(room.members().await.is_empty());
        assert!(lobby.members().await.is_empty());
    }

    #[tokio::test]
    async fn test_channel_registry() {
        let server = test_server();

        let room = server.new_channel("room").await.unwrap();
        assert!(matches!(
            server.new_channel("room").await,
            Err(WebSocketError::ChannelExists(_))
        ));
        assert!(Arc::ptr_eq(&server.channel("room").await.unwrap(), &room));
        assert!(server.channel("missing").await.is_none());

        server.remove_channel("room").await.unwrap();
        assert!(room.is_closed());
        assert!(server.channel("room").await.is_none());
        assert!(matches!(
            server.remove_channel("room").await,
            Err(WebSocketError::ChannelNotFound(_))
        ));

        let fresh = server.new_channel("room").await.unwrap();
        assert!(!fresh.is_closed());
    }
}
