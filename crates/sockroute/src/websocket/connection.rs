//! WebSocket connection handle
//!
//! A `Connection` owns the write half of one upgraded socket. Every write goes
//! through a single mutex so frames from concurrent handlers, broadcasts and
//! the keepalive task never interleave on the wire. The read half is driven
//! separately by the server's read loop.

use super::codec::FrameSink;
use super::types::{
    CloseCode, ConnectionId, DataKind, Frame, Message, WebSocketError, WebSocketResult,
};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Connection {
    id: ConnectionId,
    params: HashMap<String, String>,
    sink: Mutex<Box<dyn FrameSink>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    write_timeout: Duration,
    close_timeout: Duration,
}

impl Connection {
    pub(crate) fn new(
        params: HashMap<String, String>,
        sink: Box<dyn FrameSink>,
        write_timeout: Duration,
        close_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(),
            params,
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            write_timeout,
            close_timeout,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Query parameter from the upgrade request
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been closed from either side
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Send a named message as a single text frame
    pub async fn emit<T: Serialize>(&self, name: &str, data: T) -> WebSocketResult<()> {
        let payload = Message::new(name, data)?.encode()?;
        self.write_frame(Frame::text(payload)).await
    }

    /// Send any serializable value as JSON text, without the message envelope
    pub async fn send<T: Serialize + ?Sized>(&self, value: &T) -> WebSocketResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.write_frame(Frame::text(payload)).await
    }

    pub async fn send_binary(&self, payload: impl Into<Bytes>) -> WebSocketResult<()> {
        self.write_frame(Frame::binary(payload)).await
    }

    /// Write a complete data message of the given kind
    pub async fn write(&self, kind: DataKind, payload: impl Into<Bytes>) -> WebSocketResult<()> {
        self.write_frame(Frame::new(true, kind.into(), payload))
            .await
    }

    pub async fn ping(&self, payload: impl Into<Bytes>) -> WebSocketResult<()> {
        self.write_frame(Frame::ping(payload)).await
    }

    pub async fn pong(&self, payload: impl Into<Bytes>) -> WebSocketResult<()> {
        self.write_frame(Frame::pong(payload)).await
    }

    /// Close with a normal status
    pub async fn close(&self) -> WebSocketResult<()> {
        self.close_with_status(CloseCode::NORMAL, "").await
    }

    /// Send a close frame with the given status and shut the writer down
    ///
    /// Only the first call writes anything; later calls return `Ok(())`. The
    /// first call reports a close frame that could not be delivered within the
    /// close timeout, though the connection is closed either way.
    pub async fn close_with_status(&self, code: u16, reason: &str) -> WebSocketResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();

        let code = if CloseCode::is_sendable(code) {
            code
        } else {
            CloseCode::NORMAL
        };

        let mut sink = self.sink.lock().await;
        let result = time::timeout(self.close_timeout, async {
            sink.write_frame(Frame::close(code, reason)).await?;
            sink.close().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                debug!("Closed connection {} with status {}", self.id, code);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WebSocketError::WriteTimeout),
        }
    }

    /// Close on an internal path where nobody can act on a failed handshake
    pub(crate) async fn terminate(&self, code: u16, reason: &str) {
        if let Err(e) = self.close_with_status(code, reason).await {
            debug!("Close handshake for {} failed: {}", self.id, e);
        }
    }

    /// Serialized frame write bounded by the write timeout
    ///
    /// A failed or timed out write closes the connection.
    pub(crate) async fn write_frame(&self, frame: Frame) -> WebSocketResult<()> {
        if self.is_closed() {
            return Err(WebSocketError::ConnectionClosed);
        }

        let mut sink = self.sink.lock().await;
        if self.is_closed() {
            return Err(WebSocketError::ConnectionClosed);
        }

        let error = match time::timeout(self.write_timeout, sink.write_frame(frame)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => WebSocketError::WriteTimeout,
        };
        drop(sink);

        warn!("Write to connection {} failed: {}", self.id, error);
        self.terminate(CloseCode::INTERNAL_ERROR, "write failed").await;
        Err(error)
    }

    /// Spawn the keepalive task that pings the peer every `interval`
    ///
    /// The task holds only a weak reference and exits when the connection
    /// closes or a ping cannot be written.
    pub(crate) fn start_keepalive(self: &Arc<Self>, interval: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(conn) = weak.upgrade() else { break };
                        if let Err(e) = conn.ping(Bytes::new()).await {
                            debug!("Keepalive ping to {} failed: {}", conn.id, e);
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::test_support::{client_pair, ClientEnd};
    use crate::websocket::types::{CloseFrame, OpCode};
    use serde_json::json;

    fn connection(params: HashMap<String, String>) -> (Arc<Connection>, ClientEnd) {
        let (sink, client) = client_pair();
        let conn = Connection::new(
            params,
            sink,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        (conn, client)
    }

    #[tokio::test]
    async fn test_emit_writes_envelope() {
        let (conn, mut client) = connection(HashMap::new());

        conn.emit("echo", "hi").await.unwrap();

        let frame = client.source.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        let msg = Message::decode(&frame.payload).unwrap();
        assert_eq!(msg.name, "echo");
        assert_eq!(msg.data, json!("hi"));
    }

    #[tokio::test]
    async fn test_send_and_write_variants() {
        let (conn, mut client) = connection(HashMap::new());

        conn.send(&json!({"a": 1})).await.unwrap();
        conn.send_binary(vec![1u8, 2, 3]).await.unwrap();
        conn.write(DataKind::Text, "raw").await.unwrap();

        let frame = client.source.read_frame().await.unwrap().unwrap();
        assert_eq!(&frame.payload[..], br#"{"a":1}"#);
        let frame = client.source.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(&frame.payload[..], &[1, 2, 3]);
        let frame = client.source.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"raw");
    }

    #[tokio::test]
    async fn test_params() {
        let mut params = HashMap::new();
        params.insert("room".to_string(), "lobby".to_string());
        let (conn, _client) = connection(params);

        assert_eq!(conn.param("room"), Some("lobby"));
        assert_eq!(conn.param("missing"), None);
        assert_eq!(conn.params().len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, mut client) = connection(HashMap::new());

        conn.close_with_status(CloseCode::GOING_AWAY, "bye")
            .await
            .unwrap();
        conn.close().await.unwrap();
        assert!(conn.is_closed());
        conn.closed().await;

        let frame = client.source.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        let close = CloseFrame::parse(&frame.payload).unwrap().unwrap();
        assert_eq!(close.code, CloseCode::GOING_AWAY);
        assert_eq!(close.reason, "bye");

        assert!(client.source.read_frame().await.unwrap().is_none());
        assert!(matches!(
            conn.emit("late", ()).await,
            Err(WebSocketError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_failure_closes_connection() {
        let (conn, client) = connection(HashMap::new());
        drop(client);

        assert!(conn.emit("gone", ()).await.is_err());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_reports_undeliverable_frame_once() {
        let (conn, client) = connection(HashMap::new());
        drop(client);

        assert!(matches!(conn.close().await, Err(WebSocketError::Io(_))));
        assert!(conn.is_closed());
        assert!(conn.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_keepalive_pings() {
        let (conn, mut client) = connection(HashMap::new());
        conn.start_keepalive(Duration::from_millis(20));

        let frame = client.source.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Ping);

        conn.close().await.unwrap();
    }
}
