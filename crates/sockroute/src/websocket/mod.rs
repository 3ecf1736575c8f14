//! WebSocket server with named-message routing and channels
//!
//! ```rust,no_run
//! use sockroute::websocket::{Connection, Message, Server};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::new();
//! server.on("echo", |conn: Arc<Connection>, msg: Message| async move {
//!     conn.emit(&msg.name, msg.data).await
//! });
//! server.start()?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, server.router("/ws")).await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod codec;
pub mod connection;
pub mod handler;
pub mod reader;
pub mod router;
pub mod server;
pub mod types;

pub use channel::Channel;
pub use codec::{FrameCodec, FrameSink, FrameSource, Role};
pub use connection::Connection;
pub use handler::{parse_params, validate_handshake, ws_handler};
pub use reader::{FrameAssembler, ReadEvent, ReadState};
pub use router::NOT_FOUND;
pub use server::{Server, ServerState};
pub use types::{
    BroadcastResult, CloseCode, CloseFrame, ConnectionId, DataKind, Frame, Message, OpCode,
    WebSocketError, WebSocketResult,
};

#[cfg(test)]
pub(crate) mod test_support {
    use super::codec::{self, FrameSink, FrameSource, Role};
    use super::server::Server;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    const PIPE_CAPACITY: usize = 64 * 1024;
    const FRAME_LIMIT: usize = 1024 * 1024;

    /// Simulated peer speaking the client side of the protocol
    pub struct ClientEnd {
        pub source: Box<dyn FrameSource>,
        pub sink: Box<dyn FrameSink>,
    }

    /// Server-side write half wired to a client end; the server's read half
    /// is dropped
    pub fn client_pair() -> (Box<dyn FrameSink>, ClientEnd) {
        let (server_io, client) = duplex_client();
        let (_source, sink) = codec::split(server_io, Role::Server, FRAME_LIMIT);
        (sink, client)
    }

    /// Raw server-side stream for `Server::accept` plus the framed client end
    pub fn duplex_client() -> (DuplexStream, ClientEnd) {
        let (server_io, client_io) = tokio::io::duplex(PIPE_CAPACITY);
        let (source, sink) = codec::split(client_io, Role::Client, FRAME_LIMIT);
        (server_io, ClientEnd { source, sink })
    }

    pub async fn wait_for_count(server: &Arc<Server>, expected: usize) {
        let reached = tokio::time::timeout(Duration::from_secs(2), async {
            while server.count().await != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "server never reached {expected} connections");
    }
}
