//! Chat-style demo for the sockroute WebSocket server
//!
//! Connect with any WebSocket client to `ws://127.0.0.1:8080/ws?name=ada` and send:
//! - `{"name":"echo","data":...}` to get the same message back
//! - `{"name":"say","data":"hello"}` to talk to everyone in the `greetings` channel
//! - `{"name":"announce","data":...}` to broadcast to every connection
//! - anything else that is not an envelope to have it echoed verbatim

use serde::Serialize;
use sockroute::{
    init_logging, Connection, LoggingConfig, Message, Server, WebSocketConfig,
};
use std::env;
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

const CHANNEL: &str = "greetings";

#[derive(Serialize)]
struct Said<'a> {
    from: &'a str,
    text: serde_json::Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(LoggingConfig::development().with_service("sockroute-demo"))
        .map_err(|e| anyhow::anyhow!(e))?;

    let server = Server::with_config(WebSocketConfig::from_env()?)?;
    let greetings = server.new_channel(CHANNEL).await?;

    server.on("echo", |conn: Arc<Connection>, msg: Message| async move {
        conn.emit(&msg.name, msg.data).await
    });

    let channel = greetings.clone();
    server.on("say", move |conn: Arc<Connection>, msg: Message| {
        let channel = channel.clone();
        async move {
            let from = conn.param("name").unwrap_or("anonymous").to_string();
            let result = channel
                .emit(
                    "said",
                    Said {
                        from: &from,
                        text: msg.data,
                    },
                )
                .await?;
            if !result.is_complete() {
                warn!(failed = result.failed.len(), "Some members missed a message");
            }
            Ok(())
        }
    });

    let registry: Weak<Server> = Arc::downgrade(&server);
    server.on("announce", move |_conn: Arc<Connection>, msg: Message| {
        let registry = registry.clone();
        async move {
            match registry.upgrade() {
                Some(server) => server.emit("announcement", msg.data).await,
                None => Ok(()),
            }
        }
    });

    let channel = greetings.clone();
    server.on_connect(move |conn| {
        let channel = channel.clone();
        async move {
            info!(connection_id = %conn.id(), "Client connected");
            if let Err(e) = channel.add(&conn).await {
                warn!("Could not join {}: {}", CHANNEL, e);
            }
        }
    });

    server.on_disconnect(|conn| async move {
        info!(connection_id = %conn.id(), "Client disconnected");
    });

    server.start()?;

    let addr = env::var("DEMO_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on ws://{}/ws", listener.local_addr()?);

    let ws = server.clone();
    axum::serve(listener, server.router("/ws"))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            if let Err(e) = ws.shutdown().await {
                warn!("WebSocket shutdown: {}", e);
            }
        })
        .await?;

    info!("Demo stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("Received Ctrl+C, shutting down"),
        _ = terminate => warn!("Received terminate signal, shutting down"),
    }
}
