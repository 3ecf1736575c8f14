//! Named-message dispatch table and lifecycle hooks

use super::connection::Connection;
use super::types::{BoxFuture, DataKind, Message, WebSocketResult};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Name sent back when a routed message has no handler
pub const NOT_FOUND: &str = "not found";

pub type MessageHandler =
    Arc<dyn Fn(Arc<Connection>, Message) -> BoxFuture<'static, WebSocketResult<()>> + Send + Sync>;

pub type RawHandler = Arc<
    dyn Fn(Arc<Connection>, DataKind, Bytes) -> BoxFuture<'static, WebSocketResult<()>>
        + Send
        + Sync,
>;

pub type LifecycleHandler = Arc<dyn Fn(Arc<Connection>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Routes {
    handlers: HashMap<String, MessageHandler>,
    raw: Option<RawHandler>,
    not_found: Option<MessageHandler>,
    on_connect: Option<LifecycleHandler>,
    on_disconnect: Option<LifecycleHandler>,
}

/// Dispatch table shared by every connection of one server
///
/// Lookups clone the handler out of the lock before awaiting it, so
/// registration may happen while messages are being dispatched.
#[derive(Default)]
pub(crate) struct Router {
    routes: RwLock<Routes>,
}

impl Router {
    /// Register a handler for `name`, replacing any previous one
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Connection>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WebSocketResult<()>> + Send + 'static,
    {
        let name = name.into();
        let handler: MessageHandler = Arc::new(move |conn, msg| Box::pin(handler(conn, msg)));
        if self.routes.write().handlers.insert(name.clone(), handler).is_some() {
            debug!("Replaced handler for message '{}'", name);
        }
    }

    pub fn set_raw<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Connection>, DataKind, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WebSocketResult<()>> + Send + 'static,
    {
        self.routes.write().raw = Some(Arc::new(move |conn, kind, payload| {
            Box::pin(handler(conn, kind, payload))
        }));
    }

    pub fn set_not_found<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Connection>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WebSocketResult<()>> + Send + 'static,
    {
        self.routes.write().not_found =
            Some(Arc::new(move |conn, msg| Box::pin(handler(conn, msg))));
    }

    pub fn set_on_connect<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.routes.write().on_connect = Some(Arc::new(move |conn| Box::pin(handler(conn))));
    }

    pub fn set_on_disconnect<F, Fut>(&self, handler: F)
    where
        F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.routes.write().on_disconnect = Some(Arc::new(move |conn| Box::pin(handler(conn))));
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.routes.read().handlers.contains_key(name)
    }

    /// Route one complete message
    ///
    /// Empty and binary payloads go to the raw handler. Text is parsed as an
    /// envelope and routed by name, falling back to the not-found handler for
    /// unknown names and to the raw handler when it is not an envelope.
    /// Handler errors are logged and never close the connection.
    pub async fn dispatch(&self, conn: &Arc<Connection>, kind: DataKind, payload: Bytes) {
        let routed = match kind {
            DataKind::Text if !payload.is_empty() => Message::decode(&payload).ok(),
            _ => None,
        };

        let result = match routed {
            Some(msg) => {
                let name = msg.name.clone();
                let handler = self.routes.read().handlers.get(&name).cloned();
                let result = match handler {
                    Some(handler) => handler(conn.clone(), msg).await,
                    None => {
                        let not_found = self.routes.read().not_found.clone();
                        match not_found {
                            Some(handler) => handler(conn.clone(), msg).await,
                            None => conn.emit(NOT_FOUND, &msg.data).await,
                        }
                    }
                };
                result.map_err(|e| (name, e))
            }
            None => {
                let raw = self.routes.read().raw.clone();
                let result = match raw {
                    Some(handler) => handler(conn.clone(), kind, payload).await,
                    None => conn.write(kind, payload).await,
                };
                result.map_err(|e| ("<raw>".to_string(), e))
            }
        };

        if let Err((name, e)) = result {
            warn!(
                "Handler for '{}' failed on connection {}: {}",
                name,
                conn.id(),
                e
            );
        }
    }

    pub async fn connected(&self, conn: &Arc<Connection>) {
        let hook = self.routes.read().on_connect.clone();
        if let Some(hook) = hook {
            hook(conn.clone()).await;
        }
    }

    pub async fn disconnected(&self, conn: &Arc<Connection>) {
        let hook = self.routes.read().on_disconnect.clone();
        if let Some(hook) = hook {
            hook(conn.clone()).await;
        }
    }
}
