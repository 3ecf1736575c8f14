//! HTTP upgrade entry point
//!
//! Validates the RFC 6455 opening handshake, answers `101 Switching
//! Protocols` and hands the upgraded stream to [`Server::accept`] on a tracked
//! task once hyper releases it.

use super::server::Server;
use super::types::{WebSocketError, WebSocketResult};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use tungstenite::handshake::derive_accept_key;

const WEBSOCKET_VERSION: &str = "13";

/// Axum handler for a router whose state is the server
pub async fn ws_handler(State(server): State<Arc<Server>>, req: Request) -> Response {
    server.handler(req).await
}

impl Server {
    /// Axum router serving WebSocket upgrades on `path`
    pub fn router(self: &Arc<Self>, path: &str) -> axum::Router {
        axum::Router::new()
            .route(path, get(ws_handler))
            .with_state(self.clone())
    }

    /// Upgrade one HTTP request
    ///
    /// Answers 503 once shutdown has begun and 400 for anything that is not a
    /// valid WebSocket handshake.
    pub async fn handler(self: &Arc<Self>, mut req: Request) -> Response {
        if !self.state().accepts_connections() {
            return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
        }

        let accept_key = match validate_handshake(req.method(), req.headers()) {
            Ok(key) => key,
            Err(e) => {
                debug!("Rejected WebSocket handshake: {}", e);
                return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
            }
        };

        let params = match parse_params(req.uri().query()) {
            Ok(params) => params,
            Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        };

        let upgrade = hyper::upgrade::on(&mut req);
        let server = self.clone();
        self.tasks.spawn(async move {
            match upgrade.await {
                Ok(upgraded) => {
                    if let Err(e) = server.accept(TokioIo::new(upgraded), params).await {
                        debug!("Upgraded connection not served: {}", e);
                    }
                }
                Err(e) => warn!("WebSocket upgrade failed: {}", e),
            }
        });

        (
            StatusCode::SWITCHING_PROTOCOLS,
            [
                (header::CONNECTION, "upgrade".to_string()),
                (header::UPGRADE, "websocket".to_string()),
                (header::SEC_WEBSOCKET_ACCEPT, accept_key),
            ],
        )
            .into_response()
    }
}

/// Check the opening handshake and compute `Sec-WebSocket-Accept`
pub fn validate_handshake(method: &Method, headers: &HeaderMap) -> WebSocketResult<String> {
    if method != Method::GET {
        return Err(WebSocketError::Upgrade(format!(
            "method {method} cannot be upgraded"
        )));
    }

    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !connection_upgrade {
        return Err(WebSocketError::Upgrade(
            "missing Connection: upgrade".to_string(),
        ));
    }

    let upgrade_websocket = headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"));
    if !upgrade_websocket {
        return Err(WebSocketError::Upgrade(
            "missing Upgrade: websocket".to_string(),
        ));
    }

    if headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(|value| value.as_bytes())
        != Some(WEBSOCKET_VERSION.as_bytes())
    {
        return Err(WebSocketError::Upgrade(
            "unsupported Sec-WebSocket-Version".to_string(),
        ));
    }

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or_else(|| WebSocketError::Upgrade("missing Sec-WebSocket-Key".to_string()))?;

    Ok(derive_accept_key(key.as_bytes()))
}

/// Query string of the upgrade request as connection parameters
pub fn parse_params(query: Option<&str>) -> WebSocketResult<HashMap<String, String>> {
    serde_urlencoded::from_str(query.unwrap_or(""))
        .map_err(|e| WebSocketError::Upgrade(format!("invalid query string: {e}")))
}
