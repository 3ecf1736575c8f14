//! Named groups of connections with scoped broadcast
//!
//! Channels are created through [`Server::new_channel`](super::server::Server::new_channel).
//! The server removes a disconnected connection from every channel, and a
//! failed delivery removes the member from the channel that tried to reach it.

use super::connection::Connection;
use super::types::{
    BroadcastResult, ConnectionId, Frame, Message, WebSocketError, WebSocketResult,
};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct Channel {
    name: String,
    members: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    closed: AtomicBool,
}

impl Channel {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            members: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Add a connection; adding an existing member is a no-op
    pub async fn add(&self, conn: &Arc<Connection>) -> WebSocketResult<()> {
        if self.is_closed() {
            return Err(WebSocketError::ChannelClosed(self.name.clone()));
        }
        if conn.is_closed() {
            return Err(WebSocketError::ConnectionClosed);
        }

        let mut members = self.members.write().await;
        if self.is_closed() {
            return Err(WebSocketError::ChannelClosed(self.name.clone()));
        }
        members.insert(conn.id(), conn.clone());

        // the server may have forgotten this connection just before the insert
        if conn.is_closed() {
            members.remove(&conn.id());
            return Err(WebSocketError::ConnectionClosed);
        }

        debug!("Added connection {} to channel {}", conn.id(), self.name);
        Ok(())
    }

    /// Remove a member
    ///
    /// Fails with `ChannelClosed` after a purge and with `NotMember` when the
    /// connection was never added or is already gone.
    pub async fn remove(&self, conn: &Connection) -> WebSocketResult<()> {
        let id = conn.id();
        let mut members = self.members.write().await;

        if self.is_closed() {
            return Err(WebSocketError::ChannelClosed(self.name.clone()));
        }

        match members.remove(&id) {
            Some(_) => {
                debug!("Removed connection {} from channel {}", id, self.name);
                Ok(())
            }
            None => Err(WebSocketError::NotMember {
                channel: self.name.clone(),
                connection: id,
            }),
        }
    }

    /// Disconnect path: drop the member if present, silently
    pub(crate) async fn forget(&self, id: ConnectionId) {
        if self.members.write().await.remove(&id).is_some() {
            debug!("Dropped disconnected {} from channel {}", id, self.name);
        }
    }

    /// Send a named message to every member
    ///
    /// Members whose write fails are removed; delivery to the others goes on.
    pub async fn emit<T: Serialize>(
        &self,
        name: &str,
        data: T,
    ) -> WebSocketResult<BroadcastResult> {
        if self.is_closed() {
            return Err(WebSocketError::ChannelClosed(self.name.clone()));
        }

        let payload = Message::new(name, data)?.encode()?;
        let targets: Vec<Arc<Connection>> = self.members.read().await.values().cloned().collect();

        let outcomes = join_all(targets.iter().map(|conn| {
            let frame = Frame::text(payload.clone());
            async move { (conn.id(), conn.write_frame(frame).await) }
        }))
        .await;

        let mut result = BroadcastResult::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => result.delivered += 1,
                Err(e) => {
                    warn!("Channel {} dropped {}: {}", self.name, id, e);
                    result.failed.push(id);
                }
            }
        }

        if !result.failed.is_empty() {
            let mut members = self.members.write().await;
            for id in &result.failed {
                members.remove(id);
            }
        }

        Ok(result)
    }

    /// Members whose connection is still open
    pub async fn count(&self) -> usize {
        self.members
            .read()
            .await
            .values()
            .filter(|conn| !conn.is_closed())
            .count()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.members.read().await.contains_key(&id)
    }

    pub async fn members(&self) -> Vec<ConnectionId> {
        self.members.read().await.keys().copied().collect()
    }

    /// Clear membership and refuse further adds and emits
    pub async fn purge(&self) {
        let mut members = self.members.write().await;
        self.closed.store(true, Ordering::Release);
        members.clear();
        info!("Channel {} purged", self.name);
    }
}
