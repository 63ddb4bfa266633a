use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use pylon_common::protocol::ws::WsMessage;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Frame destined for one socket's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(WsMessage),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn new(connection_id: Uuid, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { connection_id, outbound, connected_at: Utc::now() }
    }
}

/// In-process map of user id to the single live socket for that user.
///
/// One socket per user per instance: registering a second socket for the same
/// user displaces the first, and the displaced handle is handed back so its
/// writer task can send the close frame itself.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<Uuid, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the socket for a user, returning the displaced handle when a
    /// previous socket for the same user was still registered.
    pub fn register(&self, user_id: Uuid, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut connections =
            self.connections.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        connections.insert(user_id, handle)
    }

    /// Remove the user's registration, but only if it still belongs to the
    /// given connection. A socket that was displaced by a newer one must not
    /// tear down its replacement's entry on the way out.
    pub fn unregister(&self, user_id: Uuid, connection_id: Uuid) -> bool {
        let mut connections =
            self.connections.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        match connections.get(&user_id) {
            Some(handle) if handle.connection_id == connection_id => {
                connections.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Push a frame to the user's socket. Returns false when the user has no
    /// live socket here or its writer task has already shut down.
    pub fn send(&self, user_id: Uuid, message: &WsMessage) -> bool {
        let connections =
            self.connections.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        match connections.get(&user_id) {
            Some(handle) => handle.outbound.send(Outbound::Frame(message.clone())).is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.connections
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
