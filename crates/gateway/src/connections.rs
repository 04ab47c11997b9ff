//! Per-connection bookkeeping
//!
//! Each client connection owns at most one [`EncryptedChannel`]. The
//! registry only tracks them; the gateway decides when to tear them down.

use channel::{EncryptedChannel, SessionInfo};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use shared::Clock;
use std::collections::HashMap;
use std::sync::Arc;

/// Snapshot of one connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub client_id: String,
    pub connected_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    /// Rate-limit key of the last call made over this connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
}

struct Connection {
    info: ConnectionInfo,
    channel: Option<Arc<EncryptedChannel>>,
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Connection>>,
    clock: Arc<dyn Clock>,
}

impl ConnectionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Track a new connection, replacing any previous one with the same id
    pub fn open(&self, client_id: &str, remote_addr: Option<String>) -> ConnectionInfo {
        let info = ConnectionInfo {
            client_id: client_id.to_string(),
            connected_at: self.clock.now(),
            remote_addr,
            client_key: None,
            session: None,
        };
        self.connections.write().insert(
            client_id.to_string(),
            Connection {
                info: info.clone(),
                channel: None,
            },
        );
        info
    }

    /// Record the session of a channel established elsewhere
    pub fn attach_session(&self, client_id: &str, session: SessionInfo) -> bool {
        match self.connections.write().get_mut(client_id) {
            Some(conn) => {
                conn.info.session = Some(session);
                true
            }
            None => false,
        }
    }

    /// Hand ownership of a channel to the connection
    pub fn attach_channel(&self, client_id: &str, channel: Arc<EncryptedChannel>) -> bool {
        match self.connections.write().get_mut(client_id) {
            Some(conn) => {
                conn.info.session = channel.session_info().map(|s| (*s).clone());
                conn.channel = Some(channel);
                true
            }
            None => false,
        }
    }

    pub fn bind_client_key(&self, client_id: &str, client_key: &str) {
        if let Some(conn) = self.connections.write().get_mut(client_id) {
            if conn.info.client_key.as_deref() != Some(client_key) {
                conn.info.client_key = Some(client_key.to_string());
            }
        }
    }

    pub fn get(&self, client_id: &str) -> Option<ConnectionInfo> {
        self.connections.read().get(client_id).map(Self::snapshot)
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<_> = self.connections.read().values().map(Self::snapshot).collect();
        list.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then_with(|| a.client_id.cmp(&b.client_id)));
        list
    }

    /// Stop tracking a connection and hand back its channel for teardown
    pub(crate) fn remove(&self, client_id: &str) -> Option<(ConnectionInfo, Option<Arc<EncryptedChannel>>)> {
        self.connections
            .write()
            .remove(client_id)
            .map(|conn| (conn.info, conn.channel))
    }

    pub(crate) fn drain(&self) -> Vec<(ConnectionInfo, Option<Arc<EncryptedChannel>>)> {
        self.connections
            .write()
            .drain()
            .map(|(_, conn)| (conn.info, conn.channel))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Copy of the connection with the live channel's current session
    fn snapshot(conn: &Connection) -> ConnectionInfo {
        let mut info = conn.info.clone();
        // Key rotation replaces the channel's SessionInfo wholesale
        if let Some(session) = conn.channel.as_ref().and_then(|c| c.session_info()) {
            info.session = Some((*session).clone());
        }
        info
    }
}
