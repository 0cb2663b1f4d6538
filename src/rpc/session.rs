//! Per-connection client state and the registry that `reply`/`notify`
//! resolve connections through.

use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use axum::extract::ws::Message;
use dashmap::DashMap;
use tokio::sync::mpsc::Sender;
use tracing::debug;

/// Sentinel version reported for clients that never completed the
/// version handshake.
pub const REMOTE_NOT_CONNECTED: &str = "[Not Connected]";

/// Stable identifier for one live connection. Allocated from a counter, so
/// the same connection always maps to the same registry slot and an id is
/// never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

/// Session metadata for one connected peer.
#[derive(Debug)]
pub struct Client {
    remote_version: String,
}

impl Client {
    fn new() -> Self {
        Self {
            remote_version: REMOTE_NOT_CONNECTED.to_string(),
        }
    }

    pub fn version(&self) -> &str {
        &self.remote_version
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.remote_version = version.into();
    }
}

struct SessionEntry {
    client: Client,
    sender: Sender<Message>,
}

/// Connection table. Entries are inserted and removed by the connection
/// tasks; `reply`/`notify` read it from arbitrary threads.
pub struct SessionRegistry {
    next_id: AtomicU64,
    connections: DashMap<ConnectionId, SessionEntry>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connections: DashMap::new(),
        }
    }

    pub(crate) fn insert(&self, sender: Sender<Message>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(
            id,
            SessionEntry {
                client: Client::new(),
                sender,
            },
        );
        id
    }

    /// Remove a session. Returns true if it existed.
    pub(crate) fn remove(&self, id: ConnectionId) -> bool {
        self.connections.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn remote_version(&self, id: ConnectionId) -> Option<String> {
        self.connections
            .get(&id)
            .map(|entry| entry.client.version().to_string())
    }

    /// Record the version a peer reported. Returns false if the connection
    /// has already closed.
    pub fn set_remote_version(&self, id: ConnectionId, version: &str) -> bool {
        match self.connections.get_mut(&id) {
            Some(mut entry) => {
                entry.client.set_version(version);
                true
            }
            None => false,
        }
    }

    /// Queue one text frame for a specific connection. Returns false when
    /// the connection is gone or its outbound queue is unavailable; both
    /// are expected during disconnect races and are not errors.
    pub(crate) fn send_text(&self, id: ConnectionId, text: String) -> bool {
        let Some(entry) = self.connections.get(&id) else {
            debug!(?id, "dropping frame for closed connection");
            return false;
        };
        if let Err(e) = entry.sender.try_send(Message::Text(text)) {
            debug!(?id, error = %e, "failed to queue outbound frame");
            return false;
        }
        true
    }

    /// Queue the same text frame on every live connection, skipping any
    /// that close mid-iteration. Returns the number of connections the
    /// frame was queued for.
    pub(crate) fn broadcast_text(&self, text: &str) -> usize {
        let mut delivered = 0;
        for entry in self.connections.iter() {
            if entry.sender.try_send(Message::Text(text.to_string())).is_ok() {
                delivered += 1;
            } else {
                debug!(id = ?entry.key(), "skipping connection during broadcast");
            }
        }
        delivered
    }

    /// Human-readable aggregate of the versions connected peers reported:
    /// the greatest reported version, with a " (+N)" suffix when N other
    /// distinct versions are also connected.
    pub fn remote_version_string(&self) -> String {
        let mut versions: BTreeMap<String, usize> = BTreeMap::new();
        for entry in self.connections.iter() {
            *versions.entry(entry.client.version().to_string()).or_default() += 1;
        }

        let mut result = REMOTE_NOT_CONNECTED.to_string();
        let mut others = 0;
        for version in versions.keys().rev() {
            if version == REMOTE_NOT_CONNECTED {
                continue;
            }
            if result == REMOTE_NOT_CONNECTED {
                result = version.clone();
            } else {
                others += 1;
            }
        }
        if others > 0 {
            result.push_str(&format!(" (+{})", others));
        }
        result
    }
}

/// Weak, non-owning reference to a live connection. Asynchronous handlers
/// hold one of these across threads; resolving it after the connection (or
/// the whole server) has gone away is an expected no-op.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    registry: Weak<SessionRegistry>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: ConnectionId, registry: Weak<SessionRegistry>) -> Self {
        Self { id, registry }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the connection is still tracked.
    pub fn is_live(&self) -> bool {
        self.registry
            .upgrade()
            .map(|r| r.connections.contains_key(&self.id))
            .unwrap_or(false)
    }

    pub fn remote_version(&self) -> Option<String> {
        self.registry.upgrade()?.remote_version(self.id)
    }

    pub fn set_remote_version(&self, version: &str) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.set_remote_version(self.id, version),
            None => false,
        }
    }

    pub(crate) fn send_text(&self, text: String) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.send_text(self.id, text),
            None => {
                debug!(id = ?self.id, "reply target registry is gone");
                false
            }
        }
    }
}

pub(crate) fn handle_for(registry: &Arc<SessionRegistry>, id: ConnectionId) -> ConnectionHandle {
    ConnectionHandle::new(id, Arc::downgrade(registry))
}
