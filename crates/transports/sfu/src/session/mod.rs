//! Session store
//!
//! One explicitly owned store holds every live signaling connection and the
//! router shared by all of them. Each connection record owns at most one send
//! transport and one receive transport, plus the outbound queue its WebSocket
//! writer drains.

use crate::engine::MediaRouter;
use crate::transport::{ManagedTransport, TransportRole};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque per-WebSocket client identifier
pub type ConnectionId = String;

/// Room grouping key
///
/// Clients send either a JSON string or a JSON number; both normalize to the
/// same textual key, so `1` and `"1"` address the same room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => Ok(RoomId(text)),
            Raw::Number(number) => Ok(RoomId(number.to_string())),
        }
    }
}

/// One client session, bound to one WebSocket
pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<String>,
    closing: AtomicBool,
    send_transport: Mutex<Option<ManagedTransport>>,
    recv_transport: Mutex<Option<ManagedTransport>>,
    opened_at: Instant,
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a text frame for this connection's WebSocket writer
    ///
    /// Returns false when the writer is gone.
    pub fn send(&self, message: String) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Whether disconnect handling has started for this connection
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Duration {
        self.opened_at.elapsed()
    }

    fn slot(&self, role: TransportRole) -> &Mutex<Option<ManagedTransport>> {
        match role {
            TransportRole::Send => &self.send_transport,
            TransportRole::Receive => &self.recv_transport,
        }
    }

    pub fn transport(&self, role: TransportRole) -> Option<ManagedTransport> {
        self.slot(role).lock().clone()
    }

    /// Store `transport` in the `role` slot and hand back the one it displaced
    pub fn replace_transport(
        &self,
        role: TransportRole,
        transport: ManagedTransport,
    ) -> Option<ManagedTransport> {
        self.slot(role).lock().replace(transport)
    }

    /// Clear the `role` slot only if it still holds `transport_id`
    pub fn release_transport(&self, role: TransportRole, transport_id: &str) -> bool {
        let mut slot = self.slot(role).lock();
        match slot.as_ref() {
            Some(current) if current.id() == transport_id => {
                slot.take();
                true
            }
            _ => false,
        }
    }

    pub fn take_transport(&self, role: TransportRole) -> Option<ManagedTransport> {
        self.slot(role).lock().take()
    }
}

/// Registry of live connections plus the shared router
pub struct SessionStore {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    router: RwLock<Option<Arc<dyn MediaRouter>>>,
    max_connections: usize,
}

impl SessionStore {
    /// Create an empty store; `max_connections == 0` means unlimited
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            router: RwLock::new(None),
            max_connections,
        }
    }

    /// Install the router every transport is created on
    pub fn attach_router(&self, router: Arc<dyn MediaRouter>) {
        info!(router_id = router.id(), "Router attached to session store");
        *self.router.write() = Some(router);
    }

    /// The shared router
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` before [`SessionStore::attach_router`] ran.
    pub fn router(&self) -> Result<Arc<dyn MediaRouter>> {
        self.router
            .read()
            .clone()
            .ok_or_else(|| Error::ResourceNotFound("router not initialized".to_string()))
    }

    /// Register a new connection with a fresh id
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` when the connection limit is reached.
    pub fn open(&self, outbound: mpsc::UnboundedSender<String>) -> Result<Arc<Connection>> {
        let mut connections = self.connections.write();
        if self.max_connections > 0 && connections.len() >= self.max_connections {
            return Err(Error::ValidationError(format!(
                "connection limit reached ({})",
                self.max_connections
            )));
        }

        let connection = Arc::new(Connection {
            id: Uuid::new_v4().to_string(),
            outbound,
            closing: AtomicBool::new(false),
            send_transport: Mutex::new(None),
            recv_transport: Mutex::new(None),
            opened_at: Instant::now(),
        });
        connections.insert(connection.id.clone(), Arc::clone(&connection));

        debug!(
            connection_id = %connection.id,
            total = connections.len(),
            "Connection registered"
        );
        Ok(connection)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(connection_id).cloned()
    }

    /// Look up a connection that still accepts new resources
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if the connection is gone or closing.
    pub fn live(&self, connection_id: &str) -> Result<Arc<Connection>> {
        match self.get(connection_id) {
            Some(connection) if !connection.is_closing() => Ok(connection),
            _ => Err(Error::ResourceNotFound(format!(
                "connection {} is closed",
                connection_id
            ))),
        }
    }

    /// Flag a connection as closing; new resources for it are rejected
    ///
    /// Returns the record only on the first call.
    pub fn begin_close(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let connection = self.get(connection_id)?;
        if connection.closing.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(connection)
    }

    /// Drop the connection record
    pub fn remove(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(connection_id);
        if removed.is_some() {
            debug!(connection_id, "Connection record removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.read().keys().cloned().collect()
    }

    /// Queue a message for one connection; false if it is unknown or gone
    pub fn send_to(&self, connection_id: &str, message: String) -> bool {
        match self.get(connection_id) {
            Some(connection) => connection.send(message),
            None => false,
        }
    }

    /// Queue a message for every connection except `origin`
    ///
    /// Returns how many connections it was queued for.
    pub fn broadcast_except(&self, origin: &str, message: &str) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .connections
            .read()
            .values()
            .filter(|connection| connection.id != origin && !connection.is_closing())
            .cloned()
            .collect();

        let mut delivered = 0;
        for connection in targets {
            if connection.send(message.to_string()) {
                delivered += 1;
            } else {
                warn!(connection_id = %connection.id, "Outbound queue closed, broadcast dropped");
            }
        }
        delivered
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(0)
    }
}
