//! SFU event bridge
//!
//! Lifecycle events flow from the signaling core to an embedder (or to the
//! server binary's supervisor) over an optional channel.

use crate::engine::MediaKind;
use crate::session::RoomId;
use tokio::sync::mpsc;
use tracing::warn;

/// Bridge events emitted by the signaling core
#[derive(Debug, Clone, PartialEq)]
pub enum SfuEvent {
    /// A WebSocket was accepted and registered
    ConnectionOpened {
        connection_id: String,
    },

    /// A connection finished teardown and its record was removed
    ConnectionClosed {
        connection_id: String,
        /// Optional close reason
        reason: Option<String>,
    },

    /// A producer was registered under `(room, connection, kind)`
    ProducerAdded {
        connection_id: String,
        room_id: RoomId,
        producer_id: String,
        kind: MediaKind,
    },

    /// A producer left the registry
    ProducerRemoved {
        connection_id: String,
        producer_id: String,
    },

    /// A consumer was created for a producer
    ConsumerAdded {
        connection_id: String,
        consumer_id: String,
        producer_id: String,
    },

    /// The engine worker died; the process is expected to exit
    EngineDied {
        /// Worker process id
        pid: u32,
        reason: String,
    },
}

impl SfuEvent {
    pub fn connection_opened(connection_id: &str) -> Self {
        Self::ConnectionOpened {
            connection_id: connection_id.to_string(),
        }
    }

    pub fn connection_closed(connection_id: &str, reason: Option<String>) -> Self {
        Self::ConnectionClosed {
            connection_id: connection_id.to_string(),
            reason,
        }
    }

    pub fn producer_added(
        connection_id: &str,
        room_id: &RoomId,
        producer_id: &str,
        kind: MediaKind,
    ) -> Self {
        Self::ProducerAdded {
            connection_id: connection_id.to_string(),
            room_id: room_id.clone(),
            producer_id: producer_id.to_string(),
            kind,
        }
    }

    pub fn producer_removed(connection_id: &str, producer_id: &str) -> Self {
        Self::ProducerRemoved {
            connection_id: connection_id.to_string(),
            producer_id: producer_id.to_string(),
        }
    }

    pub fn consumer_added(connection_id: &str, consumer_id: &str, producer_id: &str) -> Self {
        Self::ConsumerAdded {
            connection_id: connection_id.to_string(),
            consumer_id: consumer_id.to_string(),
            producer_id: producer_id.to_string(),
        }
    }

    pub fn engine_died(pid: u32, reason: &str) -> Self {
        Self::EngineDied {
            pid,
            reason: reason.to_string(),
        }
    }

    /// Connection the event concerns, if any
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            Self::ConnectionOpened { connection_id }
            | Self::ConnectionClosed { connection_id, .. }
            | Self::ProducerAdded { connection_id, .. }
            | Self::ProducerRemoved { connection_id, .. }
            | Self::ConsumerAdded { connection_id, .. } => Some(connection_id),
            Self::EngineDied { .. } => None,
        }
    }
}

/// Optional event sender shared by the handler and the registries
///
/// Emission never blocks: registries emit from synchronous teardown paths, so
/// a full channel drops the event with a warning.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<SfuEvent>>,
}

impl EventSink {
    pub fn new(tx: Option<mpsc::Sender<SfuEvent>>) -> Self {
        Self { tx }
    }

    /// A sink that drops everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn emit(&self, event: SfuEvent) {
        if let Some(ref tx) = self.tx {
            if let Err(e) = tx.try_send(event) {
                warn!("Failed to emit SFU event: {}", e);
            }
        }
    }
}
