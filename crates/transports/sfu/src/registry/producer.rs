//! Producer registry
//!
//! Active media sources indexed under `(room, connection, kind)`, so several
//! broadcasters can share a room. Listing is a snapshot read; every lookup
//! re-validates that the producer is still open.

use super::consumer::ConsumerRegistry;
use crate::engine::{EngineProducer, MediaKind, ProducerCloseReason};
use crate::session::{ConnectionId, RoomId, SessionStore};
use crate::signaling::events::{EventSink, SfuEvent};
use crate::signaling::protocol::{JsonRpcNotification, ProduceParams, ProducerListing, StreamInfo};
use crate::transport::TransportRole;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

type ProducerKey = (RoomId, ConnectionId, MediaKind);

/// A registered producer
#[derive(Clone)]
pub struct ProducerEntry {
    pub producer: Arc<dyn EngineProducer>,
    pub room_id: RoomId,
    pub connection_id: ConnectionId,
    pub kind: MediaKind,
    seq: u64,
}

impl ProducerEntry {
    pub fn id(&self) -> &str {
        self.producer.id()
    }

    fn is_open(&self) -> bool {
        self.producer.subscribe_closed().borrow().is_none()
    }
}

#[derive(Default)]
struct ProducerIndex {
    by_id: HashMap<String, ProducerEntry>,
    by_key: HashMap<ProducerKey, String>,
    /// Sequence number of each connection's first live producer
    first_produced: HashMap<ConnectionId, u64>,
    next_seq: u64,
}

impl ProducerIndex {
    fn insert(&mut self, mut entry: ProducerEntry) -> Option<ProducerEntry> {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.first_produced
            .entry(entry.connection_id.clone())
            .or_insert(entry.seq);

        let key = (entry.room_id.clone(), entry.connection_id.clone(), entry.kind);
        let replaced = self
            .by_key
            .insert(key, entry.id().to_string())
            .and_then(|previous| self.by_id.remove(&previous));
        self.by_id.insert(entry.id().to_string(), entry);
        replaced
    }

    fn remove(&mut self, producer_id: &str) -> Option<ProducerEntry> {
        let entry = self.by_id.remove(producer_id)?;
        let key = (entry.room_id.clone(), entry.connection_id.clone(), entry.kind);
        if self.by_key.get(&key).map(String::as_str) == Some(producer_id) {
            self.by_key.remove(&key);
        }
        if !self
            .by_id
            .values()
            .any(|other| other.connection_id == entry.connection_id)
        {
            self.first_produced.remove(&entry.connection_id);
        }
        Some(entry)
    }
}

/// Room-indexed producer registry
pub struct ProducerRegistry {
    store: Arc<SessionStore>,
    consumers: Arc<ConsumerRegistry>,
    events: EventSink,
    index: RwLock<ProducerIndex>,
}

impl ProducerRegistry {
    pub fn new(store: Arc<SessionStore>, consumers: Arc<ConsumerRegistry>, events: EventSink) -> Self {
        Self {
            store,
            consumers,
            events,
            index: RwLock::new(ProducerIndex::default()),
        }
    }

    /// Create a producer on the connection's send transport and index it
    ///
    /// A producer already registered under the same `(room, connection, kind)`
    /// is closed and replaced. Every other connection receives the
    /// `newProducer` hint.
    ///
    /// # Errors
    ///
    /// - `ValidationError` if `rtpParameters` is not an object or the
    ///   connection has no send transport
    /// - `ResourceNotFound` if the connection is closing
    pub async fn produce(self: &Arc<Self>, connection_id: &str, params: ProduceParams) -> Result<String> {
        params.rtp_parameters.validate()?;

        let connection = self.store.live(connection_id)?;
        let transport = connection.transport(TransportRole::Send).ok_or_else(|| {
            Error::ValidationError("connection has no send transport".to_string())
        })?;

        let producer = transport
            .engine()
            .produce(params.kind, params.rtp_parameters)
            .await?;

        if connection.is_closing() {
            producer.close();
            return Err(Error::ResourceNotFound(format!(
                "connection {} closed while producing",
                connection_id
            )));
        }

        let producer_id = producer.id().to_string();
        let entry = ProducerEntry {
            producer: Arc::clone(&producer),
            room_id: params.room_id.clone(),
            connection_id: connection_id.to_string(),
            kind: params.kind,
            seq: 0,
        };
        let replaced = self.index.write().insert(entry);
        if let Some(previous) = replaced {
            info!(
                connection_id,
                room_id = %params.room_id,
                kind = %params.kind,
                previous_producer_id = previous.id(),
                "Replacing existing producer"
            );
            self.retire(&previous);
        }

        self.watch_close(&producer);

        info!(
            connection_id,
            room_id = %params.room_id,
            producer_id = %producer_id,
            kind = %params.kind,
            "Producer created"
        );
        self.events.emit(SfuEvent::producer_added(
            connection_id,
            &params.room_id,
            &producer_id,
            params.kind,
        ));

        match JsonRpcNotification::new_producer().to_json() {
            Ok(hint) => {
                let notified = self.store.broadcast_except(connection_id, &hint);
                debug!(producer_id = %producer_id, notified, "Broadcast newProducer");
            }
            Err(e) => warn!(error = %e, "Failed to encode newProducer"),
        }

        Ok(producer_id)
    }

    /// Snapshot of producers in `room_ids` (every room when empty), grouped
    /// per connection
    ///
    /// Connections appear in the order they first produced; each
    /// connection's streams are listed video before audio.
    pub fn list_producers(&self, room_ids: &[RoomId]) -> Vec<ProducerListing> {
        let index = self.index.read();

        let mut grouped: BTreeMap<(u64, &str), Vec<&ProducerEntry>> = BTreeMap::new();
        for entry in index.by_id.values() {
            if !entry.is_open() {
                continue;
            }
            if !room_ids.is_empty() && !room_ids.contains(&entry.room_id) {
                continue;
            }
            let first = index
                .first_produced
                .get(&entry.connection_id)
                .copied()
                .unwrap_or(entry.seq);
            grouped
                .entry((first, entry.connection_id.as_str()))
                .or_default()
                .push(entry);
        }

        grouped
            .into_iter()
            .map(|((_, connection_id), mut entries)| {
                entries.sort_by_key(|entry| (entry.kind, entry.seq));
                ProducerListing {
                    connection_id: connection_id.to_string(),
                    streams: entries
                        .into_iter()
                        .map(|entry| StreamInfo {
                            kind: entry.kind,
                            producer_id: entry.id().to_string(),
                        })
                        .collect(),
                }
            })
            .collect()
    }

    /// Live lookup; `None` once the producer is gone or closed
    pub fn get(&self, producer_id: &str) -> Option<ProducerEntry> {
        self.index
            .read()
            .by_id
            .get(producer_id)
            .filter(|entry| entry.is_open())
            .cloned()
    }

    /// Remove and close every producer of a connection, closing dependent
    /// consumers with notification
    pub fn teardown(&self, connection_id: &str) {
        let removed: Vec<ProducerEntry> = {
            let mut index = self.index.write();
            let ids: Vec<String> = index
                .by_id
                .values()
                .filter(|entry| entry.connection_id == connection_id)
                .map(|entry| entry.id().to_string())
                .collect();
            ids.iter().filter_map(|id| index.remove(id)).collect()
        };

        if !removed.is_empty() {
            debug!(connection_id, count = removed.len(), "Closing producers");
        }
        for entry in &removed {
            self.retire(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.index.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close an entry already removed from the index
    fn retire(&self, entry: &ProducerEntry) {
        self.consumers.close_for_producer(entry.id());
        entry.producer.close();
        self.events
            .emit(SfuEvent::producer_removed(&entry.connection_id, entry.id()));
    }

    fn watch_close(self: &Arc<Self>, producer: &Arc<dyn EngineProducer>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let producer_id = producer.id().to_string();
        let mut closed = producer.subscribe_closed();

        tokio::spawn(async move {
            let reason = loop {
                if let Some(reason) = *closed.borrow_and_update() {
                    break reason;
                }
                if closed.changed().await.is_err() {
                    break ProducerCloseReason::Closed;
                }
            };

            let Some(registry) = registry.upgrade() else {
                return;
            };
            let removed = registry.index.write().remove(&producer_id);
            if let Some(entry) = removed {
                info!(
                    producer_id = %producer_id,
                    connection_id = %entry.connection_id,
                    ?reason,
                    "Producer closed"
                );
                registry.retire(&entry);
            }
        });
    }
}
