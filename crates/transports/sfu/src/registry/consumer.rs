//! Consumer registry
//!
//! Media sinks indexed per connection and keyed by their source producer id.
//! An entry leaves the registry exactly once; whoever removes it for a
//! producer close sends the `producerClosed` push to the owning connection.

use super::producer::ProducerRegistry;
use crate::engine::{ConsumerCloseReason, EngineConsumer, RtpCapabilities};
use crate::session::{ConnectionId, SessionStore};
use crate::signaling::events::{EventSink, SfuEvent};
use crate::signaling::protocol::JsonRpcNotification;
use crate::transport::TransportRole;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

#[derive(Clone)]
struct ConsumerEntry {
    consumer: Arc<dyn EngineConsumer>,
    /// Connection that owns the source producer
    producer_owner: ConnectionId,
}

/// Per-connection consumer index
pub struct ConsumerRegistry {
    store: Arc<SessionStore>,
    events: EventSink,
    entries: RwLock<HashMap<ConnectionId, HashMap<String, ConsumerEntry>>>,
}

impl ConsumerRegistry {
    pub fn new(store: Arc<SessionStore>, events: EventSink) -> Self {
        Self {
            store,
            events,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Create a paused consumer of `producer_id` on the connection's receive
    /// transport
    ///
    /// The caller resumes the returned consumer once the reply is queued. A
    /// consumer this connection already holds for the same producer is closed
    /// and replaced.
    ///
    /// # Errors
    ///
    /// - `ResourceNotFound` if the producer is no longer registered
    /// - `CapabilityMismatch` if the router rejects the capabilities; no
    ///   consumer is created
    /// - `ValidationError` if the connection has no receive transport
    pub async fn consume(
        self: &Arc<Self>,
        connection_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        producers: &ProducerRegistry,
    ) -> Result<Arc<dyn EngineConsumer>> {
        rtp_capabilities.validate()?;

        let producer = producers
            .get(producer_id)
            .ok_or_else(|| Error::ResourceNotFound(format!("producer {}", producer_id)))?;

        let router = self.store.router()?;
        if !router.can_consume(producer_id, rtp_capabilities) {
            return Err(Error::CapabilityMismatch(format!(
                "cannot consume producer {} with the given RTP capabilities",
                producer_id
            )));
        }

        let connection = self.store.live(connection_id)?;
        let transport = connection.transport(TransportRole::Receive).ok_or_else(|| {
            Error::ValidationError("connection has no receive transport".to_string())
        })?;

        let consumer = transport
            .engine()
            .consume(producer_id, rtp_capabilities, true)
            .await?;

        if connection.is_closing() {
            consumer.close();
            return Err(Error::ResourceNotFound(format!(
                "connection {} closed while consuming",
                connection_id
            )));
        }

        let entry = ConsumerEntry {
            consumer: Arc::clone(&consumer),
            producer_owner: producer.connection_id.clone(),
        };
        let replaced = self
            .entries
            .write()
            .entry(connection_id.to_string())
            .or_default()
            .insert(producer_id.to_string(), entry);
        if let Some(previous) = replaced {
            debug!(
                connection_id,
                producer_id,
                previous_consumer_id = previous.consumer.id(),
                "Replacing existing consumer"
            );
            previous.consumer.close();
        }

        self.watch_close(connection_id, &consumer);

        info!(
            connection_id,
            consumer_id = consumer.id(),
            producer_id,
            kind = %consumer.kind(),
            "Consumer created (paused)"
        );
        self.events.emit(SfuEvent::consumer_added(
            connection_id,
            consumer.id(),
            producer_id,
        ));
        Ok(consumer)
    }

    /// Close every consumer of `producer_id` and notify each owner once
    pub fn close_for_producer(&self, producer_id: &str) {
        let removed: Vec<(ConnectionId, ConsumerEntry)> = {
            let mut entries = self.entries.write();
            entries
                .iter_mut()
                .filter_map(|(connection_id, consumers)| {
                    consumers
                        .remove(producer_id)
                        .map(|entry| (connection_id.clone(), entry))
                })
                .collect()
        };

        for (connection_id, entry) in removed {
            entry.consumer.close();
            self.notify_producer_closed(&connection_id, producer_id, &entry.producer_owner);
        }
    }

    /// Close and forget every consumer of a connection without notification
    pub fn teardown(&self, connection_id: &str) {
        let removed = self.entries.write().remove(connection_id);
        let Some(consumers) = removed else {
            return;
        };

        debug!(connection_id, count = consumers.len(), "Closing consumers");
        for entry in consumers.into_values() {
            entry.consumer.close();
        }
    }

    /// Consumer ids held by a connection
    pub fn consumer_ids(&self, connection_id: &str) -> Vec<String> {
        self.entries
            .read()
            .get(connection_id)
            .map(|consumers| {
                consumers
                    .values()
                    .map(|entry| entry.consumer.id().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total consumers across all connections
    pub fn len(&self) -> usize {
        self.entries.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the entry only if it still holds `consumer_id`
    fn remove_if_current(
        &self,
        connection_id: &str,
        producer_id: &str,
        consumer_id: &str,
    ) -> Option<ConsumerEntry> {
        let mut entries = self.entries.write();
        let consumers = entries.get_mut(connection_id)?;
        if consumers.get(producer_id)?.consumer.id() != consumer_id {
            return None;
        }
        let entry = consumers.remove(producer_id);
        if consumers.is_empty() {
            entries.remove(connection_id);
        }
        entry
    }

    fn notify_producer_closed(&self, connection_id: &str, producer_id: &str, owner: &str) {
        let message = match JsonRpcNotification::producer_closed(producer_id, owner).to_json() {
            Ok(message) => message,
            Err(e) => {
                warn!(connection_id, producer_id, error = %e, "Failed to encode producerClosed");
                return;
            }
        };
        if self.store.send_to(connection_id, message) {
            debug!(connection_id, producer_id, "Sent producerClosed");
        }
    }

    fn watch_close(self: &Arc<Self>, connection_id: &str, consumer: &Arc<dyn EngineConsumer>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let connection_id = connection_id.to_string();
        let consumer_id = consumer.id().to_string();
        let producer_id = consumer.producer_id().to_string();
        let mut closed = consumer.subscribe_closed();

        tokio::spawn(async move {
            let reason = loop {
                if let Some(reason) = *closed.borrow_and_update() {
                    break reason;
                }
                if closed.changed().await.is_err() {
                    break ConsumerCloseReason::Closed;
                }
            };

            let Some(registry) = registry.upgrade() else {
                return;
            };
            let Some(entry) = registry.remove_if_current(&connection_id, &producer_id, &consumer_id)
            else {
                return;
            };

            match reason {
                ConsumerCloseReason::ProducerClosed => {
                    registry.notify_producer_closed(
                        &connection_id,
                        &producer_id,
                        &entry.producer_owner,
                    );
                }
                ConsumerCloseReason::TransportClosed | ConsumerCloseReason::Closed => {
                    debug!(
                        connection_id = %connection_id,
                        consumer_id = %consumer_id,
                        ?reason,
                        "Consumer removed"
                    );
                }
            }
        });
    }
}
