//! Signaling request dispatch
//!
//! Turns one JSON-RPC request into exactly one reply. Every request runs
//! inside the configured timeout envelope; panics inside a request are caught
//! and answered with an internal error. Disconnect teardown lives here too.

use super::events::{EventSink, SfuEvent};
use super::protocol::{
    error_codes, ConnectResult, ConnectTransportParams, ConsumeParams, ConsumeResult,
    GetProducersParams, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ProduceParams,
    ProduceResult, SignalingMethod,
};
use crate::config::SfuConfig;
use crate::engine::{EngineConsumer, MediaRouter};
use crate::registry::{ConsumerRegistry, ProducerRegistry};
use crate::session::{Connection, SessionStore};
use crate::transport::{TransportManager, TransportRole};
use crate::{Error, Result};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// State shared by every signaling connection
pub struct SharedState {
    pub config: Arc<SfuConfig>,
    pub store: Arc<SessionStore>,
    pub transports: TransportManager,
    pub producers: Arc<ProducerRegistry>,
    pub consumers: Arc<ConsumerRegistry>,
    /// Optional event sender for embedders and supervision
    pub events: EventSink,
}

impl SharedState {
    /// Create new shared state without event forwarding
    pub fn new(config: Arc<SfuConfig>) -> Self {
        Self::new_with_events(config, None)
    }

    /// Create new shared state with optional event forwarding
    pub fn new_with_events(config: Arc<SfuConfig>, event_tx: Option<mpsc::Sender<SfuEvent>>) -> Self {
        let events = EventSink::new(event_tx);
        let store = Arc::new(SessionStore::new(config.max_connections as usize));
        let consumers = Arc::new(ConsumerRegistry::new(Arc::clone(&store), events.clone()));
        let producers = Arc::new(ProducerRegistry::new(
            Arc::clone(&store),
            Arc::clone(&consumers),
            events.clone(),
        ));
        let transports = TransportManager::new(Arc::clone(&store), config.transport_options());

        Self {
            config,
            store,
            transports,
            producers,
            consumers,
            events,
        }
    }

    /// Install the router all transports are created on
    pub fn attach_router(&self, router: Arc<dyn MediaRouter>) {
        self.store.attach_router(router);
    }

    /// Emit an event if event forwarding is configured
    pub fn emit_event(&self, event: SfuEvent) {
        self.events.emit(event);
    }
}

/// Work to run after the reply has been queued
pub enum FollowUp {
    /// Start media flow on a consumer created paused
    ResumeConsumer(Arc<dyn EngineConsumer>),
}

/// Successful outcome of one request
pub struct Dispatch {
    pub result: Value,
    pub follow_up: Option<FollowUp>,
}

impl Dispatch {
    fn reply<T: Serialize>(result: &T) -> Result<Self> {
        let result = serde_json::to_value(result)
            .map_err(|e| Error::SerializationError(format!("Failed to encode result: {}", e)))?;
        Ok(Self {
            result,
            follow_up: None,
        })
    }

    fn then(mut self, follow_up: FollowUp) -> Self {
        self.follow_up = Some(follow_up);
        self
    }
}

/// Run one request against the shared state
pub async fn dispatch(
    state: &SharedState,
    connection_id: &str,
    method: SignalingMethod,
    request: &JsonRpcRequest,
) -> Result<Dispatch> {
    match method {
        SignalingMethod::GetRtpCapabilities => {
            let router = state.store.router()?;
            Dispatch::reply(&router.rtp_capabilities())
        }
        SignalingMethod::CreateProducerTransport => {
            let info = state
                .transports
                .create_transport(connection_id, TransportRole::Send)
                .await?;
            Dispatch::reply(&info)
        }
        SignalingMethod::CreateConsumerTransport => {
            let info = state
                .transports
                .create_transport(connection_id, TransportRole::Receive)
                .await?;
            Dispatch::reply(&info)
        }
        SignalingMethod::ConnectProducerTransport => {
            let params: ConnectTransportParams = request.params()?;
            state
                .transports
                .connect(connection_id, TransportRole::Send, params.dtls_parameters)
                .await?;
            Dispatch::reply(&ConnectResult { success: true })
        }
        SignalingMethod::ConnectConsumerTransport => {
            let params: ConnectTransportParams = request.params()?;
            state
                .transports
                .connect(connection_id, TransportRole::Receive, params.dtls_parameters)
                .await?;
            Dispatch::reply(&ConnectResult { success: true })
        }
        SignalingMethod::Produce => {
            let params: ProduceParams = request.params()?;
            let id = state.producers.produce(connection_id, params).await?;
            Dispatch::reply(&ProduceResult { id })
        }
        SignalingMethod::GetProducers => {
            let params: GetProducersParams = request.params()?;
            Dispatch::reply(&state.producers.list_producers(&params.room_ids))
        }
        SignalingMethod::Consume => {
            let params: ConsumeParams = request.params()?;
            let consumer = state
                .consumers
                .consume(
                    connection_id,
                    &params.producer_id,
                    &params.rtp_capabilities,
                    &state.producers,
                )
                .await?;
            let result = ConsumeResult {
                id: consumer.id().to_string(),
                producer_id: consumer.producer_id().to_string(),
                kind: consumer.kind(),
                rtp_parameters: consumer.rtp_parameters(),
            };
            Ok(Dispatch::reply(&result)?.then(FollowUp::ResumeConsumer(consumer)))
        }
    }
}

/// Answer one request on `connection`, then run its follow-up
pub async fn handle_request(
    state: Arc<SharedState>,
    connection: Arc<Connection>,
    request: JsonRpcRequest,
) {
    let Some(id) = request.id.clone() else {
        debug!(
            connection_id = connection.id(),
            method = %request.method,
            "Ignoring client notification"
        );
        return;
    };

    let Some(method) = SignalingMethod::from_name(&request.method) else {
        let reply = JsonRpcError::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Unknown method: {}", request.method),
            id,
        );
        send_reply(&connection, reply.to_json());
        return;
    };

    let timeout = state.config.request_timeout();
    let work = AssertUnwindSafe(dispatch(&state, connection.id(), method, &request)).catch_unwind();
    let outcome = match tokio::time::timeout(timeout, work).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_panic)) => {
            error!(connection_id = connection.id(), %method, "Request handler panicked");
            Err(Error::InternalError(format!("{} failed unexpectedly", method)))
        }
        Err(_elapsed) => Err(Error::OperationTimeout(format!(
            "{} did not complete within {}ms",
            method,
            timeout.as_millis()
        ))),
    };

    match outcome {
        Ok(done) => {
            send_reply(&connection, JsonRpcResponse::new(done.result, id).to_json());
            if let Some(follow_up) = done.follow_up {
                run_follow_up(connection.id(), follow_up).await;
            }
        }
        Err(e) => {
            if e.is_benign_race() {
                debug!(connection_id = connection.id(), %method, error = %e, "Request failed");
            } else {
                warn!(connection_id = connection.id(), %method, error = %e, "Request failed");
            }
            send_reply(&connection, JsonRpcError::from_error(&e, id).to_json());
        }
    }
}

fn send_reply(connection: &Connection, encoded: Result<String>) {
    match encoded {
        Ok(text) => {
            if !connection.send(text) {
                debug!(connection_id = connection.id(), "Reply dropped, connection gone");
            }
        }
        Err(e) => error!(connection_id = connection.id(), error = %e, "Failed to encode reply"),
    }
}

async fn run_follow_up(connection_id: &str, follow_up: FollowUp) {
    match follow_up {
        FollowUp::ResumeConsumer(consumer) => match consumer.resume().await {
            Ok(()) => debug!(connection_id, consumer_id = consumer.id(), "Consumer resumed"),
            Err(e) => warn!(
                connection_id,
                consumer_id = consumer.id(),
                error = %e,
                "Failed to resume consumer"
            ),
        },
    }
}

/// Tear down everything a connection owns and drop its record
///
/// Runs transports, producers, consumers in that order with no suspension
/// point. Callers flag the connection closing and drain its in-flight
/// requests first.
pub fn teardown_connection(state: &SharedState, connection_id: &str, reason: Option<String>) {
    let Some(connection) = state.store.get(connection_id) else {
        return;
    };

    info!(connection_id, uptime_ms = connection.uptime().as_millis() as u64, "Cleaning up connection");
    state.transports.teardown(&connection);
    state.producers.teardown(connection_id);
    state.consumers.teardown(connection_id);
    state.store.remove(connection_id);

    state.emit_event(SfuEvent::connection_closed(connection_id, reason));
}
