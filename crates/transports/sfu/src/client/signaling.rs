//! WebSocket signaling client for the SFU JSON-RPC protocol
//!
//! One background task writes queued frames to the socket, another reads
//! replies and pushes. Replies are matched to callers by request id; pushes
//! fan out over a broadcast channel.

use crate::config::ClientConfig;
use crate::engine::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters};
use crate::session::RoomId;
use crate::signaling::protocol::{
    notifications, ConnectResult, ConnectTransportParams, ConsumeParams, ConsumeResult,
    ErrorObject, GetProducersParams, JsonRpcRequest, ProduceParams, ProduceResult,
    ProducerClosedParams, ProducerListing, SignalingMethod, TransportInfo,
};
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

const PUSH_CHANNEL_CAPACITY: usize = 64;

/// Unsolicited server notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPush {
    /// Some other connection produced; re-poll the listing
    NewProducer,

    /// A producer this connection consumes has closed
    ProducerClosed(ProducerClosedParams),
}

/// WebSocket signaling client for JSON-RPC 2.0 SFU signaling
pub struct SignalingClient {
    /// Signaling server URL
    url: String,

    /// Outgoing frame sender
    tx: mpsc::UnboundedSender<Message>,

    /// Callers waiting for a reply, by request id
    pending: PendingReplies,

    next_id: AtomicU64,

    pushes: broadcast::Sender<ServerPush>,

    request_timeout: Duration,

    /// Set once the socket is gone or `close` was called
    closed: Arc<AtomicBool>,
}

impl SignalingClient {
    /// Connect to the signaling server
    ///
    /// Establishes the WebSocket connection and starts the background tasks
    /// for sending and receiving frames.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        info!("Connecting to signaling server: {}", config.server_url);

        let (ws_stream, _) = connect_async(config.server_url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling server");

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (pushes, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(Self::sender_task(write, rx));
        tokio::spawn(Self::receiver_task(
            read,
            Arc::clone(&pending),
            pushes.clone(),
            Arc::clone(&closed),
        ));

        Ok(Self {
            url: config.server_url.clone(),
            tx,
            pending,
            next_id: AtomicU64::new(1),
            pushes,
            request_timeout: config.request_timeout(),
            closed,
        })
    }

    /// Server URL this client is connected to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the socket has gone away
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Subscribe to server pushes
    ///
    /// Only pushes received after this call are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerPush> {
        self.pushes.subscribe()
    }

    /// Send one request and wait for its reply
    ///
    /// Error replies are mapped back onto [`Error`] through their
    /// `data.kind`, so callers can match on `ResourceNotFound` and friends.
    pub async fn request<P, R>(&self, method: SignalingMethod, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if self.is_closed() {
            return Err(Error::SignalingError(format!(
                "{} failed: signaling connection is closed",
                method
            )));
        }

        let params = serde_json::to_value(params).map_err(|e| {
            Error::SerializationError(format!("Failed to encode {} params: {}", method, e))
        })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = JsonRpcRequest::new(method.as_str(), params, Some(json!(id))).to_json()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(id, reply_tx);

        debug!(id, %method, "Sending signaling request");
        if let Err(e) = self.tx.send(Message::Text(frame)) {
            self.pending.lock().remove(&id);
            return Err(Error::SignalingError(format!("Failed to send message: {}", e)));
        }

        let outcome = tokio::time::timeout(self.request_timeout, reply_rx).await;
        let result = match outcome {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(Error::SignalingError(format!(
                    "{} failed: connection closed before reply",
                    method
                )))
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(Error::OperationTimeout(format!(
                    "{} did not complete within {:?}",
                    method, self.request_timeout
                )));
            }
        };

        serde_json::from_value(result).map_err(|e| {
            Error::SerializationError(format!("Unexpected {} result: {}", method, e))
        })
    }

    pub async fn get_rtp_capabilities(&self) -> Result<RtpCapabilities> {
        self.request(SignalingMethod::GetRtpCapabilities, &json!({}))
            .await
    }

    pub async fn create_producer_transport(&self) -> Result<TransportInfo> {
        self.request(SignalingMethod::CreateProducerTransport, &json!({}))
            .await
    }

    pub async fn connect_producer_transport(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        let reply: ConnectResult = self
            .request(
                SignalingMethod::ConnectProducerTransport,
                &ConnectTransportParams { dtls_parameters },
            )
            .await?;
        expect_success(SignalingMethod::ConnectProducerTransport, reply)
    }

    /// Publish a track; returns the server-side producer id
    pub async fn produce(
        &self,
        kind: MediaKind,
        room_id: RoomId,
        rtp_parameters: RtpParameters,
    ) -> Result<String> {
        let reply: ProduceResult = self
            .request(
                SignalingMethod::Produce,
                &ProduceParams {
                    kind,
                    room_id,
                    rtp_parameters,
                },
            )
            .await?;
        Ok(reply.id)
    }

    pub async fn create_consumer_transport(&self) -> Result<TransportInfo> {
        self.request(SignalingMethod::CreateConsumerTransport, &json!({}))
            .await
    }

    pub async fn connect_consumer_transport(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        let reply: ConnectResult = self
            .request(
                SignalingMethod::ConnectConsumerTransport,
                &ConnectTransportParams { dtls_parameters },
            )
            .await?;
        expect_success(SignalingMethod::ConnectConsumerTransport, reply)
    }

    /// List producers; an empty slice lists every room
    pub async fn get_producers(&self, room_ids: &[RoomId]) -> Result<Vec<ProducerListing>> {
        self.request(
            SignalingMethod::GetProducers,
            &GetProducersParams {
                room_ids: room_ids.to_vec(),
            },
        )
        .await
    }

    pub async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumeResult> {
        self.request(
            SignalingMethod::Consume,
            &ConsumeParams {
                producer_id: producer_id.to_string(),
                rtp_capabilities,
            },
        )
        .await
    }

    /// Close the socket; the server tears down everything this connection owns
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Closing signaling connection to {}", self.url);
        self.tx
            .send(Message::Close(None))
            .map_err(|e| Error::SignalingError(format!("Failed to send close frame: {}", e)))
    }

    /// Sender task: sends frames from the channel to the WebSocket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if is_close {
                break;
            }
        }

        debug!("Sender task terminated");
    }

    /// Receiver task: routes replies to waiting callers and publishes pushes
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        pending: PendingReplies,
        pushes: broadcast::Sender<ServerPush>,
        closed: Arc<AtomicBool>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    if let Err(e) = Self::handle_message(&text, &pending, &pushes) {
                        warn!("Failed to handle signaling message: {}", e);
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection closed");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        closed.store(true, Ordering::Release);
        // Dropping the senders fails every outstanding call
        pending.lock().clear();
        debug!("Receiver task terminated");
    }

    fn handle_message(
        text: &str,
        pending: &PendingReplies,
        pushes: &broadcast::Sender<ServerPush>,
    ) -> Result<()> {
        debug!("Received signaling message: {}", text);

        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::SerializationError(format!("Invalid JSON frame: {}", e)))?;

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            let push = match method {
                notifications::NEW_PRODUCER => ServerPush::NewProducer,
                notifications::PRODUCER_CLOSED => {
                    let params = value.get("params").cloned().unwrap_or(Value::Null);
                    let params: ProducerClosedParams =
                        serde_json::from_value(params).map_err(|e| {
                            Error::SerializationError(format!(
                                "Invalid producerClosed payload: {}",
                                e
                            ))
                        })?;
                    ServerPush::ProducerClosed(params)
                }
                other => {
                    debug!("Ignoring unknown notification: {}", other);
                    return Ok(());
                }
            };
            // No subscribers is fine
            let _ = pushes.send(push);
            return Ok(());
        }

        let Some(id) = value.get("id").and_then(Value::as_u64) else {
            return Err(Error::SignalingError(format!(
                "Reply without a usable id: {}",
                text
            )));
        };
        let Some(waiter) = pending.lock().remove(&id) else {
            debug!(id, "Reply for a request nobody is waiting on");
            return Ok(());
        };

        let outcome = if let Some(error) = value.get("error") {
            let error: ErrorObject = serde_json::from_value(error.clone()).map_err(|e| {
                Error::SerializationError(format!("Invalid error object: {}", e))
            })?;
            Err(error.into_error())
        } else {
            Ok(value.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = waiter.send(outcome);
        Ok(())
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn expect_success(method: SignalingMethod, reply: ConnectResult) -> Result<()> {
    if reply.success {
        Ok(())
    } else {
        Err(Error::SignalingError(format!(
            "{} reported success=false",
            method
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_with(id: u64) -> (PendingReplies, oneshot::Receiver<Result<Value>>) {
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().insert(id, tx);
        (pending, rx)
    }

    #[tokio::test]
    async fn test_reply_routed_by_id() {
        let (pending, rx) = pending_with(7);
        let (pushes, _) = broadcast::channel(4);

        SignalingClient::handle_message(
            r#"{"jsonrpc":"2.0","result":{"id":"p1"},"id":7}"#,
            &pending,
            &pushes,
        )
        .unwrap();

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, json!({"id": "p1"}));
        assert!(pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_error_reply_keeps_kind() {
        let (pending, rx) = pending_with(3);
        let (pushes, _) = broadcast::channel(4);

        SignalingClient::handle_message(
            r#"{"jsonrpc":"2.0","error":{"code":-32012,"message":"producer gone","data":{"kind":"ResourceNotFound"}},"id":3}"#,
            &pending,
            &pushes,
        )
        .unwrap();

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound(_)));
    }

    #[test]
    fn test_pushes_are_published() {
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let (pushes, mut rx) = broadcast::channel(4);

        SignalingClient::handle_message(r#"{"jsonrpc":"2.0","method":"newProducer"}"#, &pending, &pushes)
            .unwrap();
        SignalingClient::handle_message(
            r#"{"jsonrpc":"2.0","method":"producerClosed","params":{"producerId":"p1","connectionId":"c1"}}"#,
            &pending,
            &pushes,
        )
        .unwrap();

        assert_eq!(rx.try_recv().unwrap(), ServerPush::NewProducer);
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerPush::ProducerClosed(ProducerClosedParams {
                producer_id: "p1".to_string(),
                connection_id: "c1".to_string(),
            })
        );
    }

    #[test]
    fn test_unmatched_reply_is_ignored() {
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let (pushes, _) = broadcast::channel(4);
        assert!(SignalingClient::handle_message(
            r#"{"jsonrpc":"2.0","result":{},"id":99}"#,
            &pending,
            &pushes
        )
        .is_ok());
        assert!(SignalingClient::handle_message("not json", &pending, &pushes).is_err());
    }
}
