//! Per-connection WebSocket loop
//!
//! Reads JSON-RPC requests, runs each one as its own task, and forwards the
//! connection's outbound queue to the socket. On disconnect the in-flight
//! requests are aborted and drained before teardown runs.

use crate::signaling::events::SfuEvent;
use crate::signaling::handler::{handle_request, teardown_connection, SharedState};
use crate::signaling::protocol::{error_codes, JsonRpcError, JsonRpcRequest, JSONRPC_VERSION};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message, Result as WsResult,
    },
};
use tracing::{debug, error, info, warn};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle a single WebSocket connection until it closes or the server stops
pub async fn handle_connection(
    stream: TcpStream,
    state: Arc<SharedState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> WsResult<()> {
    let addr = stream.peer_addr()?;
    let ws_stream = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Channel for sending messages back to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let connection = match state.store.open(tx) {
        Ok(connection) => connection,
        Err(e) => {
            warn!("Rejecting WebSocket connection from {}: {}", addr, e);
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Again,
                    reason: e.to_string().into(),
                })))
                .await;
            return Ok(());
        }
    };
    let connection_id = connection.id().to_string();
    info!(connection_id = %connection_id, %addr, "WebSocket connection opened");
    state.emit_event(SfuEvent::connection_opened(&connection_id));

    // Task to forward messages from channel to WebSocket
    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_tx.send(Message::Text(msg)).await {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut in_flight: JoinSet<()> = JoinSet::new();
    let reason = loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => match parse_request(&text) {
                    Ok(request) => {
                        in_flight.spawn(handle_request(
                            Arc::clone(&state),
                            Arc::clone(&connection),
                            request,
                        ));
                    }
                    Err(reply) => {
                        if let Ok(json) = reply.to_json() {
                            connection.send(json);
                        }
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    break "WebSocket connection closed".to_string();
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(connection_id = %connection_id, "WebSocket error: {}", e);
                    break format!("WebSocket error: {}", e);
                }
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(connection_id = %connection_id, "Request task failed: {}", e);
                }
            }
            _ = shutdown_rx.recv() => {
                break "server shutting down".to_string();
            }
        }
    };

    // Cleanup on disconnect
    state.store.begin_close(&connection_id);
    in_flight.abort_all();
    while in_flight.join_next().await.is_some() {}
    drop(connection);

    teardown_connection(&state, &connection_id, Some(reason));

    // The writer exits once the last outbound sender is gone
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, forward_task).await.is_err() {
        debug!(connection_id = %connection_id, "WebSocket writer did not drain in time");
    }
    info!(connection_id = %connection_id, %addr, "WebSocket connection closed");

    Ok(())
}

/// Parse one text frame, or build the error reply for it
fn parse_request(text: &str) -> Result<JsonRpcRequest, JsonRpcError> {
    let value: Value = serde_json::from_str(text).map_err(|e| {
        JsonRpcError::new(
            error_codes::PARSE_ERROR,
            format!("Failed to parse JSON: {}", e),
            json!(null),
        )
    })?;

    let id = value.get("id").cloned().unwrap_or(json!(null));
    let request: JsonRpcRequest = serde_json::from_value(value).map_err(|e| {
        JsonRpcError::new(
            error_codes::INVALID_REQUEST,
            format!("Invalid JSON-RPC request: {}", e),
            id.clone(),
        )
    })?;

    if request.jsonrpc != JSONRPC_VERSION {
        return Err(JsonRpcError::new(
            error_codes::INVALID_REQUEST,
            format!("Unsupported jsonrpc version: {}", request.jsonrpc),
            id,
        ));
    }

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_has_null_id() {
        let reply = parse_request("{not json").unwrap_err();
        assert_eq!(reply.error.code, error_codes::PARSE_ERROR);
        assert_eq!(reply.id, Value::Null);
    }

    #[test]
    fn test_invalid_request_keeps_id() {
        let reply = parse_request(r#"{"jsonrpc":"2.0","id":9}"#).unwrap_err();
        assert_eq!(reply.error.code, error_codes::INVALID_REQUEST);
        assert_eq!(reply.id, json!(9));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let reply = parse_request(r#"{"jsonrpc":"1.0","method":"consume","id":1}"#).unwrap_err();
        assert_eq!(reply.error.code, error_codes::INVALID_REQUEST);
    }

    #[test]
    fn test_valid_request_parses() {
        let request =
            parse_request(r#"{"jsonrpc":"2.0","method":"getProducers","params":{"roomIds":[1]},"id":4}"#)
                .unwrap();
        assert_eq!(request.method, "getProducers");
    }
}
