//! JSON-RPC 2.0 signaling protocol types

use crate::engine::{
    DtlsParameters, IceCandidates, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
};
use crate::session::RoomId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 protocol version
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request (or notification when `id` is absent)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Method name to invoke
    pub method: String,

    /// Method parameters
    #[serde(default)]
    pub params: Value,

    /// Request ID for matching with response (absent for notifications)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response (success)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Result data
    pub result: Value,

    /// Request ID this response corresponds to
    pub id: Value,
}

/// JSON-RPC 2.0 error response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Error details
    pub error: ErrorObject,

    /// Request ID this error corresponds to
    pub id: Value,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Error code
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional error data (`{"kind": <taxonomy name>}` for SFU errors)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Taxonomy name from `data.kind`, if present
    pub fn kind(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|data| data.get("kind"))
            .and_then(Value::as_str)
    }

    /// Map a remote error reply back onto the local error taxonomy
    pub fn into_error(self) -> crate::Error {
        use crate::Error;

        match self.kind() {
            Some("ValidationError") => Error::ValidationError(self.message),
            Some("CapabilityMismatch") => Error::CapabilityMismatch(self.message),
            Some("ResourceNotFound") => Error::ResourceNotFound(self.message),
            Some("OperationTimeout") => Error::OperationTimeout(self.message),
            _ => Error::SignalingError(format!("{} (code {})", self.message, self.code)),
        }
    }
}

/// Server push (JSON-RPC notification, no `id`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcNotification {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Notification name
    pub method: String,

    /// Notification payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 error codes
pub mod error_codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i32 = -32700;

    /// The JSON sent is not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;

    /// The method does not exist / is not available
    pub const METHOD_NOT_FOUND: i32 = -32601;

    /// Invalid method parameter(s)
    pub const INVALID_PARAMS: i32 = -32602;

    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i32 = -32603;

    // SFU-specific error codes

    /// Missing transport/producer reference or malformed blob
    pub const VALIDATION_ERROR: i32 = -32010;

    /// Consumer capabilities cannot receive the producer
    pub const CAPABILITY_MISMATCH: i32 = -32011;

    /// Producer, transport, router or connection vanished
    pub const RESOURCE_NOT_FOUND: i32 = -32012;

    /// Request exceeded its timeout envelope
    pub const OPERATION_TIMEOUT: i32 = -32013;
}

/// Request methods understood by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingMethod {
    GetRtpCapabilities,
    CreateProducerTransport,
    ConnectProducerTransport,
    Produce,
    CreateConsumerTransport,
    ConnectConsumerTransport,
    GetProducers,
    Consume,
}

impl SignalingMethod {
    pub const ALL: [SignalingMethod; 8] = [
        SignalingMethod::GetRtpCapabilities,
        SignalingMethod::CreateProducerTransport,
        SignalingMethod::ConnectProducerTransport,
        SignalingMethod::Produce,
        SignalingMethod::CreateConsumerTransport,
        SignalingMethod::ConnectConsumerTransport,
        SignalingMethod::GetProducers,
        SignalingMethod::Consume,
    ];

    /// Wire name of the method
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalingMethod::GetRtpCapabilities => "getRtpCapabilities",
            SignalingMethod::CreateProducerTransport => "createProducerTransport",
            SignalingMethod::ConnectProducerTransport => "connectProducerTransport",
            SignalingMethod::Produce => "produce",
            SignalingMethod::CreateConsumerTransport => "createConsumerTransport",
            SignalingMethod::ConnectConsumerTransport => "connectConsumerTransport",
            SignalingMethod::GetProducers => "getProducers",
            SignalingMethod::Consume => "consume",
        }
    }

    /// Parse a wire method name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|method| method.as_str() == name)
    }
}

impl std::fmt::Display for SignalingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server push names
pub mod notifications {
    /// Re-poll hint sent to every other connection after a produce
    pub const NEW_PRODUCER: &str = "newProducer";

    /// Sent to a consumer's owner when the source producer closes
    pub const PRODUCER_CLOSED: &str = "producerClosed";
}

/// Result of createProducerTransport / createConsumerTransport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: IceCandidates,
    pub dtls_parameters: DtlsParameters,
}

/// Parameters for connectProducerTransport / connectConsumerTransport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportParams {
    pub dtls_parameters: DtlsParameters,
}

/// Result of a transport connect
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConnectResult {
    pub success: bool,
}

/// Parameters for produce
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProduceParams {
    pub kind: MediaKind,
    pub room_id: RoomId,
    pub rtp_parameters: RtpParameters,
}

/// Result of produce
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProduceResult {
    pub id: String,
}

/// Parameters for getProducers; absent or empty `roomIds` lists every room
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GetProducersParams {
    pub room_ids: Vec<RoomId>,
}

/// One stream of a listed peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub kind: MediaKind,
    pub producer_id: String,
}

/// One peer in a getProducers listing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProducerListing {
    pub connection_id: String,
    pub streams: Vec<StreamInfo>,
}

/// Parameters for consume
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeParams {
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
}

/// Result of consume
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResult {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Payload of the producerClosed push
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosedParams {
    pub producer_id: String,
    /// Connection that owned the producer
    pub connection_id: String,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request
    pub fn new(method: &str, params: Value, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize JSON-RPC request: {}", e))
        })
    }

    /// Parse from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize JSON-RPC request: {}",
                e
            ))
        })
    }

    /// Decode `params` into a typed parameter struct
    pub fn params<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        let params = if self.params.is_null() {
            Value::Object(Default::default())
        } else {
            self.params.clone()
        };
        serde_json::from_value(params).map_err(|e| {
            crate::Error::SerializationError(format!("Invalid params for {}: {}", self.method, e))
        })
    }
}

impl JsonRpcResponse {
    /// Create a new JSON-RPC response
    pub fn new(result: Value, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize JSON-RPC response: {}",
                e
            ))
        })
    }
}

impl JsonRpcError {
    /// Create a new JSON-RPC error
    pub fn new(code: i32, message: String, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            error: ErrorObject {
                code,
                message,
                data: None,
            },
            id,
        }
    }

    /// Create a new JSON-RPC error with data
    pub fn with_data(code: i32, message: String, data: Value, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            error: ErrorObject {
                code,
                message,
                data: Some(data),
            },
            id,
        }
    }

    /// Error reply for an SFU error, tagged with its taxonomy name
    pub fn from_error(error: &crate::Error, id: Value) -> Self {
        Self::with_data(
            error.rpc_code(),
            error.to_string(),
            serde_json::json!({ "kind": error.kind() }),
            id,
        )
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize JSON-RPC error: {}", e))
        })
    }
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }

    /// The newProducer re-poll hint
    pub fn new_producer() -> Self {
        Self::new(notifications::NEW_PRODUCER, None)
    }

    /// The producerClosed push for one consumer owner
    pub fn producer_closed(producer_id: &str, connection_id: &str) -> Self {
        let params = ProducerClosedParams {
            producer_id: producer_id.to_string(),
            connection_id: connection_id.to_string(),
        };
        Self::new(
            notifications::PRODUCER_CLOSED,
            serde_json::to_value(params).ok(),
        )
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize JSON-RPC notification: {}",
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_names_round_trip() {
        for method in SignalingMethod::ALL {
            assert_eq!(SignalingMethod::from_name(method.as_str()), Some(method));
        }
        assert_eq!(SignalingMethod::from_name("joinRoom"), None);
    }

    #[test]
    fn test_produce_params_accept_numeric_room() {
        let request = JsonRpcRequest::new(
            "produce",
            json!({"kind": "video", "roomId": 1, "rtpParameters": {"codecs": []}}),
            Some(json!(7)),
        );
        let params: ProduceParams = request.params().unwrap();
        assert_eq!(params.kind, MediaKind::Video);
        assert_eq!(params.room_id, RoomId::new("1"));
    }

    #[test]
    fn test_get_producers_params_default_to_all_rooms() {
        let request = JsonRpcRequest::new("getProducers", Value::Null, Some(json!(1)));
        let params: GetProducersParams = request.params().unwrap();
        assert!(params.room_ids.is_empty());

        let request =
            JsonRpcRequest::new("getProducers", json!({"roomIds": ["a", 2]}), Some(json!(2)));
        let params: GetProducersParams = request.params().unwrap();
        assert_eq!(params.room_ids, vec![RoomId::new("a"), RoomId::new("2")]);
    }

    #[test]
    fn test_missing_params_is_serialization_error() {
        let request = JsonRpcRequest::new("consume", json!({"producerId": "p1"}), Some(json!(1)));
        let result: crate::Result<ConsumeParams> = request.params();
        assert!(matches!(result, Err(crate::Error::SerializationError(_))));
    }

    #[test]
    fn test_request_without_params_parses() {
        let request =
            JsonRpcRequest::from_json(r#"{"jsonrpc":"2.0","method":"getRtpCapabilities","id":"a"}"#)
                .unwrap();
        assert_eq!(request.params, Value::Null);
        assert_eq!(request.id, Some(json!("a")));
    }

    #[test]
    fn test_error_reply_carries_kind() {
        let err = crate::Error::CapabilityMismatch("no vp8".to_string());
        let reply = JsonRpcError::from_error(&err, json!(3));
        assert_eq!(reply.error.code, error_codes::CAPABILITY_MISMATCH);
        assert_eq!(reply.error.kind(), Some("CapabilityMismatch"));

        let wire: Value = serde_json::from_str(&reply.to_json().unwrap()).unwrap();
        assert_eq!(wire["error"]["data"]["kind"], json!("CapabilityMismatch"));
        assert_eq!(wire["id"], json!(3));
    }

    #[test]
    fn test_remote_error_maps_to_taxonomy() {
        let reply = JsonRpcError::from_error(
            &crate::Error::ResourceNotFound("producer p1".to_string()),
            json!(1),
        );
        let err = reply.error.into_error();
        assert!(err.is_benign_race());

        let unknown = ErrorObject {
            code: error_codes::METHOD_NOT_FOUND,
            message: "Unknown method: joinRoom".to_string(),
            data: None,
        };
        assert!(matches!(unknown.into_error(), crate::Error::SignalingError(_)));
    }

    #[test]
    fn test_notifications_have_no_id() {
        let hint: Value =
            serde_json::from_str(&JsonRpcNotification::new_producer().to_json().unwrap()).unwrap();
        assert_eq!(hint["method"], json!("newProducer"));
        assert!(hint.get("id").is_none());
        assert!(hint.get("params").is_none());

        let closed: Value = serde_json::from_str(
            &JsonRpcNotification::producer_closed("p1", "conn-a")
                .to_json()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(closed["params"], json!({"producerId": "p1", "connectionId": "conn-a"}));
    }

    #[test]
    fn test_listing_wire_shape() {
        let listing = ProducerListing {
            connection_id: "conn-a".to_string(),
            streams: vec![StreamInfo {
                kind: MediaKind::Audio,
                producer_id: "p2".to_string(),
            }],
        };
        assert_eq!(
            serde_json::to_value(&listing).unwrap(),
            json!({"connectionId": "conn-a", "streams": [{"kind": "audio", "producerId": "p2"}]})
        );
    }
}
