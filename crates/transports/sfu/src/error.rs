//! Error types for the SFU signaling core

use crate::signaling::protocol::error_codes;

/// Result type alias using the SFU Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in SFU session and signaling operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid transport/producer reference or malformed request blob
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The engine rejected the consumer's RTP capabilities for this producer
    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    /// Producer, transport or router vanished (usually a benign race)
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// The forwarding engine process died
    #[error("Media engine died: {0}")]
    EngineFatal(String),

    /// Non-fatal failure reported by the forwarding engine
    #[error("Engine error: {0}")]
    EngineError(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Request did not complete within its timeout envelope
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// Signaling protocol error (unexpected reply, closed channel)
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Taxonomy name carried in the `data.kind` field of error replies
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ValidationError(_) => "ValidationError",
            Error::CapabilityMismatch(_) => "CapabilityMismatch",
            Error::ResourceNotFound(_) => "ResourceNotFound",
            Error::EngineFatal(_) => "EngineFatal",
            Error::EngineError(_) => "EngineError",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::OperationTimeout(_) => "OperationTimeout",
            Error::SignalingError(_) => "SignalingError",
            Error::WebSocketError(_) => "WebSocketError",
            Error::SerializationError(_) => "SerializationError",
            Error::InternalError(_) | Error::IoError(_) | Error::Other(_) => "InternalError",
        }
    }

    /// JSON-RPC error code used when this error is sent as a reply
    pub fn rpc_code(&self) -> i32 {
        match self {
            Error::ValidationError(_) => error_codes::VALIDATION_ERROR,
            Error::CapabilityMismatch(_) => error_codes::CAPABILITY_MISMATCH,
            Error::ResourceNotFound(_) => error_codes::RESOURCE_NOT_FOUND,
            Error::OperationTimeout(_) => error_codes::OPERATION_TIMEOUT,
            Error::SerializationError(_) => error_codes::INVALID_PARAMS,
            _ => error_codes::INTERNAL_ERROR,
        }
    }

    /// Check if this error must escalate to process supervision
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::EngineFatal(_))
    }

    /// Check if this error is the expected list-then-consume race
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Error::ResourceNotFound(_))
    }
}
