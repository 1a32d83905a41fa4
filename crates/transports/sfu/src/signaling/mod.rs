//! Signaling protocol, request dispatch and WebSocket server
//!
//! Clients speak JSON-RPC 2.0 over WebSocket text frames. Requests are
//! answered exactly once; `newProducer` and `producerClosed` are pushed as
//! notifications.

pub mod events;
pub mod handler;
pub mod protocol;
pub mod websocket;

pub use events::{EventSink, SfuEvent};
pub use handler::{teardown_connection, SharedState};
pub use protocol::{
    error_codes, ConsumeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ProducerListing, SignalingMethod, StreamInfo, TransportInfo,
};
pub use websocket::{WebSocketServerHandle, WebSocketSignalingServer};
