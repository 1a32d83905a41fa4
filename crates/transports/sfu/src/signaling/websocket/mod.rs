//! WebSocket signaling server for the JSON-RPC 2.0 protocol

mod connection;
mod server;

pub use connection::handle_connection;
pub use server::{WebSocketServerHandle, WebSocketSignalingServer};
