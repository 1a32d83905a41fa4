//! Selective forwarding unit signaling core
//!
//! One producer connection publishes camera/microphone media into a room;
//! any number of consumer connections subscribe to it. This crate is the
//! bookkeeping layer in between: it tracks every connection's transports,
//! producers and consumers, answers the JSON-RPC 2.0 signaling protocol
//! over WebSocket, and guarantees clean teardown on disconnect.
//!
//! The forwarding engine itself (ICE/DTLS/SRTP, RTP routing) sits behind the
//! [`engine`] traits. With the `mediasoup` feature, `engine::MediasoupWorker`
//! binds them to a mediasoup worker and real media flows.
//! [`engine::LoopbackWorker`] is an in-process implementation that performs
//! all bookkeeping without moving media; it backs the tests and offline
//! client development.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Clients (browser or client::ProducerSession/Consumer…)  │
//! │  ↓ JSON-RPC 2.0 over WebSocket                           │
//! │  WebSocketSignalingServer                                │
//! │  └─ per-connection loop → handler::dispatch              │
//! │     ├─ SessionStore (connection records)                 │
//! │     ├─ TransportManager (send/receive slots)             │
//! │     ├─ ProducerRegistry (room index, newProducer)        │
//! │     └─ ConsumerRegistry (producerClosed fan-out)         │
//! │        ↓                                                 │
//! │  engine::MediaRouter / MediaWorker                       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use relaycast_sfu::{engine::MediaWorker, LoopbackWorker, SfuConfig, SharedState,
//!     WebSocketSignalingServer};
//! use std::sync::Arc;
//!
//! let config = Arc::new(SfuConfig::local_preset());
//! let worker = LoopbackWorker::new();
//! let router = worker.create_router(&config.media_codecs).await?;
//!
//! let state = Arc::new(SharedState::new(config));
//! state.attach_router(router);
//!
//! let handle = WebSocketSignalingServer::new(state)?.start().await?;
//! println!("listening on {}", handle.url());
//! ```

#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod transport;

pub use client::{ConsumerSession, MediaDevice, ProducerSession, SignalingClient};
pub use config::{ClientConfig, SfuConfig};
pub use engine::{LoopbackWorker, MediaKind};
pub use error::{Error, Result};
pub use session::{RoomId, SessionStore};
pub use signaling::{SfuEvent, SharedState, WebSocketServerHandle, WebSocketSignalingServer};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
