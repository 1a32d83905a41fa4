//! Client session orchestrator
//!
//! Drives the signaling protocol from the client side. A
//! [`ProducerSession`] publishes local media into a room, a
//! [`ConsumerSession`] subscribes to every peer publishing there. The
//! WebRTC stack itself sits behind [`MediaDevice`].

pub mod consumer;
pub mod device;
pub mod producer;
pub mod signaling;

pub use consumer::{ConsumerSession, ConsumerState, ConsumerUpdate, PeerStream};
pub use device::{
    LocalMedia, LocalRecvTransport, LocalSendTransport, LocalTrack, MediaDevice, RemoteTrack,
};
pub use producer::{ProducerSession, ProducerState, PublishedTrack};
pub use signaling::{ServerPush, SignalingClient};
