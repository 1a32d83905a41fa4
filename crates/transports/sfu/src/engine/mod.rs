//! Media engine binding
//!
//! The forwarding engine (ICE/DTLS/SRTP, RTP routing) is an external
//! collaborator. This module defines the surface the signaling core consumes:
//! a long-lived worker with a fatal "died" signal, one router per worker, and
//! transport/producer/consumer handles with close signals.
//!
//! Capability blobs are opaque: they are passed verbatim between client and
//! engine and only checked for JSON shape.

pub mod loopback;
#[cfg(feature = "mediasoup")]
pub mod mediasoup;

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

pub use loopback::LoopbackWorker;
#[cfg(feature = "mediasoup")]
pub use self::mediasoup::MediasoupWorker;

/// Engine-assigned transport identifier
pub type TransportId = String;

/// Engine-assigned producer identifier
pub type ProducerId = String;

/// Engine-assigned consumer identifier
pub type ConsumerId = String;

/// Media kind of a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Router codec entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCodec {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
}

/// Listen options for a new WebRTC transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcTransportOptions {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for WebRtcTransportOptions {
    fn default() -> Self {
        Self {
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

/// Transport state machine: `created → connecting → connected → closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Connecting,
    Connected,
    Closed,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::Created => "created",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Closed => "closed",
        }
    }
}

/// Why a producer closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerCloseReason {
    /// Its send transport closed
    TransportClosed,
    /// Closed directly
    Closed,
}

/// Why a consumer closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerCloseReason {
    /// Its receive transport closed
    TransportClosed,
    /// Its source producer closed
    ProducerClosed,
    /// Closed directly
    Closed,
}

macro_rules! opaque_blob {
    ($(#[$meta:meta])* $name:ident, $label:literal, $check:ident, $shape:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Value);

        impl $name {
            /// Check the JSON shape without interpreting the content
            pub fn validate(&self) -> Result<()> {
                if self.0.$check() {
                    Ok(())
                } else {
                    Err(Error::ValidationError(format!(
                        "{} must be a JSON {}",
                        $label, $shape
                    )))
                }
            }

            pub fn as_value(&self) -> &Value {
                &self.0
            }
        }

        impl From<Value> for $name {
            fn from(value: Value) -> Self {
                Self(value)
            }
        }
    };
}

opaque_blob!(
    /// Router or device RTP capability descriptor
    RtpCapabilities, "rtpCapabilities", is_object, "object"
);
opaque_blob!(
    /// Negotiated RTP parameters of a producer or consumer
    RtpParameters, "rtpParameters", is_object, "object"
);
opaque_blob!(
    /// DTLS fingerprint/role descriptor
    DtlsParameters, "dtlsParameters", is_object, "object"
);
opaque_blob!(
    /// ICE username fragment/password descriptor
    IceParameters, "iceParameters", is_object, "object"
);
opaque_blob!(
    /// ICE candidate list
    IceCandidates, "iceCandidates", is_array, "array"
);

/// Forwarding engine worker process
#[async_trait]
pub trait MediaWorker: Send + Sync {
    /// Process id of the worker
    fn pid(&self) -> u32;

    /// Fatal "died" signal; becomes `Some(reason)` once the worker is gone
    fn subscribe_died(&self) -> watch::Receiver<Option<String>>;

    /// Create the router for this worker
    async fn create_router(&self, codecs: &[MediaCodec]) -> Result<Arc<dyn MediaRouter>>;
}

/// Wait until the worker reports that it died; returns the reason
///
/// Resolves immediately if the worker is already dead.
pub async fn wait_for_death(worker: &dyn MediaWorker) -> String {
    let mut died = worker.subscribe_died();
    loop {
        if let Some(reason) = died.borrow_and_update().clone() {
            return reason;
        }
        if died.changed().await.is_err() {
            return "worker signal dropped".to_string();
        }
    }
}

/// Router: capability descriptor and transport factory
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> &str;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a consumer with these capabilities can receive the producer
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>>;
}

/// Engine-side WebRTC transport
#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> &str;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> IceCandidates;

    fn dtls_parameters(&self) -> DtlsParameters;

    /// DTLS negotiation with the remote endpoint
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>>;

    /// State-change signal
    fn subscribe_state(&self) -> watch::Receiver<TransportState>;

    /// Close locally; cascades to the transport's producers and consumers
    fn close(&self);
}

/// Engine-side media source
pub trait EngineProducer: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    /// Close signal; becomes `Some(reason)` once closed
    fn subscribe_closed(&self) -> watch::Receiver<Option<ProducerCloseReason>>;

    /// Close locally; cascades to every consumer of this producer
    fn close(&self);
}

/// Engine-side media sink
#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn is_paused(&self) -> bool;

    async fn resume(&self) -> Result<()>;

    /// Close signal; becomes `Some(reason)` once closed
    fn subscribe_closed(&self) -> watch::Receiver<Option<ConsumerCloseReason>>;

    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_media_kind_wire_format() {
        assert_eq!(serde_json::to_value(MediaKind::Video).unwrap(), json!("video"));
        let kind: MediaKind = serde_json::from_value(json!("audio")).unwrap();
        assert_eq!(kind, MediaKind::Audio);
        assert!(serde_json::from_value::<MediaKind>(json!("screen")).is_err());
    }

    #[test]
    fn test_blob_shape_validation() {
        assert!(RtpParameters(json!({"codecs": []})).validate().is_ok());
        assert!(RtpParameters(json!("vp8")).validate().is_err());
        assert!(IceCandidates(json!([])).validate().is_ok());
        assert!(IceCandidates(json!({})).validate().is_err());
        assert!(DtlsParameters(Value::Null).validate().is_err());
    }

    #[test]
    fn test_blob_is_passed_verbatim() {
        let raw = json!({"role": "client", "fingerprints": [{"algorithm": "sha-256", "value": "AB:CD"}]});
        let dtls: DtlsParameters = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&dtls).unwrap(), raw);
    }

    #[tokio::test]
    async fn test_wait_for_death() {
        let worker = std::sync::Arc::new(LoopbackWorker::new());
        let killer = std::sync::Arc::clone(&worker);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            killer.kill("segfault");
        });

        assert_eq!(wait_for_death(worker.as_ref()).await, "segfault");
        // Already dead resolves immediately
        assert_eq!(wait_for_death(worker.as_ref()).await, "segfault");
    }
}
