//! Client-side media device seam
//!
//! Everything the orchestrator needs from a WebRTC stack that is not
//! signaling: local capture, capability loading, and the local halves of
//! the send and receive transports.

use crate::engine::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters};
use crate::signaling::protocol::{ConsumeResult, TransportInfo};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// A captured local track
pub trait LocalTrack: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// Stop capturing
    fn stop(&self) -> Result<()>;
}

/// Tracks returned by local capture
#[derive(Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<Arc<dyn LocalTrack>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        Self { tracks }
    }

    /// First track of a kind
    pub fn track(&self, kind: MediaKind) -> Option<&Arc<dyn LocalTrack>> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    pub fn has_audio(&self) -> bool {
        self.track(MediaKind::Audio).is_some()
    }

    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tracks.iter().map(|t| (t.id().to_string(), t.kind())))
            .finish()
    }
}

/// A remote track attached to the local receive transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
}

/// Local half of the send transport
pub trait LocalSendTransport: Send + Sync {
    /// Server-side transport id this handle was created from
    fn id(&self) -> &str;

    /// Local DTLS parameters for connectProducerTransport
    fn dtls_parameters(&self) -> DtlsParameters;

    /// Encoding parameters for publishing `track`
    fn rtp_parameters(&self, track: &dyn LocalTrack) -> Result<RtpParameters>;

    /// Bind a published track to its server-side producer id
    fn attach_producer(&self, producer_id: &str, track: &dyn LocalTrack) -> Result<()>;

    fn close_producer(&self, producer_id: &str) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Local half of the receive transport
pub trait LocalRecvTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Local DTLS parameters for connectConsumerTransport
    fn dtls_parameters(&self) -> DtlsParameters;

    /// Create the local consumer for a consume reply
    fn consume(&self, consumed: &ConsumeResult) -> Result<RemoteTrack>;

    fn close_consumer(&self, consumer_id: &str) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Client media stack
#[async_trait]
pub trait MediaDevice: Send + Sync {
    /// Load the router's capabilities; must run before any transport is made
    async fn load(&self, router_rtp_capabilities: &RtpCapabilities) -> Result<()>;

    /// Capabilities of the loaded device
    fn rtp_capabilities(&self) -> Result<RtpCapabilities>;

    /// Capture camera/microphone
    async fn acquire_local_media(&self) -> Result<LocalMedia>;

    async fn create_send_transport(
        &self,
        info: &TransportInfo,
    ) -> Result<Box<dyn LocalSendTransport>>;

    async fn create_recv_transport(
        &self,
        info: &TransportInfo,
    ) -> Result<Box<dyn LocalRecvTransport>>;
}
