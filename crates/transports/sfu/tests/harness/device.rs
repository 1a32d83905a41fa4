//! Simulated browser media stack
//!
//! Implements [`MediaDevice`] without capturing or sending media. Every
//! teardown call is appended to a shared log so tests can check ordering.

use parking_lot::Mutex;
use relaycast_sfu::client::{
    LocalMedia, LocalRecvTransport, LocalSendTransport, LocalTrack, MediaDevice, RemoteTrack,
};
use relaycast_sfu::engine::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters};
use relaycast_sfu::signaling::protocol::{ConsumeResult, TransportInfo};
use relaycast_sfu::{Error, Result};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Ordered record of teardown calls
#[derive(Default)]
pub struct DeviceLog {
    entries: Mutex<Vec<String>>,
}

impl DeviceLog {
    fn push(&self, entry: String) {
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

struct SimTrack {
    id: String,
    kind: MediaKind,
    log: Arc<DeviceLog>,
}

impl LocalTrack for SimTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) -> Result<()> {
        self.log.push(format!("stop track {}", self.id));
        Ok(())
    }
}

/// Browser stand-in for one client
pub struct SimulatedDevice {
    with_audio: bool,
    /// Video codec this device can decode and encode
    video_mime: String,
    loaded: Mutex<Option<RtpCapabilities>>,
    next_ssrc: AtomicU32,
    log: Arc<DeviceLog>,
}

impl SimulatedDevice {
    /// Camera and microphone, VP8/Opus
    pub fn new() -> Self {
        Self {
            with_audio: true,
            video_mime: "video/VP8".to_string(),
            loaded: Mutex::new(None),
            next_ssrc: AtomicU32::new(1000),
            log: Arc::new(DeviceLog::default()),
        }
    }

    /// Camera only
    pub fn video_only() -> Self {
        Self {
            with_audio: false,
            ..Self::new()
        }
    }

    /// Device whose only video codec is `mime_type`
    pub fn with_video_codec(mime_type: &str) -> Self {
        Self {
            video_mime: mime_type.to_string(),
            ..Self::video_only()
        }
    }

    pub fn log(&self) -> Arc<DeviceLog> {
        Arc::clone(&self.log)
    }

    /// Capabilities this device would offer for a codec set
    pub fn capabilities_for(video_mime: &str) -> RtpCapabilities {
        RtpCapabilities(json!({
            "codecs": [
                {"kind": "video", "mimeType": video_mime, "clockRate": 90000},
                {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2},
            ],
            "headerExtensions": [],
        }))
    }
}

#[async_trait::async_trait]
impl MediaDevice for SimulatedDevice {
    async fn load(&self, router_rtp_capabilities: &RtpCapabilities) -> Result<()> {
        router_rtp_capabilities.validate()?;
        *self.loaded.lock() = Some(Self::capabilities_for(&self.video_mime));
        Ok(())
    }

    fn rtp_capabilities(&self) -> Result<RtpCapabilities> {
        self.loaded
            .lock()
            .clone()
            .ok_or_else(|| Error::ValidationError("device not loaded".to_string()))
    }

    async fn acquire_local_media(&self) -> Result<LocalMedia> {
        let mut tracks: Vec<Arc<dyn LocalTrack>> = vec![Arc::new(SimTrack {
            id: "camera".to_string(),
            kind: MediaKind::Video,
            log: Arc::clone(&self.log),
        })];
        if self.with_audio {
            tracks.push(Arc::new(SimTrack {
                id: "microphone".to_string(),
                kind: MediaKind::Audio,
                log: Arc::clone(&self.log),
            }));
        }
        Ok(LocalMedia::new(tracks))
    }

    async fn create_send_transport(
        &self,
        info: &TransportInfo,
    ) -> Result<Box<dyn LocalSendTransport>> {
        Ok(Box::new(SimSendTransport {
            id: info.id.clone(),
            video_mime: self.video_mime.clone(),
            ssrc: self.next_ssrc.fetch_add(10, Ordering::Relaxed),
            log: Arc::clone(&self.log),
        }))
    }

    async fn create_recv_transport(
        &self,
        info: &TransportInfo,
    ) -> Result<Box<dyn LocalRecvTransport>> {
        Ok(Box::new(SimRecvTransport {
            id: info.id.clone(),
            log: Arc::clone(&self.log),
        }))
    }
}

fn client_dtls() -> DtlsParameters {
    DtlsParameters(json!({
        "role": "client",
        "fingerprints": [{"algorithm": "sha-256", "value": "11:22:33:44"}],
    }))
}

struct SimSendTransport {
    id: String,
    video_mime: String,
    ssrc: u32,
    log: Arc<DeviceLog>,
}

impl LocalSendTransport for SimSendTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        client_dtls()
    }

    fn rtp_parameters(&self, track: &dyn LocalTrack) -> Result<RtpParameters> {
        let (mime, clock_rate, ssrc) = match track.kind() {
            MediaKind::Video => (self.video_mime.as_str(), 90000, self.ssrc),
            MediaKind::Audio => ("audio/opus", 48000, self.ssrc + 1),
        };
        Ok(RtpParameters(json!({
            "mid": track.id(),
            "codecs": [{"mimeType": mime, "clockRate": clock_rate, "payloadType": 101}],
            "encodings": [{"ssrc": ssrc}],
        })))
    }

    fn attach_producer(&self, producer_id: &str, track: &dyn LocalTrack) -> Result<()> {
        self.log
            .push(format!("attach producer {} to {}", producer_id, track.id()));
        Ok(())
    }

    fn close_producer(&self, producer_id: &str) -> Result<()> {
        self.log.push(format!("close producer {}", producer_id));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.log.push(format!("close send transport {}", self.id));
        Ok(())
    }
}

struct SimRecvTransport {
    id: String,
    log: Arc<DeviceLog>,
}

impl LocalRecvTransport for SimRecvTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        client_dtls()
    }

    fn consume(&self, consumed: &ConsumeResult) -> Result<RemoteTrack> {
        consumed.rtp_parameters.validate()?;
        self.log.push(format!("consume {}", consumed.id));
        Ok(RemoteTrack {
            consumer_id: consumed.id.clone(),
            producer_id: consumed.producer_id.clone(),
            kind: consumed.kind,
        })
    }

    fn close_consumer(&self, consumer_id: &str) -> Result<()> {
        self.log.push(format!("close consumer {}", consumer_id));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.log.push(format!("close receive transport {}", self.id));
        Ok(())
    }
}
