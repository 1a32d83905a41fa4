//! Producer role: publish local camera/microphone into a room

use super::device::{LocalMedia, LocalSendTransport, MediaDevice};
use super::signaling::SignalingClient;
use crate::config::ClientConfig;
use crate::engine::MediaKind;
use crate::session::RoomId;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Progress of a producer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Idle,
    AcquireLocalMedia,
    DeviceReady,
    SendTransportReady,
    Producing(MediaKind),
    Active,
    Stopped,
}

/// A track published to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedTrack {
    pub producer_id: String,
    pub kind: MediaKind,
}

/// Publishes local media to one room
pub struct ProducerSession {
    config: ClientConfig,
    signaling: Option<SignalingClient>,
    device: Arc<dyn MediaDevice>,
    state: ProducerState,
    local_media: Option<LocalMedia>,
    transport: Option<Box<dyn LocalSendTransport>>,
    published: Vec<PublishedTrack>,
}

impl ProducerSession {
    /// Open the signaling connection; nothing is published until [`start`](Self::start)
    pub async fn connect(config: ClientConfig, device: Arc<dyn MediaDevice>) -> Result<Self> {
        let signaling = SignalingClient::connect(&config).await?;
        Ok(Self::with_signaling(config, signaling, device))
    }

    pub fn with_signaling(
        config: ClientConfig,
        signaling: SignalingClient,
        device: Arc<dyn MediaDevice>,
    ) -> Self {
        Self {
            config,
            signaling: Some(signaling),
            device,
            state: ProducerState::Idle,
            local_media: None,
            transport: None,
            published: Vec::new(),
        }
    }

    pub fn state(&self) -> ProducerState {
        self.state
    }

    pub fn published(&self) -> &[PublishedTrack] {
        &self.published
    }

    /// Producer id of the published track of a kind
    pub fn producer_id(&self, kind: MediaKind) -> Option<&str> {
        self.published
            .iter()
            .find(|track| track.kind == kind)
            .map(|track| track.producer_id.as_str())
    }

    pub fn signaling(&self) -> Result<&SignalingClient> {
        self.signaling
            .as_ref()
            .ok_or_else(|| Error::SignalingError("producer session is stopped".to_string()))
    }

    /// Run the publish sequence through to `Active`
    ///
    /// Stops at the first failure and leaves the state where it failed;
    /// call [`stop`](Self::stop) to release whatever was set up.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ProducerState::Idle {
            return Err(Error::ValidationError(format!(
                "producer session cannot start from {:?}",
                self.state
            )));
        }

        self.state = ProducerState::AcquireLocalMedia;
        let media = self.device.acquire_local_media().await?;
        if media.track(MediaKind::Video).is_none() {
            return Err(Error::ValidationError(
                "local media has no video track".to_string(),
            ));
        }
        self.local_media = Some(media.clone());

        let signaling = self.signaling()?;
        let router_caps = signaling.get_rtp_capabilities().await?;
        self.device.load(&router_caps).await?;
        self.state = ProducerState::DeviceReady;

        let signaling = self.signaling()?;
        let info = signaling.create_producer_transport().await?;
        let transport = self.device.create_send_transport(&info).await?;
        signaling
            .connect_producer_transport(transport.dtls_parameters())
            .await?;
        info!(transport_id = %info.id, "Send transport connected");
        self.transport = Some(transport);
        self.state = ProducerState::SendTransportReady;

        self.publish(&media, MediaKind::Video).await?;
        if media.has_audio() {
            self.publish(&media, MediaKind::Audio).await?;
        }

        self.state = ProducerState::Active;
        info!(
            room_id = %self.config.room_id,
            tracks = self.published.len(),
            "Producer session active"
        );
        Ok(())
    }

    async fn publish(&mut self, media: &LocalMedia, kind: MediaKind) -> Result<()> {
        self.state = ProducerState::Producing(kind);

        let track = media
            .track(kind)
            .ok_or_else(|| Error::ValidationError(format!("local media has no {} track", kind)))?;
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| Error::ValidationError("send transport not ready".to_string()))?;

        let rtp_parameters = transport.rtp_parameters(track.as_ref())?;
        let producer_id = self
            .signaling()?
            .produce(kind, RoomId::new(self.config.room_id.as_str()), rtp_parameters)
            .await?;
        transport.attach_producer(&producer_id, track.as_ref())?;

        debug!(producer_id = %producer_id, %kind, "Track published");
        self.published.push(PublishedTrack { producer_id, kind });
        Ok(())
    }

    /// Tear down in reverse order
    ///
    /// Every step runs even if an earlier one failed; the first failure is
    /// returned once all steps are done.
    pub fn stop(&mut self) -> Result<()> {
        let mut first_error: Option<Error> = None;
        let mut record = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                warn!("Producer teardown step {} failed: {}", step, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        };

        if let Some(media) = self.local_media.take() {
            for track in media.tracks() {
                record("stop track", track.stop());
            }
        }

        let published = std::mem::take(&mut self.published);
        if let Some(transport) = self.transport.take() {
            for track in published.iter().rev() {
                record("close producer", transport.close_producer(&track.producer_id));
            }
            record("close send transport", transport.close());
        }

        if let Some(signaling) = self.signaling.take() {
            record("close signaling", signaling.close());
        }

        self.state = ProducerState::Stopped;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
