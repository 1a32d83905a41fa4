//! Consumer role: subscribe to every peer publishing into a room
//!
//! Peers are aggregated per connection id. The initial listing is fanned
//! out once; after that each `newProducer` push triggers an incremental
//! re-list that only consumes producers not yet held (a known peer's late
//! tracks are merged into its aggregate), and each `producerClosed` push
//! drops the owning peer.

use super::device::{LocalRecvTransport, MediaDevice, RemoteTrack};
use super::signaling::{ServerPush, SignalingClient};
use crate::config::ClientConfig;
use crate::engine::MediaKind;
use crate::session::RoomId;
use crate::signaling::protocol::StreamInfo;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Progress of a consumer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    DeviceReady,
    RecvTransportReady,
    InitialFanout,
    Subscribed,
    Stopped,
}

/// Every consumed track of one remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStream {
    pub connection_id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl PeerStream {
    pub fn track(&self, kind: MediaKind) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|track| track.kind == kind)
    }

    pub fn consumer_ids(&self) -> impl Iterator<Item = &str> {
        self.tracks.iter().map(|track| track.consumer_id.as_str())
    }
}

/// What a handled push changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerUpdate {
    /// Peers whose aggregate gained tracks on a re-list, new peers included
    PeersAdded(Vec<String>),

    /// Peer torn down after one of its producers closed
    PeerRemoved(String),

    Unchanged,
}

/// Subscribes to every producer of one room
pub struct ConsumerSession {
    config: ClientConfig,
    signaling: Option<SignalingClient>,
    pushes: broadcast::Receiver<ServerPush>,
    device: Arc<dyn MediaDevice>,
    state: ConsumerState,
    transport: Option<Box<dyn LocalRecvTransport>>,
    /// Aggregated peers in the order they were first consumed
    peers: Vec<PeerStream>,
}

impl ConsumerSession {
    /// Open the signaling connection; nothing is consumed until [`start`](Self::start)
    pub async fn connect(config: ClientConfig, device: Arc<dyn MediaDevice>) -> Result<Self> {
        let signaling = SignalingClient::connect(&config).await?;
        Ok(Self::with_signaling(config, signaling, device))
    }

    pub fn with_signaling(
        config: ClientConfig,
        signaling: SignalingClient,
        device: Arc<dyn MediaDevice>,
    ) -> Self {
        // Subscribe before any request so no push is missed
        let pushes = signaling.subscribe();
        Self {
            config,
            signaling: Some(signaling),
            pushes,
            device,
            state: ConsumerState::Idle,
            transport: None,
            peers: Vec::new(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn peers(&self) -> &[PeerStream] {
        &self.peers
    }

    pub fn peer(&self, connection_id: &str) -> Option<&PeerStream> {
        self.peers
            .iter()
            .find(|peer| peer.connection_id == connection_id)
    }

    pub fn signaling(&self) -> Result<&SignalingClient> {
        self.signaling
            .as_ref()
            .ok_or_else(|| Error::SignalingError("consumer session is stopped".to_string()))
    }

    /// Run the subscribe sequence through to `Subscribed`
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ConsumerState::Idle {
            return Err(Error::ValidationError(format!(
                "consumer session cannot start from {:?}",
                self.state
            )));
        }

        let signaling = self.signaling()?;
        let router_caps = signaling.get_rtp_capabilities().await?;
        self.device.load(&router_caps).await?;
        self.state = ConsumerState::DeviceReady;

        let signaling = self.signaling()?;
        let info = signaling.create_consumer_transport().await?;
        let transport = self.device.create_recv_transport(&info).await?;
        signaling
            .connect_consumer_transport(transport.dtls_parameters())
            .await?;
        info!(transport_id = %info.id, "Receive transport connected");
        self.transport = Some(transport);
        self.state = ConsumerState::RecvTransportReady;

        self.state = ConsumerState::InitialFanout;
        let added = self.fan_out().await?;
        self.state = ConsumerState::Subscribed;
        info!(
            room_id = %self.config.room_id,
            peers = added.len(),
            "Consumer session subscribed"
        );
        Ok(())
    }

    /// Wait for the next server push and apply it
    ///
    /// Returns `Ok(None)` once the signaling connection is gone.
    pub async fn next_update(&mut self) -> Result<Option<ConsumerUpdate>> {
        let push = match self.pushes.recv().await {
            Ok(push) => push,
            // Missed pushes are recovered by re-listing
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Consumer fell behind on pushes; re-listing");
                ServerPush::NewProducer
            }
            Err(RecvError::Closed) => return Ok(None),
        };
        self.handle_push(push).await.map(Some)
    }

    /// Apply one server push
    pub async fn handle_push(&mut self, push: ServerPush) -> Result<ConsumerUpdate> {
        if self.state != ConsumerState::Subscribed {
            return Ok(ConsumerUpdate::Unchanged);
        }

        match push {
            ServerPush::NewProducer => {
                let added = self.fan_out().await?;
                if added.is_empty() {
                    Ok(ConsumerUpdate::Unchanged)
                } else {
                    Ok(ConsumerUpdate::PeersAdded(added))
                }
            }
            ServerPush::ProducerClosed(closed) => {
                debug!(
                    producer_id = %closed.producer_id,
                    connection_id = %closed.connection_id,
                    "Remote producer closed"
                );
                if self.remove_peer(&closed.connection_id)? {
                    Ok(ConsumerUpdate::PeerRemoved(closed.connection_id))
                } else {
                    Ok(ConsumerUpdate::Unchanged)
                }
            }
        }
    }

    /// List the room and consume every listed stream not yet held
    ///
    /// Returns the peers whose aggregate gained tracks, in listing order.
    /// Tracks consumed before a fatal error are kept so the next re-list or
    /// `producerClosed` accounts for them.
    async fn fan_out(&mut self) -> Result<Vec<String>> {
        let room_id = RoomId::new(self.config.room_id.as_str());
        let listing = self.signaling()?.get_producers(&[room_id]).await?;

        let mut added = Vec::new();
        for peer in listing {
            let missing: Vec<&StreamInfo> = peer
                .streams
                .iter()
                .filter(|stream| !self.holds(&peer.connection_id, &stream.producer_id))
                .collect();
            if missing.is_empty() {
                continue;
            }

            let (tracks, failure) = self.consume_streams(&peer.connection_id, &missing).await?;
            if !tracks.is_empty() {
                self.merge(&peer.connection_id, tracks);
                added.push(peer.connection_id.clone());
            }
            if let Some(e) = failure {
                return Err(e);
            }
        }
        Ok(added)
    }

    fn holds(&self, connection_id: &str, producer_id: &str) -> bool {
        self.peer(connection_id).is_some_and(|peer| {
            peer.tracks
                .iter()
                .any(|track| track.producer_id == producer_id)
        })
    }

    fn merge(&mut self, connection_id: &str, tracks: Vec<RemoteTrack>) {
        match self
            .peers
            .iter_mut()
            .find(|peer| peer.connection_id == connection_id)
        {
            Some(peer) => {
                debug!(connection_id, added = tracks.len(), "Merging tracks into peer stream");
                peer.tracks.extend(tracks);
            }
            None => self.peers.push(PeerStream {
                connection_id: connection_id.to_string(),
                tracks,
            }),
        }
    }

    /// Consume each stream; stops at the first error that is not a vanished
    /// producer and hands it back alongside the tracks already consumed
    async fn consume_streams(
        &self,
        connection_id: &str,
        streams: &[&StreamInfo],
    ) -> Result<(Vec<RemoteTrack>, Option<Error>)> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| Error::ValidationError("receive transport not ready".to_string()))?;
        let signaling = self.signaling()?;
        let rtp_capabilities = self.device.rtp_capabilities()?;

        let mut tracks = Vec::with_capacity(streams.len());
        for stream in streams {
            let consumed = match signaling
                .consume(&stream.producer_id, rtp_capabilities.clone())
                .await
            {
                Ok(consumed) => consumed,
                Err(e) if e.is_benign_race() => {
                    debug!(
                        connection_id,
                        producer_id = %stream.producer_id,
                        "Skipping vanished producer: {}", e
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        connection_id,
                        producer_id = %stream.producer_id,
                        kept = tracks.len(),
                        "Consume failed: {}", e
                    );
                    return Ok((tracks, Some(e)));
                }
            };

            match transport.consume(&consumed) {
                Ok(track) => tracks.push(track),
                Err(e) => {
                    warn!(
                        connection_id,
                        consumer_id = %consumed.id,
                        "Failed to attach remote track: {}", e
                    );
                    return Ok((tracks, Some(e)));
                }
            }
        }
        Ok((tracks, None))
    }

    /// Drop a peer and close its local consumers
    fn remove_peer(&mut self, connection_id: &str) -> Result<bool> {
        let Some(index) = self
            .peers
            .iter()
            .position(|peer| peer.connection_id == connection_id)
        else {
            return Ok(false);
        };
        let peer = self.peers.remove(index);

        let mut first_error = None;
        if let Some(transport) = self.transport.as_ref() {
            for consumer_id in peer.consumer_ids() {
                if let Err(e) = transport.close_consumer(consumer_id) {
                    warn!(consumer_id, "Failed to close local consumer: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        info!(connection_id, "Peer stream torn down");

        match first_error {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }

    /// Close every consumer, the receive transport, and the signaling connection
    pub fn stop(&mut self) -> Result<()> {
        let mut first_error: Option<Error> = None;
        let peers = std::mem::take(&mut self.peers);

        if let Some(transport) = self.transport.take() {
            for peer in &peers {
                for consumer_id in peer.consumer_ids() {
                    if let Err(e) = transport.close_consumer(consumer_id) {
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Err(e) = transport.close() {
                first_error.get_or_insert(e);
            }
        }

        if let Some(signaling) = self.signaling.take() {
            if let Err(e) = signaling.close() {
                first_error.get_or_insert(e);
            }
        }

        self.state = ConsumerState::Stopped;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
