//! mediasoup engine binding
//!
//! Wraps a mediasoup worker thread, its router and the WebRTC transports,
//! producers and consumers created on it. Capability and parameter blobs are
//! converted to mediasoup's own types through serde at this boundary only;
//! the signaling core keeps treating them as opaque JSON.
//!
//! Closing an adapter drops the wrapped mediasoup handle, which closes the
//! underlying object and cascades exactly as the engine does natively.

use super::{
    ConsumerCloseReason, DtlsParameters, EngineConsumer, EngineProducer, EngineTransport,
    IceCandidates, IceParameters, MediaCodec, MediaKind, MediaRouter, MediaWorker,
    ProducerCloseReason, RtpCapabilities, RtpParameters, TransportState,
    WebRtcTransportOptions,
};
use crate::{Error, Result};
use async_trait::async_trait;
use mediasoup::data_structures::{DtlsState, ListenInfo, Protocol};
use mediasoup::prelude::*;
use mediasoup::worker::WorkerSettings;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

fn to_blob<T: Serialize>(value: &T, label: &str) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| Error::SerializationError(format!("Failed to encode {}: {}", label, e)))
}

fn from_blob<T: DeserializeOwned>(value: &Value, label: &str) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::ValidationError(format!("Invalid {}: {}", label, e)))
}

fn engine_kind(kind: MediaKind) -> mediasoup::rtp_parameters::MediaKind {
    match kind {
        MediaKind::Video => mediasoup::rtp_parameters::MediaKind::Video,
        MediaKind::Audio => mediasoup::rtp_parameters::MediaKind::Audio,
    }
}

fn local_kind(kind: mediasoup::rtp_parameters::MediaKind) -> MediaKind {
    match kind {
        mediasoup::rtp_parameters::MediaKind::Video => MediaKind::Video,
        mediasoup::rtp_parameters::MediaKind::Audio => MediaKind::Audio,
    }
}

/// Router codec list in mediasoup's capability form
fn codec_capabilities(codecs: &[MediaCodec]) -> Result<Vec<RtpCodecCapability>> {
    codecs
        .iter()
        .map(|codec| {
            let mut blob = to_blob(codec, "media codec")?;
            if let Some(fields) = blob.as_object_mut() {
                fields.insert("parameters".to_string(), json!({}));
                fields.insert("rtcpFeedback".to_string(), json!([]));
            }
            from_blob(&blob, "media codec")
        })
        .collect()
}

/// mediasoup worker running in-process
pub struct MediasoupWorker {
    // Keeps the worker thread pool alive
    _manager: WorkerManager,
    worker: Worker,
    port_range: RangeInclusive<u16>,
    died_tx: Arc<watch::Sender<Option<String>>>,
}

impl MediasoupWorker {
    /// Start a worker whose transports listen on `min_port..=max_port`
    pub async fn spawn(min_port: u16, max_port: u16) -> Result<Self> {
        let manager = WorkerManager::new();
        let worker = manager
            .create_worker(WorkerSettings::default())
            .await
            .map_err(|e| Error::EngineError(format!("Failed to start mediasoup worker: {}", e)))?;

        let (died_tx, _) = watch::channel(None);
        let died_tx = Arc::new(died_tx);
        let signal = Arc::clone(&died_tx);
        worker
            .on_dead(move |outcome| {
                let reason = match outcome {
                    Ok(()) => "worker exited".to_string(),
                    Err(e) => format!("{:?}", e),
                };
                error!(reason = %reason, "mediasoup worker died");
                signal.send_replace(Some(reason));
            })
            .detach();

        info!(worker_id = %worker.id(), min_port, max_port, "mediasoup worker started");
        Ok(Self {
            _manager: manager,
            worker,
            port_range: min_port..=max_port.max(min_port),
            died_tx,
        })
    }
}

#[async_trait]
impl MediaWorker for MediasoupWorker {
    fn pid(&self) -> u32 {
        // The worker runs as a thread of this process
        std::process::id()
    }

    fn subscribe_died(&self) -> watch::Receiver<Option<String>> {
        self.died_tx.subscribe()
    }

    async fn create_router(&self, codecs: &[MediaCodec]) -> Result<Arc<dyn MediaRouter>> {
        let router = self
            .worker
            .create_router(RouterOptions::new(codec_capabilities(codecs)?))
            .await
            .map_err(|e| Error::EngineError(format!("Failed to create router: {}", e)))?;
        let rtp_capabilities = RtpCapabilities(to_blob(router.rtp_capabilities(), "router capabilities")?);

        info!(router_id = %router.id(), codecs = codecs.len(), "mediasoup router created");
        Ok(Arc::new(MediasoupRouter {
            id: router.id().to_string(),
            router,
            rtp_capabilities,
            port_range: self.port_range.clone(),
        }))
    }
}

/// Router wrapper
pub struct MediasoupRouter {
    id: String,
    router: Router,
    rtp_capabilities: RtpCapabilities,
    port_range: RangeInclusive<u16>,
}

impl MediasoupRouter {
    fn listen_info(&self, protocol: Protocol, options: &WebRtcTransportOptions) -> Result<ListenInfo> {
        let ip: IpAddr = options.listen_ip.parse().map_err(|e| {
            Error::InvalidConfig(format!("Invalid RTC listen IP '{}': {}", options.listen_ip, e))
        })?;
        Ok(ListenInfo {
            protocol,
            ip,
            announced_address: options.announced_ip.clone(),
            expose_internal_ip: false,
            port: None,
            port_range: Some(self.port_range.clone()),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        })
    }
}

#[async_trait]
impl MediaRouter for MediasoupRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.rtp_capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let Ok(producer_id) = from_blob::<ProducerId>(&json!(producer_id), "producerId") else {
            return false;
        };
        let Ok(capabilities) = from_blob::<mediasoup::rtp_parameters::RtpCapabilities>(
            rtp_capabilities.as_value(),
            "rtpCapabilities",
        ) else {
            return false;
        };
        self.router.can_consume(&producer_id, &capabilities)
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>> {
        let mut protocols = Vec::with_capacity(2);
        if options.enable_udp {
            protocols.push(Protocol::Udp);
        }
        if options.enable_tcp {
            protocols.push(Protocol::Tcp);
        }
        let mut protocols = protocols.into_iter();
        let first = protocols
            .next()
            .ok_or_else(|| Error::InvalidConfig("UDP and TCP are both disabled".to_string()))?;
        let mut listen_infos = WebRtcTransportListenInfos::new(self.listen_info(first, options)?);
        for protocol in protocols {
            listen_infos = listen_infos.insert(self.listen_info(protocol, options)?);
        }

        let mut transport_options = mediasoup::webrtc_transport::WebRtcTransportOptions::new(listen_infos);
        transport_options.prefer_udp = options.prefer_udp;

        let transport = self
            .router
            .create_webrtc_transport(transport_options)
            .await
            .map_err(|e| Error::EngineError(format!("Failed to create transport: {}", e)))?;

        MediasoupTransport::wrap(transport).map(|t| t as Arc<dyn EngineTransport>)
    }
}

/// WebRTC transport wrapper
pub struct MediasoupTransport {
    id: String,
    ice_parameters: IceParameters,
    ice_candidates: IceCandidates,
    dtls_parameters: DtlsParameters,
    transport: Mutex<Option<WebRtcTransport>>,
    state_tx: Arc<watch::Sender<TransportState>>,
}

impl MediasoupTransport {
    fn wrap(transport: WebRtcTransport) -> Result<Arc<Self>> {
        let (state_tx, _) = watch::channel(TransportState::Created);
        let state_tx = Arc::new(state_tx);

        let closed = Arc::clone(&state_tx);
        transport
            .on_close(move || {
                closed.send_replace(TransportState::Closed);
            })
            .detach();

        let id = transport.id().to_string();
        let dtls = Arc::clone(&state_tx);
        let transport_id = id.clone();
        transport
            .on_dtls_state_change(move |state| {
                if matches!(state, DtlsState::Failed | DtlsState::Closed) {
                    warn!(transport_id = %transport_id, ?state, "DTLS ended; closing transport");
                    dtls.send_replace(TransportState::Closed);
                }
            })
            .detach();

        debug!(transport_id = %id, "mediasoup transport created");
        Ok(Arc::new(Self {
            ice_parameters: IceParameters(to_blob(transport.ice_parameters(), "iceParameters")?),
            ice_candidates: IceCandidates(to_blob(transport.ice_candidates(), "iceCandidates")?),
            dtls_parameters: DtlsParameters(to_blob(&transport.dtls_parameters(), "dtlsParameters")?),
            id,
            transport: Mutex::new(Some(transport)),
            state_tx,
        }))
    }

    fn handle(&self) -> Result<WebRtcTransport> {
        self.transport
            .lock()
            .clone()
            .ok_or_else(|| Error::EngineError(format!("transport {} is closed", self.id)))
    }
}

#[async_trait]
impl EngineTransport for MediasoupTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> IceCandidates {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        let remote = from_blob(dtls_parameters.as_value(), "dtlsParameters")?;
        let transport = self.handle()?;

        let started = self.state_tx.send_if_modified(|state| {
            if *state == TransportState::Created {
                *state = TransportState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(Error::EngineError(format!(
                "connect() called on transport {} in state {}",
                self.id,
                self.state_tx.borrow().as_str()
            )));
        }

        match transport
            .connect(WebRtcTransportRemoteParameters {
                dtls_parameters: remote,
            })
            .await
        {
            Ok(()) => {
                self.state_tx.send_if_modified(|state| {
                    if *state == TransportState::Connecting {
                        *state = TransportState::Connected;
                        true
                    } else {
                        false
                    }
                });
                Ok(())
            }
            Err(e) => {
                self.state_tx.send_if_modified(|state| {
                    if *state == TransportState::Connecting {
                        *state = TransportState::Created;
                        true
                    } else {
                        false
                    }
                });
                Err(Error::EngineError(format!(
                    "DTLS connect failed on transport {}: {}",
                    self.id, e
                )))
            }
        }
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>> {
        let parameters = from_blob(rtp_parameters.as_value(), "rtpParameters")?;
        let producer = self
            .handle()?
            .produce(ProducerOptions::new(engine_kind(kind), parameters))
            .await
            .map_err(|e| Error::EngineError(format!("Failed to produce: {}", e)))?;
        MediasoupProducer::wrap(producer).map(|p| p as Arc<dyn EngineProducer>)
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>> {
        let engine_producer_id: ProducerId = from_blob(&json!(producer_id), "producerId")
            .map_err(|_| Error::ResourceNotFound(format!("producer {}", producer_id)))?;
        let capabilities = from_blob(rtp_capabilities.as_value(), "rtpCapabilities")?;

        let mut options = ConsumerOptions::new(engine_producer_id, capabilities);
        options.paused = paused;
        let consumer = self
            .handle()?
            .consume(options)
            .await
            .map_err(|e| Error::EngineError(format!("Failed to consume {}: {}", producer_id, e)))?;
        MediasoupConsumer::wrap(consumer).map(|c| c as Arc<dyn EngineConsumer>)
    }

    fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    fn close(&self) {
        // Dropping the last handle closes the transport inside the worker
        if self.transport.lock().take().is_some() {
            debug!(transport_id = %self.id, "mediasoup transport closed");
        }
        self.state_tx.send_replace(TransportState::Closed);
    }
}

/// Producer wrapper
pub struct MediasoupProducer {
    id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    producer: Mutex<Option<Producer>>,
    closed_tx: Arc<watch::Sender<Option<ProducerCloseReason>>>,
}

impl MediasoupProducer {
    fn wrap(producer: Producer) -> Result<Arc<Self>> {
        let (closed_tx, _) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);

        let on_transport = Arc::clone(&closed_tx);
        producer
            .on_transport_close(move || {
                on_transport.send_if_modified(|reason| close_once(reason, ProducerCloseReason::TransportClosed));
            })
            .detach();
        let on_close = Arc::clone(&closed_tx);
        producer
            .on_close(move || {
                on_close.send_if_modified(|reason| close_once(reason, ProducerCloseReason::Closed));
            })
            .detach();

        Ok(Arc::new(Self {
            id: producer.id().to_string(),
            kind: local_kind(producer.kind()),
            rtp_parameters: RtpParameters(to_blob(producer.rtp_parameters(), "rtpParameters")?),
            producer: Mutex::new(Some(producer)),
            closed_tx,
        }))
    }
}

fn close_once<R: Copy>(current: &mut Option<R>, reason: R) -> bool {
    if current.is_none() {
        *current = Some(reason);
        true
    } else {
        false
    }
}

impl EngineProducer for MediasoupProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn subscribe_closed(&self) -> watch::Receiver<Option<ProducerCloseReason>> {
        self.closed_tx.subscribe()
    }

    fn close(&self) {
        self.producer.lock().take();
        self.closed_tx
            .send_if_modified(|reason| close_once(reason, ProducerCloseReason::Closed));
    }
}

/// Consumer wrapper
pub struct MediasoupConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumer: Mutex<Option<Consumer>>,
    closed_tx: Arc<watch::Sender<Option<ConsumerCloseReason>>>,
}

impl MediasoupConsumer {
    fn wrap(consumer: Consumer) -> Result<Arc<Self>> {
        let (closed_tx, _) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);

        let on_producer = Arc::clone(&closed_tx);
        consumer
            .on_producer_close(move || {
                on_producer.send_if_modified(|reason| close_once(reason, ConsumerCloseReason::ProducerClosed));
            })
            .detach();
        let on_transport = Arc::clone(&closed_tx);
        consumer
            .on_transport_close(move || {
                on_transport.send_if_modified(|reason| close_once(reason, ConsumerCloseReason::TransportClosed));
            })
            .detach();
        let on_close = Arc::clone(&closed_tx);
        consumer
            .on_close(move || {
                on_close.send_if_modified(|reason| close_once(reason, ConsumerCloseReason::Closed));
            })
            .detach();

        Ok(Arc::new(Self {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: local_kind(consumer.kind()),
            rtp_parameters: RtpParameters(to_blob(consumer.rtp_parameters(), "rtpParameters")?),
            consumer: Mutex::new(Some(consumer)),
            closed_tx,
        }))
    }
}

#[async_trait]
impl EngineConsumer for MediasoupConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_paused(&self) -> bool {
        self.consumer
            .lock()
            .as_ref()
            .map_or(true, |consumer| consumer.paused())
    }

    async fn resume(&self) -> Result<()> {
        let consumer = self
            .consumer
            .lock()
            .clone()
            .ok_or_else(|| Error::EngineError(format!("consumer {} is closed", self.id)))?;
        consumer
            .resume()
            .await
            .map_err(|e| Error::EngineError(format!("Failed to resume consumer {}: {}", self.id, e)))
    }

    fn subscribe_closed(&self) -> watch::Receiver<Option<ConsumerCloseReason>> {
        self.closed_tx.subscribe()
    }

    fn close(&self) {
        self.consumer.lock().take();
        self.closed_tx
            .send_if_modified(|reason| close_once(reason, ConsumerCloseReason::Closed));
    }
}
