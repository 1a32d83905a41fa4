//! In-process forwarding engine
//!
//! Models the engine semantics the signaling core depends on without any
//! network I/O: close cascades (transport → producers/consumers, producer →
//! consumers), paused consumer creation, codec-based `can_consume`, and the
//! fatal worker "died" signal. Producers can inject synthetic frames, which
//! only resumed consumers count.

use super::{
    ConsumerCloseReason, DtlsParameters, EngineConsumer, EngineProducer, EngineTransport,
    IceCandidates, IceParameters, MediaCodec, MediaKind, MediaRouter, MediaWorker,
    ProducerCloseReason, RtpCapabilities, RtpParameters, TransportState, WebRtcTransportOptions,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Simulated DTLS handshake duration
const DEFAULT_HANDSHAKE_DELAY: Duration = Duration::from_millis(5);

/// In-process engine worker
pub struct LoopbackWorker {
    pid: u32,
    min_port: u16,
    max_port: u16,
    handshake_delay: Duration,
    resume_delay: Duration,
    died_tx: watch::Sender<Option<String>>,
    routers: Mutex<Vec<Arc<LoopbackRouter>>>,
}

impl LoopbackWorker {
    /// Create a worker with the default RTC port range (10000-10100)
    pub fn new() -> Self {
        Self::with_port_range(10000, 10100)
    }

    /// Create a worker allocating transport ports from `min_port..=max_port`
    pub fn with_port_range(min_port: u16, max_port: u16) -> Self {
        let (died_tx, _) = watch::channel(None);
        Self {
            pid: std::process::id(),
            min_port,
            max_port: max_port.max(min_port),
            handshake_delay: DEFAULT_HANDSHAKE_DELAY,
            resume_delay: Duration::ZERO,
            died_tx,
            routers: Mutex::new(Vec::new()),
        }
    }

    /// Override the simulated DTLS handshake duration
    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    /// Hold every consumer `resume` for `delay` before media starts flowing
    pub fn with_resume_delay(mut self, delay: Duration) -> Self {
        self.resume_delay = delay;
        self
    }

    /// Simulate a worker crash: emits the "died" signal and closes every
    /// transport of every router
    pub fn kill(&self, reason: &str) {
        let newly_dead = self.died_tx.send_if_modified(|died| {
            if died.is_none() {
                *died = Some(reason.to_string());
                true
            } else {
                false
            }
        });
        if !newly_dead {
            return;
        }

        error!(pid = self.pid, reason, "Loopback worker died");
        let routers: Vec<_> = self.routers.lock().drain(..).collect();
        for router in routers {
            router.close_all_transports();
        }
    }

    pub fn is_dead(&self) -> bool {
        self.died_tx.borrow().is_some()
    }

    /// Routers created by this worker, in creation order
    pub fn routers(&self) -> Vec<Arc<LoopbackRouter>> {
        self.routers.lock().clone()
    }
}

impl Default for LoopbackWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaWorker for LoopbackWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn subscribe_died(&self) -> watch::Receiver<Option<String>> {
        self.died_tx.subscribe()
    }

    async fn create_router(&self, codecs: &[MediaCodec]) -> Result<Arc<dyn MediaRouter>> {
        if let Some(reason) = self.died_tx.borrow().clone() {
            return Err(Error::EngineFatal(reason));
        }
        if codecs.is_empty() {
            return Err(Error::EngineError(
                "router needs at least one media codec".to_string(),
            ));
        }

        let router = Arc::new(LoopbackRouter {
            id: Uuid::new_v4().to_string(),
            shared: Arc::new(RouterShared {
                codecs: codecs.to_vec(),
                min_port: self.min_port,
                max_port: self.max_port,
                next_port: AtomicU16::new(0),
                handshake_delay: self.handshake_delay,
                resume_delay: self.resume_delay,
                transports: RwLock::new(HashMap::new()),
                producers: RwLock::new(HashMap::new()),
                consumers: RwLock::new(HashMap::new()),
            }),
        });

        info!(router_id = %router.id, codecs = codecs.len(), "Loopback router created");
        self.routers.lock().push(Arc::clone(&router));
        Ok(router)
    }
}

/// Router state shared with the objects it created
struct RouterShared {
    codecs: Vec<MediaCodec>,
    min_port: u16,
    max_port: u16,
    next_port: AtomicU16,
    handshake_delay: Duration,
    resume_delay: Duration,
    transports: RwLock<HashMap<String, Arc<LoopbackTransport>>>,
    producers: RwLock<HashMap<String, Arc<LoopbackProducer>>>,
    consumers: RwLock<HashMap<String, Arc<LoopbackConsumer>>>,
}

impl RouterShared {
    fn allocate_port(&self) -> u16 {
        let span = u32::from(self.max_port - self.min_port) + 1;
        let offset = u32::from(self.next_port.fetch_add(1, Ordering::Relaxed)) % span;
        // offset < span <= u16::MAX + 1, and min_port + offset <= max_port
        self.min_port + offset as u16
    }

    fn producer_mime_types(&self, producer: &LoopbackProducer) -> HashSet<String> {
        let declared = mime_types(producer.rtp_parameters.as_value());
        if !declared.is_empty() {
            return declared;
        }
        self.codecs
            .iter()
            .filter(|codec| codec.kind == producer.kind)
            .map(|codec| codec.mime_type.to_ascii_lowercase())
            .collect()
    }
}

/// Lowercased `codecs[*].mimeType` of a capability or parameter blob
fn mime_types(blob: &Value) -> HashSet<String> {
    blob.get("codecs")
        .and_then(Value::as_array)
        .map(|codecs| {
            codecs
                .iter()
                .filter_map(|codec| codec.get("mimeType").and_then(Value::as_str))
                .map(str::to_ascii_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

/// In-process router
pub struct LoopbackRouter {
    id: String,
    shared: Arc<RouterShared>,
}

impl LoopbackRouter {
    pub fn transport(&self, transport_id: &str) -> Option<Arc<LoopbackTransport>> {
        self.shared.transports.read().get(transport_id).cloned()
    }

    pub fn producer(&self, producer_id: &str) -> Option<Arc<LoopbackProducer>> {
        self.shared.producers.read().get(producer_id).cloned()
    }

    pub fn consumer(&self, consumer_id: &str) -> Option<Arc<LoopbackConsumer>> {
        self.shared.consumers.read().get(consumer_id).cloned()
    }

    /// Number of live (not closed) transports
    pub fn transport_count(&self) -> usize {
        self.shared.transports.read().len()
    }

    pub fn producer_count(&self) -> usize {
        self.shared.producers.read().len()
    }

    pub fn consumer_count(&self) -> usize {
        self.shared.consumers.read().len()
    }

    fn close_all_transports(&self) {
        let transports: Vec<_> = self.shared.transports.read().values().cloned().collect();
        for transport in transports {
            transport.close();
        }
    }
}

#[async_trait]
impl MediaRouter for LoopbackRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        let codecs: Vec<Value> = self
            .shared
            .codecs
            .iter()
            .enumerate()
            .map(|(index, codec)| {
                let mut entry = json!({
                    "kind": codec.kind,
                    "mimeType": codec.mime_type,
                    "clockRate": codec.clock_rate,
                    "preferredPayloadType": 100 + index,
                    "rtcpFeedback": [],
                });
                if let Some(channels) = codec.channels {
                    entry["channels"] = json!(channels);
                }
                entry
            })
            .collect();

        RtpCapabilities(json!({
            "codecs": codecs,
            "headerExtensions": [],
        }))
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.producer(producer_id) else {
            return false;
        };
        let offered = mime_types(rtp_capabilities.as_value());
        self.shared
            .producer_mime_types(&producer)
            .iter()
            .any(|mime| offered.contains(mime))
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>> {
        let ip = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.clone());
        let port = self.shared.allocate_port();

        let mut candidates = Vec::new();
        if options.enable_udp {
            candidates.push(json!({
                "foundation": "udpcandidate",
                "priority": if options.prefer_udp { 1_076_302_079u32 } else { 1_076_302_078 },
                "ip": ip,
                "protocol": "udp",
                "port": port,
                "type": "host",
            }));
        }
        if options.enable_tcp {
            candidates.push(json!({
                "foundation": "tcpcandidate",
                "priority": if options.prefer_udp { 1_076_276_479u32 } else { 1_076_302_079 },
                "ip": ip,
                "protocol": "tcp",
                "port": port,
                "type": "host",
                "tcpType": "passive",
            }));
        }

        let (state_tx, _) = watch::channel(TransportState::Created);
        let transport = Arc::new(LoopbackTransport {
            id: Uuid::new_v4().to_string(),
            ice_parameters: IceParameters(json!({
                "usernameFragment": Uuid::new_v4().simple().to_string(),
                "password": Uuid::new_v4().simple().to_string(),
                "iceLite": true,
            })),
            ice_candidates: IceCandidates(Value::Array(candidates)),
            dtls_parameters: DtlsParameters(json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": fingerprint(),
                }],
            })),
            router: Arc::downgrade(&self.shared),
            handshake_delay: self.shared.handshake_delay,
            state_tx,
            connect_count: AtomicUsize::new(0),
            fail_next_connect: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });

        debug!(transport_id = %transport.id, port, "Loopback transport created");
        self.shared
            .transports
            .write()
            .insert(transport.id.clone(), Arc::clone(&transport));
        Ok(transport)
    }
}

/// Colon-separated hex fingerprint derived from two random UUIDs
fn fingerprint() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// In-process WebRTC transport
pub struct LoopbackTransport {
    id: String,
    ice_parameters: IceParameters,
    ice_candidates: IceCandidates,
    dtls_parameters: DtlsParameters,
    router: Weak<RouterShared>,
    handshake_delay: Duration,
    state_tx: watch::Sender<TransportState>,
    connect_count: AtomicUsize,
    fail_next_connect: AtomicBool,
    producers: Mutex<Vec<Arc<LoopbackProducer>>>,
    consumers: Mutex<Vec<Arc<LoopbackConsumer>>>,
}

impl LoopbackTransport {
    /// Number of DTLS negotiations that reached the engine and succeeded
    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TransportState {
        *self.state_tx.borrow()
    }

    /// Make the next `connect` fail after its handshake delay
    pub fn fail_next_connect(&self) {
        self.fail_next_connect.store(true, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<Arc<RouterShared>> {
        if self.state() == TransportState::Closed {
            return Err(Error::EngineError(format!("transport {} is closed", self.id)));
        }
        self.router
            .upgrade()
            .ok_or_else(|| Error::EngineError("router closed".to_string()))
    }
}

#[async_trait]
impl EngineTransport for LoopbackTransport {
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
        dtls_parameters.validate()?;

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
                self.state().as_str()
            )));
        }

        tokio::time::sleep(self.handshake_delay).await;

        if self.fail_next_connect.swap(false, Ordering::SeqCst) {
            self.state_tx.send_if_modified(|state| {
                if *state == TransportState::Connecting {
                    *state = TransportState::Created;
                    true
                } else {
                    false
                }
            });
            return Err(Error::EngineError(format!(
                "DTLS handshake failed on transport {}",
                self.id
            )));
        }

        let connected = self.state_tx.send_if_modified(|state| {
            if *state == TransportState::Connecting {
                *state = TransportState::Connected;
                true
            } else {
                false
            }
        });
        if !connected {
            return Err(Error::EngineError(format!(
                "transport {} closed during handshake",
                self.id
            )));
        }

        self.connect_count.fetch_add(1, Ordering::SeqCst);
        debug!(transport_id = %self.id, "Loopback transport connected");
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn EngineProducer>> {
        let router = self.ensure_open()?;
        rtp_parameters.validate()?;

        let (closed_tx, _) = watch::channel(None);
        let producer = Arc::new(LoopbackProducer {
            id: Uuid::new_v4().to_string(),
            kind,
            rtp_parameters,
            router: Arc::downgrade(&router),
            closed_tx,
            consumers: Mutex::new(Vec::new()),
        });

        router
            .producers
            .write()
            .insert(producer.id.clone(), Arc::clone(&producer));
        self.producers.lock().push(Arc::clone(&producer));

        debug!(transport_id = %self.id, producer_id = %producer.id, %kind, "Loopback producer created");
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn EngineConsumer>> {
        let router = self.ensure_open()?;

        let producer = router
            .producers
            .read()
            .get(producer_id)
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound(format!("producer {}", producer_id)))?;

        let offered = mime_types(rtp_capabilities.as_value());
        let accepted: Vec<String> = router
            .producer_mime_types(&producer)
            .into_iter()
            .filter(|mime| offered.contains(mime))
            .collect();
        if accepted.is_empty() {
            return Err(Error::CapabilityMismatch(format!(
                "no common codec for producer {}",
                producer_id
            )));
        }

        let (closed_tx, _) = watch::channel(None);
        let consumer = Arc::new(LoopbackConsumer {
            id: Uuid::new_v4().to_string(),
            producer_id: producer.id.clone(),
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters.clone(),
            router: Arc::downgrade(&router),
            paused: AtomicBool::new(paused),
            frames: AtomicU64::new(0),
            closed_tx,
        });

        // A producer closed between lookup and registration must not gain a consumer
        {
            let mut dependents = producer.consumers.lock();
            if producer.is_closed() {
                return Err(Error::ResourceNotFound(format!("producer {}", producer_id)));
            }
            dependents.push(Arc::downgrade(&consumer));
        }
        router
            .consumers
            .write()
            .insert(consumer.id.clone(), Arc::clone(&consumer));
        self.consumers.lock().push(Arc::clone(&consumer));

        debug!(
            transport_id = %self.id,
            consumer_id = %consumer.id,
            producer_id,
            paused,
            "Loopback consumer created"
        );
        Ok(consumer)
    }

    fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    fn close(&self) {
        let closed = self.state_tx.send_if_modified(|state| {
            if *state == TransportState::Closed {
                false
            } else {
                *state = TransportState::Closed;
                true
            }
        });
        if !closed {
            return;
        }

        let producers: Vec<_> = self.producers.lock().drain(..).collect();
        for producer in producers {
            producer.close_with(ProducerCloseReason::TransportClosed);
        }
        let consumers: Vec<_> = self.consumers.lock().drain(..).collect();
        for consumer in consumers {
            consumer.close_with(ConsumerCloseReason::TransportClosed);
        }

        if let Some(router) = self.router.upgrade() {
            router.transports.write().remove(&self.id);
        }
        debug!(transport_id = %self.id, "Loopback transport closed");
    }
}

/// In-process media source
pub struct LoopbackProducer {
    id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    router: Weak<RouterShared>,
    closed_tx: watch::Sender<Option<ProducerCloseReason>>,
    consumers: Mutex<Vec<Weak<LoopbackConsumer>>>,
}

impl LoopbackProducer {
    pub fn is_closed(&self) -> bool {
        self.closed_tx.borrow().is_some()
    }

    /// Inject one synthetic media frame; returns how many consumers received it
    pub fn send_frame(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        let consumers: Vec<_> = self
            .consumers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        consumers
            .iter()
            .filter(|consumer| consumer.deliver_frame())
            .count()
    }

    fn close_with(&self, reason: ProducerCloseReason) {
        let closed = self.closed_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if !closed {
            return;
        }

        if let Some(router) = self.router.upgrade() {
            router.producers.write().remove(&self.id);
        }
        let dependents: Vec<_> = self.consumers.lock().drain(..).collect();
        for consumer in dependents.iter().filter_map(Weak::upgrade) {
            consumer.close_with(ConsumerCloseReason::ProducerClosed);
        }
        debug!(producer_id = %self.id, ?reason, "Loopback producer closed");
    }
}

impl EngineProducer for LoopbackProducer {
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
        self.close_with(ProducerCloseReason::Closed);
    }
}

/// In-process media sink
pub struct LoopbackConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    router: Weak<RouterShared>,
    paused: AtomicBool,
    frames: AtomicU64,
    closed_tx: watch::Sender<Option<ConsumerCloseReason>>,
}

impl LoopbackConsumer {
    pub fn is_closed(&self) -> bool {
        self.closed_tx.borrow().is_some()
    }

    /// Frames delivered while resumed
    pub fn frames_received(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    fn deliver_frame(&self) -> bool {
        if self.is_closed() || self.paused.load(Ordering::SeqCst) {
            return false;
        }
        self.frames.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn close_with(&self, reason: ConsumerCloseReason) {
        let closed = self.closed_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if !closed {
            return;
        }

        if let Some(router) = self.router.upgrade() {
            router.consumers.write().remove(&self.id);
        }
        debug!(consumer_id = %self.id, ?reason, "Loopback consumer closed");
    }
}

#[async_trait]
impl EngineConsumer for LoopbackConsumer {
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
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<()> {
        let delay = self
            .router
            .upgrade()
            .map(|router| router.resume_delay)
            .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.is_closed() {
            return Err(Error::EngineError(format!("consumer {} is closed", self.id)));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_closed(&self) -> watch::Receiver<Option<ConsumerCloseReason>> {
        self.closed_tx.subscribe()
    }

    fn close(&self) {
        self.close_with(ConsumerCloseReason::Closed);
    }
}
