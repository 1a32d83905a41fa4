//! Embedded SFU signaling server for integration tests
//!
//! Runs the real WebSocket server on a random loopback port, backed by the
//! in-process loopback engine.

use super::{HarnessError, HarnessResult};
use relaycast_sfu::engine::loopback::LoopbackRouter;
use relaycast_sfu::engine::MediaWorker;
use relaycast_sfu::{
    LoopbackWorker, SfuConfig, SfuEvent, SharedState, WebSocketServerHandle,
    WebSocketSignalingServer,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Embedded signaling server for testing
pub struct TestServer {
    handle: Mutex<Option<WebSocketServerHandle>>,
    url: String,
    state: Arc<SharedState>,
    worker: Arc<LoopbackWorker>,
    router: Arc<LoopbackRouter>,
    events: Mutex<mpsc::Receiver<SfuEvent>>,
}

impl TestServer {
    /// Start a server on 127.0.0.1 with a random port
    pub async fn new(config: SfuConfig) -> HarnessResult<Self> {
        Self::with_worker(config, LoopbackWorker::new()).await
    }

    /// Start a server backed by a preconfigured loopback worker
    pub async fn with_worker(config: SfuConfig, worker: LoopbackWorker) -> HarnessResult<Self> {
        let config = Arc::new(config);
        let worker = Arc::new(worker);

        let router = worker
            .create_router(&config.media_codecs)
            .await
            .map_err(|e| HarnessError::ServerError(format!("Failed to create router: {}", e)))?;
        let loopback_router = worker
            .routers()
            .into_iter()
            .next()
            .ok_or_else(|| HarnessError::ServerError("worker has no router".to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let state = Arc::new(SharedState::new_with_events(config, Some(event_tx)));
        state.attach_router(router);

        let server = WebSocketSignalingServer::new(Arc::clone(&state))
            .map_err(|e| HarnessError::ServerError(e.to_string()))?;
        let handle = server
            .start()
            .await
            .map_err(|e| HarnessError::ServerError(format!("Failed to start: {}", e)))?;
        let url = handle.url();
        info!("Test server listening on {}", url);

        Ok(Self {
            handle: Mutex::new(Some(handle)),
            url,
            state,
            worker,
            router: loopback_router,
            events: Mutex::new(event_rx),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn worker(&self) -> &Arc<LoopbackWorker> {
        &self.worker
    }

    pub fn router(&self) -> &Arc<LoopbackRouter> {
        &self.router
    }

    /// Next event matching `filter`, skipping the rest
    pub async fn next_event<F>(&self, mut filter: F) -> Option<SfuEvent>
    where
        F: FnMut(&SfuEvent) -> bool,
    {
        let mut events = self.events.lock().await;
        while let Some(event) = events.recv().await {
            if filter(&event) {
                return Some(event);
            }
        }
        None
    }

    /// Stop accepting and close every connection
    pub async fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.shutdown().await;
        }
    }
}
