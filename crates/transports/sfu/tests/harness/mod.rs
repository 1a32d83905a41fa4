//! SFU end-to-end test harness
//!
//! Provides:
//! - An embedded signaling server on a random port, backed by the loopback
//!   engine so tests can inspect engine-side state
//! - Simulated browser devices for the producer and consumer sessions
//! - Raw signaling clients for protocol-level checks
//!
//! Call `harness.shutdown()` at the end of each test.

#![allow(dead_code)]

pub mod device;
pub mod test_server;

use relaycast_sfu::{
    ClientConfig, ConsumerSession, LoopbackWorker, ProducerSession, SfuConfig, SignalingClient,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use device::SimulatedDevice;
pub use test_server::TestServer;

/// Room every harness session publishes into
pub const TEST_ROOM: &str = "1";

/// Upper bound on any single wait in a test
pub const WAIT: Duration = Duration::from_secs(5);

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Client error: {0}")]
    ClientError(#[from] relaycast_sfu::Error),

    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Install a test subscriber once per process; `RUST_LOG` overrides
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("relaycast_sfu=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds or `WAIT` elapses
pub async fn wait_until<F>(what: &str, mut check: F) -> HarnessResult<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            return Err(HarnessError::Timeout(what.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Await `future` for at most `WAIT`
pub async fn within<T>(what: &str, future: impl Future<Output = T>) -> HarnessResult<T> {
    tokio::time::timeout(WAIT, future)
        .await
        .map_err(|_| HarnessError::Timeout(what.to_string()))
}

/// Server plus client factories
pub struct SfuTestHarness {
    pub server: TestServer,
}

impl SfuTestHarness {
    pub async fn new() -> HarnessResult<Self> {
        Self::with_config(SfuConfig::local_preset()).await
    }

    pub async fn with_config(config: SfuConfig) -> HarnessResult<Self> {
        Self::with_worker(config, LoopbackWorker::new()).await
    }

    pub async fn with_worker(config: SfuConfig, worker: LoopbackWorker) -> HarnessResult<Self> {
        init_test_tracing();
        let server = TestServer::with_worker(config, worker).await?;
        info!("SFU test harness ready at {}", server.url());
        Ok(Self { server })
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.server.url()).with_room(TEST_ROOM)
    }

    /// Raw protocol client
    pub async fn signaling_client(&self) -> HarnessResult<SignalingClient> {
        Ok(SignalingClient::connect(&self.client_config()).await?)
    }

    /// Producer session that has reached `Active`
    pub async fn start_producer(
        &self,
        device: Arc<SimulatedDevice>,
    ) -> HarnessResult<ProducerSession> {
        let mut session = ProducerSession::connect(self.client_config(), device).await?;
        session.start().await?;
        Ok(session)
    }

    /// Consumer session that has reached `Subscribed`
    pub async fn start_consumer(
        &self,
        device: Arc<SimulatedDevice>,
    ) -> HarnessResult<ConsumerSession> {
        let mut session = ConsumerSession::connect(self.client_config(), device).await?;
        session.start().await?;
        Ok(session)
    }

    /// Wait until the server has no connection records left
    pub async fn wait_for_disconnects(&self) -> HarnessResult<()> {
        let store = Arc::clone(&self.server.state().store);
        wait_until("all connections torn down", || store.is_empty()).await
    }

    pub async fn shutdown(&self) {
        self.server.shutdown().await;
    }
}
