//! WebSocket signaling server
//!
//! Binds the signaling listener and runs the accept loop as a task on the
//! ambient multi-threaded runtime. Each accepted socket gets its own
//! connection task; a shutdown broadcast stops the accept loop and every
//! connection loop.

use super::connection::handle_connection;
use crate::signaling::handler::SharedState;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// WebSocket signaling server
pub struct WebSocketSignalingServer {
    /// Server address
    addr: SocketAddr,

    /// Shared state
    state: Arc<SharedState>,
}

impl WebSocketSignalingServer {
    /// Create a server bound to the state's configured listen address
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `listen_address` is not a socket address.
    pub fn new(state: Arc<SharedState>) -> Result<Self> {
        let addr: SocketAddr = state.config.listen_address.parse().map_err(|e| {
            Error::InvalidConfig(format!(
                "listen_address {} is not a socket address: {}",
                state.config.listen_address, e
            ))
        })?;
        Ok(Self { addr, state })
    }

    /// Get shared state (for external access)
    pub fn state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    /// Get the configured address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bind the listener and start accepting connections
    ///
    /// Returns once the listener is bound. Dropping the returned handle
    /// without calling [`WebSocketServerHandle::shutdown`] also stops the
    /// server.
    pub async fn start(self) -> Result<WebSocketServerHandle> {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!("Failed to bind WebSocket server to {}: {}", self.addr, e);
            Error::IoError(e)
        })?;
        let local_addr = listener.local_addr()?;

        info!("WebSocket signaling server listening on ws://{}", local_addr);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let connection_shutdown = shutdown_tx.clone();
        let state = self.state;

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let state = Arc::clone(&state);
                                let shutdown_rx = connection_shutdown.subscribe();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, state, shutdown_rx).await {
                                        error!("WebSocket connection error from {}: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept WebSocket connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("WebSocket signaling server received shutdown signal");
                        break;
                    }
                }
            }

            info!("WebSocket signaling server accept loop exited");
        });

        Ok(WebSocketServerHandle {
            local_addr,
            accept_task: Some(accept_task),
            shutdown_tx,
        })
    }
}

/// Handle for controlling the WebSocket server
pub struct WebSocketServerHandle {
    local_addr: SocketAddr,
    accept_task: Option<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL of the server
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Stop accepting and close every open connection
    pub async fn shutdown(mut self) {
        info!("Sending shutdown signal to WebSocket server");
        let _ = self.shutdown_tx.send(());

        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                error!("WebSocket accept loop ended abnormally: {}", e);
            }
        }
    }
}
