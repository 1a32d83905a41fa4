//! Transport lifecycle management
//!
//! Creates the per-connection send/receive transports on the shared router,
//! runs the one-shot DTLS negotiation behind a per-transport guard, and
//! releases a transport from its connection record once the engine reports it
//! closed.

use crate::engine::{DtlsParameters, EngineTransport, TransportState, WebRtcTransportOptions};
use crate::session::{Connection, SessionStore};
use crate::signaling::protocol::TransportInfo;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Direction of a transport relative to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportRole {
    /// Client → server media (producers)
    Send,
    /// Server → client media (consumers)
    Receive,
}

impl TransportRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportRole::Send => "send",
            TransportRole::Receive => "receive",
        }
    }
}

impl std::fmt::Display for TransportRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An engine transport as tracked by a connection record
#[derive(Clone)]
pub struct ManagedTransport {
    role: TransportRole,
    engine: Arc<dyn EngineTransport>,
    /// In-flight DTLS negotiation, kept across cancelled callers
    negotiation: Arc<AsyncMutex<Option<JoinHandle<Result<()>>>>>,
    connected: Arc<AtomicBool>,
}

impl ManagedTransport {
    fn new(role: TransportRole, engine: Arc<dyn EngineTransport>) -> Self {
        Self {
            role,
            engine,
            negotiation: Arc::new(AsyncMutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        self.engine.id()
    }

    pub fn role(&self) -> TransportRole {
        self.role
    }

    pub fn engine(&self) -> &Arc<dyn EngineTransport> {
        &self.engine
    }

    /// Whether the DTLS negotiation has completed
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.engine.subscribe_state().borrow() == TransportState::Closed
    }

    fn info(&self) -> TransportInfo {
        TransportInfo {
            id: self.engine.id().to_string(),
            ice_parameters: self.engine.ice_parameters(),
            ice_candidates: self.engine.ice_candidates(),
            dtls_parameters: self.engine.dtls_parameters(),
        }
    }

    fn close(&self) {
        self.engine.close();
    }
}

/// Creates, connects and tears down connection transports
pub struct TransportManager {
    store: Arc<SessionStore>,
    options: WebRtcTransportOptions,
}

impl TransportManager {
    pub fn new(store: Arc<SessionStore>, options: WebRtcTransportOptions) -> Self {
        Self { store, options }
    }

    /// Create a transport of `role` for a connection
    ///
    /// A transport already held in that role is closed and replaced.
    ///
    /// # Errors
    ///
    /// - `ResourceNotFound` if the router is not initialized or the
    ///   connection is gone or closing
    /// - engine errors from transport creation
    pub async fn create_transport(
        &self,
        connection_id: &str,
        role: TransportRole,
    ) -> Result<TransportInfo> {
        let connection = self.store.live(connection_id)?;
        let router = self.store.router()?;

        let engine = router.create_webrtc_transport(&self.options).await?;
        let managed = ManagedTransport::new(role, engine);

        if connection.is_closing() {
            managed.close();
            return Err(Error::ResourceNotFound(format!(
                "connection {} closed while creating transport",
                connection_id
            )));
        }

        self.watch_state(connection_id, &managed);

        if let Some(previous) = connection.replace_transport(role, managed.clone()) {
            info!(
                connection_id,
                %role,
                previous_transport_id = previous.id(),
                transport_id = managed.id(),
                "Replacing existing transport"
            );
            previous.close();
        } else {
            info!(connection_id, %role, transport_id = managed.id(), "Transport created");
        }

        Ok(managed.info())
    }

    /// Run the DTLS negotiation for the connection's `role` transport
    ///
    /// Concurrent and repeated calls are serialized per transport; once one
    /// succeeds the rest return `Ok(())` without touching the engine. A failed
    /// negotiation leaves the transport unconnected so the caller may retry.
    ///
    /// The engine handshake runs in its own task. A caller dropped mid-way
    /// (request timeout, disconnect) leaves it running, and the next call
    /// joins it instead of starting a second handshake.
    ///
    /// # Errors
    ///
    /// - `ValidationError` if the connection holds no transport of `role` or
    ///   `dtls_parameters` is not an object
    /// - `ResourceNotFound` if the transport has closed
    pub async fn connect(
        &self,
        connection_id: &str,
        role: TransportRole,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        dtls_parameters.validate()?;
        let connection = self.store.live(connection_id)?;
        let transport = connection.transport(role).ok_or_else(|| {
            Error::ValidationError(format!("connection has no {} transport", role))
        })?;

        let mut negotiation = transport.negotiation.lock().await;

        if transport.is_closed() {
            return Err(Error::ResourceNotFound(format!(
                "transport {} is closed",
                transport.id()
            )));
        }
        if transport.is_connected() {
            debug!(connection_id, transport_id = transport.id(), "Transport already connected");
            return Ok(());
        }

        if negotiation
            .as_ref()
            .is_some_and(|pending| pending.is_finished())
        {
            // Abandoned attempt that failed; start over
            *negotiation = None;
        }
        if negotiation.is_some() {
            debug!(
                connection_id,
                transport_id = transport.id(),
                "Joining in-flight transport negotiation"
            );
        }
        let handshake = negotiation.get_or_insert_with(|| {
            let engine = Arc::clone(&transport.engine);
            let connected = Arc::clone(&transport.connected);
            tokio::spawn(async move {
                engine.connect(dtls_parameters).await?;
                connected.store(true, Ordering::SeqCst);
                Ok::<(), Error>(())
            })
        });

        let outcome = match handshake.await {
            Ok(outcome) => outcome,
            Err(e) => Err(Error::InternalError(format!(
                "transport negotiation task failed: {}",
                e
            ))),
        };
        *negotiation = None;

        match outcome {
            Ok(()) => {
                info!(connection_id, %role, transport_id = transport.id(), "Transport connected");
                Ok(())
            }
            Err(e) => {
                warn!(
                    connection_id,
                    transport_id = transport.id(),
                    error = %e,
                    "Transport connect failed"
                );
                Err(e)
            }
        }
    }

    /// Close and clear both transports of a connection (receive first)
    pub fn teardown(&self, connection: &Connection) {
        for role in [TransportRole::Receive, TransportRole::Send] {
            if let Some(transport) = connection.take_transport(role) {
                debug!(
                    connection_id = connection.id(),
                    %role,
                    transport_id = transport.id(),
                    "Closing transport"
                );
                transport.close();
            }
        }
    }

    /// Release the transport from its connection once the engine closes it
    fn watch_state(&self, connection_id: &str, transport: &ManagedTransport) {
        let store = Arc::clone(&self.store);
        let connection_id = connection_id.to_string();
        let transport_id = transport.id().to_string();
        let role = transport.role;
        let mut state = transport.engine.subscribe_state();

        tokio::spawn(async move {
            loop {
                if *state.borrow_and_update() == TransportState::Closed {
                    break;
                }
                if state.changed().await.is_err() {
                    break;
                }
            }

            if let Some(connection) = store.get(&connection_id) {
                if connection.release_transport(role, &transport_id) {
                    debug!(
                        connection_id = %connection_id,
                        transport_id = %transport_id,
                        "Released closed transport"
                    );
                }
            }
        });
    }
}
