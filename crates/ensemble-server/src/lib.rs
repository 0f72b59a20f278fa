//! Ensemble room relay server.
//!
//! This crate provides the production server implementation using:
//! - Quinn for QUIC transport
//! - Tokio for async runtime
//! - System time and OS randomness
//!
//! ## Architecture
//!
//! ```text
//! ensemble-server
//!   ├─ SystemEnv           (production Environment impl)
//!   ├─ QuinnTransport      (QUIC via Quinn)
//!   ├─ RoomManager         (Sans-IO rooms, sessions, property stores)
//!   ├─ ConnectionRegistry  (session -> outbound queue)
//!   └─ execute_actions     (RoomAction -> queued frames/datagrams)
//! ```
//!
//! ## Wire usage
//!
//! Each client opens one bidirectional stream right after the handshake and
//! keeps it for the lifetime of the connection. Control frames travel on it
//! as length-prefixed CBOR; transform updates travel as QUIC datagrams.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod executor;
mod registry;
mod room_manager;
mod system_env;
mod transport;

use std::sync::Arc;

use ensemble_core::env::Environment;
use ensemble_proto::{
    ClientFrame, LENGTH_PREFIX_SIZE, decode_datagram, decode_payload, payload_len,
};
pub use error::ServerError;
pub use executor::{ExecutionStats, execute_actions};
pub use registry::{ConnectionRegistry, Outbound, SessionInfo};
pub use room_manager::{
    RoomAction, RoomConfig, RoomError, RoomManager, RoomMetadata, SessionId, rejection,
};
pub use system_env::SystemEnv;
use tokio::sync::{Mutex, mpsc};
pub use transport::QuinnTransport;

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:4433")
    pub bind_address: String,
    /// Path to TLS certificate (PEM format)
    pub cert_path: Option<String>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<String>,
    /// Room limits
    pub rooms: RoomConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            cert_path: None,
            key_path: None,
            rooms: RoomConfig::default(),
        }
    }
}

/// Room state and live connections, locked together so actions are executed
/// against the membership that produced them.
struct Shared {
    manager: RoomManager<SystemEnv>,
    connections: ConnectionRegistry,
}

/// Production Ensemble server.
///
/// Wraps `RoomManager` with Quinn QUIC transport and system environment.
pub struct Server {
    shared: Arc<Mutex<Shared>>,
    transport: QuinnTransport,
    env: SystemEnv,
}

impl Server {
    /// Create and bind a new server.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Binding to the address fails
    /// - TLS configuration is invalid
    pub fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let env = SystemEnv::new();
        let manager = RoomManager::new(env.clone(), config.rooms);
        let transport =
            QuinnTransport::bind(&config.bind_address, config.cert_path, config.key_path)?;

        let shared = Shared { manager, connections: ConnectionRegistry::new() };
        Ok(Self { shared: Arc::new(Mutex::new(shared)), transport, env })
    }

    /// Run the server, accepting connections and processing frames.
    ///
    /// This method runs until the endpoint is closed.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.transport.local_addr()?);

        while let Some(conn) = self.transport.accept().await {
            let shared = Arc::clone(&self.shared);
            let env = self.env.clone();

            tokio::spawn(async move {
                let remote = conn.remote_address();
                if let Err(e) = handle_connection(conn, shared, env).await {
                    tracing::debug!(%remote, "connection ended: {}", e);
                }
            });
        }

        tracing::info!("Endpoint closed");
        Ok(())
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }
}

/// Handle a single QUIC connection from accept to close.
async fn handle_connection(
    conn: quinn::Connection,
    shared: Arc<Mutex<Shared>>,
    env: SystemEnv,
) -> Result<(), ServerError> {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let session_id = {
        let mut state = shared.lock().await;
        let session_id = state.manager.register_session();
        let info = SessionInfo { remote: conn.remote_address(), connected_at: env.now() };
        state.connections.insert(session_id, info, outbound_tx);
        session_id
    };

    tracing::debug!(session_id, remote = %conn.remote_address(), "new connection");

    let result = serve_session(session_id, &conn, &shared, outbound_rx).await;

    {
        let mut state = shared.lock().await;
        let actions = state.manager.disconnect(session_id);
        state.connections.remove(session_id);
        execute_actions(&state.manager, &state.connections, actions);
    }

    tracing::debug!(session_id, "connection closed");
    result
}

async fn serve_session(
    session_id: SessionId,
    conn: &quinn::Connection,
    shared: &Arc<Mutex<Shared>>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) -> Result<(), ServerError> {
    let (send, mut recv) = conn.accept_bi().await?;

    let writer = tokio::spawn(write_outbound(conn.clone(), send, outbound_rx));
    let datagrams = tokio::spawn(read_datagrams(session_id, conn.clone(), Arc::clone(shared)));

    let result = read_frames(session_id, &mut recv, shared).await;
    if let Err(ServerError::Room(e)) = &result {
        conn.close(1u32.into(), e.to_string().as_bytes());
    }

    datagrams.abort();
    writer.abort();
    result
}

/// Reads control frames until the stream ends or a frame is malformed.
async fn read_frames(
    session_id: SessionId,
    recv: &mut quinn::RecvStream,
    shared: &Arc<Mutex<Shared>>,
) -> Result<(), ServerError> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    loop {
        if let Err(e) = recv.read_exact(&mut prefix).await {
            tracing::debug!(session_id, "control stream ended: {}", e);
            return Ok(());
        }

        let len = payload_len(prefix)?;
        let mut payload = vec![0u8; len];
        recv.read_exact(&mut payload).await?;
        let frame: ClientFrame = decode_payload(&payload)?;

        let mut state = shared.lock().await;
        let seq = frame.write_seq();
        let actions = match state.manager.process_frame(session_id, frame) {
            Ok(actions) => actions,
            Err(e) if e.is_fatal() => {
                tracing::warn!(session_id, "closing session: {}", e);
                return Err(e.into());
            },
            Err(e) => {
                tracing::debug!(session_id, "request rejected: {}", e);
                vec![rejection(session_id, &e, seq)]
            },
        };
        execute_actions(&state.manager, &state.connections, actions);
    }
}

/// Relays transform datagrams until the connection closes.
async fn read_datagrams(
    session_id: SessionId,
    conn: quinn::Connection,
    shared: Arc<Mutex<Shared>>,
) {
    while let Ok(bytes) = conn.read_datagram().await {
        let datagram = match decode_datagram(&bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::debug!(session_id, "dropping malformed datagram: {}", e);
                continue;
            },
        };

        let state = shared.lock().await;
        let actions = state.manager.process_datagram(session_id, datagram);
        execute_actions(&state.manager, &state.connections, actions);
    }
}

/// Drains a connection's outbound queue onto the wire.
async fn write_outbound(
    conn: quinn::Connection,
    mut send: quinn::SendStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(bytes) => {
                if let Err(e) = send.write_all(&bytes).await {
                    tracing::debug!("control stream write failed: {}", e);
                    break;
                }
            },
            Outbound::Datagram(bytes) => {
                if let Err(e) = conn.send_datagram(bytes) {
                    tracing::trace!("datagram dropped: {}", e);
                }
            },
        }
    }
}
