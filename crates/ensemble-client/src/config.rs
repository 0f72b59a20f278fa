//! Client configuration.

use std::{net::SocketAddr, time::Duration};

use rustls::pki_types::CertificateDer;

/// Receive buffer for transform datagrams.
const DATAGRAM_BUFFER_SIZE: usize = 1024 * 1024;

/// How the server certificate is checked.
#[derive(Debug, Clone, Default)]
pub enum CertificateVerification {
    /// Trust exactly these certificates as roots.
    Trusted(Vec<CertificateDer<'static>>),
    /// Accept any certificate (development servers with self-signed certs).
    #[default]
    SkipVerification,
}

/// Settings for [`QuicTransport::connect`](crate::QuicTransport::connect).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address.
    pub server_addr: SocketAddr,
    /// Name presented for SNI and checked against the certificate.
    pub server_name: String,
    /// Display name sent in the handshake.
    pub player_name: String,
    /// Certificate policy.
    pub cert_verification: CertificateVerification,
    /// Upper bound on the QUIC handshake.
    pub connect_timeout: Duration,
    /// Idle time after which the connection is considered lost.
    pub idle_timeout: Duration,
    /// Keep-alive interval, well below the idle timeout.
    pub keep_alive_interval: Duration,
    /// Receive buffer for transform datagrams.
    pub datagram_receive_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 4433)),
            server_name: "localhost".to_string(),
            player_name: "player".to_string(),
            cert_verification: CertificateVerification::default(),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(5),
            datagram_receive_buffer_size: DATAGRAM_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    /// Default settings for `server_addr`.
    pub fn new(server_addr: SocketAddr) -> Self {
        Self { server_addr, ..Self::default() }
    }

    /// Sets the handshake display name.
    #[must_use]
    pub fn with_player_name(mut self, name: impl Into<String>) -> Self {
        self.player_name = name.into();
        self
    }
}
