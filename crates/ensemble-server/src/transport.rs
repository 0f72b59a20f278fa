//! QUIC transport via Quinn.
//!
//! Wraps a server endpoint: TLS setup (PEM files or a self-signed development
//! certificate), transport tuning, and connection acceptance. Per-connection
//! framing lives in the crate root.

use std::{fs::File, io::BufReader, net::SocketAddr, sync::Arc, time::Duration};

use ensemble_proto::ALPN;
use quinn::{Connection, Endpoint, ServerConfig, TransportConfig, crypto::rustls::QuicServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::ServerError;

/// Idle time after which a silent connection is dropped.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Keep-alive interval, well below the idle timeout.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Receive buffer for transform datagrams.
const DATAGRAM_BUFFER_SIZE: usize = 1024 * 1024;

/// Accepting QUIC endpoint.
pub struct QuinnTransport {
    endpoint: Endpoint,
}

impl QuinnTransport {
    /// Binds a server endpoint.
    ///
    /// Without both `cert_path` and `key_path`, a self-signed certificate for
    /// `localhost` is generated.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn bind(
        bind_address: &str,
        cert_path: Option<String>,
        key_path: Option<String>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = bind_address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address {bind_address}: {e}")))?;

        let (certs, key) = match (cert_path, key_path) {
            (Some(cert), Some(key)) => load_pem(&cert, &key)?,
            _ => self_signed()?,
        };

        let mut crypto = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| ServerError::Config(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Config(format!("invalid certificate: {e}")))?;
        crypto.alpn_protocols = vec![ALPN.to_vec()];

        let quic_crypto =
            QuicServerConfig::try_from(crypto).map_err(|e| ServerError::Config(e.to_string()))?;
        let mut server_config = ServerConfig::with_crypto(Arc::new(quic_crypto));

        let mut transport = TransportConfig::default();
        transport
            .max_idle_timeout(Some(
                IDLE_TIMEOUT.try_into().map_err(|_| ServerError::Config("idle timeout".into()))?,
            ))
            .keep_alive_interval(Some(KEEP_ALIVE_INTERVAL))
            .datagram_receive_buffer_size(Some(DATAGRAM_BUFFER_SIZE));
        server_config.transport_config(Arc::new(transport));

        let endpoint = Endpoint::server(server_config, addr)?;
        Ok(Self { endpoint })
    }

    /// Waits for the next established connection.
    ///
    /// Failed handshakes are logged and skipped. Returns `None` once the
    /// endpoint is closed.
    pub async fn accept(&self) -> Option<Connection> {
        loop {
            let incoming = self.endpoint.accept().await?;
            match incoming.await {
                Ok(connection) => return Some(connection),
                Err(e) => tracing::debug!("handshake failed: {}", e),
            }
        }
    }

    /// Get the local address the endpoint is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Closes the endpoint and every connection.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server shutting down");
    }
}

fn load_pem(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ServerError> {
    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ServerError::Config(format!("no certificates in {cert_path}")));
    }

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| ServerError::Config(format!("no private key in {key_path}")))?;

    Ok((certs, key))
}

fn self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ServerError> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Config(format!("failed to generate certificate: {e}")))?;

    let cert = CertificateDer::from(certified.cert.der().to_vec());
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    Ok((vec![cert], key.into()))
}
