//! Client error types.

use ensemble_proto::ProtocolError;
use thiserror::Error;

/// Errors from the QUIC client transport.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration could not be turned into a TLS/QUIC setup.
    #[error("configuration error: {reason}")]
    Config {
        /// What was wrong.
        reason: String,
    },

    /// Socket setup failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection could not be initiated.
    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    /// The connection failed or was closed.
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    /// The handshake did not finish in time.
    #[error("connect timed out")]
    Timeout,

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The control stream broke.
    #[error("stream error: {reason}")]
    Stream {
        /// Description of the stream failure.
        reason: String,
    },
}

impl ClientError {
    /// Returns true if retrying with the same settings cannot succeed.
    ///
    /// Network failures are transient; configuration and protocol errors are
    /// not.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config { .. } | Self::Protocol(_) | Self::Connect(_) => true,

            Self::Io(_) | Self::Connection(_) | Self::Timeout | Self::Stream { .. } => false,
        }
    }
}

impl From<quinn::ReadExactError> for ClientError {
    fn from(err: quinn::ReadExactError) -> Self {
        Self::Stream { reason: err.to_string() }
    }
}

impl From<quinn::WriteError> for ClientError {
    fn from(err: quinn::WriteError) -> Self {
        Self::Stream { reason: err.to_string() }
    }
}
