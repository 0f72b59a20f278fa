//! Server error types.

use std::fmt;

use ensemble_proto::ProtocolError;

use crate::room_manager::RoomError;

/// Errors that can occur in the server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error
    Config(String),

    /// Transport/network error
    Transport(String),

    /// Protocol error
    Protocol(ProtocolError),

    /// Internal error
    Internal(String),

    /// Room manager rejected a request fatally
    Room(RoomError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
            Self::Room(err) => write!(f, "room error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(err) => Some(err),
            Self::Room(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}

impl From<RoomError> for ServerError {
    fn from(err: RoomError) -> Self {
        Self::Room(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<quinn::ConnectionError> for ServerError {
    fn from(err: quinn::ConnectionError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<quinn::ReadExactError> for ServerError {
    fn from(err: quinn::ReadExactError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<quinn::WriteError> for ServerError {
    fn from(err: quinn::WriteError) -> Self {
        Self::Transport(err.to_string())
    }
}
