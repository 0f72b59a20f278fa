//! Routing errors.
//!
//! Every variant is recoverable: the session logs the error, drops the event
//! and moves on to the next one.

use ensemble_proto::DecodeError;
use thiserror::Error;

/// Why a transport event could not be routed to a target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// A property notification carried a key that is not `{target}:{name}`.
    #[error("malformed property key {key:?}: {source}")]
    MalformedPropertyKey {
        /// The raw key.
        key: String,
        /// Decoder failure.
        #[source]
        source: DecodeError,
    },

    /// A message or transform carried a key that is not a target key.
    #[error("malformed target key {key:?}: {source}")]
    MalformedTargetKey {
        /// The raw key.
        key: String,
        /// Decoder failure.
        #[source]
        source: DecodeError,
    },
}

impl RouteError {
    /// The raw key that failed to decode.
    pub fn key(&self) -> &str {
        match self {
            Self::MalformedPropertyKey { key, .. } | Self::MalformedTargetKey { key, .. } => key,
        }
    }
}
