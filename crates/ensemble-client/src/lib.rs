//! Ensemble QUIC client.
//!
//! [`QuicTransport`] connects a [`SharingSession`] to an Ensemble room server.
//! It implements both the core [`Transport`] boundary and the [`Lobby`]
//! membership API.
//!
//! ```text
//! SharingSession ──▶ QuicTransport ──▶ control stream (CBOR frames)
//!                          │        └─▶ datagrams (transforms)
//!                          └─ RoomMirror (last known room store)
//! ```
//!
//! [`SharingSession`]: ensemble_core::SharingSession
//! [`Transport`]: ensemble_core::Transport
//! [`Lobby`]: ensemble_core::Lobby

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod transport;
mod verify;

pub use config::{CertificateVerification, ClientConfig};
pub use error::ClientError;
pub use transport::QuicTransport;
