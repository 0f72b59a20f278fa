//! Deterministic simulation harness for Ensemble.
//!
//! Runs real sharing sessions against the real room manager without sockets
//! or threads:
//!
//! - [`SimEnv`]: virtual clock and seeded randomness
//! - [`SimHub`]: in-process room server with link cuts and datagram loss
//! - [`SimTransport`]: [`Transport`] and [`Lobby`] over a hub session
//! - [`SimClient`]: a session wired to a simulated transport
//!
//! Given the same seed, a simulation produces the same player ids, the same
//! generated labels and the same datagram losses.
//!
//! # Model-Based Testing
//!
//! The `model` module provides a reference implementation for model-based
//! testing. Operations are applied to both the model and the simulated system,
//! and their observable states are compared.
//!
//! [`Transport`]: ensemble_core::Transport
//! [`Lobby`]: ensemble_core::Lobby

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod model;
pub mod sim_client;
pub mod sim_env;
pub mod sim_hub;
pub mod sim_transport;

pub use model::{
    ClientId, ModelClient, ModelMessage, ModelWorld, ObservableState, Operation, OperationError,
    OperationResult, PropertyKey, TargetSlot,
};
pub use sim_client::{SimClient, settle};
pub use sim_env::SimEnv;
pub use sim_hub::{Delivery, HubStats, SimHub};
pub use sim_transport::SimTransport;
