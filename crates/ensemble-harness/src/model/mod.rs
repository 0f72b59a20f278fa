//! Reference model for model-based testing.
//!
//! The model is a simplified implementation of a shared room: one
//! last-write-wins store, peers that go offline and come back, and commands
//! fanned out to the other peers. It serves as the oracle against which the
//! simulated system is verified.
//!
//! # Design Principles
//!
//! - Simplicity: The model should be obviously correct
//! - Instant delivery: every operation is fully propagated before the next
//! - Deterministic: Same inputs produce same outputs

mod client;
pub mod operation;
mod world;

pub use client::{ModelClient, ModelMessage, PropertyKey};
pub use operation::{
    ClientId, Operation, OperationError, OperationResult, PROPERTY_NAMES, TARGET_SLOTS,
    TargetSlot, command_name, property_name, target_id,
};
pub use world::{ModelWorld, ObservableState};
