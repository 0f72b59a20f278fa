//! Operations for model-based testing.
//!
//! Operations represent everything a peer can do to a shared room. They are
//! generated randomly by proptest and applied to both the model and the real
//! simulated system.

use arbitrary::Arbitrary;
use ensemble_proto::{Identification, TargetType};

/// Client identifier (0-indexed).
pub type ClientId = u8;

/// Target slot, mapped onto a small fixed set of targets.
pub type TargetSlot = u8;

/// Number of distinct targets.
pub const TARGET_SLOTS: u8 = 3;

/// Property names, indexed by `property % PROPERTY_NAMES.len()`.
pub const PROPERTY_NAMES: [&str; 3] = ["color", "health", "owner"];

/// Operations that can be applied to the system.
///
/// Each operation is performed by one client. Delivery is instant: the real
/// system settles after every operation.
#[derive(Debug, Clone, Arbitrary)]
pub enum Operation {
    /// Client writes (or deletes) a property.
    SetProperty {
        /// Client performing the write.
        client_id: ClientId,
        /// Target slot.
        target: TargetSlot,
        /// Property index.
        property: u8,
        /// New value, `None` deletes.
        value: Option<u8>,
    },

    /// Client clears every property of a target.
    ClearProperties {
        /// Client performing the clear.
        client_id: ClientId,
        /// Target slot.
        target: TargetSlot,
    },

    /// Client sends a command to a target.
    SendMessage {
        /// Sender.
        client_id: ClientId,
        /// Target slot.
        target: TargetSlot,
        /// Command number.
        command: u8,
    },

    /// Client loses its link.
    Disconnect {
        /// Client going offline.
        client_id: ClientId,
    },

    /// Client opens a new link and rejoins the room.
    Reconnect {
        /// Client coming back.
        client_id: ClientId,
    },
}

impl Operation {
    /// Client performing the operation.
    pub fn client_id(&self) -> ClientId {
        match self {
            Self::SetProperty { client_id, .. }
            | Self::ClearProperties { client_id, .. }
            | Self::SendMessage { client_id, .. }
            | Self::Disconnect { client_id }
            | Self::Reconnect { client_id } => *client_id,
        }
    }

    /// Same operation with the client id wrapped into `0..num_clients`.
    #[must_use]
    pub fn clamped(mut self, num_clients: usize) -> Self {
        let limit = u8::try_from(num_clients.max(1)).unwrap_or(u8::MAX);
        match &mut self {
            Self::SetProperty { client_id, .. }
            | Self::ClearProperties { client_id, .. }
            | Self::SendMessage { client_id, .. }
            | Self::Disconnect { client_id }
            | Self::Reconnect { client_id } => *client_id %= limit,
        }
        self
    }
}

/// Identification of a target slot: two roots and one child of the first.
pub fn target_id(slot: TargetSlot) -> Identification {
    match slot % TARGET_SLOTS {
        0 => Identification::new(TargetType::Object, "crate"),
        1 => Identification::new(TargetType::Object, "lamp"),
        _ => Identification::with_address(TargetType::Object, "crate", vec![1]),
    }
}

/// Property name for an index.
pub fn property_name(property: u8) -> &'static str {
    PROPERTY_NAMES[usize::from(property) % PROPERTY_NAMES.len()]
}

/// Command string for a command number.
pub fn command_name(command: u8) -> String {
    format!("cmd-{command}")
}

/// Result of applying an operation.
///
/// Used to compare model and real system behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// Operation succeeded.
    Ok,

    /// Operation failed with expected error.
    Error(OperationError),
}

/// Expected errors that can occur during operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// Invalid client ID.
    InvalidClient,

    /// The operation needs a joined room.
    NotConnected,

    /// The client is already in the room.
    AlreadyConnected,
}

impl OperationResult {
    /// Check if operation succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Check if operation failed.
    pub fn is_err(&self) -> bool {
        !self.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_wrap() {
        assert_eq!(target_id(3), target_id(0));
        assert!(target_id(2).address() == [1]);
        assert_eq!(target_id(2).root(), target_id(0));
        assert_eq!(property_name(4), "health");
    }

    #[test]
    fn clamping_wraps_client() {
        let op = Operation::Disconnect { client_id: 7 }.clamped(3);
        assert_eq!(op.client_id(), 1);
    }
}
