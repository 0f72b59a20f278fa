//! Model client.
//!
//! A peer's view of the room: its local property cache, whether it is in the
//! room, and the commands it has received.

use std::collections::BTreeMap;

use super::operation::{ClientId, TargetSlot};

/// Property key in the model: target slot and property name.
pub type PropertyKey = (TargetSlot, String);

/// Command received by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMessage {
    /// Addressed target.
    pub target: TargetSlot,
    /// Command string.
    pub command: String,
}

/// Model client state.
#[derive(Debug, Clone)]
pub struct ModelClient {
    id: ClientId,
    connected: bool,
    properties: BTreeMap<PropertyKey, u8>,
    messages: Vec<ModelMessage>,
}

impl ModelClient {
    /// Create a new model client, already in the room.
    pub fn new(id: ClientId) -> Self {
        Self { id, connected: true, properties: BTreeMap::new(), messages: Vec::new() }
    }

    /// Client identifier.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Whether the client is in the room.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Local property cache.
    pub fn properties(&self) -> &BTreeMap<PropertyKey, u8> {
        &self.properties
    }

    /// Commands received, in arrival order.
    pub fn messages(&self) -> &[ModelMessage] {
        &self.messages
    }

    /// Writes the local cache.
    pub fn write(&mut self, key: PropertyKey, value: Option<u8>) {
        match value {
            Some(value) => {
                self.properties.insert(key, value);
            },
            None => {
                self.properties.remove(&key);
            },
        }
    }

    /// Drops every local property of `target`.
    pub fn clear(&mut self, target: TargetSlot) {
        self.properties.retain(|(slot, _), _| *slot != target);
    }

    /// Records a received command.
    pub fn receive(&mut self, message: ModelMessage) {
        self.messages.push(message);
    }

    /// Marks the client offline. The cache is kept.
    pub fn disconnect(&mut self) {
        self.connected = false;
    }

    /// Marks the client online with the room's store as its cache.
    pub fn rejoin(&mut self, room: &BTreeMap<PropertyKey, u8>) {
        self.connected = true;
        self.properties.clone_from(room);
    }
}
