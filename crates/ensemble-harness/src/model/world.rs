//! Model world - orchestrates clients and the room store.
//!
//! The world is the top-level container that manages the model state and
//! applies operations. It's the oracle against which the simulated system is
//! verified.

use std::collections::BTreeMap;

use super::{
    client::{ModelClient, ModelMessage, PropertyKey},
    operation::{
        ClientId, Operation, OperationError, OperationResult, TARGET_SLOTS, TargetSlot,
        command_name, property_name,
    },
};

/// Observable state for oracle comparison.
///
/// This is the subset of world state that can be compared against the real
/// implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservableState {
    /// Per-client room presence.
    pub connected: Vec<bool>,
    /// Per-client local property caches.
    pub client_properties: Vec<BTreeMap<PropertyKey, u8>>,
    /// Per-client received commands.
    pub client_messages: Vec<Vec<ModelMessage>>,
    /// The room's property store.
    pub room: BTreeMap<PropertyKey, u8>,
}

/// Model world - the reference implementation.
///
/// Delivery is instant, so every connected client always holds exactly the
/// room's store.
#[derive(Debug, Clone)]
pub struct ModelWorld {
    clients: Vec<ModelClient>,
    room: BTreeMap<PropertyKey, u8>,
}

impl ModelWorld {
    /// Create a new model world with the given number of clients, all in the
    /// room.
    pub fn new(num_clients: usize) -> Self {
        let clients = (0..num_clients)
            .map(|i| ModelClient::new(ClientId::try_from(i).unwrap_or(ClientId::MAX)))
            .collect();
        Self { clients, room: BTreeMap::new() }
    }

    /// Number of clients in the world.
    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    /// Get a client by ID.
    pub fn client(&self, id: ClientId) -> Option<&ModelClient> {
        self.clients.get(usize::from(id))
    }

    /// The room's property store.
    pub fn room(&self) -> &BTreeMap<PropertyKey, u8> {
        &self.room
    }

    /// Apply an operation and return the result.
    pub fn apply(&mut self, op: &Operation) -> OperationResult {
        let index = usize::from(op.client_id());
        if index >= self.clients.len() {
            return OperationResult::Error(OperationError::InvalidClient);
        }

        match op {
            Operation::SetProperty { target, property, value, .. } => {
                let key = (target % TARGET_SLOTS, property_name(*property).to_string());
                self.apply_write(index, key, *value)
            },
            Operation::ClearProperties { target, .. } => {
                self.apply_clear(index, target % TARGET_SLOTS)
            },
            Operation::SendMessage { target, command, .. } => {
                let message =
                    ModelMessage { target: target % TARGET_SLOTS, command: command_name(*command) };
                self.apply_send(index, message)
            },
            Operation::Disconnect { .. } => {
                if !self.clients[index].is_connected() {
                    return OperationResult::Error(OperationError::NotConnected);
                }
                self.clients[index].disconnect();
                OperationResult::Ok
            },
            Operation::Reconnect { .. } => self.apply_reconnect(index),
        }
    }

    /// Extract observable state for comparison.
    pub fn observable_state(&self) -> ObservableState {
        ObservableState {
            connected: self.clients.iter().map(ModelClient::is_connected).collect(),
            client_properties: self.clients.iter().map(|c| c.properties().clone()).collect(),
            client_messages: self.clients.iter().map(|c| c.messages().to_vec()).collect(),
            room: self.room.clone(),
        }
    }

    fn apply_write(
        &mut self,
        index: usize,
        key: PropertyKey,
        value: Option<u8>,
    ) -> OperationResult {
        self.clients[index].write(key.clone(), value);
        if !self.clients[index].is_connected() {
            return OperationResult::Ok;
        }

        match value {
            Some(value) => {
                self.room.insert(key.clone(), value);
            },
            None => {
                self.room.remove(&key);
            },
        }
        for client in self.connected_mut() {
            client.write(key.clone(), value);
        }
        OperationResult::Ok
    }

    fn apply_clear(&mut self, index: usize, target: TargetSlot) -> OperationResult {
        self.clients[index].clear(target);
        if !self.clients[index].is_connected() {
            return OperationResult::Ok;
        }

        self.room.retain(|(slot, _), _| *slot != target);
        for client in self.connected_mut() {
            client.clear(target);
        }
        OperationResult::Ok
    }

    fn apply_send(&mut self, index: usize, message: ModelMessage) -> OperationResult {
        if !self.clients[index].is_connected() {
            return OperationResult::Error(OperationError::NotConnected);
        }
        for (i, client) in self.clients.iter_mut().enumerate() {
            if i != index && client.is_connected() {
                client.receive(message.clone());
            }
        }
        OperationResult::Ok
    }

    /// Offline writes the room lacks are published; everything the room holds
    /// wins over the local cache.
    fn apply_reconnect(&mut self, index: usize) -> OperationResult {
        if self.clients[index].is_connected() {
            return OperationResult::Error(OperationError::AlreadyConnected);
        }

        for (key, value) in self.clients[index].properties() {
            self.room.entry(key.clone()).or_insert(*value);
        }
        self.clients[index].rejoin(&self.room);

        let room = self.room.clone();
        for client in self.connected_mut() {
            client.rejoin(&room);
        }
        OperationResult::Ok
    }

    fn connected_mut(&mut self) -> impl Iterator<Item = &mut ModelClient> {
        self.clients.iter_mut().filter(|client| client.is_connected())
    }
}
