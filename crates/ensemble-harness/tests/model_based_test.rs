//! Model-based property tests.
//!
//! These tests generate random operation sequences and verify that the real
//! sessions, running over the simulated hub, behave identically to the
//! reference model.
//!
//! # Architecture
//!
//! ```text
//! proptest generates: Vec<Operation>
//!                          │
//!           ┌──────────────┼──────────────┐
//!           ▼              ▼              ▼
//!      ModelWorld     RealWorld       Compare
//!      (reference)    (SimHub)     observable state
//! ```
//!
//! The real world settles after every operation, matching the model's instant
//! delivery.

use std::{collections::BTreeMap, sync::Arc};

use ensemble_core::{Lobby, SharingTarget, Subscription, TargetEvent, Transport};
use ensemble_harness::{
    ClientId, ModelMessage, ModelWorld, ObservableState, Operation, OperationError,
    OperationResult, PropertyKey, SimClient, SimEnv, SimHub, TargetSlot, settle,
    model::{TARGET_SLOTS, command_name, property_name, target_id},
};
use ensemble_proto::{Identification, Value};
use ensemble_server::RoomConfig;
use proptest::prelude::*;

const ROOM: &str = "arena";
const MAX_ROUNDS: usize = 32;

/// One peer's handles on the shared targets, indexed by slot.
struct RealPeer {
    targets: Vec<Arc<SharingTarget>>,
    subscriptions: Vec<Subscription>,
    messages: Vec<ModelMessage>,
}

/// Real system wrapper that mirrors ModelWorld's interface.
struct RealWorld {
    hub: Arc<SimHub>,
    clients: Vec<SimClient>,
    peers: Vec<RealPeer>,
}

impl RealWorld {
    fn new(num_clients: usize, seed: u64) -> Self {
        let hub = Arc::new(SimHub::new(SimEnv::with_seed(seed), RoomConfig::default()));
        hub.host_room(ROOM);

        let clients: Vec<SimClient> = (0..num_clients)
            .map(|i| SimClient::join(&hub, &format!("peer-{i}"), ROOM))
            .collect();
        let peers = clients.iter().map(RealPeer::new).collect();

        let mut world = Self { hub, clients, peers };
        world.settle();
        world
    }

    fn apply(&mut self, op: &Operation) -> OperationResult {
        let index = usize::from(op.client_id());
        if index >= self.clients.len() {
            return OperationResult::Error(OperationError::InvalidClient);
        }

        let result = match op {
            Operation::SetProperty { target, property, value, .. } => {
                let value = value.map(|v| Value::Int(v.into()));
                self.target(index, *target).set_property(property_name(*property), value);
                OperationResult::Ok
            },
            Operation::ClearProperties { target, .. } => {
                self.target(index, *target).clear_properties();
                OperationResult::Ok
            },
            Operation::SendMessage { target, command, .. } => {
                let target = self.target(index, *target);
                if !target.is_connected() {
                    return OperationResult::Error(OperationError::NotConnected);
                }
                target.send_message(&command_name(*command));
                OperationResult::Ok
            },
            Operation::Disconnect { .. } => {
                let transport = self.clients[index].transport();
                if !transport.is_link_up() {
                    return OperationResult::Error(OperationError::NotConnected);
                }
                transport.kill_link();
                OperationResult::Ok
            },
            Operation::Reconnect { .. } => {
                let transport = self.clients[index].transport();
                if transport.is_link_up() {
                    return OperationResult::Error(OperationError::AlreadyConnected);
                }
                transport.reconnect();
                transport.join_room(ROOM);
                OperationResult::Ok
            },
        };

        self.settle();
        result
    }

    fn target(&self, index: usize, slot: TargetSlot) -> &Arc<SharingTarget> {
        &self.peers[index].targets[usize::from(slot % TARGET_SLOTS)]
    }

    fn settle(&mut self) {
        let rounds = settle(&mut self.clients, MAX_ROUNDS);
        assert!(rounds < MAX_ROUNDS, "simulation did not settle");
        for peer in &mut self.peers {
            peer.collect_messages();
        }
    }

    fn observable_state(&self) -> ObservableState {
        let room = self
            .hub
            .room_properties(ROOM)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, value)| {
                let (id, name) = Identification::decode_with_property(&key).ok()?;
                Some(((slot_of(&id)?, name), as_u8(&value)?))
            })
            .collect();

        ObservableState {
            connected: self.clients.iter().map(|c| c.transport().is_connected()).collect(),
            client_properties: self.peers.iter().map(RealPeer::properties).collect(),
            client_messages: self.peers.iter().map(|p| p.messages.clone()).collect(),
            room,
        }
    }
}

impl RealPeer {
    fn new(client: &SimClient) -> Self {
        let first = client.target(&target_id(0));
        let second = client.target(&target_id(1));
        let child = first.add_child(target_id(2).address());
        let targets = vec![first, second, child];
        let subscriptions = targets.iter().map(|t| t.subscribe()).collect();
        Self { targets, subscriptions, messages: Vec::new() }
    }

    fn collect_messages(&mut self) {
        for (slot, subscription) in (0..).zip(&mut self.subscriptions) {
            for event in subscription.drain() {
                if let TargetEvent::MessageReceived { command, .. } = event {
                    self.messages.push(ModelMessage { target: slot, command });
                }
            }
        }
    }

    fn properties(&self) -> BTreeMap<PropertyKey, u8> {
        (0..)
            .zip(&self.targets)
            .flat_map(|(slot, target)| {
                target
                    .properties()
                    .into_iter()
                    .filter_map(move |(name, value)| Some(((slot, name), as_u8(&value)?)))
            })
            .collect()
    }
}

fn slot_of(id: &Identification) -> Option<TargetSlot> {
    (0..TARGET_SLOTS).find(|slot| target_id(*slot) == *id)
}

fn as_u8(value: &Value) -> Option<u8> {
    value.as_int().and_then(|v| u8::try_from(v).ok())
}

/// Strategy for generating operations with valid client IDs.
fn operation_strategy(num_clients: usize) -> impl Strategy<Value = Operation> {
    let client_id = 0..u8::try_from(num_clients).unwrap();
    let slot = 0..TARGET_SLOTS;

    prop_oneof![
        // Weight towards writes, the interesting part of reconciliation
        6 => (client_id.clone(), slot.clone(), 0..3u8, prop::option::weighted(0.8, 0..4u8))
            .prop_map(|(c, t, p, v)| Operation::SetProperty {
                client_id: c,
                target: t,
                property: p,
                value: v,
            }),
        1 => (client_id.clone(), slot.clone())
            .prop_map(|(c, t)| Operation::ClearProperties { client_id: c, target: t }),
        2 => (client_id.clone(), slot, any::<u8>())
            .prop_map(|(c, t, m)| Operation::SendMessage { client_id: c, target: t, command: m }),
        1 => client_id.clone().prop_map(|c| Operation::Disconnect { client_id: c }),
        2 => client_id.prop_map(|c| Operation::Reconnect { client_id: c }),
    ]
}

proptest! {
    /// Verify that operation results and observable state match between model
    /// and real implementation after every step.
    #[test]
    fn prop_model_matches_real(
        seed in any::<u64>(),
        num_clients in 2..5usize,
        ops in prop::collection::vec(operation_strategy(4), 0..40)
    ) {
        let mut model = ModelWorld::new(num_clients);
        let mut real = RealWorld::new(num_clients, seed);

        for (i, op) in ops.into_iter().enumerate() {
            let op = op.clamped(num_clients);

            let model_result = model.apply(&op);
            let real_result = real.apply(&op);

            prop_assert_eq!(
                &model_result,
                &real_result,
                "Divergence at operation {}: {:?}",
                i,
                op
            );
            prop_assert_eq!(
                model.observable_state(),
                real.observable_state(),
                "State divergence after operation {}: {:?}",
                i,
                op
            );
        }
    }

    /// Verify model invariants hold after any operation sequence.
    #[test]
    fn prop_model_invariants(
        num_clients in 2..5usize,
        ops in prop::collection::vec(operation_strategy(4), 0..100)
    ) {
        let mut model = ModelWorld::new(num_clients);
        for op in ops {
            let _ = model.apply(&op.clamped(num_clients));
        }

        let state = model.observable_state();

        // Invariant: every peer in the room sees exactly the room's store
        for (client_id, properties) in state.client_properties.iter().enumerate() {
            if state.connected[client_id] {
                prop_assert_eq!(
                    properties,
                    &state.room,
                    "Connected client {} diverges from the room",
                    client_id
                );
            }
        }
    }

    /// Verify that a peer never receives its own commands.
    #[test]
    fn prop_no_self_delivery(
        sender in 0..4u8,
        commands in prop::collection::vec(any::<u8>(), 1..10)
    ) {
        let mut model = ModelWorld::new(4);
        for command in commands {
            let result =
                model.apply(&Operation::SendMessage { client_id: sender, target: 0, command });
            prop_assert!(result.is_ok());
        }

        let state = model.observable_state();
        prop_assert!(state.client_messages[usize::from(sender)].is_empty());
        for (client_id, messages) in state.client_messages.iter().enumerate() {
            if client_id != usize::from(sender) {
                prop_assert!(!messages.is_empty());
            }
        }
    }
}

mod smoke_tests {
    use super::*;

    fn set(client_id: ClientId, target: TargetSlot, value: Option<u8>) -> Operation {
        Operation::SetProperty { client_id, target, property: 0, value }
    }

    fn run(num_clients: usize, ops: &[Operation]) {
        let mut model = ModelWorld::new(num_clients);
        let mut real = RealWorld::new(num_clients, 7);
        for op in ops {
            assert_eq!(model.apply(op), real.apply(op), "result of {op:?}");
            assert_eq!(model.observable_state(), real.observable_state(), "state after {op:?}");
        }
    }

    #[test]
    fn writes_and_commands() {
        run(2, &[
            set(0, 0, Some(1)),
            set(1, 2, Some(2)),
            Operation::SendMessage { client_id: 1, target: 2, command: 9 },
            Operation::ClearProperties { client_id: 0, target: 0 },
        ]);
    }

    #[test]
    fn offline_write_survives_reconnect() {
        run(3, &[
            set(0, 0, Some(1)),
            Operation::Disconnect { client_id: 1 },
            set(1, 1, Some(3)),
            set(1, 0, Some(2)),
            set(2, 0, Some(4)),
            Operation::Reconnect { client_id: 1 },
        ]);
    }

    #[test]
    fn everyone_offline_keeps_the_room() {
        run(2, &[
            set(0, 1, Some(1)),
            Operation::Disconnect { client_id: 0 },
            Operation::Disconnect { client_id: 1 },
            Operation::Reconnect { client_id: 1 },
            Operation::Reconnect { client_id: 1 },
            Operation::SendMessage { client_id: 0, target: 0, command: 1 },
        ]);
    }

    #[test]
    fn model_basic_operations() {
        let mut model = ModelWorld::new(2);
        assert!(model.apply(&set(0, 0, Some(5))).is_ok());
        assert!(model.apply(&Operation::Disconnect { client_id: 0 }).is_ok());
        assert!(model.apply(&Operation::Disconnect { client_id: 0 }).is_err());
        assert!(model.apply(&Operation::SendMessage { client_id: 0, target: 0, command: 0 }).is_err());
        assert!(model.apply(&Operation::Reconnect { client_id: 0 }).is_ok());
        assert_eq!(model.room().len(), 1);
    }
}
