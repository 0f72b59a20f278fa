//! Transport boundary.
//!
//! A [`Transport`] is the narrow interface the core needs from the network:
//! a last-write-wins room property store, fire-and-forget commands and
//! transforms, and a queue of notifications. It is implemented by the QUIC
//! client transport, by the simulation hub, and, behind the `test-util`
//! feature, by `MockTransport` for tests.
//!
//! # Threading
//!
//! Transports may receive traffic on network tasks, but they never call into
//! the core from there. Notifications are queued and handed out by
//! [`Transport::poll_events`], which the session calls from the host's logical
//! thread.

use ensemble_proto::{Message, PlayerInfo, RoomInfo, Transform, Value};

/// Notifications queued by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Joined a room; the property store now reflects the server.
    Connected,
    /// Left the room or lost the link.
    Disconnected,
    /// A room property changed (`None` deletes).
    PropertyChanged {
        /// Property key (`{target}:{name}`).
        key: String,
        /// New value.
        value: Option<Value>,
    },
    /// A command from another peer.
    MessageReceived(Message),
    /// A transform update from another peer.
    TransformMessageReceived {
        /// Target key.
        target: String,
        /// New transform.
        transform: Transform,
    },
    /// Players in the room changed.
    PlayersChanged(Vec<PlayerInfo>),
    /// The room listing changed.
    RoomsChanged(Vec<RoomInfo>),
}

/// Network side of a sharing session.
///
/// # Contract
///
/// - Writes never block the caller on network I/O.
/// - Local writes are reflected by [`Transport::try_get_property`] as soon as
///   the call returns, before the server round-trip.
/// - [`Transport::set_properties`] reaches the wire as one message.
/// - Calls made while not connected are silently ignored.
pub trait Transport: Send + Sync {
    /// Whether the transport is in a room.
    fn is_connected(&self) -> bool;

    /// Writes one room property (`None` deletes).
    fn set_property(&self, key: &str, value: Option<Value>);

    /// Writes several room properties atomically.
    fn set_properties(&self, entries: Vec<(String, Option<Value>)>);

    /// Last known value of a room property.
    fn try_get_property(&self, key: &str) -> Option<Value>;

    /// Whether a room property has a value.
    fn has_property(&self, key: &str) -> bool {
        self.try_get_property(key).is_some()
    }

    /// Deletes every room property whose key starts with `prefix`.
    fn clear_properties_starting_with(&self, prefix: &str);

    /// Sends a command to the other peers.
    fn send_message(&self, message: Message);

    /// Sends a transform update to the other peers (unreliable).
    fn send_transform_message(&self, target: &str, transform: Transform);

    /// Drains queued notifications.
    fn poll_events(&self) -> Vec<TransportEvent>;
}
