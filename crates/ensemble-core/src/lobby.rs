//! Room and player membership.
//!
//! Consumed by application code and bindings, never by the target core.
//! Requests are asynchronous: results show up as
//! [`TransportEvent::Connected`], [`TransportEvent::RoomsChanged`] and
//! [`TransportEvent::PlayersChanged`] on the next pump.
//!
//! [`TransportEvent::Connected`]: crate::TransportEvent::Connected
//! [`TransportEvent::RoomsChanged`]: crate::TransportEvent::RoomsChanged
//! [`TransportEvent::PlayersChanged`]: crate::TransportEvent::PlayersChanged

use ensemble_proto::{PlayerId, PlayerInfo, RoomInfo, Value};

/// Room membership operations of a transport.
pub trait Lobby: Send + Sync {
    /// Creates `room` and joins it. Leaves the current room first.
    fn create_and_join_room(&self, room: &str);

    /// Joins an existing room. Leaves the current room first.
    fn join_room(&self, room: &str);

    /// Leaves the current room.
    fn leave_room(&self);

    /// Asks the server for a fresh room listing.
    fn refresh_rooms(&self);

    /// Last known room listing.
    fn rooms(&self) -> Vec<RoomInfo>;

    /// Players in the current room.
    fn players(&self) -> Vec<PlayerInfo>;

    /// This connection's player id, once the server has assigned one.
    fn local_player(&self) -> Option<PlayerId>;

    /// Writes a property of the local player (`None` deletes).
    fn set_local_player_property(&self, key: &str, value: Option<Value>);
}
