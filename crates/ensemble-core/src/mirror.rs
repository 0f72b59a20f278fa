//! Client-side mirror of a server room.
//!
//! Network transports receive [`ServerFrame`]s; the core consumes
//! [`TransportEvent`]s. `RoomMirror` sits between the two: it keeps the last
//! known room store, player list and room listing, and translates each frame
//! into the events the session routes. The QUIC transport and the simulation
//! transport share it so both behave identically.
//!
//! Local writes are applied to the store optimistically
//! ([`RoomMirror::apply_local`]) and stay pending until the server echoes the
//! request back. Server updates to a key with a pending local write are
//! recorded but not shown: they were applied before that write, so showing
//! them would roll the key back. Once the echo arrives, later server updates
//! overwrite the key in server order, which is what makes concurrent writers
//! converge.

use std::collections::{HashMap, VecDeque};

use ensemble_proto::{
    PlayerId, PlayerInfo, PropertyEntry, RoomInfo, ServerFrame, TransformDatagram, Value,
    WriteOrigin, WriteSeq,
};

use crate::transport::TransportEvent;

/// Last known state of the joined room.
#[derive(Debug, Default, Clone)]
pub struct RoomMirror {
    player_id: Option<PlayerId>,
    room: Option<String>,
    /// Room store as seen locally, pending writes included.
    properties: HashMap<String, Value>,
    /// Room store as last reported by the server.
    confirmed: HashMap<String, Value>,
    /// Local write requests not yet echoed, oldest first.
    pending: VecDeque<PendingWrite>,
    last_seq: WriteSeq,
    players: Vec<PlayerInfo>,
    rooms: Vec<RoomInfo>,
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Keys { seq: WriteSeq, keys: Vec<String> },
    Prefix { seq: WriteSeq, prefix: String },
}

impl PendingWrite {
    fn seq(&self) -> WriteSeq {
        match self {
            Self::Keys { seq, .. } | Self::Prefix { seq, .. } => *seq,
        }
    }

    fn covers(&self, key: &str) -> bool {
        match self {
            Self::Keys { keys, .. } => keys.iter().any(|k| k == key),
            Self::Prefix { prefix, .. } => key.starts_with(prefix.as_str()),
        }
    }
}

impl RoomMirror {
    /// Mirror of no room.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a room is joined.
    pub fn is_connected(&self) -> bool {
        self.room.is_some()
    }

    /// Joined room name.
    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    /// Player id assigned by the server.
    pub fn player_id(&self) -> Option<PlayerId> {
        self.player_id
    }

    /// Players in the joined room.
    pub fn players(&self) -> &[PlayerInfo] {
        &self.players
    }

    /// Last room listing.
    pub fn rooms(&self) -> &[RoomInfo] {
        &self.rooms
    }

    /// Last known value of a room property.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Whether a local write to `key` is waiting for its echo.
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.iter().any(|write| write.covers(key))
    }

    /// Allocates the sequence number of the next write request.
    pub fn next_write_seq(&mut self) -> WriteSeq {
        self.last_seq += 1;
        self.last_seq
    }

    /// Applies the local writes of request `seq` before the server confirms
    /// them.
    pub fn apply_local(&mut self, seq: WriteSeq, entries: &[PropertyEntry]) {
        for (key, value) in entries {
            self.write(key, value.clone());
        }
        let keys = entries.iter().map(|(key, _)| key.clone()).collect();
        self.pending.push_back(PendingWrite::Keys { seq, keys });
    }

    /// Applies the local prefix clear of request `seq` before the server
    /// confirms it.
    pub fn clear_local(&mut self, seq: WriteSeq, prefix: &str) {
        self.properties.retain(|key, _| !key.starts_with(prefix));
        self.pending.push_back(PendingWrite::Prefix { seq, prefix: prefix.to_string() });
    }

    /// Applies one server frame and returns the resulting notifications.
    pub fn apply(&mut self, frame: ServerFrame) -> Vec<TransportEvent> {
        match frame {
            ServerFrame::Welcome { player_id } => {
                self.player_id = Some(player_id);
                Vec::new()
            },
            ServerFrame::RoomList { rooms } => {
                self.rooms.clone_from(&rooms);
                vec![TransportEvent::RoomsChanged(rooms)]
            },
            ServerFrame::Joined { room, properties, players } => {
                let mut events = Vec::with_capacity(properties.len() + 3);
                if self.room.take().is_some() {
                    events.push(TransportEvent::Disconnected);
                }

                tracing::debug!(room = %room, properties = properties.len(), "joined room");
                self.room = Some(room);
                self.pending.clear();
                self.confirmed = properties.iter().cloned().collect();
                self.properties.clone_from(&self.confirmed);
                self.players.clone_from(&players);

                events.push(TransportEvent::Connected);
                events.extend(properties.into_iter().map(|(key, value)| {
                    TransportEvent::PropertyChanged { key, value: Some(value) }
                }));
                events.push(TransportEvent::PlayersChanged(players));
                events
            },
            ServerFrame::Left { room } => {
                if self.room.as_deref() != Some(room.as_str()) {
                    tracing::debug!(room = %room, "ignoring leave for a room we are not in");
                    return Vec::new();
                }
                tracing::debug!(room = %room, "left room");
                self.leave()
            },
            ServerFrame::PropertiesChanged { entries, origin } => {
                if !self.is_connected() {
                    return Vec::new();
                }
                self.properties_changed(entries, origin)
            },
            ServerFrame::MessageReceived(message) => {
                if !self.is_connected() {
                    return Vec::new();
                }
                vec![TransportEvent::MessageReceived(message)]
            },
            ServerFrame::PlayersChanged { players } => {
                self.players.clone_from(&players);
                vec![TransportEvent::PlayersChanged(players)]
            },
            ServerFrame::Error { reason, seq } => {
                tracing::warn!(reason = %reason, seq, "server rejected request");
                match seq {
                    Some(seq) => self.write_rejected(seq),
                    None => Vec::new(),
                }
            },
        }
    }

    /// Translates a transform datagram. Dropped outside a room.
    pub fn apply_datagram(&self, datagram: TransformDatagram) -> Option<TransportEvent> {
        self.is_connected().then(|| TransportEvent::TransformMessageReceived {
            target: datagram.target,
            transform: datagram.transform,
        })
    }

    /// The link to the server is gone.
    pub fn connection_lost(&mut self) -> Vec<TransportEvent> {
        self.player_id = None;
        if self.room.is_none() {
            return Vec::new();
        }
        self.leave()
    }

    fn properties_changed(
        &mut self,
        entries: Vec<PropertyEntry>,
        origin: WriteOrigin,
    ) -> Vec<TransportEvent> {
        if self.player_id == Some(origin.player) {
            // Requests are answered in order, so everything up to `seq` is done
            self.pending.retain(|write| write.seq() > origin.seq);
        }

        let mut events = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            put(&mut self.confirmed, &key, value.clone());
            if self.is_pending(&key) {
                tracing::trace!(key = %key, "holding back update older than a local write");
                continue;
            }
            self.write(&key, value.clone());
            events.push(TransportEvent::PropertyChanged { key, value });
        }
        events
    }

    /// Drops rejected request `seq` and restores the keys it touched.
    fn write_rejected(&mut self, seq: WriteSeq) -> Vec<TransportEvent> {
        let Some(index) = self.pending.iter().position(|write| write.seq() == seq) else {
            return Vec::new();
        };
        let Some(rejected) = self.pending.remove(index) else {
            return Vec::new();
        };

        let touched: Vec<String> = match rejected {
            PendingWrite::Keys { keys, .. } => keys,
            PendingWrite::Prefix { prefix, .. } => {
                self.confirmed.keys().filter(|key| key.starts_with(&prefix)).cloned().collect()
            },
        };
        touched.into_iter().filter_map(|key| self.restore(key)).collect()
    }

    /// Resets `key` to its confirmed value unless a local write still holds
    /// it.
    fn restore(&mut self, key: String) -> Option<TransportEvent> {
        if self.is_pending(&key) {
            return None;
        }
        let confirmed = self.confirmed.get(&key).cloned();
        if self.properties.get(&key) == confirmed.as_ref() {
            return None;
        }
        self.write(&key, confirmed.clone());
        Some(TransportEvent::PropertyChanged { key, value: confirmed })
    }

    fn leave(&mut self) -> Vec<TransportEvent> {
        self.room = None;
        self.properties.clear();
        self.confirmed.clear();
        self.pending.clear();
        self.players.clear();
        vec![TransportEvent::Disconnected]
    }

    fn write(&mut self, key: &str, value: Option<Value>) {
        put(&mut self.properties, key, value);
    }
}

fn put(store: &mut HashMap<String, Value>, key: &str, value: Option<Value>) {
    match value {
        Some(value) => {
            store.insert(key.to_string(), value);
        },
        None => {
            store.remove(key);
        },
    }
}

#[cfg(test)]
mod tests {
    use ensemble_proto::{Message, Transform};

    use super::*;

    fn joined(properties: Vec<(String, Value)>) -> ServerFrame {
        ServerFrame::Joined {
            room: "lobby".into(),
            properties,
            players: vec![PlayerInfo { id: 1, name: "ann".into(), properties: Default::default() }],
        }
    }

    #[test]
    fn join_reports_connect_then_snapshot() {
        let mut mirror = RoomMirror::new();
        let events = mirror.apply(joined(vec![("3.engine:a".into(), Value::Int(1))]));

        assert_eq!(events[0], TransportEvent::Connected);
        assert_eq!(
            events[1],
            TransportEvent::PropertyChanged { key: "3.engine:a".into(), value: Some(Value::Int(1)) }
        );
        assert!(matches!(events[2], TransportEvent::PlayersChanged(_)));
        assert_eq!(mirror.property("3.engine:a"), Some(&Value::Int(1)));
        assert_eq!(mirror.room(), Some("lobby"));
    }

    const ME: PlayerId = 1;
    const PEER: PlayerId = 2;

    fn in_room() -> RoomMirror {
        let mut mirror = RoomMirror::new();
        mirror.apply(ServerFrame::Welcome { player_id: ME });
        mirror.apply(joined(Vec::new()));
        mirror
    }

    fn changed(player: PlayerId, seq: WriteSeq, key: &str, value: Option<i64>) -> ServerFrame {
        ServerFrame::PropertiesChanged {
            entries: vec![(key.into(), value.map(Value::Int))],
            origin: WriteOrigin { player, seq },
        }
    }

    fn local(mirror: &mut RoomMirror, key: &str, value: i64) -> WriteSeq {
        let seq = mirror.next_write_seq();
        mirror.apply_local(seq, &[(key.into(), Some(Value::Int(value)))]);
        seq
    }

    #[test]
    fn later_update_overwrites_confirmed_write() {
        let mut mirror = in_room();
        let seq = local(&mut mirror, "k", 1);
        assert_eq!(mirror.property("k"), Some(&Value::Int(1)));

        mirror.apply(changed(ME, seq, "k", Some(1)));
        assert!(!mirror.is_pending("k"));
        mirror.apply(changed(PEER, 1, "k", Some(2)));
        assert_eq!(mirror.property("k"), Some(&Value::Int(2)));
    }

    #[test]
    fn stale_echo_does_not_roll_back_newer_write() {
        let mut mirror = in_room();
        let first = local(&mut mirror, "k", 1);
        let second = local(&mut mirror, "k", 2);

        assert!(mirror.apply(changed(ME, first, "k", Some(1))).is_empty());
        assert_eq!(mirror.property("k"), Some(&Value::Int(2)));

        assert_eq!(mirror.apply(changed(ME, second, "k", Some(2))), vec![
            TransportEvent::PropertyChanged { key: "k".into(), value: Some(Value::Int(2)) }
        ]);
        assert!(!mirror.is_pending("k"));
    }

    #[test]
    fn updates_ordered_before_a_local_write_are_held_back() {
        let mut mirror = in_room();
        let seq = local(&mut mirror, "k", 1);

        assert!(mirror.apply(changed(PEER, 7, "k", Some(9))).is_empty());
        assert_eq!(mirror.property("k"), Some(&Value::Int(1)));

        // Other keys are not affected
        assert_eq!(mirror.apply(changed(PEER, 8, "j", Some(3))).len(), 1);

        mirror.apply(changed(ME, seq, "k", Some(1)));
        assert_eq!(mirror.property("k"), Some(&Value::Int(1)));
    }

    #[test]
    fn pending_clear_holds_back_matching_keys() {
        let mut mirror = in_room();
        mirror.apply(changed(PEER, 1, "3.a:x", Some(1)));
        let seq = mirror.next_write_seq();
        mirror.clear_local(seq, "3.a:");

        assert!(mirror.apply(changed(PEER, 2, "3.a:y", Some(2))).is_empty());
        assert_eq!(mirror.property("3.a:y"), None);

        mirror.apply(ServerFrame::PropertiesChanged {
            entries: vec![("3.a:x".into(), None), ("3.a:y".into(), None)],
            origin: WriteOrigin { player: ME, seq },
        });
        assert_eq!(mirror.property("3.a:x"), None);
        assert!(!mirror.is_pending("3.a:y"));
    }

    #[test]
    fn rejected_write_restores_the_server_value() {
        let mut mirror = in_room();
        mirror.apply(changed(PEER, 1, "k", Some(5)));
        let seq = local(&mut mirror, "k", 6);

        let events = mirror.apply(ServerFrame::Error { reason: "full".into(), seq: Some(seq) });

        assert_eq!(events, vec![TransportEvent::PropertyChanged {
            key: "k".into(),
            value: Some(Value::Int(5)),
        }]);
        assert_eq!(mirror.property("k"), Some(&Value::Int(5)));
        assert!(!mirror.is_pending("k"));
    }

    #[test]
    fn rejoin_forgets_pending_writes() {
        let mut mirror = in_room();
        local(&mut mirror, "k", 1);
        mirror.apply(joined(vec![("k".into(), Value::Int(4))]));

        assert!(!mirror.is_pending("k"));
        assert_eq!(mirror.property("k"), Some(&Value::Int(4)));
    }

    #[test]
    fn leave_clears_store() {
        let mut mirror = RoomMirror::new();
        mirror.apply(joined(vec![("k".into(), Value::Int(1))]));

        assert!(mirror.apply(ServerFrame::Left { room: "other".into() }).is_empty());
        assert_eq!(mirror.apply(ServerFrame::Left { room: "lobby".into() }), vec![
            TransportEvent::Disconnected
        ]);
        assert!(!mirror.is_connected());
        assert_eq!(mirror.property("k"), None);
    }

    #[test]
    fn traffic_outside_room_is_ignored() {
        let mut mirror = RoomMirror::new();
        let message = Message { target: "3.engine".into(), command: "go".into() };

        assert!(mirror.apply(ServerFrame::MessageReceived(message)).is_empty());
        assert!(
            mirror
                .apply_datagram(TransformDatagram {
                    target: "3.engine".into(),
                    transform: Transform::IDENTITY
                })
                .is_none()
        );
        assert!(mirror.connection_lost().is_empty());
    }

    #[test]
    fn connection_loss_disconnects() {
        let mut mirror = RoomMirror::new();
        mirror.apply(ServerFrame::Welcome { player_id: 7 });
        mirror.apply(joined(Vec::new()));

        assert_eq!(mirror.connection_lost(), vec![TransportEvent::Disconnected]);
        assert_eq!(mirror.player_id(), None);
    }
}
