//! Room Manager
//!
//! Sans-IO state of the relay: sessions, rooms, room property stores and
//! player lists.
//!
//! ## Responsibilities
//!
//! - Session lifecycle: register on connect, handshake, disconnect
//! - Room lifecycle: explicit creation, join/leave, removal when empty
//! - Property store: last-write-wins, applied in arrival order
//! - Relay: commands and transforms go to every member except the sender
//!
//! ## Design
//!
//! - Action-based: every method returns [`RoomAction`]s, no direct I/O
//! - Property batches are echoed to the writer too, so every member applies
//!   writes in the same (server) order and converges on the last one. The
//!   echo carries the writer's request sequence number
//! - Room stores and player properties have byte budgets so a `Joined`
//!   snapshot always fits in one frame

use std::{
    collections::{BTreeMap, HashMap},
    time::Instant,
};

use ensemble_core::env::Environment;
use ensemble_proto::{
    ClientFrame, PROTOCOL_VERSION, PlayerId, PlayerInfo, PropertyEntry, RoomInfo, ServerFrame,
    TransformDatagram, Value, WriteOrigin, WriteSeq,
};

/// Server-side connection identifier. Equal to the session's player id.
pub type SessionId = u64;

/// Per-entry allowance for CBOR framing of the key and the entry itself.
const ENTRY_OVERHEAD: usize = 8;

/// Limits applied by the room manager.
///
/// `max_store_bytes` plus `max_players * max_player_bytes` must stay below
/// [`ensemble_proto::MAX_FRAME_SIZE`], or a `Joined` snapshot may not encode.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Player cap per room.
    pub max_players: usize,
    /// Maximum number of open rooms.
    pub max_rooms: usize,
    /// Byte budget of one room's property store.
    pub max_store_bytes: usize,
    /// Byte budget of one player's properties.
    pub max_player_bytes: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_players: 16,
            max_rooms: 256,
            max_store_bytes: 512 * 1024,
            max_player_bytes: 16 * 1024,
        }
    }
}

/// Metadata about a room.
#[derive(Debug, Clone)]
pub struct RoomMetadata {
    /// Player who created the room
    pub creator: PlayerId,
    /// When the room was created
    pub created_at: Instant,
}

struct Room {
    properties: BTreeMap<String, Value>,
    /// Budgeted size of `properties`.
    store_bytes: usize,
    /// Members in join order.
    members: Vec<SessionId>,
    metadata: RoomMetadata,
}

struct Session {
    player: PlayerInfo,
    room: Option<String>,
    greeted: bool,
}

/// Actions returned by `RoomManager` for the runtime to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomAction {
    /// Send a frame to one session
    SendToSession {
        /// Recipient
        session_id: SessionId,
        /// Frame to send
        frame: ServerFrame,
    },

    /// Send a frame to every member of a room
    BroadcastToRoom {
        /// Room name
        room: String,
        /// Frame to send
        frame: ServerFrame,
        /// Member to skip, if any
        exclude: Option<SessionId>,
    },

    /// Forward a transform datagram to every member of a room but the sender
    RelayDatagram {
        /// Room name
        room: String,
        /// Datagram to forward
        datagram: TransformDatagram,
        /// The sender
        exclude: SessionId,
    },
}

/// Errors from `RoomManager` operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// Session was never registered or already disconnected
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// A frame other than `Hello` arrived before the handshake
    #[error("handshake required")]
    HandshakeRequired,

    /// Client speaks another protocol version
    #[error("unsupported protocol version: expected {expected}, got {actual}")]
    UnsupportedVersion {
        /// Server version
        expected: u8,
        /// Client version
        actual: u8,
    },

    /// Room name is empty
    #[error("room name must not be empty")]
    InvalidRoomName,

    /// Room does not exist
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// Room already exists
    #[error("room already exists: {0}")]
    RoomAlreadyExists(String),

    /// Room is at its player cap
    #[error("room {room} is full ({max} players)")]
    RoomFull {
        /// Room name
        room: String,
        /// Player cap
        max: usize,
    },

    /// Server is at its room cap
    #[error("room limit of {0} reached")]
    TooManyRooms(usize),

    /// The request needs a joined room
    #[error("not in a room")]
    NotInRoom,

    /// The write would grow the room store past its budget
    #[error("property store of room {room} would exceed {max} bytes")]
    StoreFull {
        /// Room name
        room: String,
        /// Byte budget
        max: usize,
    },

    /// The write would grow the player's properties past their budget
    #[error("player properties would exceed {0} bytes")]
    PlayerPropertiesFull(usize),
}

impl RoomError {
    /// Whether the connection should be closed rather than sent an error
    /// frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnknownSession(_) | Self::UnsupportedVersion { .. })
    }
}

/// Rooms, sessions and their property stores.
pub struct RoomManager<E>
where
    E: Environment,
{
    env: E,
    config: RoomConfig,
    sessions: HashMap<SessionId, Session>,
    rooms: HashMap<String, Room>,
}

impl<E> RoomManager<E>
where
    E: Environment,
{
    /// Create a new `RoomManager`
    pub fn new(env: E, config: RoomConfig) -> Self {
        Self { env, config, sessions: HashMap::new(), rooms: HashMap::new() }
    }

    /// Registers a new connection and assigns its player id.
    pub fn register_session(&mut self) -> SessionId {
        let id = (0..8)
            .map(|_| self.env.random_u64())
            .find(|id| *id != 0 && !self.sessions.contains_key(id))
            .unwrap_or_else(|| {
                self.sessions.keys().max().map_or(1, |max| max.saturating_add(1))
            });

        let player = PlayerInfo { id, name: String::new(), properties: BTreeMap::new() };
        self.sessions.insert(id, Session { player, room: None, greeted: false });
        tracing::debug!(session_id = id, "session registered");
        id
    }

    /// Removes a connection, leaving its room without notifying it.
    pub fn disconnect(&mut self, session_id: SessionId) -> Vec<RoomAction> {
        let mut actions = Vec::new();
        if let Some(room) = self.sessions.get(&session_id).and_then(|s| s.room.clone()) {
            self.leave_room(session_id, &room, false, &mut actions);
        }
        if self.sessions.remove(&session_id).is_some() {
            tracing::debug!(session_id, "session disconnected");
        }
        actions
    }

    /// Processes one control frame from a session.
    pub fn process_frame(
        &mut self,
        session_id: SessionId,
        frame: ClientFrame,
    ) -> Result<Vec<RoomAction>, RoomError> {
        let session =
            self.sessions.get_mut(&session_id).ok_or(RoomError::UnknownSession(session_id))?;

        if let ClientFrame::Hello(hello) = frame {
            if hello.version != PROTOCOL_VERSION {
                return Err(RoomError::UnsupportedVersion {
                    expected: PROTOCOL_VERSION,
                    actual: hello.version,
                });
            }
            session.player.name = hello.player_name;
            session.greeted = true;
            return Ok(vec![RoomAction::SendToSession {
                session_id,
                frame: ServerFrame::Welcome { player_id: session_id },
            }]);
        }

        if !session.greeted {
            return Err(RoomError::HandshakeRequired);
        }

        let mut actions = Vec::new();
        match frame {
            ClientFrame::Hello(_) => {},
            ClientFrame::ListRooms => {
                actions.push(RoomAction::SendToSession {
                    session_id,
                    frame: ServerFrame::RoomList { rooms: self.rooms() },
                });
            },
            ClientFrame::CreateAndJoinRoom { room } => {
                self.create_and_join(session_id, room, &mut actions)?;
            },
            ClientFrame::JoinRoom { room } => self.join(session_id, room, &mut actions)?,
            ClientFrame::LeaveRoom => {
                let room = self.current_room(session_id)?;
                self.leave_room(session_id, &room, true, &mut actions);
            },
            ClientFrame::SetProperties { seq, entries } => {
                self.set_properties(session_id, seq, entries, &mut actions)?;
            },
            ClientFrame::ClearProperties { seq, prefix } => {
                self.clear_properties(session_id, seq, &prefix, &mut actions)?;
            },
            ClientFrame::SendMessage(message) => {
                let room = self.current_room(session_id)?;
                actions.push(RoomAction::BroadcastToRoom {
                    room,
                    frame: ServerFrame::MessageReceived(message),
                    exclude: Some(session_id),
                });
            },
            ClientFrame::SetPlayerProperty { key, value } => {
                self.set_player_property(session_id, key, value, &mut actions)?;
            },
        }
        Ok(actions)
    }

    /// Processes one transform datagram. Dropped outside a room.
    pub fn process_datagram(
        &self,
        session_id: SessionId,
        datagram: TransformDatagram,
    ) -> Vec<RoomAction> {
        match self.sessions.get(&session_id).and_then(|s| s.room.clone()) {
            Some(room) => vec![RoomAction::RelayDatagram { room, datagram, exclude: session_id }],
            None => Vec::new(),
        }
    }

    /// Open rooms, sorted by name.
    pub fn rooms(&self) -> Vec<RoomInfo> {
        let max_players = u32::try_from(self.config.max_players).unwrap_or(u32::MAX);
        let mut rooms: Vec<_> = self
            .rooms
            .iter()
            .map(|(name, room)| RoomInfo {
                name: name.clone(),
                player_count: u32::try_from(room.members.len()).unwrap_or(u32::MAX),
                max_players,
            })
            .collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }

    /// Check if a room exists
    pub fn has_room(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Metadata of a room
    pub fn room_metadata(&self, room: &str) -> Option<&RoomMetadata> {
        self.rooms.get(room).map(|r| &r.metadata)
    }

    /// Property store of a room
    pub fn room_properties(&self, room: &str) -> Option<&BTreeMap<String, Value>> {
        self.rooms.get(room).map(|r| &r.properties)
    }

    /// Members of a room in join order
    pub fn sessions_in_room(&self, room: &str) -> impl Iterator<Item = SessionId> + '_ {
        self.rooms.get(room).into_iter().flat_map(|r| r.members.iter().copied())
    }

    /// Room a session is in
    pub fn session_room(&self, session_id: SessionId) -> Option<&str> {
        self.sessions.get(&session_id).and_then(|s| s.room.as_deref())
    }

    /// Player record of a session
    pub fn player(&self, session_id: SessionId) -> Option<&PlayerInfo> {
        self.sessions.get(&session_id).map(|s| &s.player)
    }

    /// Number of registered sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn current_room(&self, session_id: SessionId) -> Result<String, RoomError> {
        self.session_room(session_id).map(str::to_string).ok_or(RoomError::NotInRoom)
    }

    fn create_and_join(
        &mut self,
        session_id: SessionId,
        room: String,
        actions: &mut Vec<RoomAction>,
    ) -> Result<(), RoomError> {
        if room.is_empty() {
            return Err(RoomError::InvalidRoomName);
        }
        if self.rooms.contains_key(&room) {
            return Err(RoomError::RoomAlreadyExists(room));
        }

        let previous = self.session_room(session_id).map(str::to_string);
        // Leaving a room we are alone in removes it and frees a slot
        let freed = previous
            .as_ref()
            .and_then(|name| self.rooms.get(name))
            .is_some_and(|r| r.members == [session_id]);
        if self.rooms.len().saturating_sub(usize::from(freed)) >= self.config.max_rooms {
            return Err(RoomError::TooManyRooms(self.config.max_rooms));
        }

        if let Some(previous) = previous {
            self.leave_room(session_id, &previous, true, actions);
        }

        let metadata = RoomMetadata { creator: session_id, created_at: self.env.now() };
        self.rooms.insert(room.clone(), Room {
            properties: BTreeMap::new(),
            store_bytes: 0,
            members: Vec::new(),
            metadata,
        });
        tracing::info!(room = %room, creator = session_id, "room created");
        self.enter_room(session_id, room, actions);
        Ok(())
    }

    fn join(
        &mut self,
        session_id: SessionId,
        room: String,
        actions: &mut Vec<RoomAction>,
    ) -> Result<(), RoomError> {
        let target = self.rooms.get(&room).ok_or_else(|| RoomError::RoomNotFound(room.clone()))?;

        if self.session_room(session_id) == Some(room.as_str()) {
            actions.push(RoomAction::SendToSession {
                session_id,
                frame: self.joined_frame(&room),
            });
            return Ok(());
        }

        if target.members.len() >= self.config.max_players {
            return Err(RoomError::RoomFull { room, max: self.config.max_players });
        }

        if let Some(previous) = self.session_room(session_id).map(str::to_string) {
            self.leave_room(session_id, &previous, true, actions);
        }
        self.enter_room(session_id, room, actions);
        Ok(())
    }

    fn enter_room(&mut self, session_id: SessionId, room: String, actions: &mut Vec<RoomAction>) {
        if let Some(entry) = self.rooms.get_mut(&room) {
            entry.members.push(session_id);
        }
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.room = Some(room.clone());
        }
        tracing::debug!(room = %room, session_id, "joined room");

        actions.push(RoomAction::SendToSession { session_id, frame: self.joined_frame(&room) });
        actions.push(RoomAction::BroadcastToRoom {
            frame: ServerFrame::PlayersChanged { players: self.players_in(&room) },
            room,
            exclude: Some(session_id),
        });
    }

    /// Leaves `room`; `notify` sends `Left` to the session itself.
    fn leave_room(
        &mut self,
        session_id: SessionId,
        room: &str,
        notify: bool,
        actions: &mut Vec<RoomAction>,
    ) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.room = None;
        }
        if notify {
            actions.push(RoomAction::SendToSession {
                session_id,
                frame: ServerFrame::Left { room: room.to_string() },
            });
        }

        let Some(entry) = self.rooms.get_mut(room) else {
            return;
        };
        entry.members.retain(|member| *member != session_id);
        tracing::debug!(room = %room, session_id, "left room");

        if entry.members.is_empty() {
            self.rooms.remove(room);
            tracing::info!(room = %room, "room removed");
        } else {
            actions.push(RoomAction::BroadcastToRoom {
                room: room.to_string(),
                frame: ServerFrame::PlayersChanged { players: self.players_in(room) },
                exclude: None,
            });
        }
    }

    fn set_properties(
        &mut self,
        session_id: SessionId,
        seq: WriteSeq,
        entries: Vec<PropertyEntry>,
        actions: &mut Vec<RoomAction>,
    ) -> Result<(), RoomError> {
        let room = self.current_room(session_id)?;
        let origin = WriteOrigin { player: session_id, seq };
        let Some(entry) = self.rooms.get_mut(&room) else {
            return Err(RoomError::NotInRoom);
        };

        let projected = projected_size(&entry.properties, entry.store_bytes, &entries);
        if projected > self.config.max_store_bytes && projected > entry.store_bytes {
            tracing::debug!(room = %room, session_id, projected, "write over store budget");
            return Err(RoomError::StoreFull { room, max: self.config.max_store_bytes });
        }

        for (key, value) in &entries {
            match value {
                Some(value) => {
                    entry.properties.insert(key.clone(), value.clone());
                },
                None => {
                    entry.properties.remove(key);
                },
            }
        }
        entry.store_bytes = projected;

        // The writer always gets its echo, even for an empty batch
        let frame = ServerFrame::PropertiesChanged { entries, origin };
        if echo_only(&frame) {
            actions.push(RoomAction::SendToSession { session_id, frame });
        } else {
            actions.push(RoomAction::BroadcastToRoom { room, frame, exclude: None });
        }
        Ok(())
    }

    fn clear_properties(
        &mut self,
        session_id: SessionId,
        seq: WriteSeq,
        prefix: &str,
        actions: &mut Vec<RoomAction>,
    ) -> Result<(), RoomError> {
        let room = self.current_room(session_id)?;
        let origin = WriteOrigin { player: session_id, seq };
        let Some(entry) = self.rooms.get_mut(&room) else {
            return Err(RoomError::NotInRoom);
        };

        let removed: Vec<String> =
            entry.properties.keys().filter(|key| key.starts_with(prefix)).cloned().collect();
        for key in &removed {
            if let Some(value) = entry.properties.remove(key) {
                entry.store_bytes = entry.store_bytes.saturating_sub(entry_size(key, &value));
            }
        }

        let entries: Vec<PropertyEntry> = removed.into_iter().map(|key| (key, None)).collect();
        let frame = ServerFrame::PropertiesChanged { entries, origin };
        if echo_only(&frame) {
            actions.push(RoomAction::SendToSession { session_id, frame });
        } else {
            actions.push(RoomAction::BroadcastToRoom { room, frame, exclude: None });
        }
        Ok(())
    }

    fn set_player_property(
        &mut self,
        session_id: SessionId,
        key: String,
        value: Option<Value>,
        actions: &mut Vec<RoomAction>,
    ) -> Result<(), RoomError> {
        let max = self.config.max_player_bytes;
        let session =
            self.sessions.get_mut(&session_id).ok_or(RoomError::UnknownSession(session_id))?;
        let properties = &mut session.player.properties;
        match value {
            Some(value) => {
                let current: usize = properties.iter().map(|(k, v)| entry_size(k, v)).sum();
                let old = properties.get(&key).map_or(0, |v| entry_size(&key, v));
                let projected = current.saturating_sub(old).saturating_add(entry_size(&key, &value));
                if projected > max && projected > current {
                    return Err(RoomError::PlayerPropertiesFull(max));
                }
                properties.insert(key, value);
            },
            None => {
                properties.remove(&key);
            },
        }

        if let Some(room) = session.room.clone() {
            actions.push(RoomAction::BroadcastToRoom {
                frame: ServerFrame::PlayersChanged { players: self.players_in(&room) },
                room,
                exclude: None,
            });
        }
        Ok(())
    }

    fn joined_frame(&self, room: &str) -> ServerFrame {
        let properties = self
            .rooms
            .get(room)
            .map(|r| r.properties.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        ServerFrame::Joined { room: room.to_string(), properties, players: self.players_in(room) }
    }

    fn players_in(&self, room: &str) -> Vec<PlayerInfo> {
        self.sessions_in_room(room)
            .filter_map(|id| self.sessions.get(&id).map(|s| s.player.clone()))
            .collect()
    }
}

/// Whether a property echo changes nothing and only the writer needs it.
fn echo_only(frame: &ServerFrame) -> bool {
    matches!(frame, ServerFrame::PropertiesChanged { entries, .. } if entries.is_empty())
}

/// Budgeted size of one stored property.
fn entry_size(key: &str, value: &Value) -> usize {
    key.len().saturating_add(value.encoded_len()).saturating_add(ENTRY_OVERHEAD)
}

/// Store size after applying `entries` to a store of `current` bytes.
fn projected_size(
    properties: &BTreeMap<String, Value>,
    current: usize,
    entries: &[PropertyEntry],
) -> usize {
    // Only the last write per key counts
    let latest: HashMap<&str, Option<&Value>> =
        entries.iter().map(|(key, value)| (key.as_str(), value.as_ref())).collect();
    latest.into_iter().fold(current, |size, (key, value)| {
        let old = properties.get(key).map_or(0, |v| entry_size(key, v));
        let new = value.map_or(0, |v| entry_size(key, v));
        size.saturating_sub(old).saturating_add(new)
    })
}

/// Frame telling a session its request was rejected.
///
/// `seq` is the sequence number of a rejected property write, which lets the
/// writer stop waiting for its echo.
pub fn rejection(session_id: SessionId, error: &RoomError, seq: Option<WriteSeq>) -> RoomAction {
    RoomAction::SendToSession {
        session_id,
        frame: ServerFrame::Error { reason: error.to_string(), seq },
    }
}

