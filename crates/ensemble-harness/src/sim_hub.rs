//! In-process room server.
//!
//! `SimHub` drives the real [`RoomManager`] without sockets. Client frames are
//! processed the moment they are submitted, so the hub's arrival order is the
//! order of `submit` calls. Outgoing traffic is CBOR-encoded exactly as on the
//! wire and parked in per-session inboxes until the owning transport polls.
//! Sessions can be cut at any time to simulate a lost link, and relayed
//! transform datagrams can be dropped with a seeded probability.

use std::collections::{BTreeMap, HashMap};

use ensemble_proto::{
    ClientFrame, Hello, PROTOCOL_VERSION, RoomInfo, ServerFrame, TransformDatagram, Value,
    encode_datagram, encode_frame,
};
use ensemble_server::{RoomAction, RoomConfig, RoomManager, SessionId, rejection};
use parking_lot::Mutex;

use crate::sim_env::SimEnv;

/// Encoded traffic waiting for a simulated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Length-prefixed control frame.
    Frame(Vec<u8>),
    /// Transform datagram.
    Datagram(Vec<u8>),
}

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Frames queued to sessions.
    pub frames: usize,
    /// Datagrams queued to sessions.
    pub datagrams: usize,
    /// Datagrams dropped by fault injection.
    pub datagrams_lost: usize,
}

struct Link {
    inbox: Vec<Delivery>,
    /// Traffic to a sink is counted and discarded.
    sink: bool,
}

struct HubState {
    manager: RoomManager<SimEnv>,
    links: HashMap<SessionId, Link>,
    datagram_loss: f64,
    stats: HubStats,
}

/// Simulated room server shared by every [`SimTransport`] of a simulation.
///
/// [`SimTransport`]: crate::SimTransport
pub struct SimHub {
    env: SimEnv,
    state: Mutex<HubState>,
}

impl SimHub {
    /// Hub with the given room limits.
    pub fn new(env: SimEnv, config: RoomConfig) -> Self {
        let manager = RoomManager::new(env.clone(), config);
        let state =
            HubState { manager, links: HashMap::new(), datagram_loss: 0.0, stats: HubStats::default() };
        Self { env, state: Mutex::new(state) }
    }

    /// Environment shared with the room manager.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Probability that a relayed datagram is dropped per recipient.
    pub fn set_datagram_loss(&self, probability: f64) {
        self.state.lock().datagram_loss = probability.clamp(0.0, 1.0);
    }

    /// Opens a session and performs the handshake.
    pub fn connect(&self, player_name: &str) -> SessionId {
        let session_id = {
            let mut state = self.state.lock();
            let session_id = state.manager.register_session();
            state.links.insert(session_id, Link { inbox: Vec::new(), sink: false });
            session_id
        };
        let hello =
            ClientFrame::Hello(Hello { version: PROTOCOL_VERSION, player_name: player_name.into() });
        self.submit(session_id, hello);
        session_id
    }

    /// Creates `room` with a silent host session that never leaves, so the
    /// room and its store outlive every client.
    pub fn host_room(&self, room: &str) -> SessionId {
        let host = self.connect("host");
        if let Some(link) = self.state.lock().links.get_mut(&host) {
            link.sink = true;
            link.inbox.clear();
        }
        self.submit(host, ClientFrame::CreateAndJoinRoom { room: room.to_string() });
        host
    }

    /// Processes one control frame from `session_id`.
    ///
    /// Frames from cut sessions are dropped.
    pub fn submit(&self, session_id: SessionId, frame: ClientFrame) {
        let mut state = self.state.lock();
        if !state.links.contains_key(&session_id) {
            tracing::trace!(session_id, "dropping frame from closed session");
            return;
        }

        let seq = frame.write_seq();
        let actions = match state.manager.process_frame(session_id, frame) {
            Ok(actions) => actions,
            Err(e) if e.is_fatal() => {
                tracing::warn!(session_id, "closing session: {}", e);
                state.close(session_id, &self.env);
                return;
            },
            Err(e) => {
                tracing::debug!(session_id, "request rejected: {}", e);
                vec![rejection(session_id, &e, seq)]
            },
        };
        state.execute(actions, &self.env);
    }

    /// Relays one transform datagram from `session_id`.
    pub fn submit_datagram(&self, session_id: SessionId, datagram: TransformDatagram) {
        let mut state = self.state.lock();
        if !state.links.contains_key(&session_id) {
            return;
        }
        let actions = state.manager.process_datagram(session_id, datagram);
        state.execute(actions, &self.env);
    }

    /// Cuts a session as if its link dropped. The owner finds out on its next
    /// poll.
    pub fn drop_session(&self, session_id: SessionId) {
        self.state.lock().close(session_id, &self.env);
    }

    /// Takes everything queued for `session_id`, or `None` once the session is
    /// cut.
    pub fn take_inbox(&self, session_id: SessionId) -> Option<Vec<Delivery>> {
        self.state.lock().links.get_mut(&session_id).map(|link| std::mem::take(&mut link.inbox))
    }

    /// Whether `session_id` is still open.
    pub fn is_linked(&self, session_id: SessionId) -> bool {
        self.state.lock().links.contains_key(&session_id)
    }

    /// Copy of a room's property store.
    pub fn room_properties(&self, room: &str) -> Option<BTreeMap<String, Value>> {
        self.state.lock().manager.room_properties(room).cloned()
    }

    /// Open rooms.
    pub fn rooms(&self) -> Vec<RoomInfo> {
        self.state.lock().manager.rooms()
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Traffic counters so far.
    pub fn stats(&self) -> HubStats {
        self.state.lock().stats
    }
}

impl HubState {
    fn close(&mut self, session_id: SessionId, env: &SimEnv) {
        if self.links.remove(&session_id).is_none() {
            return;
        }
        let actions = self.manager.disconnect(session_id);
        self.execute(actions, env);
        tracing::debug!(session_id, "session cut");
    }

    fn execute(&mut self, actions: Vec<RoomAction>, env: &SimEnv) {
        for action in actions {
            match action {
                RoomAction::SendToSession { session_id, frame } => {
                    if let Some(bytes) = encode(&frame) {
                        self.push(session_id, Delivery::Frame(bytes));
                    }
                },
                RoomAction::BroadcastToRoom { room, frame, exclude } => {
                    let Some(bytes) = encode(&frame) else {
                        continue;
                    };
                    for session_id in self.members(&room, exclude) {
                        self.push(session_id, Delivery::Frame(bytes.clone()));
                    }
                },
                RoomAction::RelayDatagram { room, datagram, exclude } => {
                    let bytes = match encode_datagram(&datagram) {
                        Ok(bytes) => bytes.to_vec(),
                        Err(e) => {
                            tracing::error!(room = %room, "failed to encode datagram: {}", e);
                            continue;
                        },
                    };
                    for session_id in self.members(&room, Some(exclude)) {
                        if env.chance(self.datagram_loss) {
                            self.stats.datagrams_lost += 1;
                            continue;
                        }
                        self.push(session_id, Delivery::Datagram(bytes.clone()));
                    }
                },
            }
        }
    }

    fn members(&self, room: &str, exclude: Option<SessionId>) -> Vec<SessionId> {
        self.manager.sessions_in_room(room).filter(|id| Some(*id) != exclude).collect()
    }

    fn push(&mut self, session_id: SessionId, delivery: Delivery) {
        let Some(link) = self.links.get_mut(&session_id) else {
            tracing::trace!(session_id, "dropping output for closed session");
            return;
        };
        match delivery {
            Delivery::Frame(_) => self.stats.frames += 1,
            Delivery::Datagram(_) => self.stats.datagrams += 1,
        }
        if !link.sink {
            link.inbox.push(delivery);
        }
    }
}

fn encode(frame: &ServerFrame) -> Option<Vec<u8>> {
    encode_frame(frame)
        .map_err(|e| tracing::error!("failed to encode frame: {}", e))
        .ok()
}
