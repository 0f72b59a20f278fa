//! Simulated transport.
//!
//! Implements [`Transport`] and [`Lobby`] against a [`SimHub`], with the same
//! [`RoomMirror`] the QUIC client uses, so the core sees identical event
//! sequences in simulation and in production.

use std::sync::Arc;

use ensemble_core::{Lobby, RoomMirror, Transport, TransportEvent};
use ensemble_proto::{
    ClientFrame, Message, PlayerId, PlayerInfo, PropertyEntry, RoomInfo, ServerFrame, Transform,
    TransformDatagram, Value, decode_datagram, decode_frame, encode_frame,
};
use ensemble_server::SessionId;
use parking_lot::Mutex;

use crate::sim_hub::{Delivery, SimHub};

#[derive(Default)]
struct State {
    session: Option<SessionId>,
    mirror: RoomMirror,
    events: Vec<TransportEvent>,
}

/// One simulated client connection.
pub struct SimTransport {
    hub: Arc<SimHub>,
    player_name: String,
    state: Mutex<State>,
}

impl SimTransport {
    /// Opens a session on `hub`.
    pub fn connect(hub: &Arc<SimHub>, player_name: &str) -> Self {
        let session = hub.connect(player_name);
        Self {
            hub: Arc::clone(hub),
            player_name: player_name.to_string(),
            state: Mutex::new(State { session: Some(session), ..State::default() }),
        }
    }

    /// Current hub session, until the loss of the link has been observed.
    pub fn session_id(&self) -> Option<SessionId> {
        self.state.lock().session
    }

    /// Whether the hub still holds this connection's session.
    pub fn is_link_up(&self) -> bool {
        self.session_id().is_some_and(|id| self.hub.is_linked(id))
    }

    /// Cuts the link. Queued traffic is lost; the disconnect is reported by the
    /// next [`Transport::poll_events`].
    pub fn kill_link(&self) {
        if let Some(session) = self.session_id() {
            self.hub.drop_session(session);
        }
    }

    /// Opens a fresh session after a lost link. Rejoining a room is up to the
    /// caller, as with a real client.
    pub fn reconnect(&self) {
        let mut state = self.state.lock();
        if let Some(old) = state.session.take() {
            if self.hub.is_linked(old) {
                state.session = Some(old);
                return;
            }
            let events = state.mirror.connection_lost();
            state.events.extend(events);
        }
        state.session = Some(self.hub.connect(&self.player_name));
    }

    fn submit(&self, session: Option<SessionId>, frame: ClientFrame) {
        match session {
            Some(session) => self.hub.submit(session, frame),
            None => tracing::trace!("no session, dropping frame"),
        }
    }

    fn write(&self, entries: Vec<PropertyEntry>) {
        if entries.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if !state.mirror.is_connected() {
            return;
        }
        let seq = state.mirror.next_write_seq();
        let frame = ClientFrame::SetProperties { seq, entries: entries.clone() };
        // Same limit as the wire, so oversize batches never reach the mirror
        if let Err(e) = encode_frame(&frame) {
            tracing::warn!(seq, "dropping property batch: {}", e);
            return;
        }
        state.mirror.apply_local(seq, &entries);
        self.submit(state.session, frame);
    }

    fn lobby_request(&self, frame: ClientFrame) {
        let session = self.session_id();
        self.submit(session, frame);
    }
}

impl Transport for SimTransport {
    fn is_connected(&self) -> bool {
        self.state.lock().mirror.is_connected()
    }

    fn set_property(&self, key: &str, value: Option<Value>) {
        self.write(vec![(key.to_string(), value)]);
    }

    fn set_properties(&self, entries: Vec<(String, Option<Value>)>) {
        self.write(entries);
    }

    fn try_get_property(&self, key: &str) -> Option<Value> {
        self.state.lock().mirror.property(key).cloned()
    }

    fn clear_properties_starting_with(&self, prefix: &str) {
        let mut state = self.state.lock();
        if !state.mirror.is_connected() {
            return;
        }
        let seq = state.mirror.next_write_seq();
        state.mirror.clear_local(seq, prefix);
        self.submit(state.session, ClientFrame::ClearProperties { seq, prefix: prefix.to_string() });
    }

    fn send_message(&self, message: Message) {
        let state = self.state.lock();
        if state.mirror.is_connected() {
            self.submit(state.session, ClientFrame::SendMessage(message));
        }
    }

    fn send_transform_message(&self, target: &str, transform: Transform) {
        let state = self.state.lock();
        if let (true, Some(session)) = (state.mirror.is_connected(), state.session) {
            let datagram = TransformDatagram { target: target.to_string(), transform };
            self.hub.submit_datagram(session, datagram);
        }
    }

    fn poll_events(&self) -> Vec<TransportEvent> {
        let mut state = self.state.lock();
        let Some(session) = state.session else {
            return std::mem::take(&mut state.events);
        };

        match self.hub.take_inbox(session) {
            Some(deliveries) => {
                for delivery in deliveries {
                    let events = receive(&mut state.mirror, delivery);
                    state.events.extend(events);
                }
            },
            None => {
                tracing::debug!(session, "link lost");
                state.session = None;
                let events = state.mirror.connection_lost();
                state.events.extend(events);
            },
        }
        std::mem::take(&mut state.events)
    }
}

impl Lobby for SimTransport {
    fn create_and_join_room(&self, room: &str) {
        self.lobby_request(ClientFrame::CreateAndJoinRoom { room: room.to_string() });
    }

    fn join_room(&self, room: &str) {
        self.lobby_request(ClientFrame::JoinRoom { room: room.to_string() });
    }

    fn leave_room(&self) {
        self.lobby_request(ClientFrame::LeaveRoom);
    }

    fn refresh_rooms(&self) {
        self.lobby_request(ClientFrame::ListRooms);
    }

    fn rooms(&self) -> Vec<RoomInfo> {
        self.state.lock().mirror.rooms().to_vec()
    }

    fn players(&self) -> Vec<PlayerInfo> {
        self.state.lock().mirror.players().to_vec()
    }

    fn local_player(&self) -> Option<PlayerId> {
        self.state.lock().mirror.player_id()
    }

    fn set_local_player_property(&self, key: &str, value: Option<Value>) {
        self.lobby_request(ClientFrame::SetPlayerProperty { key: key.to_string(), value });
    }
}

/// Decodes one delivery and feeds it to the mirror.
fn receive(mirror: &mut RoomMirror, delivery: Delivery) -> Vec<TransportEvent> {
    match delivery {
        Delivery::Frame(bytes) => match decode_frame::<ServerFrame>(&bytes) {
            Ok((frame, _)) => mirror.apply(frame),
            Err(e) => {
                tracing::warn!("dropping undecodable frame: {}", e);
                Vec::new()
            },
        },
        Delivery::Datagram(bytes) => match decode_datagram(&bytes) {
            Ok(datagram) => mirror.apply_datagram(datagram).into_iter().collect(),
            Err(e) => {
                tracing::debug!("dropping malformed datagram: {}", e);
                Vec::new()
            },
        },
    }
}
