//! Fuzz target for [`RoomManager`] request handling
//!
//! # Strategy
//!
//! - A handful of sessions issuing arbitrary request sequences
//! - Rooms and keys drawn from small sets so requests collide
//! - Disconnects and late registrations interleaved with requests
//!
//! # Invariants
//!
//! - Membership is symmetric: a session's room lists that session
//! - No room outlives its last member
//! - A successful write is visible in the room store immediately
//! - Every accepted write is echoed exactly once, tagged with its request
//! - Requests before the handshake are always rejected
//! - NEVER panic on any request sequence

#![no_main]

use arbitrary::Arbitrary;
use ensemble_harness::SimEnv;
use ensemble_proto::{
    ClientFrame, Hello, Message, PROTOCOL_VERSION, ServerFrame, Value, WriteOrigin, WriteSeq,
};
use ensemble_server::{RoomAction, RoomConfig, RoomError, RoomManager, SessionId};
use libfuzzer_sys::fuzz_target;

const ROOMS: [&str; 3] = ["", "alpha", "beta"];
const KEYS: [&str; 3] = ["3.a:x", "3.a:y", "3.a.1:x"];

#[derive(Debug, Clone, Arbitrary)]
enum Request {
    Hello { version: u8 },
    ListRooms,
    Create { room: u8 },
    Join { room: u8 },
    Leave,
    Set { key: u8, value: Option<i8> },
    Clear { key: u8 },
    Send { command: u8 },
    SetPlayer { value: Option<i8> },
}

#[derive(Debug, Clone, Arbitrary)]
enum Step {
    Register,
    Disconnect { session: u8 },
    Frame { session: u8, request: Request },
    Datagram { session: u8 },
}

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    seed: u64,
    max_players: u8,
    steps: Vec<Step>,
}

fn room(index: u8) -> String {
    ROOMS[usize::from(index) % ROOMS.len()].to_string()
}

fn key(index: u8) -> String {
    KEYS[usize::from(index) % KEYS.len()].to_string()
}

fn frame(request: Request, seq: WriteSeq) -> ClientFrame {
    match request {
        Request::Hello { version } => {
            ClientFrame::Hello(Hello { version, player_name: "fuzz".into() })
        },
        Request::ListRooms => ClientFrame::ListRooms,
        Request::Create { room: r } => ClientFrame::CreateAndJoinRoom { room: room(r) },
        Request::Join { room: r } => ClientFrame::JoinRoom { room: room(r) },
        Request::Leave => ClientFrame::LeaveRoom,
        Request::Set { key: k, value } => ClientFrame::SetProperties {
            seq,
            entries: vec![(key(k), value.map(|v| Value::Int(v.into())))],
        },
        Request::Clear { key: k } => ClientFrame::ClearProperties { seq, prefix: key(k) },
        Request::Send { command } => ClientFrame::SendMessage(Message {
            target: "3.a".into(),
            command: command.to_string(),
        }),
        Request::SetPlayer { value } => ClientFrame::SetPlayerProperty {
            key: "ready".into(),
            value: value.map(|v| Value::Int(v.into())),
        },
    }
}

fuzz_target!(|input: FuzzInput| {
    let config = RoomConfig {
        max_players: usize::from(input.max_players % 4) + 1,
        max_rooms: 2,
        ..RoomConfig::default()
    };
    let mut manager = RoomManager::new(SimEnv::with_seed(input.seed), config);
    let mut sessions: Vec<SessionId> = Vec::new();
    let mut greeted: Vec<SessionId> = Vec::new();

    for (seq, step) in (0..).zip(input.steps) {
        match step {
            Step::Register => {
                if sessions.len() < 6 {
                    sessions.push(manager.register_session());
                }
            },
            Step::Disconnect { session } => {
                let Some(id) = pick(&sessions, session) else { continue };
                let _ = manager.disconnect(id);
                sessions.retain(|s| *s != id);
                greeted.retain(|s| *s != id);
                assert!(manager.session_room(id).is_none());
                assert_eq!(
                    manager.process_frame(id, ClientFrame::ListRooms),
                    Err(RoomError::UnknownSession(id))
                );
            },
            Step::Frame { session, request } => {
                let Some(id) = pick(&sessions, session) else { continue };
                let write = match &request {
                    Request::Set { key: k, value } => Some((key(*k), value.map(i64::from))),
                    _ => None,
                };
                let is_write = matches!(request, Request::Set { .. } | Request::Clear { .. });
                let is_hello = matches!(request, Request::Hello { .. });
                let hello_ok = matches!(request, Request::Hello { version } if version == PROTOCOL_VERSION);

                let result = manager.process_frame(id, frame(request, seq));

                if !is_hello && !greeted.contains(&id) {
                    assert_eq!(result, Err(RoomError::HandshakeRequired));
                }
                if hello_ok {
                    assert!(result.is_ok());
                    greeted.push(id);
                }
                if let (Ok(actions), true) = (&result, is_write) {
                    let echoes = actions.iter().filter(|action| is_echo(action, id, seq)).count();
                    assert_eq!(echoes, 1, "accepted write not echoed exactly once");
                }
                if let (Ok(_), Some((k, value))) = (&result, write) {
                    let room = manager.session_room(id).expect("write accepted outside a room");
                    let stored = manager.room_properties(room).and_then(|p| p.get(&k)).cloned();
                    assert_eq!(stored, value.map(Value::Int));
                }
            },
            Step::Datagram { session } => {
                let Some(id) = pick(&sessions, session) else { continue };
                let datagram = ensemble_proto::TransformDatagram {
                    target: "3.a".into(),
                    transform: ensemble_proto::Transform::IDENTITY,
                };
                let actions = manager.process_datagram(id, datagram);
                assert_eq!(actions.is_empty(), manager.session_room(id).is_none());
            },
        }

        check_membership(&manager, &sessions);
    }
});

fn pick(sessions: &[SessionId], index: u8) -> Option<SessionId> {
    if sessions.is_empty() {
        return None;
    }
    Some(sessions[usize::from(index) % sessions.len()])
}

fn is_echo(action: &RoomAction, writer: SessionId, seq: WriteSeq) -> bool {
    let frame = match action {
        RoomAction::SendToSession { frame, .. } | RoomAction::BroadcastToRoom { frame, .. } => frame,
        RoomAction::RelayDatagram { .. } => return false,
    };
    matches!(
        frame,
        ServerFrame::PropertiesChanged { origin, .. } if *origin == WriteOrigin { player: writer, seq }
    )
}

fn check_membership(manager: &RoomManager<SimEnv>, sessions: &[SessionId]) {
    assert_eq!(manager.session_count(), sessions.len());
    for info in manager.rooms() {
        let members: Vec<_> = manager.sessions_in_room(&info.name).collect();
        assert!(!members.is_empty(), "room {} outlived its members", info.name);
        for member in members {
            assert_eq!(manager.session_room(member), Some(info.name.as_str()));
        }
    }
    for id in sessions {
        if let Some(room) = manager.session_room(*id) {
            assert!(manager.has_room(room));
            assert!(manager.sessions_in_room(room).any(|m| m == *id));
        }
    }
}
