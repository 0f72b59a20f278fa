//! Action execution for server I/O.
//!
//! Turns [`RoomAction`]s into queued [`Outbound`] work. Each frame is encoded
//! once and the bytes are shared by every recipient. Delivery is best effort:
//! a recipient whose connection is gone is logged and skipped.

use bytes::Bytes;
use ensemble_core::env::Environment;
use ensemble_proto::{encode_datagram, encode_frame};

use crate::{
    registry::{ConnectionRegistry, Outbound},
    room_manager::{RoomAction, RoomManager, SessionId},
};

/// Outcome of executing a batch of actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Items queued to a connection.
    pub delivered: usize,
    /// Items dropped (encode failure or closed connection).
    pub failed: usize,
}

/// Executes `actions` against the current room membership.
///
/// Must run under the same lock that produced the actions, so membership has
/// not moved on in between.
pub fn execute_actions<E: Environment>(
    manager: &RoomManager<E>,
    connections: &ConnectionRegistry,
    actions: Vec<RoomAction>,
) -> ExecutionStats {
    let mut stats = ExecutionStats::default();
    for action in actions {
        match action {
            RoomAction::SendToSession { session_id, frame } => match encode_frame(&frame) {
                Ok(bytes) => {
                    deliver(connections, session_id, Outbound::Frame(Bytes::from(bytes)), &mut stats);
                },
                Err(e) => {
                    tracing::error!(session_id, "failed to encode frame: {}", e);
                    stats.failed += 1;
                },
            },

            RoomAction::BroadcastToRoom { room, frame, exclude } => {
                let bytes = match encode_frame(&frame) {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(e) => {
                        tracing::error!(room = %room, "failed to encode broadcast: {}", e);
                        stats.failed += 1;
                        continue;
                    },
                };
                for session_id in manager.sessions_in_room(&room) {
                    if Some(session_id) != exclude {
                        deliver(connections, session_id, Outbound::Frame(bytes.clone()), &mut stats);
                    }
                }
            },

            RoomAction::RelayDatagram { room, datagram, exclude } => {
                let bytes = match encode_datagram(&datagram) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!(room = %room, "failed to encode datagram: {}", e);
                        stats.failed += 1;
                        continue;
                    },
                };
                for session_id in manager.sessions_in_room(&room) {
                    if session_id != exclude {
                        deliver(connections, session_id, Outbound::Datagram(bytes.clone()), &mut stats);
                    }
                }
            },
        }
    }
    stats
}

fn deliver(
    connections: &ConnectionRegistry,
    session_id: SessionId,
    outbound: Outbound,
    stats: &mut ExecutionStats,
) {
    if connections.send(session_id, outbound) {
        stats.delivered += 1;
    } else {
        tracing::debug!(session_id, "dropping output for closed connection");
        stats.failed += 1;
    }
}
