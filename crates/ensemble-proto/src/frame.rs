//! Wire frames exchanged between clients and the room server.
//!
//! Control traffic is a stream of length-prefixed CBOR frames on one reliable,
//! ordered stream per connection:
//!
//! ```text
//! +----------------+---------------------------+
//! | length (u32 BE)| CBOR payload (length bytes)|
//! +----------------+---------------------------+
//! ```
//!
//! Transform updates travel as unprefixed CBOR datagrams and may be lost or
//! reordered.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::value::{Transform, Value};

/// Current protocol version, sent in [`Hello`].
pub const PROTOCOL_VERSION: u8 = 1;

/// ALPN protocol identifier negotiated by QUIC peers.
pub const ALPN: &[u8] = b"ensemble/1";

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest accepted frame payload.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Server-assigned player identifier.
pub type PlayerId = u64;

/// One property write: key and new value (`None` deletes).
pub type PropertyEntry = (String, Option<Value>);

/// Client-chosen sequence number of a property write request.
///
/// Increases by one per write request on a connection, so the writer can
/// match the server's echo to the request that caused it.
pub type WriteSeq = u64;

/// Errors from frame encoding and decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// CBOR serialization failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// CBOR deserialization failed.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced or encoded size.
        size: usize,
        /// Limit.
        max: usize,
    },

    /// Buffer ends before the announced frame does.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes needed for the full frame.
        needed: usize,
        /// Bytes available.
        available: usize,
    },
}

/// Room listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    /// Room name (unique on the server).
    pub name: String,
    /// Players currently in the room.
    pub player_count: u32,
    /// Player cap.
    pub max_players: u32,
}

/// Player in a room, with its player-scoped properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    /// Server-assigned identifier.
    pub id: PlayerId,
    /// Display name from [`Hello`].
    pub name: String,
    /// Player-scoped properties.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// Initial client handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version.
    pub version: u8,
    /// Display name.
    pub player_name: String,
}

/// Addressed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Encoded target key.
    pub target: String,
    /// Opaque command string.
    pub command: String,
}

/// Player and request that produced a [`ServerFrame::PropertiesChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOrigin {
    /// Writing player.
    pub player: PlayerId,
    /// Sequence number of the write request.
    pub seq: WriteSeq,
}

/// Transform update datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformDatagram {
    /// Encoded target key.
    pub target: String,
    /// New transform.
    pub transform: Transform,
}

/// Frames sent by a client on the control stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Handshake, first frame on a connection.
    Hello(Hello),
    /// Request a [`ServerFrame::RoomList`].
    ListRooms,
    /// Create a room and join it.
    CreateAndJoinRoom {
        /// Room name.
        room: String,
    },
    /// Join an existing room.
    JoinRoom {
        /// Room name.
        room: String,
    },
    /// Leave the current room.
    LeaveRoom,
    /// Atomic batch of room property writes.
    SetProperties {
        /// Request sequence number, echoed back in [`WriteOrigin`].
        seq: WriteSeq,
        /// Writes, applied in order.
        entries: Vec<PropertyEntry>,
    },
    /// Delete every room property whose key starts with `prefix`.
    ClearProperties {
        /// Request sequence number, echoed back in [`WriteOrigin`].
        seq: WriteSeq,
        /// Key prefix.
        prefix: String,
    },
    /// Command for the other room members.
    SendMessage(Message),
    /// Write a property of the sending player.
    SetPlayerProperty {
        /// Property key.
        key: String,
        /// New value, `None` deletes.
        value: Option<Value>,
    },
}

/// Frames sent by the server on the control stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Handshake reply.
    Welcome {
        /// Identifier assigned to this connection's player.
        player_id: PlayerId,
    },
    /// Open rooms.
    RoomList {
        /// Rooms.
        rooms: Vec<RoomInfo>,
    },
    /// The client is now in `room`.
    Joined {
        /// Room name.
        room: String,
        /// Current room properties.
        properties: Vec<(String, Value)>,
        /// Current players, the joining player included.
        players: Vec<PlayerInfo>,
    },
    /// The client is no longer in `room`.
    Left {
        /// Room name.
        room: String,
    },
    /// Room properties changed (one frame per applied batch).
    ///
    /// Sent to every member, the writer included.
    PropertiesChanged {
        /// Writes in applied order.
        entries: Vec<PropertyEntry>,
        /// Request that caused the change.
        origin: WriteOrigin,
    },
    /// Command from another room member.
    MessageReceived(Message),
    /// Room membership or player properties changed.
    PlayersChanged {
        /// Current players.
        players: Vec<PlayerInfo>,
    },
    /// A request was rejected.
    Error {
        /// Reason for the rejection.
        reason: String,
        /// Sequence number when the rejected request was a property write.
        #[serde(default)]
        seq: Option<WriteSeq>,
    },
}

impl ClientFrame {
    /// Sequence number of a property write request.
    pub fn write_seq(&self) -> Option<WriteSeq> {
        match self {
            Self::SetProperties { seq, .. } | Self::ClearProperties { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}

/// Encodes `frame` as CBOR behind a length prefix.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = vec![0u8; LENGTH_PREFIX_SIZE];
    ciborium::ser::into_writer(frame, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;

    let payload_len = buf.len() - LENGTH_PREFIX_SIZE;
    if payload_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge { size: payload_len, max: MAX_FRAME_SIZE });
    }

    let prefix = u32::try_from(payload_len)
        .map_err(|_| ProtocolError::FrameTooLarge { size: payload_len, max: MAX_FRAME_SIZE })?;
    buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&prefix.to_be_bytes());
    Ok(buf)
}

/// Payload length announced by a length prefix.
///
/// Rejects lengths above [`MAX_FRAME_SIZE`] before anything is allocated.
pub fn payload_len(prefix: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize, ProtocolError> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge { size: len, max: MAX_FRAME_SIZE });
    }
    Ok(len)
}

/// Decodes a CBOR payload (without prefix).
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    ciborium::de::from_reader(payload).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Decodes one prefixed frame from the front of `buf`.
///
/// Returns the frame and the number of bytes consumed.
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<(T, usize), ProtocolError> {
    let Some(prefix) = buf.first_chunk::<LENGTH_PREFIX_SIZE>() else {
        return Err(ProtocolError::Truncated { needed: LENGTH_PREFIX_SIZE, available: buf.len() });
    };

    let len = payload_len(*prefix)?;
    let end = LENGTH_PREFIX_SIZE + len;
    let payload = buf
        .get(LENGTH_PREFIX_SIZE..end)
        .ok_or(ProtocolError::Truncated { needed: end, available: buf.len() })?;

    Ok((decode_payload(payload)?, end))
}

/// Encodes a transform datagram.
pub fn encode_datagram(datagram: &TransformDatagram) -> Result<Bytes, ProtocolError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(datagram, &mut buf)
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decodes a transform datagram.
pub fn decode_datagram(bytes: &[u8]) -> Result<TransformDatagram, ProtocolError> {
    decode_payload(bytes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use hex_literal::hex;

    use super::*;
    use crate::value::Vec3;

    #[test]
    fn prefix_is_big_endian_payload_length() {
        let bytes = encode_frame(&ClientFrame::LeaveRoom).unwrap();
        let payload_len = bytes.len() - LENGTH_PREFIX_SIZE;
        assert_eq!(&bytes[..4], &(payload_len as u32).to_be_bytes());
    }

    #[test]
    fn oversized_prefix_rejected() {
        let err = payload_len(hex!("00100001")).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 0x0010_0001, .. }));
        assert_eq!(payload_len(hex!("00000010")).unwrap(), 16);
    }

    #[test]
    fn decode_frame_consumes_exactly_one_frame() {
        let first = ClientFrame::SetProperties {
            seq: 1,
            entries: vec![
                ("3.engine:color".to_string(), Some(Value::from("red"))),
                ("3.engine:speed".to_string(), None),
            ],
        };
        let second = ClientFrame::ListRooms;

        let mut buf = encode_frame(&first).unwrap();
        let first_len = buf.len();
        buf.extend(encode_frame(&second).unwrap());

        let (decoded, consumed) = decode_frame::<ClientFrame>(&buf).unwrap();
        assert_eq!(decoded, first);
        assert_eq!(consumed, first_len);

        let (decoded, _) = decode_frame::<ClientFrame>(&buf[consumed..]).unwrap();
        assert_eq!(decoded, second);
    }

    #[test]
    fn decode_frame_reports_truncation() {
        let buf = encode_frame(&ServerFrame::Welcome { player_id: 7 }).unwrap();
        let err = decode_frame::<ServerFrame>(&buf[..buf.len() - 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));

        let err = decode_frame::<ServerFrame>(&buf[..2]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { needed: 4, available: 2 }));
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        let mut buf = hex!("00000003").to_vec();
        buf.extend_from_slice(&[0xff, 0xff, 0xff]);
        assert!(matches!(decode_frame::<ServerFrame>(&buf), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn only_property_writes_carry_a_sequence() {
        assert_eq!(ClientFrame::ClearProperties { seq: 4, prefix: "3.".into() }.write_seq(), Some(4));
        assert_eq!(ClientFrame::SetProperties { seq: 9, entries: Vec::new() }.write_seq(), Some(9));
        assert_eq!(ClientFrame::LeaveRoom.write_seq(), None);
    }

    #[test]
    fn datagram_serde() {
        let datagram = TransformDatagram {
            target: "3.engine.1".to_string(),
            transform: Transform::from_position(Vec3::new(0.5, 1.0, -2.0)),
        };
        let bytes = encode_datagram(&datagram).unwrap();
        assert_eq!(decode_datagram(&bytes).unwrap(), datagram);
    }
}
