//! Ensemble wire protocol.
//!
//! Types shared by every participant in a sharing session:
//!
//! - [`Identification`]: hierarchical target addresses and the flat wire keys
//!   they encode to
//! - [`Value`] and [`Transform`]: opaque replicated payloads
//! - [`ClientFrame`] / [`ServerFrame`]: control frames and their
//!   length-prefixed CBOR codec
//! - [`TransformDatagram`]: unreliable transform updates

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod frame;
pub mod identification;
pub mod value;

pub use frame::{
    ALPN, ClientFrame, Hello, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE, Message, PROTOCOL_VERSION,
    PlayerId, PlayerInfo, PropertyEntry, ProtocolError, RoomInfo, ServerFrame, TransformDatagram,
    WriteOrigin, WriteSeq, decode_datagram, decode_frame, decode_payload, encode_datagram, encode_frame, payload_len,
};
pub use identification::{
    DecodeError, ESCAPE_REPLACEMENT, FIELD_SEPARATOR, Identification, PROPERTY_SEPARATOR,
    TargetType, escape_segment,
};
pub use value::{Quat, Transform, Value, Vec3};
