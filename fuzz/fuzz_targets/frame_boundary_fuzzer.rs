//! Fuzz target for frame and datagram decoding
//!
//! # Strategy
//!
//! - Raw bytes: arbitrary buffers as length-prefixed frames and datagrams
//! - Split reads: the same buffer cut at an arbitrary point
//!
//! # Invariants
//!
//! - Decoding NEVER panics on any input
//! - A decoded frame never claims more bytes than the buffer holds
//! - A prefix of a buffer never decodes to a longer frame than the whole
//! - Oversized length prefixes are rejected before any payload is read

#![no_main]

use arbitrary::Arbitrary;
use ensemble_proto::{
    ClientFrame, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE, ProtocolError, ServerFrame, decode_datagram,
    decode_frame, payload_len,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    bytes: Vec<u8>,
    split: u16,
}

fuzz_target!(|input: FuzzInput| {
    let bytes = &input.bytes;

    if let Ok((_, used)) = decode_frame::<ClientFrame>(bytes) {
        assert!(used <= bytes.len());
        assert!(used >= LENGTH_PREFIX_SIZE);
    }
    if let Ok((_, used)) = decode_frame::<ServerFrame>(bytes) {
        assert!(used <= bytes.len());
    }
    let _ = decode_datagram(bytes);

    if let Some(prefix) = bytes.first_chunk::<LENGTH_PREFIX_SIZE>() {
        match payload_len(*prefix) {
            Ok(len) => assert!(len <= MAX_FRAME_SIZE),
            Err(e) => assert!(matches!(e, ProtocolError::FrameTooLarge { .. })),
        }
    }

    let split = usize::from(input.split).min(bytes.len());
    if let Ok((_, used)) = decode_frame::<ClientFrame>(&bytes[..split]) {
        let (_, whole) = decode_frame::<ClientFrame>(bytes).expect("prefix decoded");
        assert_eq!(used, whole);
    }
});
