//! Fuzz target for wire key encoding and decoding
//!
//! # Strategy
//!
//! - Raw strings: arbitrary text fed to both decoders
//! - Structured ids: arbitrary type, label and address encoded then decoded
//!
//! # Invariants
//!
//! - Decoding NEVER panics
//! - A decoded key re-encodes to a key that decodes to the same id
//! - Any constructed id with a label survives encode/decode unchanged
//! - Property keys split back into the same id and escaped name

#![no_main]

use arbitrary::Arbitrary;
use ensemble_proto::{Identification, TargetType, escape_segment};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    raw: String,
    ordinal: u8,
    label: String,
    address: Vec<i32>,
    property: String,
}

fuzz_target!(|input: FuzzInput| {
    if let Ok(id) = Identification::decode(&input.raw) {
        let again = Identification::decode(id.encode()).expect("re-encoded key must decode");
        assert_eq!(again, id);
    }
    if let Ok((id, name)) = Identification::decode_with_property(&input.raw) {
        assert!(!name.is_empty());
        let key = id.encode_with_property(&name).expect("decoded name is not empty");
        let (again, again_name) =
            Identification::decode_with_property(&key).expect("re-encoded key must decode");
        assert_eq!((again, again_name), (id, name));
    }

    let Some(kind) = TargetType::from_ordinal(input.ordinal) else {
        return;
    };
    if input.label.is_empty() {
        return;
    }
    let id = Identification::with_address(kind, &input.label, input.address);
    assert_eq!(Identification::decode(id.encode()).as_ref(), Ok(&id));

    let property = escape_segment(&input.property);
    match id.encode_with_property(&property) {
        Some(key) => {
            assert!(key.starts_with(&id.property_prefix()));
            let decoded = Identification::decode_with_property(&key);
            assert_eq!(decoded, Ok((id, property.into_owned())));
        },
        None => assert!(property.is_empty()),
    }
});
