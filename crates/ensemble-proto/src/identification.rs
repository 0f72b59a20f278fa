//! Target identifiers and their wire-key codec.
//!
//! An [`Identification`] names one logical replicated object: either a root
//! (type + label) or a child of a root (the root's fields plus a non-empty
//! integer address). On the wire it travels as a flat string:
//!
//! ```text
//! {type}.{label}[.{address}]*          target key
//! {type}.{label}[.{address}]*:{name}   property key
//! ```
//!
//! `.` separates fields and `:` introduces a property name, so a property key
//! can always be told apart from a child key without knowing the call site.
//!
//! # Invariants
//!
//! - Labels and property names never contain a separator. Both are replaced
//!   with `_` whenever a label or name is written.
//! - Equality, ordering and hashing use the encoded string, so two values
//!   built from the same type/label/address are interchangeable.

use std::{
    borrow::Cow,
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};

use serde_repr::{Deserialize_repr, Serialize_repr};
use thiserror::Error;

/// Separates type, label and address components.
pub const FIELD_SEPARATOR: char = '.';

/// Separates an encoded target from a property name.
pub const PROPERTY_SEPARATOR: char = ':';

/// Written in place of a separator found inside a label or property name.
pub const ESCAPE_REPLACEMENT: char = '_';

/// Kind of logical object a target represents.
///
/// The discriminant is the ordinal written as the first wire-key field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize_repr, Deserialize_repr,
)]
#[repr(u8)]
pub enum TargetType {
    /// Unclassified target.
    Unknown = 0,
    /// Room-wide state (session settings, menus).
    Room = 1,
    /// State owned by one player.
    Player = 2,
    /// A shared scene object and its sub-parts.
    Object = 3,
}

impl TargetType {
    /// Ordinal written on the wire.
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Type for a wire ordinal, `None` if the ordinal is not assigned.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(Self::Unknown),
            1 => Some(Self::Room),
            2 => Some(Self::Player),
            3 => Some(Self::Object),
            _ => None,
        }
    }
}

/// Reasons a wire key is not a valid target or property key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer than the two mandatory fields (type and label).
    #[error("wire key has {found} field(s), expected at least 2")]
    TooFewFields {
        /// Number of fields found.
        found: usize,
    },

    /// The type field is not an integer.
    #[error("invalid type field: {token:?}")]
    InvalidType {
        /// The offending field.
        token: String,
    },

    /// The type field is an integer with no [`TargetType`].
    #[error("unknown type ordinal: {ordinal}")]
    UnknownType {
        /// The unassigned ordinal.
        ordinal: u8,
    },

    /// The label field is empty.
    #[error("empty label")]
    EmptyLabel,

    /// An address field is not an integer.
    #[error("invalid address field: {token:?}")]
    InvalidAddress {
        /// The offending field.
        token: String,
    },

    /// A plain target key carried a property suffix.
    #[error("unexpected property suffix in target key")]
    UnexpectedProperty,

    /// A property key had no property separator.
    #[error("missing property separator")]
    MissingProperty,

    /// A property key had an empty or malformed property name.
    #[error("invalid property name: {name:?}")]
    InvalidProperty {
        /// The offending name.
        name: String,
    },
}

/// Replaces separator characters in a label or property name.
///
/// Borrows when there is nothing to replace.
pub fn escape_segment(segment: &str) -> Cow<'_, str> {
    if segment.contains([FIELD_SEPARATOR, PROPERTY_SEPARATOR]) {
        Cow::Owned(
            segment
                .chars()
                .map(|c| {
                    if c == FIELD_SEPARATOR || c == PROPERTY_SEPARATOR { ESCAPE_REPLACEMENT } else { c }
                })
                .collect(),
        )
    } else {
        Cow::Borrowed(segment)
    }
}

/// Address of one logical replicated object.
#[derive(Clone)]
pub struct Identification {
    kind: TargetType,
    label: String,
    address: Vec<i32>,
    encoded: String,
}

impl Identification {
    /// Identification of a root target.
    ///
    /// Separators inside `label` are escaped.
    pub fn new(kind: TargetType, label: &str) -> Self {
        Self::with_address(kind, label, Vec::new())
    }

    /// Identification with an explicit address (empty for a root).
    ///
    /// Separators inside `label` are escaped.
    pub fn with_address(kind: TargetType, label: &str, address: impl Into<Vec<i32>>) -> Self {
        Self::from_parts(kind, escape_segment(label).into_owned(), address.into())
    }

    fn from_parts(kind: TargetType, label: String, address: Vec<i32>) -> Self {
        let encoded = encode_fields(kind, &label, &address);
        Self { kind, label, address, encoded }
    }

    /// Target type.
    pub fn kind(&self) -> TargetType {
        self.kind
    }

    /// Escaped label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Address below the root; empty for roots.
    pub fn address(&self) -> &[i32] {
        &self.address
    }

    /// Whether this names a root target.
    pub fn is_root(&self) -> bool {
        self.address.is_empty()
    }

    /// Identification of the owning root (itself for a root).
    pub fn root(&self) -> Self {
        if self.is_root() {
            self.clone()
        } else {
            Self::from_parts(self.kind, self.label.clone(), Vec::new())
        }
    }

    /// Identification of a descendant, extending this address by `address`.
    pub fn child(&self, address: &[i32]) -> Self {
        let mut extended = self.address.clone();
        extended.extend_from_slice(address);
        Self::from_parts(self.kind, self.label.clone(), extended)
    }

    /// Canonical wire key.
    pub fn encode(&self) -> &str {
        &self.encoded
    }

    /// Wire key of one property of this target.
    ///
    /// Returns `None` if `property` is empty.
    pub fn encode_with_property(&self, property: &str) -> Option<String> {
        if property.is_empty() {
            return None;
        }
        let property = escape_segment(property);
        let mut key = String::with_capacity(self.encoded.len() + 1 + property.len());
        key.push_str(&self.encoded);
        key.push(PROPERTY_SEPARATOR);
        key.push_str(&property);
        Some(key)
    }

    /// Prefix shared by every property key of this target and no other
    /// target's keys (children included).
    pub fn property_prefix(&self) -> String {
        let mut prefix = String::with_capacity(self.encoded.len() + 1);
        prefix.push_str(&self.encoded);
        prefix.push(PROPERTY_SEPARATOR);
        prefix
    }

    /// Parses a target key.
    pub fn decode(key: &str) -> Result<Self, DecodeError> {
        if key.contains(PROPERTY_SEPARATOR) {
            return Err(DecodeError::UnexpectedProperty);
        }

        let fields: Vec<&str> = key.split(FIELD_SEPARATOR).collect();
        let [type_field, label, address_fields @ ..] = fields.as_slice() else {
            return Err(DecodeError::TooFewFields { found: fields.len() });
        };

        let ordinal = type_field
            .parse::<u8>()
            .map_err(|_| DecodeError::InvalidType { token: (*type_field).to_string() })?;
        let kind = TargetType::from_ordinal(ordinal).ok_or(DecodeError::UnknownType { ordinal })?;

        if label.is_empty() {
            return Err(DecodeError::EmptyLabel);
        }

        let address = address_fields
            .iter()
            .map(|token| {
                token
                    .parse::<i32>()
                    .map_err(|_| DecodeError::InvalidAddress { token: (*token).to_string() })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::from_parts(kind, (*label).to_string(), address))
    }

    /// Parses a property key into the target and the property name.
    pub fn decode_with_property(key: &str) -> Result<(Self, String), DecodeError> {
        let (target, property) =
            key.split_once(PROPERTY_SEPARATOR).ok_or(DecodeError::MissingProperty)?;

        if property.is_empty() || property.contains([FIELD_SEPARATOR, PROPERTY_SEPARATOR]) {
            return Err(DecodeError::InvalidProperty { name: property.to_string() });
        }

        Ok((Self::decode(target)?, property.to_string()))
    }
}

fn encode_fields(kind: TargetType, label: &str, address: &[i32]) -> String {
    let mut encoded = String::with_capacity(label.len() + 4 + address.len() * 4);
    encoded.push_str(&kind.ordinal().to_string());
    encoded.push(FIELD_SEPARATOR);
    encoded.push_str(label);
    for part in address {
        encoded.push(FIELD_SEPARATOR);
        encoded.push_str(&part.to_string());
    }
    encoded
}

impl PartialEq for Identification {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for Identification {}

impl Hash for Identification {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.encoded.hash(state);
    }
}

impl PartialOrd for Identification {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identification {
    fn cmp(&self, other: &Self) -> Ordering {
        self.encoded.cmp(&other.encoded)
    }
}

impl fmt::Debug for Identification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Identification").field(&self.encoded).finish()
    }
}

impl fmt::Display for Identification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl FromStr for Identification {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn root_key_format() {
        let id = Identification::new(TargetType::Object, "engine");
        insta::assert_snapshot!(id.encode(), @"3.engine");
        assert!(id.is_root());
    }

    #[test]
    fn child_and_property_key_format() {
        let id = Identification::with_address(TargetType::Object, "engine", vec![2, 0, 7]);
        insta::assert_snapshot!(id.encode(), @"3.engine.2.0.7");
        insta::assert_snapshot!(id.encode_with_property("color").unwrap(), @"3.engine.2.0.7:color");
        insta::assert_snapshot!(id.property_prefix(), @"3.engine.2.0.7:");
    }

    #[test]
    fn separators_in_label_and_property_are_escaped() {
        let id = Identification::new(TargetType::Room, "lobby.main:1");
        assert_eq!(id.label(), "lobby_main_1");
        assert_eq!(id.encode_with_property("a.b:c").unwrap(), "1.lobby_main_1:a_b_c");
    }

    #[test]
    fn empty_property_has_no_key() {
        let id = Identification::new(TargetType::Room, "lobby");
        assert_eq!(id.encode_with_property(""), None);
    }

    #[test]
    fn equality_follows_encoded_form() {
        let built = Identification::with_address(TargetType::Object, "a.b", vec![1]);
        let decoded = Identification::decode("3.a_b.1").unwrap();
        assert_eq!(built, decoded);

        let mut set = std::collections::HashSet::new();
        set.insert(built);
        assert!(set.contains(&decoded));
    }

    #[test]
    fn child_extends_address_and_shares_root() {
        let root = Identification::new(TargetType::Object, "engine");
        let child = root.child(&[4]).child(&[1]);
        assert_eq!(child.address(), &[4, 1]);
        assert_eq!(child.root(), root);
        assert_eq!(root.root(), root);
    }

    #[test]
    fn decode_rejects_single_field() {
        assert_eq!(Identification::decode("engine"), Err(DecodeError::TooFewFields { found: 1 }));
        assert_eq!(Identification::decode(""), Err(DecodeError::TooFewFields { found: 1 }));
    }

    #[test]
    fn decode_rejects_non_numeric_type() {
        assert!(matches!(Identification::decode("x.engine"), Err(DecodeError::InvalidType { .. })));
        assert_eq!(Identification::decode("9.engine"), Err(DecodeError::UnknownType { ordinal: 9 }));
    }

    #[test]
    fn decode_rejects_non_numeric_address() {
        assert!(matches!(
            Identification::decode("3.engine.1.wheel"),
            Err(DecodeError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn decode_rejects_empty_label() {
        assert_eq!(Identification::decode("3."), Err(DecodeError::EmptyLabel));
    }

    #[test]
    fn plain_decode_rejects_property_key() {
        assert_eq!(Identification::decode("3.engine:color"), Err(DecodeError::UnexpectedProperty));
    }

    #[test]
    fn property_decode_distinguishes_address_from_name() {
        let (id, name) = Identification::decode_with_property("3.engine.12:12").unwrap();
        assert_eq!(id.address(), &[12]);
        assert_eq!(name, "12");

        assert_eq!(
            Identification::decode_with_property("3.engine.12"),
            Err(DecodeError::MissingProperty)
        );
        assert!(matches!(
            Identification::decode_with_property("3.engine:"),
            Err(DecodeError::InvalidProperty { .. })
        ));
    }

    fn kind_strategy() -> impl Strategy<Value = TargetType> {
        prop_oneof![
            Just(TargetType::Unknown),
            Just(TargetType::Room),
            Just(TargetType::Player),
            Just(TargetType::Object),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            kind in kind_strategy(),
            label in "[^.:]{1,24}",
            address in prop::collection::vec(any::<i32>(), 0..6),
        ) {
            let id = Identification::with_address(kind, &label, address.clone());
            let decoded = Identification::decode(id.encode()).unwrap();
            prop_assert_eq!(decoded.kind(), kind);
            prop_assert_eq!(decoded.label(), label.as_str());
            prop_assert_eq!(decoded.address(), address.as_slice());
        }

        #[test]
        fn prop_property_decode_inverts_encode(
            label in "[a-zA-Z0-9_-]{1,16}",
            address in prop::collection::vec(any::<i32>(), 0..4),
            property in "[^.:]{1,16}",
        ) {
            let id = Identification::with_address(TargetType::Object, &label, address);
            let key = id.encode_with_property(&property).unwrap();
            let (decoded, name) = Identification::decode_with_property(&key).unwrap();
            prop_assert_eq!(decoded, id);
            prop_assert_eq!(name, property);
        }

        #[test]
        fn prop_decode_never_panics(key in ".{0,48}") {
            let _ = Identification::decode(&key);
            let _ = Identification::decode_with_property(&key);
        }
    }
}
