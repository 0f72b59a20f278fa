//! Domain bindings built on sharing targets.
//!
//! Bindings own no replication logic of their own; they map application state
//! onto target properties and events.

pub mod transform;

pub use transform::{TRANSFORM_PROPERTY, TransformSync};
