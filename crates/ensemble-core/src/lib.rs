//! Ensemble core.
//!
//! Transport-agnostic property replication for small groups of peers. A
//! [`SharingSession`] owns a [`TargetRegistry`] of [`SharingTarget`]s, each a
//! property bag with a root/children hierarchy, and routes notifications from a
//! [`Transport`] to them.
//!
//! # Architecture
//!
//! ```text
//! application ──▶ SharingTarget ──▶ Transport ──▶ network / room server
//!                      ▲                │
//!                      │  pump()        │ poll_events()
//!                 SharingSession ◀──────┘
//! ```
//!
//! Writes go through targets into the transport. Notifications queue inside
//! the transport until the host calls [`SharingSession::pump`], so all target
//! mutation happens on one logical thread.
//!
//! On every (re)connect each live target reconciles with the room: values the
//! room lacks are published, values the room holds win (see [`reconcile`]).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bindings;
pub mod env;
pub mod error;
pub mod event;
pub mod lobby;
pub mod mirror;
#[cfg(any(test, feature = "test-util"))]
pub mod mock_transport;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod target;
pub mod transport;

pub use env::Environment;
pub use error::RouteError;
pub use event::{SessionEvent, Subscription, TargetEvent};
pub use lobby::Lobby;
pub use mirror::RoomMirror;
#[cfg(any(test, feature = "test-util"))]
pub use mock_transport::MockTransport;
pub use reconcile::{ReconcilePlan, plan};
pub use registry::TargetRegistry;
pub use session::{PumpStats, SessionConfig, SharingSession};
pub use target::SharingTarget;
pub use transport::{Transport, TransportEvent};
