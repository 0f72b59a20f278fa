//! Target events and subscriptions.
//!
//! Events are delivered over unbounded channels rather than callbacks, so a
//! subscriber never runs while a target is mid-update and can freely call back
//! into the target that produced the event.

use std::collections::BTreeMap;

use ensemble_proto::{Identification, PlayerInfo, RoomInfo, Transform, Value};
use tokio::sync::mpsc::{UnboundedReceiver, error::TryRecvError};

/// Event raised by a [`SharingTarget`](crate::SharingTarget).
#[derive(Debug, Clone, PartialEq)]
pub enum TargetEvent {
    /// A property of this target changed (`None` means removed).
    PropertyChanged {
        /// Target whose property changed.
        target: Identification,
        /// Property name.
        name: String,
        /// New value.
        value: Option<Value>,
    },

    /// A property of one of this root's children changed.
    ChildPropertyChanged {
        /// The child.
        child: Identification,
        /// Property name.
        name: String,
        /// New value.
        value: Option<Value>,
    },

    /// A command addressed to this target arrived.
    MessageReceived {
        /// Addressed target.
        target: Identification,
        /// Opaque command.
        command: String,
    },

    /// A transform update addressed to this target arrived.
    TransformMessageReceived {
        /// Addressed target.
        target: Identification,
        /// New transform.
        transform: Transform,
    },

    /// A transform update addressed to one of this root's children arrived.
    ChildTransformMessageReceived {
        /// The child.
        child: Identification,
        /// New transform.
        transform: Transform,
    },

    /// The target was reconciled after a connect, or lost its connection.
    ConnectionChanged {
        /// New state.
        connected: bool,
    },
}

/// Event raised by a [`SharingSession`](crate::SharingSession).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Every live target has been reconciled (`true`) or disconnected.
    ConnectionChanged {
        /// New state.
        connected: bool,
    },
    /// Players in the room changed.
    PlayersChanged(Vec<PlayerInfo>),
    /// Room listing changed.
    RoomsChanged(Vec<RoomInfo>),
}

/// Live view of one target: the properties at subscribe time and every event
/// raised after it.
///
/// Dropping the subscription unsubscribes. The stream ends once the target is
/// disposed or freed.
#[derive(Debug)]
pub struct Subscription {
    target: Identification,
    snapshot: BTreeMap<String, Value>,
    receiver: UnboundedReceiver<TargetEvent>,
}

impl Subscription {
    pub(crate) fn new(
        target: Identification,
        snapshot: BTreeMap<String, Value>,
        receiver: UnboundedReceiver<TargetEvent>,
    ) -> Self {
        Self { target, snapshot, receiver }
    }

    /// Target this subscription observes.
    pub fn target(&self) -> &Identification {
        &self.target
    }

    /// Properties at the moment of subscribing.
    pub fn snapshot(&self) -> &BTreeMap<String, Value> {
        &self.snapshot
    }

    /// Synthetic `PropertyChanged` events reproducing the snapshot, in key
    /// order.
    ///
    /// Lets a late subscriber run the same code path it uses for live updates.
    pub fn replay(&self) -> impl Iterator<Item = TargetEvent> + '_ {
        self.snapshot.iter().map(|(name, value)| TargetEvent::PropertyChanged {
            target: self.target.clone(),
            name: name.clone(),
            value: Some(value.clone()),
        })
    }

    /// Next queued event, without waiting.
    pub fn try_next(&mut self) -> Option<TargetEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Every queued event, without waiting.
    pub fn drain(&mut self) -> Vec<TargetEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    /// Waits for the next event. `None` once the target is gone.
    pub async fn next(&mut self) -> Option<TargetEvent> {
        self.receiver.recv().await
    }
}
