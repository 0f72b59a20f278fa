//! Sharing targets.
//!
//! A [`SharingTarget`] is the local face of one replicated object: a property
//! cache, a root/children relationship, and an event stream. Property writes
//! land in the cache first and are forwarded to the transport only while the
//! target is connected; anything written offline is published by
//! reconciliation on the next connect.
//!
//! # Ownership
//!
//! Targets are handed out as `Arc<SharingTarget>`. A child holds its root
//! strongly and a root holds its children weakly, so a root lives at least as
//! long as any of its children and a child is freed as soon as nobody uses it.
//! The registry only ever holds weak references.
//!
//! # Locking
//!
//! Each target has one lock around its mutable state. It is never held while
//! calling the transport, the registry or another target.

use std::{collections::BTreeMap, sync::Arc};

use ensemble_proto::{Identification, Message, Transform, Value, escape_segment};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::{
    event::{Subscription, TargetEvent},
    reconcile,
    registry::TargetRegistry,
    transport::Transport,
};

#[derive(Default)]
struct TargetState {
    properties: BTreeMap<String, Value>,
    children: Vec<std::sync::Weak<SharingTarget>>,
    subscribers: Vec<UnboundedSender<TargetEvent>>,
    connected: bool,
}

/// One replicated object.
pub struct SharingTarget {
    id: Identification,
    transport: Arc<dyn Transport>,
    registry: Arc<TargetRegistry>,
    root: Option<Arc<SharingTarget>>,
    state: Mutex<TargetState>,
}

impl SharingTarget {
    pub(crate) fn new(
        id: Identification,
        transport: Arc<dyn Transport>,
        registry: Arc<TargetRegistry>,
        root: Option<Arc<Self>>,
        connected: bool,
    ) -> Self {
        Self {
            id,
            transport,
            registry,
            root,
            state: Mutex::new(TargetState { connected, ..TargetState::default() }),
        }
    }

    /// Immutable identifier.
    pub fn id(&self) -> &Identification {
        &self.id
    }

    /// Whether this is a root target.
    pub fn is_root(&self) -> bool {
        self.root.is_none()
    }

    /// Owning root; `None` for a root.
    pub fn root(&self) -> Option<&Arc<Self>> {
        self.root.as_ref()
    }

    /// Whether writes are currently forwarded to the transport.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Sets (`Some`) or removes (`None`) a property.
    ///
    /// The name is escaped before use. An empty name is ignored.
    pub fn set_property(&self, name: &str, value: Option<Value>) {
        let name = escape_segment(name);
        let Some(key) = self.id.encode_with_property(&name) else {
            tracing::warn!(target_id = %self.id, "ignoring write to empty property name");
            return;
        };

        if self.store_local(&name, value.clone()) {
            self.raise_property_changed(&name, value.clone());
        }

        if self.is_connected() {
            self.transport.set_property(&key, value);
        }
    }

    /// Sets or removes several properties, sent to the transport as one batch.
    ///
    /// Local updates are applied first, in order; there is no rollback if the
    /// transport later rejects the batch.
    pub fn set_properties<I, S>(&self, entries: I)
    where
        I: IntoIterator<Item = (S, Option<Value>)>,
        S: AsRef<str>,
    {
        let mut batch = Vec::new();
        for (name, value) in entries {
            let name = escape_segment(name.as_ref()).into_owned();
            let Some(key) = self.id.encode_with_property(&name) else {
                tracing::warn!(target_id = %self.id, "ignoring write to empty property name");
                continue;
            };

            if self.store_local(&name, value.clone()) {
                self.raise_property_changed(&name, value.clone());
            }
            batch.push((key, value));
        }

        if !batch.is_empty() && self.is_connected() {
            self.transport.set_properties(batch);
        }
    }

    /// Current value of a property: the local cache, then the transport's last
    /// known value.
    pub fn try_get_property(&self, name: &str) -> Option<Value> {
        let name = escape_segment(name);
        if let Some(value) = self.state.lock().properties.get(name.as_ref()) {
            return Some(value.clone());
        }
        let key = self.id.encode_with_property(&name)?;
        self.transport.try_get_property(&key)
    }

    /// Whether a property has a value locally or in the room.
    pub fn has_property(&self, name: &str) -> bool {
        self.try_get_property(name).is_some()
    }

    /// Snapshot of the local property cache.
    pub fn properties(&self) -> BTreeMap<String, Value> {
        self.state.lock().properties.clone()
    }

    /// Removes every local property, raising one removal event per key, and
    /// clears this target's keys in the room. Children are not touched.
    pub fn clear_properties(&self) {
        let removed = std::mem::take(&mut self.state.lock().properties);
        for name in removed.keys() {
            self.raise_property_changed(name, None);
        }

        if self.is_connected() {
            self.transport.clear_properties_starting_with(&self.id.property_prefix());
        }
    }

    /// Sends a command to this target on the other peers.
    ///
    /// Dropped while disconnected.
    pub fn send_message(&self, command: &str) {
        if !self.is_connected() {
            tracing::debug!(target_id = %self.id, command, "dropping message while disconnected");
            return;
        }
        self.transport
            .send_message(Message { target: self.id.encode().to_string(), command: command.to_string() });
    }

    /// Sends a transform update to this target on the other peers.
    ///
    /// Unreliable; dropped while disconnected.
    pub fn send_transform_message(&self, transform: Transform) {
        if !self.is_connected() {
            tracing::debug!(target_id = %self.id, "dropping transform while disconnected");
            return;
        }
        self.transport.send_transform_message(self.id.encode(), transform);
    }

    /// Child target at `address` below this one, created if needed.
    pub fn add_child(&self, address: &[i32]) -> Arc<Self> {
        self.registry.get_or_create(&self.id.child(address))
    }

    /// Live children of this root. Always empty for a child.
    pub fn children(&self) -> Vec<Arc<Self>> {
        let mut state = self.state.lock();
        state.children.retain(|child| child.strong_count() > 0);
        state.children.iter().filter_map(std::sync::Weak::upgrade).collect()
    }

    /// Evicts this target from the registry and from its root's children, and
    /// ends every subscription.
    ///
    /// Handles still held elsewhere keep working but no longer receive routed
    /// events; the next lookup of the same id creates a fresh target.
    pub fn dispose(self: &Arc<Self>) {
        self.registry.remove(self);
        if let Some(root) = &self.root {
            root.unlink_child(self);
        }
        self.state.lock().subscribers.clear();
    }

    /// Subscribes to this target's events.
    ///
    /// The snapshot and the subscription are taken under the same lock, so no
    /// change can fall between them.
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.subscribers.push(sender);
        Subscription::new(self.id.clone(), state.properties.clone(), receiver)
    }

    /// Applies a property value that arrived from the room.
    pub(crate) fn apply_remote_property(&self, name: &str, value: Option<Value>) {
        if self.store_local(name, value.clone()) {
            self.raise_property_changed(name, value);
        }
    }

    pub(crate) fn deliver_message(&self, command: String) {
        self.emit(TargetEvent::MessageReceived { target: self.id.clone(), command });
    }

    pub(crate) fn deliver_transform(&self, transform: Transform) {
        self.emit(TargetEvent::TransformMessageReceived { target: self.id.clone(), transform });
        if let Some(root) = &self.root {
            root.emit(TargetEvent::ChildTransformMessageReceived {
                child: self.id.clone(),
                transform,
            });
        }
    }

    /// Reconciles with the room, then reports the connection.
    pub(crate) fn on_connected(&self) {
        let local = self.properties();
        let plan = reconcile::plan(&local, |name| {
            self.id.encode_with_property(name).and_then(|key| self.transport.try_get_property(&key))
        });

        if !plan.publish.is_empty() {
            tracing::debug!(
                target_id = %self.id,
                count = plan.publish.len(),
                "publishing offline writes"
            );
            let batch = plan
                .publish
                .into_iter()
                .filter_map(|(name, value)| {
                    self.id.encode_with_property(&name).map(|key| (key, Some(value)))
                })
                .collect();
            self.transport.set_properties(batch);
        }

        for (name, value) in plan.adopt {
            self.apply_remote_property(&name, Some(value));
        }

        self.state.lock().connected = true;
        self.emit(TargetEvent::ConnectionChanged { connected: true });
    }

    pub(crate) fn on_disconnected(&self) {
        self.state.lock().connected = false;
        self.emit(TargetEvent::ConnectionChanged { connected: false });
    }

    pub(crate) fn link_child(&self, child: &Arc<Self>) {
        self.state.lock().children.push(Arc::downgrade(child));
    }

    fn unlink_child(&self, child: &Arc<Self>) {
        let child = Arc::downgrade(child);
        self.state.lock().children.retain(|weak| !weak.ptr_eq(&child) && weak.strong_count() > 0);
    }

    /// Writes the local cache. Returns whether the value changed.
    fn store_local(&self, name: &str, value: Option<Value>) -> bool {
        let mut state = self.state.lock();
        match value {
            Some(value) => {
                if state.properties.get(name) == Some(&value) {
                    return false;
                }
                state.properties.insert(name.to_string(), value);
                true
            },
            None => state.properties.remove(name).is_some(),
        }
    }

    fn raise_property_changed(&self, name: &str, value: Option<Value>) {
        self.emit(TargetEvent::PropertyChanged {
            target: self.id.clone(),
            name: name.to_string(),
            value: value.clone(),
        });
        if let Some(root) = &self.root {
            root.emit(TargetEvent::ChildPropertyChanged {
                child: self.id.clone(),
                name: name.to_string(),
                value,
            });
        }
    }

    fn emit(&self, event: TargetEvent) {
        self.state.lock().subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

impl std::fmt::Debug for SharingTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharingTarget")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ensemble_proto::{TargetType, Vec3};

    use super::*;
    use crate::mock_transport::MockTransport;

    fn connected_registry() -> (Arc<MockTransport>, Arc<TargetRegistry>) {
        let transport = Arc::new(MockTransport::new());
        transport.connect();
        let registry = TargetRegistry::new(transport.clone());
        registry.set_connected(true);
        (transport, registry)
    }

    fn engine() -> Identification {
        Identification::new(TargetType::Object, "engine")
    }

    #[test]
    fn set_property_updates_cache_and_transport() {
        let (transport, registry) = connected_registry();
        let target = registry.get_or_create(&engine());

        target.set_property("color", Some("red".into()));

        assert_eq!(target.try_get_property("color"), Some(Value::from("red")));
        assert_eq!(transport.stored("3.engine:color"), Some(Value::from("red")));
    }

    #[test]
    fn redundant_write_raises_no_event() {
        let (_transport, registry) = connected_registry();
        let target = registry.get_or_create(&engine());
        let mut events = target.subscribe();

        target.set_property("color", Some("red".into()));
        target.set_property("color", Some("red".into()));

        assert_eq!(events.drain().len(), 1);
    }

    #[test]
    fn none_removes_property() {
        let (transport, registry) = connected_registry();
        let target = registry.get_or_create(&engine());
        target.set_property("color", Some("red".into()));
        let mut events = target.subscribe();

        target.set_property("color", None);

        assert!(!target.has_property("color"));
        assert_eq!(transport.stored("3.engine:color"), None);
        assert_eq!(
            events.drain(),
            vec![TargetEvent::PropertyChanged { target: engine(), name: "color".into(), value: None }]
        );
    }

    #[test]
    fn property_names_are_escaped() {
        let (transport, registry) = connected_registry();
        let target = registry.get_or_create(&engine());

        target.set_property("wheel.front", Some(Value::Int(4)));

        assert_eq!(target.try_get_property("wheel_front"), Some(Value::Int(4)));
        assert_eq!(target.try_get_property("wheel.front"), Some(Value::Int(4)));
        assert_eq!(transport.stored("3.engine:wheel_front"), Some(Value::Int(4)));
    }

    #[test]
    fn set_properties_sends_one_batch() {
        let (transport, registry) = connected_registry();
        let target = registry.get_or_create(&engine());

        target.set_properties([("a", Some(Value::Int(1))), ("b", Some(Value::Int(2)))]);

        let batches = transport.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn offline_writes_stay_local() {
        let transport = Arc::new(MockTransport::new());
        let registry = TargetRegistry::new(transport.clone());
        let target = registry.get_or_create(&engine());

        target.set_property("color", Some("red".into()));
        target.send_message("explode");

        assert_eq!(target.try_get_property("color"), Some(Value::from("red")));
        assert!(transport.batches().is_empty());
        assert!(transport.messages().is_empty());
    }

    #[test]
    fn try_get_falls_back_to_transport() {
        let (transport, registry) = connected_registry();
        transport.set_remote("3.engine:speed", Some(Value::Int(7)));
        let target = registry.get_or_create(&engine());

        assert_eq!(target.try_get_property("speed"), Some(Value::Int(7)));
        assert!(target.properties().is_empty());
    }

    #[test]
    fn clear_properties_spares_children() {
        let (transport, registry) = connected_registry();
        let root = registry.get_or_create(&engine());
        let child = root.add_child(&[1]);
        root.set_property("a", Some(Value::Int(1)));
        child.set_property("b", Some(Value::Int(2)));

        root.clear_properties();

        assert!(root.properties().is_empty());
        assert_eq!(transport.stored("3.engine:a"), None);
        assert_eq!(transport.stored("3.engine.1:b"), Some(Value::Int(2)));
        assert_eq!(transport.cleared_prefixes(), vec!["3.engine:".to_string()]);
    }

    #[test]
    fn child_events_bubble_to_root() {
        let (_transport, registry) = connected_registry();
        let root = registry.get_or_create(&engine());
        let other = registry.get_or_create(&Identification::new(TargetType::Object, "gearbox"));
        let mut root_events = root.subscribe();
        let mut other_events = other.subscribe();
        let child = root.add_child(&[2, 0]);
        let sibling = root.add_child(&[2, 1]);
        let mut child_events = child.subscribe();
        let mut sibling_events = sibling.subscribe();

        child.set_property("color", Some("blue".into()));
        child.deliver_transform(Transform::from_position(Vec3::ONE));

        assert_eq!(child_events.drain(), vec![
            TargetEvent::PropertyChanged {
                target: child.id().clone(),
                name: "color".into(),
                value: Some("blue".into()),
            },
            TargetEvent::TransformMessageReceived {
                target: child.id().clone(),
                transform: Transform::from_position(Vec3::ONE),
            },
        ]);
        assert!(sibling_events.drain().is_empty());
        assert!(other_events.drain().is_empty());
        assert_eq!(
            root_events.drain(),
            vec![
                TargetEvent::ChildPropertyChanged {
                    child: child.id().clone(),
                    name: "color".into(),
                    value: Some("blue".into()),
                },
                TargetEvent::ChildTransformMessageReceived {
                    child: child.id().clone(),
                    transform: Transform::from_position(Vec3::ONE),
                },
            ]
        );
    }

    #[test]
    fn children_track_live_handles() {
        let (_transport, registry) = connected_registry();
        let root = registry.get_or_create(&engine());
        let first = root.add_child(&[1]);
        let second = root.add_child(&[2]);
        assert_eq!(root.children().len(), 2);
        assert!(Arc::ptr_eq(first.root().unwrap(), &root));

        drop(second);
        assert_eq!(root.children().len(), 1);

        first.dispose();
        assert!(root.children().is_empty());
    }

    #[test]
    fn subscription_snapshot_and_replay() {
        let (_transport, registry) = connected_registry();
        let target = registry.get_or_create(&engine());
        target.set_property("a", Some(Value::Int(1)));

        let mut sub = target.subscribe();
        target.set_property("b", Some(Value::Int(2)));

        assert_eq!(sub.snapshot().len(), 1);
        assert_eq!(sub.replay().count(), 1);
        assert_eq!(sub.drain().len(), 1);
    }

    #[test]
    fn dispose_ends_subscriptions() {
        let (_transport, registry) = connected_registry();
        let target = registry.get_or_create(&engine());
        let mut sub = target.subscribe();

        target.dispose();
        target.set_property("a", Some(Value::Int(1)));

        assert!(sub.try_next().is_none());
        assert!(registry.get(&engine()).is_none());
    }
}
