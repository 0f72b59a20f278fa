//! Transform synchronisation for a shared object.
//!
//! While an object is being moved, its pose is streamed as unreliable
//! transform messages; when the move ends, [`TransformSync::commit`] stores the
//! final pose as a property so late joiners and reconnecting peers see it.
//! Small moves below a distance threshold are not streamed.

use std::sync::Arc;

use ensemble_proto::{Transform, Vec3};

use crate::{
    event::{Subscription, TargetEvent},
    target::SharingTarget,
};

/// Property holding the committed pose.
pub const TRANSFORM_PROPERTY: &str = "transform";

/// Default streaming threshold in world units.
const DEFAULT_MIN_DISTANCE: f32 = 0.001;

/// Keeps a local pose in sync with one target.
#[derive(Debug)]
pub struct TransformSync {
    target: Arc<SharingTarget>,
    events: Subscription,
    current: Transform,
    last_sent: Option<Transform>,
    min_distance: f32,
}

impl TransformSync {
    /// Binds to `target`, starting from its committed pose if it has one.
    pub fn new(target: Arc<SharingTarget>) -> Self {
        let events = target.subscribe();
        let current = target
            .try_get_property(TRANSFORM_PROPERTY)
            .and_then(|value| value.as_transform())
            .unwrap_or_default();
        Self { target, events, current, last_sent: None, min_distance: DEFAULT_MIN_DISTANCE }
    }

    /// Sets the distance an object must move before a new update is streamed.
    #[must_use]
    pub fn with_min_distance(mut self, min_distance: f32) -> Self {
        self.min_distance = min_distance;
        self
    }

    /// The bound target.
    pub fn target(&self) -> &Arc<SharingTarget> {
        &self.target
    }

    /// Latest known pose, local or remote.
    pub fn transform(&self) -> Transform {
        self.current
    }

    /// Moves the object locally. Returns whether an update was streamed.
    pub fn move_to(&mut self, transform: Transform) -> bool {
        self.current = transform;
        if !self.target.is_connected() {
            return false;
        }
        if self.last_sent.is_some_and(|sent| !moved(&sent, &transform, self.min_distance)) {
            return false;
        }
        self.target.send_transform_message(transform);
        self.last_sent = Some(transform);
        true
    }

    /// Stores the current pose as the target's committed transform.
    pub fn commit(&mut self) {
        self.target.set_property(TRANSFORM_PROPERTY, Some(self.current.into()));
        self.last_sent = None;
    }

    /// Applies remote updates received since the last poll.
    ///
    /// Returns the new pose if any update arrived.
    pub fn poll(&mut self) -> Option<Transform> {
        let mut updated = None;
        for event in self.events.drain() {
            match event {
                TargetEvent::TransformMessageReceived { transform, .. } => {
                    updated = Some(transform);
                },
                TargetEvent::PropertyChanged { name, value: Some(value), .. }
                    if name == TRANSFORM_PROPERTY =>
                {
                    if let Some(transform) = value.as_transform() {
                        updated = Some(transform);
                    }
                },
                _ => {},
            }
        }

        if let Some(transform) = updated {
            self.current = transform;
        }
        updated
    }
}

fn moved(from: &Transform, to: &Transform, min_distance: f32) -> bool {
    distance(from.position, to.position) >= min_distance
        || from.rotation != to.rotation
        || from.scale != to.scale
}

fn distance(a: Vec3, b: Vec3) -> f32 {
    let (dx, dy, dz) = (a.x - b.x, a.y - b.y, a.z - b.z);
    (dx * dx + dy * dy + dz * dz).sqrt()
}

#[cfg(test)]
mod tests {
    use ensemble_proto::{Identification, TargetType, Value};

    use super::*;
    use crate::{mock_transport::MockTransport, registry::TargetRegistry};

    fn bound() -> (Arc<MockTransport>, TransformSync) {
        let transport = Arc::new(MockTransport::new());
        transport.connect();
        let registry = TargetRegistry::new(transport.clone());
        registry.set_connected(true);
        let target = registry.get_or_create(&Identification::new(TargetType::Object, "crate"));
        (transport, TransformSync::new(target).with_min_distance(0.5))
    }

    #[test]
    fn small_moves_are_not_streamed() {
        let (transport, mut sync) = bound();

        assert!(sync.move_to(Transform::from_position(Vec3::new(1.0, 0.0, 0.0))));
        assert!(!sync.move_to(Transform::from_position(Vec3::new(1.1, 0.0, 0.0))));
        assert!(sync.move_to(Transform::from_position(Vec3::new(2.0, 0.0, 0.0))));

        assert_eq!(transport.transforms().len(), 2);
        assert_eq!(sync.transform().position, Vec3::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn commit_stores_pose_property() {
        let (transport, mut sync) = bound();
        let pose = Transform::from_position(Vec3::ONE);
        sync.move_to(pose);
        sync.commit();

        assert_eq!(transport.stored("3.crate:transform"), Some(Value::Transform(pose)));
    }

    #[test]
    fn remote_updates_move_local_pose() {
        let (_transport, mut sync) = bound();
        let pose = Transform::from_position(Vec3::new(0.0, 3.0, 0.0));
        sync.target().deliver_transform(pose);

        assert_eq!(sync.poll(), Some(pose));
        assert_eq!(sync.transform(), pose);
        assert_eq!(sync.poll(), None);
    }
}
