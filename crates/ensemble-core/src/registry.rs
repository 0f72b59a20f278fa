//! Target registry.
//!
//! Maps identifiers to live targets so that every lookup of the same id
//! yields the same instance while anyone holds it. The registry stores only
//! weak references: once the last handle is dropped the target is freed and
//! the next lookup builds a fresh one.
//!
//! Callers that want a target to survive without holding a handle can pin it
//! with [`TargetRegistry::retain`].

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use ensemble_proto::Identification;
use parking_lot::Mutex;

use crate::{target::SharingTarget, transport::Transport};

#[derive(Default)]
struct RegistryState {
    targets: HashMap<Identification, Weak<SharingTarget>>,
    pins: HashMap<Identification, Pin>,
    connected: bool,
}

struct Pin {
    target: Arc<SharingTarget>,
    count: usize,
}

/// Session-owned identity cache for sharing targets.
///
/// All operations are serialised by one lock and may be called from any
/// thread. The lock is never held while a target's own lock is taken.
pub struct TargetRegistry {
    transport: Arc<dyn Transport>,
    state: Mutex<RegistryState>,
}

impl TargetRegistry {
    /// Creates an empty registry whose targets write through `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self { transport, state: Mutex::new(RegistryState::default()) })
    }

    /// Live target for `id`, if any.
    pub fn get(&self, id: &Identification) -> Option<Arc<SharingTarget>> {
        let mut state = self.state.lock();
        let target = state.targets.get(id).and_then(Weak::upgrade);
        if target.is_none() {
            state.targets.remove(id);
        }
        target
    }

    /// Live target for `id`, created if absent.
    ///
    /// Creating a child first resolves (or creates) its root and links the
    /// child into the root's children. Concurrent calls for the same id return
    /// the same instance.
    pub fn get_or_create(self: &Arc<Self>, id: &Identification) -> Arc<SharingTarget> {
        let root = if id.is_root() { None } else { Some(self.get_or_create(&id.root())) };

        let created = {
            let mut state = self.state.lock();
            if let Some(existing) = state.targets.get(id).and_then(Weak::upgrade) {
                return existing;
            }

            let target = Arc::new(SharingTarget::new(
                id.clone(),
                Arc::clone(&self.transport),
                Arc::clone(self),
                root.clone(),
                state.connected,
            ));
            state.targets.insert(id.clone(), Arc::downgrade(&target));
            target
        };

        tracing::trace!(target_id = %id, "created target");
        if let Some(root) = root {
            root.link_child(&created);
        }
        created
    }

    /// Evicts `target` if the registry still maps its id to that instance.
    ///
    /// Returns whether an entry was removed. Pins on the instance are dropped.
    pub fn remove(&self, target: &Arc<SharingTarget>) -> bool {
        let mut state = self.state.lock();
        let id = target.id();
        let same = state
            .targets
            .get(id)
            .is_some_and(|weak| weak.ptr_eq(&Arc::downgrade(target)));
        if !same {
            return false;
        }

        state.targets.remove(id);
        if state.pins.get(id).is_some_and(|pin| Arc::ptr_eq(&pin.target, target)) {
            state.pins.remove(id);
        }
        true
    }

    /// Drops entries whose target has been freed. Returns how many.
    pub fn purge(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.targets.len();
        state.targets.retain(|_, weak| weak.strong_count() > 0);
        before - state.targets.len()
    }

    /// Snapshot of every live target, in id order.
    pub fn live_targets(&self) -> Vec<Arc<SharingTarget>> {
        let mut targets: Vec<_> =
            self.state.lock().targets.values().filter_map(Weak::upgrade).collect();
        targets.sort_by(|a, b| a.id().cmp(b.id()));
        targets
    }

    /// Number of live targets.
    pub fn len(&self) -> usize {
        self.state.lock().targets.values().filter(|weak| weak.strong_count() > 0).count()
    }

    /// Whether no target is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keeps `target` alive until a matching [`TargetRegistry::release`].
    ///
    /// Pins nest: each `retain` needs its own `release`.
    pub fn retain(&self, target: &Arc<SharingTarget>) {
        let mut state = self.state.lock();
        let pin = state
            .pins
            .entry(target.id().clone())
            .or_insert_with(|| Pin { target: Arc::clone(target), count: 0 });
        pin.count += 1;
    }

    /// Undoes one [`TargetRegistry::retain`].
    ///
    /// Releasing a target that is not pinned is a caller bug; it is logged and
    /// otherwise ignored.
    pub fn release(&self, target: &Arc<SharingTarget>) {
        let mut state = self.state.lock();
        let id = target.id();
        let Some(pin) = state.pins.get_mut(id) else {
            tracing::error!(target_id = %id, "release without matching retain");
            return;
        };

        pin.count = pin.count.saturating_sub(1);
        if pin.count == 0 {
            state.pins.remove(id);
        }
    }

    /// Current pin count of `id`.
    pub fn pin_count(&self, id: &Identification) -> usize {
        self.state.lock().pins.get(id).map_or(0, |pin| pin.count)
    }

    /// Drops every pin.
    pub fn release_all(&self) {
        let pins = std::mem::take(&mut self.state.lock().pins);
        drop(pins);
    }

    /// Connection state given to targets created from now on.
    pub(crate) fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }
}

impl std::fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TargetRegistry")
            .field("entries", &state.targets.len())
            .field("pins", &state.pins.len())
            .field("connected", &state.connected)
            .finish()
    }
}
