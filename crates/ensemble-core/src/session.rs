//! Sharing session: the router between a transport and its targets.
//!
//! The session owns the target registry and drains the transport's
//! notification queue on the host's logical thread ([`SharingSession::pump`]).
//! Each notification is decoded and dispatched:
//!
//! - `Connected` / `Disconnected`: every live target reconciles or goes
//!   offline, then the session reports the change.
//! - `PropertyChanged`: `{target}:{name}` is decoded and applied to the target.
//! - `MessageReceived` / `TransformMessageReceived`: the target key is decoded
//!   and the target raises the event.
//! - Player and room listings are re-raised as session events.
//!
//! A notification for a target nobody holds is still accepted: the transport
//! keeps the value and the target reads it on first use. If only the root is
//! alive, the child is created so the root hears about it.

use std::sync::Arc;

use ensemble_proto::{Identification, Message, TargetType};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    env::Environment,
    error::RouteError,
    event::SessionEvent,
    registry::TargetRegistry,
    target::SharingTarget,
    transport::{Transport, TransportEvent},
};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Prefix of generated labels; should be unique per device.
    pub device_id: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { device_id: "device".to_string() }
    }
}

/// Result of one [`SharingSession::pump`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Notifications dispatched.
    pub routed: usize,
    /// Notifications dropped because their key was malformed.
    pub dropped: usize,
}

/// Owns the registry and routes transport notifications to targets.
pub struct SharingSession<E: Environment> {
    env: E,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<TargetRegistry>,
    subscribers: Vec<UnboundedSender<SessionEvent>>,
}

impl<E: Environment> SharingSession<E> {
    /// Creates a session over `transport`.
    ///
    /// If the transport is already in a room, targets start connected.
    pub fn new(env: E, transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let registry = TargetRegistry::new(Arc::clone(&transport));
        registry.set_connected(transport.is_connected());
        Self { env, config, transport, registry, subscribers: Vec::new() }
    }

    /// The target registry.
    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Whether the transport is in a room.
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Target for `id`, created if needed.
    pub fn target(&self, id: &Identification) -> Arc<SharingTarget> {
        self.registry.get_or_create(id)
    }

    /// Root target of `kind`. Without a label, a unique one is generated.
    pub fn create_root(&self, kind: TargetType, label: Option<&str>) -> Arc<SharingTarget> {
        let id = match label {
            Some(label) => Identification::new(kind, label),
            None => Identification::new(kind, &self.generate_label()),
        };
        self.target(&id)
    }

    /// Fresh label of the form `{device_id}-{128-bit hex}`.
    pub fn generate_label(&self) -> String {
        format!("{}-{:032x}", self.config.device_id, self.env.random_u128())
    }

    /// Subscribes to session events.
    pub fn subscribe(&mut self) -> UnboundedReceiver<SessionEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.push(sender);
        receiver
    }

    /// Drains and routes every queued transport notification.
    ///
    /// Malformed notifications are logged and skipped.
    pub fn pump(&mut self) -> PumpStats {
        let mut stats = PumpStats::default();
        for event in self.transport.poll_events() {
            match self.route(event) {
                Ok(()) => stats.routed += 1,
                Err(error) => {
                    tracing::warn!(%error, "dropping transport event");
                    stats.dropped += 1;
                },
            }
        }
        stats
    }

    /// Routes one notification.
    pub fn route(&mut self, event: TransportEvent) -> Result<(), RouteError> {
        match event {
            TransportEvent::Connected => {
                self.set_connected(true);
                Ok(())
            },
            TransportEvent::Disconnected => {
                self.set_connected(false);
                Ok(())
            },
            TransportEvent::PropertyChanged { key, value } => {
                let (id, name) = Identification::decode_with_property(&key)
                    .map_err(|source| RouteError::MalformedPropertyKey { key, source })?;
                if let Some(target) = self.resolve(&id) {
                    target.apply_remote_property(&name, value);
                }
                Ok(())
            },
            TransportEvent::MessageReceived(Message { target, command }) => {
                let id = decode_target(target)?;
                if let Some(target) = self.resolve(&id) {
                    target.deliver_message(command);
                }
                Ok(())
            },
            TransportEvent::TransformMessageReceived { target, transform } => {
                let id = decode_target(target)?;
                if let Some(target) = self.resolve(&id) {
                    target.deliver_transform(transform);
                }
                Ok(())
            },
            TransportEvent::PlayersChanged(players) => {
                self.emit(&SessionEvent::PlayersChanged(players));
                Ok(())
            },
            TransportEvent::RoomsChanged(rooms) => {
                self.emit(&SessionEvent::RoomsChanged(rooms));
                Ok(())
            },
        }
    }

    /// Live target for `id`, or a new child if its root is live.
    fn resolve(&self, id: &Identification) -> Option<Arc<SharingTarget>> {
        if let Some(target) = self.registry.get(id) {
            return Some(target);
        }
        if id.is_root() || self.registry.get(&id.root()).is_none() {
            tracing::trace!(target_id = %id, "no live target");
            return None;
        }
        Some(self.registry.get_or_create(id))
    }

    fn set_connected(&mut self, connected: bool) {
        self.registry.set_connected(connected);
        let targets = self.registry.live_targets();
        tracing::debug!(connected, targets = targets.len(), "connection changed");

        for target in &targets {
            if connected {
                target.on_connected();
            } else {
                target.on_disconnected();
            }
        }
        self.emit(&SessionEvent::ConnectionChanged { connected });
    }

    fn emit(&mut self, event: &SessionEvent) {
        self.subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

fn decode_target(key: String) -> Result<Identification, RouteError> {
    Identification::decode(&key).map_err(|source| RouteError::MalformedTargetKey { key, source })
}

impl<E: Environment> Drop for SharingSession<E> {
    fn drop(&mut self) {
        // Pinned targets hold the registry; unpin so both can be freed.
        self.registry.release_all();
    }
}
