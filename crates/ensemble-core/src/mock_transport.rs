//! In-memory transport for tests.
//!
//! Plays both sides of a single-client room: local writes go straight into the
//! store (as a real transport reflects them before the round-trip), and tests
//! act as the server through [`MockTransport::set_remote`] and
//! [`MockTransport::inject`]. Every outbound call is recorded for assertions.
//!
//! ```rust,ignore
//! let transport = Arc::new(MockTransport::new());
//! let mut session = SharingSession::new(env, transport.clone(), SessionConfig::default());
//!
//! transport.set_remote("3.engine:color", Some("red".into()));
//! transport.connect();
//! session.pump();
//! ```

use std::collections::{BTreeMap, VecDeque};

use ensemble_proto::{Message, Transform, Value};
use parking_lot::Mutex;

use crate::transport::{Transport, TransportEvent};

#[derive(Default)]
struct MockState {
    connected: bool,
    properties: BTreeMap<String, Value>,
    single_writes: Vec<(String, Option<Value>)>,
    batches: Vec<Vec<(String, Option<Value>)>>,
    cleared_prefixes: Vec<String>,
    messages: Vec<Message>,
    transforms: Vec<(String, Transform)>,
    queue: VecDeque<TransportEvent>,
}

/// Recording transport with a local property store.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Disconnected transport with an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the room and queues [`TransportEvent::Connected`].
    pub fn connect(&self) {
        let mut state = self.state.lock();
        state.connected = true;
        state.queue.push_back(TransportEvent::Connected);
    }

    /// Leaves the room and queues [`TransportEvent::Disconnected`].
    ///
    /// The store is kept so the next connect reconciles against it.
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.queue.push_back(TransportEvent::Disconnected);
    }

    /// Writes the store as the server would, without notifying.
    pub fn set_remote(&self, key: &str, value: Option<Value>) {
        write(&mut self.state.lock().properties, key, value);
    }

    /// Queues an event as if it came from the server.
    ///
    /// Property notifications also update the store.
    pub fn inject(&self, event: TransportEvent) {
        if let TransportEvent::PropertyChanged { key, value } = &event {
            self.set_remote(key, value.clone());
        }
        self.state.lock().queue.push_back(event);
    }

    /// Stored value of `key`.
    pub fn stored(&self, key: &str) -> Option<Value> {
        self.state.lock().properties.get(key).cloned()
    }

    /// Every `set_property` call, in order.
    pub fn single_writes(&self) -> Vec<(String, Option<Value>)> {
        self.state.lock().single_writes.clone()
    }

    /// Every `set_properties` call, in order.
    pub fn batches(&self) -> Vec<Vec<(String, Option<Value>)>> {
        self.state.lock().batches.clone()
    }

    /// Every cleared prefix, in order.
    pub fn cleared_prefixes(&self) -> Vec<String> {
        self.state.lock().cleared_prefixes.clone()
    }

    /// Every sent message, in order.
    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    /// Every sent transform, in order.
    pub fn transforms(&self) -> Vec<(String, Transform)> {
        self.state.lock().transforms.clone()
    }

    /// Forgets recorded outbound calls.
    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.single_writes.clear();
        state.batches.clear();
        state.cleared_prefixes.clear();
        state.messages.clear();
        state.transforms.clear();
    }
}

fn write(properties: &mut BTreeMap<String, Value>, key: &str, value: Option<Value>) {
    match value {
        Some(value) => {
            properties.insert(key.to_string(), value);
        },
        None => {
            properties.remove(key);
        },
    }
}

impl Transport for MockTransport {
    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn set_property(&self, key: &str, value: Option<Value>) {
        let mut state = self.state.lock();
        if !state.connected {
            return;
        }
        state.single_writes.push((key.to_string(), value.clone()));
        write(&mut state.properties, key, value);
    }

    fn set_properties(&self, entries: Vec<(String, Option<Value>)>) {
        let mut state = self.state.lock();
        if !state.connected {
            return;
        }
        for (key, value) in &entries {
            write(&mut state.properties, key, value.clone());
        }
        state.batches.push(entries);
    }

    fn try_get_property(&self, key: &str) -> Option<Value> {
        self.stored(key)
    }

    fn clear_properties_starting_with(&self, prefix: &str) {
        let mut state = self.state.lock();
        if !state.connected {
            return;
        }
        state.properties.retain(|key, _| !key.starts_with(prefix));
        state.cleared_prefixes.push(prefix.to_string());
    }

    fn send_message(&self, message: Message) {
        let mut state = self.state.lock();
        if state.connected {
            state.messages.push(message);
        }
    }

    fn send_transform_message(&self, target: &str, transform: Transform) {
        let mut state = self.state.lock();
        if state.connected {
            state.transforms.push((target.to_string(), transform));
        }
    }

    fn poll_events(&self) -> Vec<TransportEvent> {
        self.state.lock().queue.drain(..).collect()
    }
}
