//! Fuzz target for [`SharingSession`] event routing
//!
//! # Strategy
//!
//! - Arbitrary transport events, keys built from a mix of valid and garbage
//!   fragments
//! - Connects and disconnects interleaved with remote changes and local writes
//!
//! # Invariants
//!
//! - Routing NEVER panics; malformed keys are errors, not crashes
//! - A routed property change for a live target lands in its cache
//! - After a connect, every target is connected and agrees with the room
//!   for every key the room holds

#![no_main]

use std::sync::Arc;

use arbitrary::Arbitrary;
use ensemble_core::{MockTransport, SessionConfig, SharingSession, TransportEvent};
use ensemble_harness::SimEnv;
use ensemble_proto::{Identification, Message, TargetType, Transform, Value};
use libfuzzer_sys::fuzz_target;

const FRAGMENTS: [&str; 8] = ["3", "7", "crate", "", ".", ":", "1", "x"];

#[derive(Debug, Clone, Arbitrary)]
enum Step {
    Connect,
    Disconnect,
    Remote { key: Vec<u8>, value: Option<i8> },
    Message { key: Vec<u8> },
    Transform { key: Vec<u8> },
    Local { child: bool, value: Option<i8> },
    Clear,
}

fn key(fragments: &[u8]) -> String {
    fragments.iter().map(|f| FRAGMENTS[usize::from(*f) % FRAGMENTS.len()]).collect()
}

fuzz_target!(|steps: Vec<Step>| {
    let transport = Arc::new(MockTransport::new());
    let mut session = SharingSession::new(
        SimEnv::with_seed(0),
        transport.clone(),
        SessionConfig { device_id: "fuzz".into() },
    );
    let root = session.target(&Identification::new(TargetType::Object, "crate"));
    let child = root.add_child(&[1]);

    for step in steps {
        match step {
            Step::Connect => {
                transport.connect();
                session.pump();
                assert!(root.is_connected() && child.is_connected());
                for target in [&root, &child] {
                    for (name, value) in target.properties() {
                        let key = target.id().encode_with_property(&name).expect("cached name");
                        if let Some(remote) = transport.stored(&key) {
                            assert_eq!(remote, value);
                        }
                    }
                }
            },
            Step::Disconnect => {
                transport.disconnect();
                session.pump();
                assert!(!root.is_connected());
            },
            Step::Remote { key: k, value } => {
                let key = key(&k);
                let value = value.map(|v| Value::Int(v.into()));
                let parsed = Identification::decode_with_property(&key);
                transport.set_remote(&key, value.clone());
                let routed =
                    session.route(TransportEvent::PropertyChanged { key, value: value.clone() });
                assert_eq!(routed.is_ok(), parsed.is_ok());
                if let Ok((id, name)) = parsed {
                    if id == *root.id() {
                        assert_eq!(root.properties().get(&name).cloned(), value);
                    }
                }
            },
            Step::Message { key: k } => {
                let target = key(&k);
                let valid = Identification::decode(&target).is_ok();
                let message = Message { target, command: "go".into() };
                let routed = session.route(TransportEvent::MessageReceived(message));
                assert_eq!(routed.is_ok(), valid);
            },
            Step::Transform { key: k } => {
                let target = key(&k);
                let valid = Identification::decode(&target).is_ok();
                let routed = session.route(TransportEvent::TransformMessageReceived {
                    target,
                    transform: Transform::IDENTITY,
                });
                assert_eq!(routed.is_ok(), valid);
            },
            Step::Local { child: on_child, value } => {
                let target = if on_child { &child } else { &root };
                target.set_property("x", value.map(|v| Value::Int(v.into())));
            },
            Step::Clear => root.clear_properties(),
        }
    }
});
