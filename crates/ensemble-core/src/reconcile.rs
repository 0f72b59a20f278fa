//! Reconnection reconciliation.
//!
//! When a target (re)connects, its local property cache and the room store may
//! disagree: the local side holds writes made while offline, the room holds
//! writes from peers that stayed online. The merge rule is per key:
//!
//! | local | room            | outcome                         |
//! |-------|-----------------|---------------------------------|
//! | `v`   | absent          | publish `v` (local wins)        |
//! | `v`   | `w != v`        | adopt `w` locally (server wins) |
//! | `v`   | `v`             | nothing                         |
//!
//! Keys present only in the room are not visited here; they reach the target
//! as ordinary property notifications.
//!
//! The rule is a pure function so it can be tested without a transport.
//! Applying a plan and planning again yields an empty plan.

use std::collections::BTreeMap;

use ensemble_proto::Value;

/// Outcome of reconciling one target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Room values that replace local ones, in key order.
    pub adopt: Vec<(String, Value)>,
    /// Local values the room lacks, in key order. Sent as one batch.
    pub publish: Vec<(String, Value)>,
}

impl ReconcilePlan {
    /// Whether local and room state already agree.
    pub fn is_empty(&self) -> bool {
        self.adopt.is_empty() && self.publish.is_empty()
    }
}

/// Computes the merge of `local` against the room store.
///
/// `remote` returns the room's last known value for a property name.
pub fn plan<F>(local: &BTreeMap<String, Value>, mut remote: F) -> ReconcilePlan
where
    F: FnMut(&str) -> Option<Value>,
{
    let mut plan = ReconcilePlan::default();
    for (name, value) in local {
        match remote(name) {
            None => plan.publish.push((name.clone(), value.clone())),
            Some(server) if server != *value => plan.adopt.push((name.clone(), server)),
            Some(_) => {},
        }
    }
    plan
}
