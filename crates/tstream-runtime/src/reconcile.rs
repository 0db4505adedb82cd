use sha2::{Digest, Sha256};
use std::collections::HashMap;

use tstream_types::{Component, ComponentKind};

/// What the reconciler decided for one desired component set.
///
/// Unchanged components keep their workers untouched; `update_in_place`
/// components rewire configuration without restarting sockets; the rest
/// are stop-then-start.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    pub start: Vec<Component>,
    pub stop: Vec<String>,
    pub update_in_place: Vec<Component>,
    pub unchanged: Vec<String>,
}

/// Diff the running component set against the desired one, keyed by id
/// and by structural hash.
pub fn diff(current: &[Component], desired: &[Component]) -> ReconcilePlan {
    let current_by_id: HashMap<&str, &Component> =
        current.iter().map(|c| (c.id.as_str(), c)).collect();
    let desired_ids: HashMap<&str, ()> = desired.iter().map(|c| (c.id.as_str(), ())).collect();

    let mut plan = ReconcilePlan::default();

    for component in desired {
        match current_by_id.get(component.id.as_str()) {
            None => plan.start.push(component.clone()),
            Some(running) => {
                if component.skip_update || structural_hash(running) == structural_hash(component) {
                    plan.unchanged.push(component.id.clone());
                } else if restart_hash(running) == restart_hash(component) {
                    // Only cosmetic fields differ; no socket churn
                    plan.update_in_place.push(component.clone());
                } else {
                    plan.stop.push(component.id.clone());
                    plan.start.push(component.clone());
                }
            }
        }
    }

    for component in current {
        if !desired_ids.contains_key(component.id.as_str()) {
            plan.stop.push(component.id.clone());
        }
    }

    plan
}

/// Hash of everything a worker cares about
pub fn structural_hash(component: &Component) -> [u8; 32] {
    let serialized =
        serde_json::to_vec(component).expect("components always serialize");
    Sha256::digest(serialized).into()
}

/// Hash of only the fields whose change forces a worker restart. For
/// listeners that is the port and enablement; match patterns, tags,
/// actions, and trace settings rewire in place.
fn restart_hash(component: &Component) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(component.id.as_bytes());
    hasher.update([u8::from(component.enable)]);
    match &component.kind {
        ComponentKind::Listener(config) => {
            hasher.update(config.port.to_be_bytes());
        }
        _ => {
            // Everything else restarts on any structural change
            return structural_hash(component);
        }
    }
    hasher.finalize().into()
}
