//! Diff between the composed objects and what the cluster currently holds.

use std::collections::{BTreeMap, BTreeSet};

use kube::api::DynamicObject;
use kube::ResourceExt;

use crate::api::v1beta1::Role;
use crate::resources::{recorded_hash, ManagedObject, ResourceKind, LABEL_COMPONENT};
use crate::util::errors::ErrorReason;

/// An observed object that no longer has a desired counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleObject {
    pub kind: ResourceKind,
    pub name: String,
}

/// Changes needed to converge, each group sorted by apply order.
#[derive(Debug, Default)]
pub struct Plan {
    pub creates: Vec<ManagedObject>,
    pub updates: Vec<ManagedObject>,
    pub removals: Vec<StaleObject>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.removals.is_empty()
    }
}

/// Compares desired objects with observed ones by their recorded hash.
///
/// Observed objects of kinds that are not prunable are never scheduled for
/// removal, even when nothing desires them in this pass.
pub fn diff(desired: Vec<ManagedObject>, observed: &[(ResourceKind, DynamicObject)]) -> Plan {
    let current: BTreeMap<(ResourceKind, String), &DynamicObject> = observed
        .iter()
        .map(|(kind, obj)| ((*kind, obj.name_any()), obj))
        .collect();
    let wanted: BTreeSet<(ResourceKind, String)> =
        desired.iter().map(|o| (o.kind, o.name.clone())).collect();

    let mut plan = Plan::default();
    for object in desired {
        match current.get(&(object.kind, object.name.clone())) {
            None => plan.creates.push(object),
            Some(existing) if outdated(&object, existing) => plan.updates.push(object),
            Some(_) => {}
        }
    }

    plan.removals = observed
        .iter()
        .filter(|(kind, _)| kind.prunable())
        .map(|(kind, obj)| StaleObject {
            kind: *kind,
            name: obj.name_any(),
        })
        .filter(|stale| !wanted.contains(&(stale.kind, stale.name.clone())))
        .collect();

    let order = |kind: &ResourceKind, name: &String| (kind.apply_order(), name.clone());
    plan.creates.sort_by_key(|o| order(&o.kind, &o.name));
    plan.updates.sort_by_key(|o| order(&o.kind, &o.name));
    plan.removals.sort_by_key(|o| order(&o.kind, &o.name));
    plan
}

/// The recorded hash differs, or an owned field was edited behind our back.
fn outdated(desired: &ManagedObject, existing: &DynamicObject) -> bool {
    if recorded_hash(existing) != Some(desired.hash.as_str()) {
        return true;
    }
    desired.kind.owned_fields().iter().any(|field| {
        desired
            .object
            .data
            .pointer(field)
            .is_some_and(|want| existing.data.pointer(field) != Some(want))
    })
}

/// Category recorded when applying `object` fails.
pub fn apply_failure_reason(object: &ManagedObject, update: bool) -> ErrorReason {
    match object.kind {
        ResourceKind::ServiceAccount | ResourceKind::Role | ResourceKind::RoleBinding => {
            ErrorReason::RbacManagement
        }
        ResourceKind::StatefulSet => {
            let component = object.object.labels().get(LABEL_COMPONENT).map(String::as_str);
            if component == Some(Role::Proxy.token()) {
                ErrorReason::ProxyCreation
            } else {
                ErrorReason::TargetCreation
            }
        }
        ResourceKind::ConfigMap if update => ErrorReason::ConfigChange,
        _ if update => ErrorReason::ResourceUpdate,
        _ => ErrorReason::ResourceCreation,
    }
}
