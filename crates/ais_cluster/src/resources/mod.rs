//! Derivation of every Kubernetes object an `AIStore` owns.
//!
//! Everything in here is pure: the same `AIStore` always yields the same
//! objects, which is what lets the driver diff by content hash.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::api::v1beta1::aistore::AIStore;
use crate::api::v1beta1::Role;
use crate::util::errors::{Error, ErrorReason, Result, StdError};

pub mod config;
pub mod pod;
pub mod rbac;
pub mod registry;
pub mod services;
pub mod statefulset;
pub mod validation;
pub mod volumes;

pub use pod::{compose, ComposedResources};
pub use registry::{ResourceKind, ResourceRegistry};

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

pub const APP_NAME: &str = "aistore";
pub const MANAGED_BY: &str = "ais-operator";

/// SHA-256 of the object as composed, used to detect drift.
pub const SPEC_HASH_ANNOTATION: &str = "ais.nvidia.com/spec-hash";

/// Labels shared by everything that belongs to one cluster.
pub fn instance_labels(ais: &AIStore) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), APP_NAME.to_string()),
        (LABEL_INSTANCE.to_string(), ais.name_any()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
    ])
}

/// Pod and selector labels of one role.
pub fn role_labels(ais: &AIStore, role: Role) -> BTreeMap<String, String> {
    let mut labels = instance_labels(ais);
    labels.insert(LABEL_COMPONENT.to_string(), role.token().to_string());
    labels
}

/// Label selector matching every object the operator manages for `ais`.
pub fn instance_selector(ais: &AIStore) -> String {
    format!(
        "{LABEL_INSTANCE}={},{LABEL_MANAGED_BY}={MANAGED_BY}",
        ais.name_any()
    )
}

/// Metadata for an object owned by `ais`.
pub fn object_meta(
    ais: &AIStore,
    name: impl Into<String>,
    labels: BTreeMap<String, String>,
) -> Result<ObjectMeta> {
    let namespace = ais.namespace().ok_or_else(|| {
        Error::StdError(StdError::MetadataMissing("AIStore without namespace".to_string()))
    })?;
    let owner = ais.controller_owner_ref(&()).ok_or_else(|| {
        Error::categorize(
            ErrorReason::OwnerReference,
            StdError::MetadataMissing(format!("cannot reference {} as owner", ais.name_any())),
        )
    })?;
    Ok(ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace),
        labels: Some(labels),
        owner_references: Some(vec![owner]),
        ..Default::default()
    })
}

/// A desired object, erased to its dynamic form and stamped with its hash.
#[derive(Clone, Debug)]
pub struct ManagedObject {
    pub kind: ResourceKind,
    pub name: String,
    pub hash: String,
    pub object: DynamicObject,
}

impl ManagedObject {
    pub fn new<K: Serialize>(kind: ResourceKind, typed: &K) -> Result<Self> {
        let value = serde_json::to_value(typed)
            .map_err(|e| Error::categorize(ErrorReason::ConfigBuild, StdError::JsonSerializationError(e)))?;
        let hash = spec_hash(&value)?;
        let mut object: DynamicObject = serde_json::from_value(value)
            .map_err(|e| Error::categorize(ErrorReason::ConfigBuild, StdError::JsonSerializationError(e)))?;
        object
            .annotations_mut()
            .insert(SPEC_HASH_ANNOTATION.to_string(), hash.clone());
        Ok(Self {
            kind,
            name: object.name_any(),
            hash,
            object,
        })
    }
}

/// Hex SHA-256 of the canonical JSON encoding. Object keys are sorted, so
/// equal values always hash equally.
pub fn spec_hash(value: &serde_json::Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| Error::categorize(ErrorReason::ConfigBuild, StdError::JsonSerializationError(e)))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Hash recorded on an observed object, if it was created by the operator.
pub fn recorded_hash(object: &DynamicObject) -> Option<&str> {
    object
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SPEC_HASH_ANNOTATION))
        .map(String::as_str)
}

/// How far the workloads may be brought up in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadGate {
    /// External endpoints are not ready yet; submit no workload.
    Hold,
    /// First bring-up: only the primary proxy runs, targets wait.
    PrimaryOnly,
    /// Both roles at their effective size.
    Full,
    /// Both roles at zero replicas.
    Shutdown,
}

impl WorkloadGate {
    /// Replica count for `role`, or `None` when its workload is not submitted.
    pub fn replicas(&self, ais: &AIStore, role: Role) -> Option<i32> {
        match (self, role) {
            (WorkloadGate::Hold, _) => None,
            (WorkloadGate::PrimaryOnly, Role::Proxy) => Some(ais.proxy_size().min(1)),
            (WorkloadGate::PrimaryOnly, Role::Target) => None,
            (WorkloadGate::Full, role) => Some(ais.effective_size(role)),
            (WorkloadGate::Shutdown, _) => Some(0),
        }
    }
}

/// Every object the cluster should own right now, in apply order.
pub fn desired_objects(ais: &AIStore, gate: WorkloadGate) -> Result<Vec<ManagedObject>> {
    let mut objects = Vec::new();

    let (account, role, binding) = rbac::rbac_objects(ais)?;
    objects.push(ManagedObject::new(ResourceKind::ServiceAccount, &account)?);
    objects.push(ManagedObject::new(ResourceKind::Role, &role)?);
    objects.push(ManagedObject::new(ResourceKind::RoleBinding, &binding)?);

    for cm in config::config_maps(ais)? {
        objects.push(ManagedObject::new(ResourceKind::ConfigMap, &cm)?);
    }
    for svc in services::services(ais)? {
        objects.push(ManagedObject::new(ResourceKind::Service, &svc)?);
    }

    for role in Role::ALL {
        if let Some(replicas) = gate.replicas(ais, role) {
            let sts = statefulset::statefulset(ais, role, replicas)?;
            objects.push(ManagedObject::new(ResourceKind::StatefulSet, &sts)?);
        }
    }

    objects.sort_by(|a, b| {
        a.kind
            .apply_order()
            .cmp(&b.kind.apply_order())
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::aistore;

    #[test]
    fn desired_objects_are_deterministic() {
        let ais = aistore("demo", 3);
        let first = desired_objects(&ais, WorkloadGate::Full).unwrap();
        let second = desired_objects(&ais, WorkloadGate::Full).unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.hash, b.hash);
            assert_eq!(
                serde_json::to_value(&a.object).unwrap(),
                serde_json::to_value(&b.object).unwrap()
            );
        }
    }

    #[test]
    fn every_object_is_labelled_owned_and_hashed() {
        let ais = aistore("demo", 1);
        for obj in desired_objects(&ais, WorkloadGate::Full).unwrap() {
            let labels = obj.object.labels();
            assert_eq!(labels.get(LABEL_INSTANCE).map(String::as_str), Some("demo"));
            assert_eq!(labels.get(LABEL_MANAGED_BY).map(String::as_str), Some(MANAGED_BY));
            assert_eq!(obj.object.owner_references()[0].uid, "demo-uid");
            assert_eq!(recorded_hash(&obj.object), Some(obj.hash.as_str()));
            assert_eq!(obj.object.namespace().as_deref(), Some("ais"));
        }
    }

    #[test]
    fn objects_follow_apply_order() {
        let ais = aistore("demo", 1);
        let kinds: Vec<_> = desired_objects(&ais, WorkloadGate::Full)
            .unwrap()
            .into_iter()
            .map(|o| o.kind)
            .collect();
        assert_eq!(kinds.first(), Some(&ResourceKind::ServiceAccount));
        assert_eq!(kinds.last(), Some(&ResourceKind::StatefulSet));
        assert!(kinds.windows(2).all(|w| w[0].apply_order() <= w[1].apply_order()));
    }

    #[test]
    fn gate_controls_submitted_workloads() {
        let ais = aistore("demo", 3);
        let statefulsets = |gate| {
            desired_objects(&ais, gate)
                .unwrap()
                .into_iter()
                .filter(|o| o.kind == ResourceKind::StatefulSet)
                .map(|o| (o.name, o.object.data["spec"]["replicas"].as_i64()))
                .collect::<Vec<_>>()
        };

        assert!(statefulsets(WorkloadGate::Hold).is_empty());
        assert_eq!(
            statefulsets(WorkloadGate::PrimaryOnly),
            vec![("demo-proxy".to_string(), Some(1))]
        );
        assert_eq!(
            statefulsets(WorkloadGate::Full),
            vec![("demo-proxy".to_string(), Some(3)), ("demo-target".to_string(), Some(3))]
        );
        assert_eq!(
            statefulsets(WorkloadGate::Shutdown),
            vec![("demo-proxy".to_string(), Some(0)), ("demo-target".to_string(), Some(0))]
        );
    }

    #[test]
    fn hash_changes_with_content() {
        let mut ais = aistore("demo", 1);
        let before = desired_objects(&ais, WorkloadGate::Full).unwrap();
        ais.spec.node_image = "aistorage/aisnode:v3.29".to_string();
        let after = desired_objects(&ais, WorkloadGate::Full).unwrap();

        for (a, b) in before.iter().zip(&after) {
            assert_eq!(a.name, b.name);
            if a.kind == ResourceKind::StatefulSet {
                assert_ne!(a.hash, b.hash);
            } else {
                assert_eq!(a.hash, b.hash, "{} should not change", a.name);
            }
        }
    }

    #[test]
    fn missing_uid_is_an_owner_reference_error() {
        let mut ais = aistore("demo", 1);
        ais.metadata.uid = None;
        let err = desired_objects(&ais, WorkloadGate::Full).unwrap_err();
        assert_eq!(err.reason(), ErrorReason::OwnerReference);
    }
}
