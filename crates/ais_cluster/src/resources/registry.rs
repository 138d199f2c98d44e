//! Registry of the resource kinds an `AIStore` owns.
//!
//! Built once at start-up and handed to the driver through its context, so
//! the diff can list and apply every kind through one dynamic API.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::discovery::ApiResource;

/// Kinds of objects managed for a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    ServiceAccount,
    Role,
    RoleBinding,
    ConfigMap,
    Service,
    StatefulSet,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::ServiceAccount,
        ResourceKind::Role,
        ResourceKind::RoleBinding,
        ResourceKind::ConfigMap,
        ResourceKind::Service,
        ResourceKind::StatefulSet,
    ];

    /// Lower values are applied first.
    pub fn apply_order(&self) -> u8 {
        match self {
            ResourceKind::ServiceAccount => 0,
            ResourceKind::Role => 1,
            ResourceKind::RoleBinding => 2,
            ResourceKind::ConfigMap => 3,
            ResourceKind::Service => 4,
            ResourceKind::StatefulSet => 5,
        }
    }

    /// Whether stale objects of this kind are deleted by the diff.
    ///
    /// Stateful sets go away only with their owner.
    pub fn prunable(&self) -> bool {
        !matches!(self, ResourceKind::StatefulSet)
    }

    /// JSON pointers into an object's body that the operator owns outright.
    ///
    /// These are compared against observed objects on every pass, so hand
    /// edits that keep the recorded hash are still reverted. Fields the API
    /// server defaults are left out.
    pub fn owned_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::ServiceAccount | ResourceKind::RoleBinding => &[],
            ResourceKind::Role => &["/rules"],
            ResourceKind::ConfigMap => &["/data"],
            ResourceKind::Service => &["/spec/selector", "/spec/type"],
            ResourceKind::StatefulSet => &[
                "/spec/replicas",
                "/spec/template/spec/containers/0/image",
                "/spec/template/spec/initContainers/0/image",
            ],
        }
    }

    fn api_resource(&self) -> ApiResource {
        match self {
            ResourceKind::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
            ResourceKind::Role => ApiResource::erase::<Role>(&()),
            ResourceKind::RoleBinding => ApiResource::erase::<RoleBinding>(&()),
            ResourceKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            ResourceKind::Service => ApiResource::erase::<Service>(&()),
            ResourceKind::StatefulSet => ApiResource::erase::<StatefulSet>(&()),
        }
    }
}

/// Lookup table from [`ResourceKind`] to its API coordinates.
#[derive(Debug, Clone)]
pub struct ResourceRegistry {
    entries: BTreeMap<ResourceKind, ApiResource>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        let entries = ResourceKind::ALL
            .iter()
            .map(|kind| (*kind, kind.api_resource()))
            .collect();
        Self { entries }
    }

    /// Coordinates of `kind`. Every kind is registered at construction.
    pub fn resource(&self, kind: ResourceKind) -> ApiResource {
        self.entries
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| kind.api_resource())
    }

    /// Registered kinds in apply order.
    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        let mut kinds: Vec<_> = self.entries.keys().copied().collect();
        kinds.sort_by_key(|k| k.apply_order());
        kinds.into_iter()
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
