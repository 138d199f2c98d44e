use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{
    Affinity, LocalObjectReference, PodSecurityContext, SecurityContext, Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::conditions_schema;
use crate::api::v1beta1::Role;

pub static AISTORE_FINALIZER: &str = "ais.nvidia.com/cleanup";

pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";

/// Desired state of an AIS cluster.
///
/// This provides a hook for generating the CRD yaml (in crdgen)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "AIStore",
    group = "ais.nvidia.com",
    version = "v1beta1",
    namespaced
)]
#[kube(status = "AIStoreStatus", shortname = "ais")]
#[serde(rename_all = "camelCase")]
pub struct AIStoreSpec {
    /// Number of proxies and targets. Either role can override it with its own `size`.
    #[serde(default)]
    pub size: Option<i32>,
    pub node_image: String,
    pub init_image: String,
    #[serde(default)]
    pub hostpath_prefix: Option<String>,
    /// Storage class for the daemon state volume. Replaces the host path state volume when set.
    #[serde(default)]
    pub state_storage_class: Option<String>,

    /// Map of primary host to comma-separated string of all hosts for multi-home
    #[serde(default)]
    pub hostname_map: Option<BTreeMap<String, String>>,
    /// Comma-separated list of additional network attachment definitions for each pod
    #[serde(default, rename = "networkAttachment")]
    pub network_attachment: Option<String>,

    pub proxy_spec: DaemonSpec,
    pub target_spec: TargetSpec,

    /// Scales the cluster to zero while keeping configuration and data.
    #[serde(default)]
    pub shutdown_cluster: Option<bool>,
    /// Delete PVCs and user data when the resource is deleted.
    #[serde(default)]
    pub cleanup_data: Option<bool>,
    #[serde(default)]
    pub enable_prom_exporter: Option<bool>,
    #[serde(default)]
    pub cluster_domain: Option<String>,

    #[serde(default)]
    pub aws_secret_name: Option<String>,
    #[serde(default)]
    pub gcp_secret_name: Option<String>,
    #[serde(default)]
    pub oci_secret_name: Option<String>,

    /// Host directory for daemon logs. Logs stay in the pod when unset.
    #[serde(default, rename = "logsDir")]
    pub logs_dir: Option<String>,

    #[serde(default)]
    pub tls_secret_name: Option<String>,
    /// cert-manager issuer. Takes precedence over `tlsSecretName`.
    #[serde(default)]
    pub tls_cert_manager_issuer_name: Option<String>,
    #[serde(default)]
    pub tracing_token_secret_name: Option<String>,

    #[serde(default)]
    pub image_pull_secrets: Option<Vec<LocalObjectReference>>,

    /// Deprecated: use `targetSpec.disablePodAntiAffinity`
    #[serde(default)]
    pub disable_pod_anti_affinity: Option<bool>,

    #[serde(default, rename = "enableExternalLB")]
    pub enable_external_lb: bool,
}

/// Network ports of a daemon role.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSpec {
    pub service_port: IntOrString,
    #[serde(rename = "portPublic")]
    pub public_port: IntOrString,
    #[serde(rename = "portIntraControl")]
    pub intra_control_port: IntOrString,
    #[serde(rename = "portIntraData")]
    pub intra_data_port: IntOrString,

    #[serde(default)]
    pub security_context: Option<PodSecurityContext>,
    /// Overrides the cluster-wide size for this role.
    #[serde(default)]
    pub size: Option<i32>,
    #[serde(default, rename = "capabilities")]
    pub container_security: Option<SecurityContext>,
    #[serde(default)]
    pub affinity: Option<Affinity>,
    #[serde(default)]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub tolerations: Option<Vec<Toleration>>,
    /// Host port for host networking
    #[serde(default)]
    pub host_port: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    #[serde(flatten)]
    pub daemon: DaemonSpec,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Deprecated: use `Mount.label`
    #[serde(default, rename = "allowSharedNoDisks")]
    pub allow_shared_no_disks: Option<bool>,
    #[serde(default)]
    pub disable_pod_anti_affinity: Option<bool>,
    /// Run targets in the host network namespace (multi-homing)
    #[serde(default)]
    pub host_network: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub path: String,
    pub size: Quantity,
    #[serde(default)]
    pub storage_class: Option<String>,
    /// Selector for choosing PVs
    #[serde(default)]
    pub selector: Option<LabelSelector>,
    /// Groups mountpaths by disk or storage class
    #[serde(default)]
    pub label: Option<String>,
}

/// Observed state of an AIS cluster.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AIStoreStatus {
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub state: Option<ClusterState>,
    #[serde(default)]
    pub consecutive_error_count: u32,
    /// Generation of the spec the current `state` was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Coarse lifecycle state of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClusterState {
    Initialized,
    #[serde(rename = "InitializingLoadBalancerService")]
    InitializingLbService,
    #[serde(rename = "PendingLoadBalancerService")]
    PendingLbService,
    Created,
    Ready,
    Upgrading,
    ShuttingDown,
    Shutdown,
    Failed,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClusterState::Initialized => write!(f, "Initialized"),
            ClusterState::InitializingLbService => write!(f, "InitializingLoadBalancerService"),
            ClusterState::PendingLbService => write!(f, "PendingLoadBalancerService"),
            ClusterState::Created => write!(f, "Created"),
            ClusterState::Ready => write!(f, "Ready"),
            ClusterState::Upgrading => write!(f, "Upgrading"),
            ClusterState::ShuttingDown => write!(f, "ShuttingDown"),
            ClusterState::Shutdown => write!(f, "Shutdown"),
            ClusterState::Failed => write!(f, "Failed"),
        }
    }
}

/// Which TLS mechanism, if any, provides the daemon certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsSource<'a> {
    /// Certificates requested per pod from a cert-manager issuer.
    Issuer(&'a str),
    /// A fixed secret mounted as is.
    Secret(&'a str),
}

/// Resolves the backward-compatible anti-affinity override.
///
/// `role_flag` is the per-role `disablePodAntiAffinity`, `deprecated_flag` the
/// cluster-wide one. Either of them set to `true` disables anti-affinity.
pub fn anti_affinity_disabled(role_flag: Option<bool>, deprecated_flag: Option<bool>) -> bool {
    role_flag.unwrap_or(false) || deprecated_flag.unwrap_or(false)
}

/// Numeric value of a port, if it has one.
pub fn port_number(port: &IntOrString) -> Option<i32> {
    match port {
        IntOrString::Int(p) => Some(*p),
        IntOrString::String(s) => s.parse().ok(),
    }
}

impl AIStore {
    pub fn cluster_domain(&self) -> &str {
        self.spec
            .cluster_domain
            .as_deref()
            .unwrap_or(DEFAULT_CLUSTER_DOMAIN)
    }

    pub fn daemon_spec(&self, role: Role) -> &DaemonSpec {
        match role {
            Role::Proxy => &self.spec.proxy_spec,
            Role::Target => &self.spec.target_spec.daemon,
        }
    }

    /// Role-specific size if present, else the cluster-wide size.
    pub fn effective_size(&self, role: Role) -> i32 {
        self.daemon_spec(role)
            .size
            .or(self.spec.size)
            .unwrap_or_default()
    }

    pub fn proxy_size(&self) -> i32 {
        self.effective_size(Role::Proxy)
    }

    pub fn target_size(&self) -> i32 {
        self.effective_size(Role::Target)
    }

    pub fn should_shutdown(&self) -> bool {
        self.spec.shutdown_cluster.unwrap_or(false)
    }

    pub fn should_cleanup_data(&self) -> bool {
        self.spec.cleanup_data.unwrap_or(false)
    }

    pub fn prometheus_enabled(&self) -> bool {
        self.spec.enable_prom_exporter.unwrap_or(false)
    }

    /// Whether replicas of `role` may share a node.
    pub fn allow_shared_nodes(&self, role: Role) -> bool {
        let role_flag = match role {
            Role::Proxy => None,
            Role::Target => self.spec.target_spec.disable_pod_anti_affinity,
        };
        anti_affinity_disabled(role_flag, self.spec.disable_pod_anti_affinity)
    }

    pub fn tls_source(&self) -> Option<TlsSource<'_>> {
        if let Some(issuer) = self.spec.tls_cert_manager_issuer_name.as_deref() {
            return Some(TlsSource::Issuer(issuer));
        }
        self.spec.tls_secret_name.as_deref().map(TlsSource::Secret)
    }

    pub fn uses_host_network(&self, role: Role) -> bool {
        role == Role::Target && self.spec.target_spec.host_network.unwrap_or(false)
    }

    pub fn statefulset_name(&self, role: Role) -> String {
        format!("{}-{}", self.name_any(), role.token())
    }

    pub fn headless_service_name(&self, role: Role) -> String {
        self.statefulset_name(role)
    }

    pub fn pod_name(&self, role: Role, index: i32) -> String {
        format!("{}-{}", self.statefulset_name(role), index)
    }

    pub fn default_primary_name(&self) -> String {
        self.pod_name(Role::Proxy, 0)
    }

    pub fn proxy_lb_service_name(&self) -> String {
        format!("{}-lb", self.statefulset_name(Role::Proxy))
    }

    pub fn target_lb_service_name(&self, index: i32) -> String {
        self.pod_name(Role::Target, index)
    }

    pub fn config_map_name(&self, role: Role) -> String {
        self.statefulset_name(role)
    }

    pub fn global_config_map_name(&self) -> String {
        format!("{}-global-cfg", self.name_any())
    }

    pub fn statsd_config_map_name(&self) -> String {
        format!("{}-statsd", self.name_any())
    }

    pub fn service_account_name(&self) -> String {
        format!("{}-sa", self.name_any())
    }

    pub fn rbac_role_name(&self) -> String {
        format!("{}-role", self.name_any())
    }

    pub fn rbac_role_binding_name(&self) -> String {
        format!("{}-rolebinding", self.name_any())
    }

    pub fn state_claim_name(&self) -> String {
        format!("{}-state", self.name_any())
    }

    /// Volume claim name for a target mount, e.g. `/ais/disk1` -> `<cluster>-ais-disk1`.
    pub fn mount_claim_name(&self, path: &str) -> String {
        let slug = path
            .trim_matches('/')
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect::<String>();
        format!("{}-{}", self.name_any(), slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::aistore;

    #[test]
    fn effective_size_prefers_role_override() {
        let mut ais = aistore("ais", 3);
        assert_eq!(ais.proxy_size(), 3);
        assert_eq!(ais.target_size(), 3);

        ais.spec.target_spec.daemon.size = Some(5);
        assert_eq!(ais.target_size(), 5);
        assert_eq!(ais.proxy_size(), 3);
    }

    #[test]
    fn cluster_domain_defaults_when_unset() {
        let mut ais = aistore("ais", 1);
        assert_eq!(ais.cluster_domain(), "cluster.local");
        ais.spec.cluster_domain = Some("example.internal".to_string());
        assert_eq!(ais.cluster_domain(), "example.internal");
    }

    #[test]
    fn anti_affinity_override_is_an_or_of_both_flags() {
        assert!(!anti_affinity_disabled(None, None));
        assert!(!anti_affinity_disabled(Some(false), Some(false)));
        assert!(anti_affinity_disabled(Some(true), None));
        assert!(anti_affinity_disabled(None, Some(true)));
        assert!(anti_affinity_disabled(Some(false), Some(true)));
    }

    #[test]
    fn deprecated_anti_affinity_flag_applies_to_proxies() {
        let mut ais = aistore("ais", 1);
        ais.spec.target_spec.disable_pod_anti_affinity = Some(true);
        assert!(ais.allow_shared_nodes(Role::Target));
        assert!(!ais.allow_shared_nodes(Role::Proxy));

        ais.spec.disable_pod_anti_affinity = Some(true);
        assert!(ais.allow_shared_nodes(Role::Proxy));
    }

    #[test]
    fn issuer_takes_precedence_over_secret() {
        let mut ais = aistore("ais", 1);
        assert_eq!(ais.tls_source(), None);
        ais.spec.tls_secret_name = Some("tls".to_string());
        assert_eq!(ais.tls_source(), Some(TlsSource::Secret("tls")));
        ais.spec.tls_cert_manager_issuer_name = Some("issuer".to_string());
        assert_eq!(ais.tls_source(), Some(TlsSource::Issuer("issuer")));
    }

    #[test]
    fn names_derive_from_cluster_and_role() {
        let ais = aistore("demo", 1);
        assert_eq!(ais.statefulset_name(Role::Proxy), "demo-proxy");
        assert_eq!(ais.statefulset_name(Role::Target), "demo-target");
        assert_eq!(ais.default_primary_name(), "demo-proxy-0");
        assert_eq!(ais.target_lb_service_name(2), "demo-target-2");
        assert_eq!(ais.mount_claim_name("/ais/Disk_1"), "demo-ais-disk-1");
    }

    #[test]
    fn spec_round_trips_wire_names() {
        let ais = aistore("demo", 1);
        let value = serde_json::to_value(&ais.spec).unwrap();
        assert!(value.get("enableExternalLB").is_some());
        assert!(value["proxySpec"].get("portPublic").is_some());
        assert!(value["targetSpec"].get("portIntraData").is_some());
        assert!(value["targetSpec"].get("mounts").is_some());
    }
}
