//! Pod volumes and their mounts.
//!
//! Each volume is one row of [`FEATURES`]: a name, where it is mounted and a
//! source function that returns `None` when the feature is off for the
//! cluster and role at hand. Rows never look at each other.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    CSIVolumeSource, ConfigMapVolumeSource, EmptyDirVolumeSource, HostPathVolumeSource,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, SecretVolumeSource, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::api::v1beta1::aistore::{AIStore, TlsSource};
use crate::api::v1beta1::Role;

pub const STATE_DIR: &str = "/etc/ais";
pub const CONFIG_TEMPLATE_DIR: &str = "/var/ais_config_template";
pub const CONFIG_DIR: &str = "/var/ais_config";
pub const GLOBAL_CONFIG_DIR: &str = "/var/global_config";
pub const STATSD_DIR: &str = "/var/statsd_config";
pub const LOGS_DIR: &str = "/var/log/ais";
pub const AWS_DIR: &str = "/root/.aws";
pub const GCP_DIR: &str = "/var/gcp";
pub const OCI_DIR: &str = "/root/.oci";
pub const CERTS_DIR: &str = "/var/certs";
pub const TRACES_DIR: &str = "/var/traces";

pub const STATE_VOLUME: &str = "state-mount";
pub const LOGS_VOLUME: &str = "logs-dir";
pub const TLS_VOLUME: &str = "tls-certs";

pub const CERT_MANAGER_CSI_DRIVER: &str = "csi.cert-manager.io";
const STATE_CLAIM_SIZE: &str = "1Gi";

/// Sub-path expression pinning a mount to the replica that uses it.
pub const REPLICA_SUB_PATH: &str = "$(MY_POD)";

/// Containers a volume is mounted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mounted {
    Daemon,
    Init,
    Both,
}

struct VolumeFeature {
    name: &'static str,
    mount_path: &'static str,
    mounted: Mounted,
    read_only: bool,
    /// Targets get a per-replica sub-path on this mount.
    per_replica: bool,
    source: fn(&AIStore, Role) -> Option<Volume>,
}

const FEATURES: [VolumeFeature; 11] = [
    VolumeFeature {
        name: "config-template",
        mount_path: CONFIG_TEMPLATE_DIR,
        mounted: Mounted::Init,
        read_only: false,
        per_replica: false,
        source: |ais, role| Some(config_map_volume(ais.config_map_name(role))),
    },
    VolumeFeature {
        name: "config-mount",
        mount_path: CONFIG_DIR,
        mounted: Mounted::Both,
        read_only: false,
        per_replica: false,
        source: |_, _| Some(empty_dir()),
    },
    VolumeFeature {
        name: "config-global",
        mount_path: GLOBAL_CONFIG_DIR,
        mounted: Mounted::Init,
        read_only: false,
        per_replica: false,
        source: |ais, _| Some(config_map_volume(ais.global_config_map_name())),
    },
    VolumeFeature {
        name: "statsd-config",
        mount_path: STATSD_DIR,
        mounted: Mounted::Daemon,
        read_only: false,
        per_replica: false,
        source: |ais, _| Some(config_map_volume(ais.statsd_config_map_name())),
    },
    VolumeFeature {
        name: LOGS_VOLUME,
        mount_path: LOGS_DIR,
        mounted: Mounted::Daemon,
        read_only: false,
        per_replica: true,
        source: |ais, role| match ais.spec.logs_dir.as_deref() {
            Some(dir) if !dir.is_empty() => Some(host_path(host_dir(dir, ais, role))),
            _ => Some(empty_dir()),
        },
    },
    VolumeFeature {
        name: STATE_VOLUME,
        mount_path: STATE_DIR,
        mounted: Mounted::Daemon,
        read_only: false,
        per_replica: true,
        source: |ais, role| match state_volume(ais, role) {
            StateVolume::HostPath(path) => Some(host_path(path)),
            StateVolume::Claim { .. } => None,
        },
    },
    VolumeFeature {
        name: "aws-creds",
        mount_path: AWS_DIR,
        mounted: Mounted::Daemon,
        read_only: true,
        per_replica: false,
        source: |ais, role| target_secret(ais.spec.aws_secret_name.as_deref(), role),
    },
    VolumeFeature {
        name: "gcp-creds",
        mount_path: GCP_DIR,
        mounted: Mounted::Daemon,
        read_only: true,
        per_replica: false,
        source: |ais, role| target_secret(ais.spec.gcp_secret_name.as_deref(), role),
    },
    VolumeFeature {
        name: "oci-creds",
        mount_path: OCI_DIR,
        mounted: Mounted::Daemon,
        read_only: true,
        per_replica: false,
        source: |ais, role| target_secret(ais.spec.oci_secret_name.as_deref(), role),
    },
    VolumeFeature {
        name: TLS_VOLUME,
        mount_path: CERTS_DIR,
        mounted: Mounted::Daemon,
        read_only: true,
        per_replica: false,
        source: |ais, role| match ais.tls_source()? {
            TlsSource::Issuer(issuer) => Some(cert_manager_volume(ais, role, issuer)),
            TlsSource::Secret(secret) => Some(secret_volume(secret)),
        },
    },
    VolumeFeature {
        name: "tracing-token",
        mount_path: TRACES_DIR,
        mounted: Mounted::Daemon,
        read_only: true,
        per_replica: false,
        source: |ais, _| ais.spec.tracing_token_secret_name.as_deref().map(secret_volume),
    },
];

/// Where the daemon keeps its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateVolume {
    /// Directory on the node: `<prefix>/<namespace>/<cluster>/<role>`.
    HostPath(String),
    /// Claim template provisioned from a storage class.
    Claim { name: String, storage_class: String },
}

pub fn state_volume(ais: &AIStore, role: Role) -> StateVolume {
    match ais.spec.state_storage_class.as_deref() {
        Some(class) => StateVolume::Claim {
            name: ais.state_claim_name(),
            storage_class: class.to_string(),
        },
        None => StateVolume::HostPath(host_dir(
            ais.spec.hostpath_prefix.as_deref().unwrap_or_default(),
            ais,
            role,
        )),
    }
}

/// Volumes and mounts of one role's pods.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodVolumes {
    pub volumes: Vec<Volume>,
    pub daemon_mounts: Vec<VolumeMount>,
    pub init_mounts: Vec<VolumeMount>,
    pub claim_templates: Vec<PersistentVolumeClaim>,
}

pub fn pod_volumes(ais: &AIStore, role: Role) -> PodVolumes {
    let mut out = PodVolumes::default();

    for feature in &FEATURES {
        let Some(mut volume) = (feature.source)(ais, role) else {
            continue;
        };
        volume.name = feature.name.to_string();
        out.volumes.push(volume);

        let mount = VolumeMount {
            name: feature.name.to_string(),
            mount_path: feature.mount_path.to_string(),
            read_only: feature.read_only.then_some(true),
            sub_path_expr: (feature.per_replica && role == Role::Target)
                .then(|| REPLICA_SUB_PATH.to_string()),
            ..Default::default()
        };
        match feature.mounted {
            Mounted::Daemon => out.daemon_mounts.push(mount),
            Mounted::Init => out.init_mounts.push(mount),
            Mounted::Both => {
                out.init_mounts.push(mount.clone());
                out.daemon_mounts.push(mount);
            }
        }
    }

    if let StateVolume::Claim { name, storage_class } = state_volume(ais, role) {
        out.daemon_mounts.push(VolumeMount {
            name: name.clone(),
            mount_path: STATE_DIR.to_string(),
            ..Default::default()
        });
        out.claim_templates.push(claim_template(
            name,
            Some(storage_class),
            Quantity(STATE_CLAIM_SIZE.to_string()),
            None,
        ));
    }

    if role == Role::Target {
        for mount in &ais.spec.target_spec.mounts {
            let name = ais.mount_claim_name(&mount.path);
            out.daemon_mounts.push(VolumeMount {
                name: name.clone(),
                mount_path: mount.path.clone(),
                ..Default::default()
            });
            out.claim_templates.push(claim_template(
                name,
                mount.storage_class.clone(),
                mount.size.clone(),
                mount.selector.clone(),
            ));
        }
    }

    out
}

fn host_dir(prefix: &str, ais: &AIStore, role: Role) -> String {
    format!(
        "{}/{}/{}/{}",
        prefix.trim_end_matches('/'),
        ais.namespace().unwrap_or_default(),
        ais.name_any(),
        role.token()
    )
}

fn empty_dir() -> Volume {
    Volume {
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn host_path(path: String) -> Volume {
    Volume {
        host_path: Some(HostPathVolumeSource {
            path,
            type_: Some("DirectoryOrCreate".to_string()),
        }),
        ..Default::default()
    }
}

fn config_map_volume(name: String) -> Volume {
    Volume {
        config_map: Some(ConfigMapVolumeSource {
            name,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_volume(secret: &str) -> Volume {
    Volume {
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn target_secret(secret: Option<&str>, role: Role) -> Option<Volume> {
    match role {
        Role::Target => secret.map(secret_volume),
        Role::Proxy => None,
    }
}

/// Per-pod certificate requested from a cert-manager issuer through the CSI driver.
fn cert_manager_volume(ais: &AIStore, role: Role, issuer: &str) -> Volume {
    let service = ais.headless_service_name(role);
    let domain = ais.cluster_domain();
    let dns_names = [
        format!("${{POD_NAME}}.${{POD_NAMESPACE}}.svc.{domain}"),
        format!("{service}.${{POD_NAMESPACE}}.svc.{domain}"),
        format!("{service}.${{POD_NAMESPACE}}.svc"),
        service.clone(),
    ]
    .join(",");

    Volume {
        csi: Some(CSIVolumeSource {
            driver: CERT_MANAGER_CSI_DRIVER.to_string(),
            read_only: Some(true),
            volume_attributes: Some(BTreeMap::from([
                ("csi.cert-manager.io/issuer-name".to_string(), issuer.to_string()),
                (
                    "csi.cert-manager.io/common-name".to_string(),
                    format!("{service}.${{POD_NAMESPACE}}"),
                ),
                ("csi.cert-manager.io/dns-names".to_string(), dns_names),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn claim_template(
    name: String,
    storage_class: Option<String>,
    size: Quantity,
    selector: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector>,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage_class,
            selector,
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), size)])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1beta1::aistore::Mount;
    use crate::fixtures::aistore;

    fn volume<'a>(v: &'a PodVolumes, name: &str) -> Option<&'a Volume> {
        v.volumes.iter().find(|vol| vol.name == name)
    }

    fn mount<'a>(mounts: &'a [VolumeMount], name: &str) -> Option<&'a VolumeMount> {
        mounts.iter().find(|m| m.name == name)
    }

    #[test]
    fn base_volumes_are_always_present() {
        let ais = aistore("demo", 1);
        for role in Role::ALL {
            let v = pod_volumes(&ais, role);
            for name in ["config-template", "config-mount", "config-global", "statsd-config", LOGS_VOLUME] {
                assert!(volume(&v, name).is_some(), "{name} missing for {role}");
            }
            assert!(mount(&v.init_mounts, "config-template").is_some());
            assert!(mount(&v.init_mounts, "config-global").is_some());
            assert!(mount(&v.daemon_mounts, "config-mount").is_some());
            assert!(mount(&v.daemon_mounts, "statsd-config").is_some());
        }
    }

    #[test]
    fn state_is_host_path_xor_claim() {
        let mut ais = aistore("demo", 1);
        let host = pod_volumes(&ais, Role::Target);
        let state = volume(&host, STATE_VOLUME).unwrap();
        assert_eq!(
            state.host_path.as_ref().unwrap().path,
            "/etc/ais/ais/demo/target"
        );
        assert!(host.claim_templates.is_empty());

        ais.spec.state_storage_class = Some("local-path".to_string());
        let claim = pod_volumes(&ais, Role::Target);
        assert!(volume(&claim, STATE_VOLUME).is_none());
        assert_eq!(claim.claim_templates.len(), 1);
        assert_eq!(claim.claim_templates[0].metadata.name.as_deref(), Some("demo-state"));
        let state_mounts: Vec<_> = claim
            .daemon_mounts
            .iter()
            .filter(|m| m.mount_path == STATE_DIR)
            .collect();
        assert_eq!(state_mounts.len(), 1);
        assert_eq!(state_mounts[0].name, "demo-state");
    }

    #[test]
    fn logs_use_host_dir_when_configured() {
        let mut ais = aistore("demo", 1);
        assert!(volume(&pod_volumes(&ais, Role::Proxy), LOGS_VOLUME)
            .unwrap()
            .empty_dir
            .is_some());

        ais.spec.logs_dir = Some("/var/log/aistore/".to_string());
        let v = pod_volumes(&ais, Role::Proxy);
        assert_eq!(
            volume(&v, LOGS_VOLUME).unwrap().host_path.as_ref().unwrap().path,
            "/var/log/aistore/ais/demo/proxy"
        );
    }

    #[test]
    fn replica_sub_path_only_for_targets() {
        let ais = aistore("demo", 1);
        let target = pod_volumes(&ais, Role::Target);
        assert_eq!(
            mount(&target.daemon_mounts, STATE_VOLUME).unwrap().sub_path_expr.as_deref(),
            Some(REPLICA_SUB_PATH)
        );
        assert_eq!(
            mount(&target.daemon_mounts, LOGS_VOLUME).unwrap().sub_path_expr.as_deref(),
            Some(REPLICA_SUB_PATH)
        );

        let proxy = pod_volumes(&ais, Role::Proxy);
        assert!(proxy.daemon_mounts.iter().all(|m| m.sub_path_expr.is_none()));
    }

    #[test]
    fn cloud_credentials_mount_on_targets_only() {
        let mut ais = aistore("demo", 1);
        ais.spec.aws_secret_name = Some("aws".to_string());
        ais.spec.gcp_secret_name = Some("gcp".to_string());
        ais.spec.oci_secret_name = Some("oci".to_string());

        let target = pod_volumes(&ais, Role::Target);
        for (name, path) in [("aws-creds", AWS_DIR), ("gcp-creds", GCP_DIR), ("oci-creds", OCI_DIR)] {
            let m = mount(&target.daemon_mounts, name).unwrap();
            assert_eq!(m.mount_path, path);
            assert_eq!(m.read_only, Some(true));
        }

        let proxy = pod_volumes(&ais, Role::Proxy);
        assert!(volume(&proxy, "aws-creds").is_none());
        assert!(volume(&proxy, "gcp-creds").is_none());
        assert!(volume(&proxy, "oci-creds").is_none());
    }

    #[test]
    fn issuer_wins_over_tls_secret() {
        let mut ais = aistore("demo", 1);
        ais.spec.tls_secret_name = Some("tls".to_string());
        ais.spec.tls_cert_manager_issuer_name = Some("ca-issuer".to_string());

        let v = pod_volumes(&ais, Role::Proxy);
        let tls: Vec<_> = v.volumes.iter().filter(|vol| vol.name == TLS_VOLUME).collect();
        assert_eq!(tls.len(), 1);
        assert!(tls[0].secret.is_none());

        let csi = tls[0].csi.as_ref().unwrap();
        assert_eq!(csi.driver, CERT_MANAGER_CSI_DRIVER);
        let attrs = csi.volume_attributes.as_ref().unwrap();
        assert_eq!(attrs["csi.cert-manager.io/issuer-name"], "ca-issuer");
        assert_eq!(attrs["csi.cert-manager.io/common-name"], "demo-proxy.${POD_NAMESPACE}");
        assert_eq!(
            attrs["csi.cert-manager.io/dns-names"],
            "${POD_NAME}.${POD_NAMESPACE}.svc.cluster.local,\
             demo-proxy.${POD_NAMESPACE}.svc.cluster.local,\
             demo-proxy.${POD_NAMESPACE}.svc,\
             demo-proxy"
        );
        assert_eq!(mount(&v.daemon_mounts, TLS_VOLUME).unwrap().mount_path, CERTS_DIR);
    }

    #[test]
    fn tls_secret_is_mounted_as_is() {
        let mut ais = aistore("demo", 1);
        ais.spec.tls_secret_name = Some("tls".to_string());
        let v = pod_volumes(&ais, Role::Target);
        let tls = volume(&v, TLS_VOLUME).unwrap();
        assert_eq!(tls.secret.as_ref().unwrap().secret_name.as_deref(), Some("tls"));
        assert!(tls.csi.is_none());
    }

    #[test]
    fn tracing_token_is_read_only() {
        let mut ais = aistore("demo", 1);
        assert!(volume(&pod_volumes(&ais, Role::Proxy), "tracing-token").is_none());
        ais.spec.tracing_token_secret_name = Some("token".to_string());
        let v = pod_volumes(&ais, Role::Proxy);
        let m = mount(&v.daemon_mounts, "tracing-token").unwrap();
        assert_eq!(m.mount_path, TRACES_DIR);
        assert_eq!(m.read_only, Some(true));
    }

    #[test]
    fn target_mounts_become_claim_templates() {
        let mut ais = aistore("demo", 1);
        ais.spec.target_spec.mounts = vec![Mount {
            path: "/ais/1".to_string(),
            size: Quantity("10Gi".to_string()),
            storage_class: Some("local".to_string()),
            ..Default::default()
        }];
        let v = pod_volumes(&ais, Role::Target);
        assert_eq!(v.claim_templates.len(), 1);
        let claim = &v.claim_templates[0];
        assert_eq!(claim.metadata.name.as_deref(), Some("demo-ais-1"));
        let spec = claim.spec.as_ref().unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("local"));
        assert_eq!(
            spec.resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"],
            Quantity("10Gi".to_string())
        );
        assert_eq!(mount(&v.daemon_mounts, "demo-ais-1").unwrap().mount_path, "/ais/1");

        assert!(pod_volumes(&ais, Role::Proxy).claim_templates.is_empty());
    }
}
