use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EnvVar, EnvVarSource, ExecAction, LifecycleHandler,
    Lifecycle, ObjectFieldSelector, PersistentVolumeClaim, PodAffinityTerm, PodAntiAffinity,
    PodSpec, PodTemplateSpec, Probe, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::api::v1beta1::aistore::{port_number, AIStore, DaemonSpec};
use crate::api::v1beta1::Role;
use crate::resources::config::{GLOBAL_CONFIG_FILE, HOSTNAME_MAP_FILE, LOCAL_CONFIG_FILE, STATSD_CONFIG_FILE};
use crate::resources::role_labels;
use crate::resources::volumes::{pod_volumes, PodVolumes, CONFIG_DIR, CONFIG_TEMPLATE_DIR, GCP_DIR, GLOBAL_CONFIG_DIR, STATSD_DIR};

pub const DAEMON_CONTAINER: &str = "ais-node";
pub const INIT_CONTAINER: &str = "populate-env";
pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";
pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Everything a role's pods are made of.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedResources {
    pub volumes: Vec<Volume>,
    pub volume_mounts: Vec<VolumeMount>,
    pub init_volume_mounts: Vec<VolumeMount>,
    pub ports: Vec<ContainerPort>,
    pub affinity: Option<Affinity>,
    pub claim_templates: Vec<PersistentVolumeClaim>,
    pub template: PodTemplateSpec,
}

/// Derives the pod shape of `role` from the cluster spec.
pub fn compose(ais: &AIStore, role: Role) -> ComposedResources {
    let volumes = pod_volumes(ais, role);
    let ports = daemon_ports(ais.daemon_spec(role), role);
    let affinity = merge_anti_affinity(
        ais.daemon_spec(role).affinity.clone(),
        &role_labels(ais, role),
        ais.allow_shared_nodes(role),
    );

    let template = pod_template(ais, role, &volumes, &ports, &affinity);
    ComposedResources {
        volumes: volumes.volumes,
        volume_mounts: volumes.daemon_mounts,
        init_volume_mounts: volumes.init_mounts,
        ports,
        affinity,
        claim_templates: volumes.claim_templates,
        template,
    }
}

fn pod_template(
    ais: &AIStore,
    role: Role,
    volumes: &PodVolumes,
    ports: &[ContainerPort],
    affinity: &Option<Affinity>,
) -> PodTemplateSpec {
    let spec = ais.daemon_spec(role);
    let host_network = ais.uses_host_network(role);

    let annotations = ais
        .spec
        .network_attachment
        .as_ref()
        .filter(|n| !n.is_empty())
        .map(|n| BTreeMap::from([(NETWORKS_ANNOTATION.to_string(), n.clone())]));

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(role_labels(ais, role)),
            annotations,
            ..Default::default()
        }),
        spec: Some(PodSpec {
            init_containers: Some(vec![Container {
                name: INIT_CONTAINER.to_string(),
                image: Some(ais.spec.init_image.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                command: Some(vec!["aisinit".to_string()]),
                args: Some(init_args(ais, role)),
                env: Some(init_env(ais, role)),
                volume_mounts: Some(volumes.init_mounts.clone()),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: DAEMON_CONTAINER.to_string(),
                image: Some(ais.spec.node_image.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                command: Some(vec!["aisnode".to_string()]),
                args: Some(daemon_args(role)),
                env: Some(daemon_env(ais, role)),
                ports: Some(ports.to_vec()),
                security_context: spec.container_security.clone(),
                volume_mounts: Some(volumes.daemon_mounts.clone()),
                lifecycle: Some(pre_stop_hook()),
                liveness_probe: Some(exec_probe("ais_liveness.sh", 90)),
                readiness_probe: Some(exec_probe("ais_readiness.sh", 5)),
                ..Default::default()
            }],
            affinity: affinity.clone(),
            node_selector: spec.node_selector.clone(),
            tolerations: spec.tolerations.clone(),
            security_context: spec.security_context.clone(),
            service_account_name: Some(ais.service_account_name()),
            image_pull_secrets: ais.spec.image_pull_secrets.clone(),
            host_network: host_network.then_some(true),
            dns_policy: host_network.then(|| "ClusterFirstWithHostNet".to_string()),
            volumes: Some(volumes.volumes.clone()),
            ..Default::default()
        }),
    }
}

/// Public port for every role. Targets add the intra-cluster ports.
fn daemon_ports(spec: &DaemonSpec, role: Role) -> Vec<ContainerPort> {
    let mut ports = vec![ContainerPort {
        name: Some("public".to_string()),
        container_port: port_number(&spec.public_port).unwrap_or_default(),
        host_port: spec.host_port.filter(|p| *p != 0),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];
    if role == Role::Target {
        for (name, port) in [("control", &spec.intra_control_port), ("data", &spec.intra_data_port)] {
            ports.push(ContainerPort {
                name: Some(name.to_string()),
                container_port: port_number(port).unwrap_or_default(),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }
    }
    ports
}

/// Adds hostname-level anti-affinity between replicas of one role.
///
/// A user supplied pod anti-affinity is kept untouched, as is the rest of the
/// user affinity.
pub fn merge_anti_affinity(
    user: Option<Affinity>,
    pod_labels: &BTreeMap<String, String>,
    allow_shared_nodes: bool,
) -> Option<Affinity> {
    if allow_shared_nodes {
        return user;
    }
    let mut affinity = user.unwrap_or_default();
    if affinity.pod_anti_affinity.is_none() {
        affinity.pod_anti_affinity = Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_labels: Some(pod_labels.clone()),
                    ..Default::default()
                }),
                topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
    }
    Some(affinity)
}

fn init_args(ais: &AIStore, role: Role) -> Vec<String> {
    let mut args = vec![
        format!("-role={}", role.token()),
        format!("-local_config_template={CONFIG_TEMPLATE_DIR}/{LOCAL_CONFIG_FILE}"),
        format!("-output_local_config={CONFIG_DIR}/{LOCAL_CONFIG_FILE}"),
        format!("-cluster_config_override={GLOBAL_CONFIG_DIR}/{GLOBAL_CONFIG_FILE}"),
        format!("-output_cluster_config={CONFIG_DIR}/{GLOBAL_CONFIG_FILE}"),
    ];
    if ais.spec.hostname_map.is_some() {
        args.push(format!("-hostname_map_file={CONFIG_TEMPLATE_DIR}/{HOSTNAME_MAP_FILE}"));
    }
    args
}

fn daemon_args(role: Role) -> Vec<String> {
    vec![
        format!("-config={CONFIG_DIR}/{GLOBAL_CONFIG_FILE}"),
        format!("-local_config={CONFIG_DIR}/{LOCAL_CONFIG_FILE}"),
        format!("-role={}", role.token()),
    ]
}

fn init_env(ais: &AIStore, role: Role) -> Vec<EnvVar> {
    let mut env = vec![
        env_field("MY_NODE", "spec.nodeName"),
        env_field("MY_POD", "metadata.name"),
        env_field("K8S_NS", "metadata.namespace"),
        env_value("AIS_K8S_CLUSTER_DOMAIN", ais.cluster_domain()),
        env_value("MY_SERVICE", &ais.headless_service_name(role)),
        env_value("AIS_NODE_ROLE", role.token()),
    ];
    env.extend(proxy_service_env(ais));
    env.extend(optional_env(ais, role));
    env
}

fn daemon_env(ais: &AIStore, role: Role) -> Vec<EnvVar> {
    let spec = ais.daemon_spec(role);
    let mut env = vec![
        env_field("MY_POD", "metadata.name"),
        env_field("MY_NODE", "spec.nodeName"),
        env_field("K8S_NS", "metadata.namespace"),
        env_value("AIS_K8S_CLUSTER_DOMAIN", ais.cluster_domain()),
        env_value("AIS_NODE_ROLE", role.token()),
        env_value("AIS_SHUTDOWN_MARKER_PATH", CONFIG_DIR),
        env_value("AIS_CONF_FILE", &format!("{CONFIG_DIR}/{GLOBAL_CONFIG_FILE}")),
        env_value("AIS_LOCAL_CONF_FILE", &format!("{CONFIG_DIR}/{LOCAL_CONFIG_FILE}")),
        env_value("STATSD_CONF_FILE", &format!("{STATSD_DIR}/{STATSD_CONFIG_FILE}")),
        env_value("AIS_PROMETHEUS", &ais.prometheus_enabled().to_string()),
        env_value(
            "AIS_NODE_SERVICE_PORT",
            &port_number(&spec.public_port).unwrap_or_default().to_string(),
        ),
    ];
    env.extend(proxy_service_env(ais));
    if role == Role::Proxy {
        env.push(env_value("TARGETS", &ais.target_size().to_string()));
    }
    env.extend(optional_env(ais, role));
    env
}

fn proxy_service_env(ais: &AIStore) -> Vec<EnvVar> {
    vec![
        env_value("CLUSTERIP_PROXY_SERVICE_HOSTNAME", &ais.headless_service_name(Role::Proxy)),
        env_value(
            "CLUSTERIP_PROXY_SERVICE_PORT",
            &port_number(&ais.spec.proxy_spec.service_port).unwrap_or_default().to_string(),
        ),
        env_value("AIS_DEFAULT_PRIMARY", &ais.default_primary_name()),
    ]
}

fn optional_env(ais: &AIStore, role: Role) -> Vec<EnvVar> {
    let mut env = Vec::new();
    if ais.daemon_spec(role).host_port.is_some_and(|p| p != 0) {
        env.push(env_field("AIS_PUBLIC_HOSTNAME", "status.hostIP"));
    }
    if ais.tls_source().is_some() {
        env.push(env_value("AIS_USE_HTTPS", "true"));
    }
    if role == Role::Target && ais.spec.gcp_secret_name.is_some() {
        env.push(env_value("GOOGLE_APPLICATION_CREDENTIALS", &format!("{GCP_DIR}/gcp.json")));
    }
    env
}

fn env_value(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn env_field(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn exec_probe(script: &str, initial_delay: i32) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec!["/bin/bash".to_string(), format!("{CONFIG_DIR}/{script}")]),
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(5),
        failure_threshold: Some(3),
        timeout_seconds: Some(5),
        success_threshold: Some(1),
        ..Default::default()
    }
}

// SIGINT lets the daemon leave the cluster map before the pod goes away.
fn pre_stop_hook() -> Lifecycle {
    Lifecycle {
        pre_stop: Some(LifecycleHandler {
            exec: Some(ExecAction {
                command: Some(vec![
                    "/bin/bash".to_string(),
                    "-c".to_string(),
                    "/usr/bin/pkill -SIGINT aisnode".to_string(),
                ]),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
