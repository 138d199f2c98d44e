//! Shared builders for unit tests.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

use crate::api::v1beta1::aistore::{AIStore, AIStoreSpec, DaemonSpec, TargetSpec};

pub fn daemon(port: i32) -> DaemonSpec {
    DaemonSpec {
        service_port: IntOrString::Int(port),
        public_port: IntOrString::Int(port),
        intra_control_port: IntOrString::Int(port + 1),
        intra_data_port: IntOrString::Int(port + 2),
        ..Default::default()
    }
}

/// A minimal valid cluster with `size` proxies and targets.
pub fn aistore(name: &str, size: i32) -> AIStore {
    let mut ais = AIStore::new(
        name,
        AIStoreSpec {
            size: Some(size),
            node_image: "aistorage/aisnode:v3.28".to_string(),
            init_image: "aistorage/ais-init:v3.28".to_string(),
            hostpath_prefix: Some("/etc/ais".to_string()),
            proxy_spec: daemon(51080),
            target_spec: TargetSpec {
                daemon: daemon(51081),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    ais.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("ais".to_string()),
        uid: Some(format!("{name}-uid")),
        generation: Some(1),
        resource_version: Some("1".to_string()),
        ..Default::default()
    };
    ais
}
