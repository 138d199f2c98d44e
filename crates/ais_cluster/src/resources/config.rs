//! Config maps rendered into the daemons' configuration by the init container.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use serde_json::{json, Map, Value};

use crate::api::v1beta1::aistore::{port_number, AIStore};
use crate::api::v1beta1::Role;
use crate::resources::services::proxy_service_url;
use crate::resources::volumes::{CERTS_DIR, LOGS_DIR, STATE_DIR, TRACES_DIR};
use crate::resources::{instance_labels, object_meta, role_labels};
use crate::util::errors::{Error, ErrorReason, Result, StdError};

pub const GLOBAL_CONFIG_FILE: &str = "ais.json";
pub const LOCAL_CONFIG_FILE: &str = "ais_local.json";
pub const HOSTNAME_MAP_FILE: &str = "hostname_map.json";
pub const STATSD_CONFIG_FILE: &str = "statsd.json";

pub fn config_maps(ais: &AIStore) -> Result<Vec<ConfigMap>> {
    let mut maps = vec![global_config_map(ais)?];
    for role in Role::ALL {
        maps.push(role_config_map(ais, role)?);
    }
    maps.push(statsd_config_map(ais)?);
    Ok(maps)
}

/// Cluster-wide config, shared by both roles.
pub fn global_config_map(ais: &AIStore) -> Result<ConfigMap> {
    let data = BTreeMap::from([(GLOBAL_CONFIG_FILE.to_string(), render(&global_config(ais))?)]);
    Ok(ConfigMap {
        metadata: object_meta(ais, ais.global_config_map_name(), instance_labels(ais))?,
        data: Some(data),
        ..Default::default()
    })
}

/// Per-role local config template.
pub fn role_config_map(ais: &AIStore, role: Role) -> Result<ConfigMap> {
    let mut data = BTreeMap::from([(LOCAL_CONFIG_FILE.to_string(), render(&local_config(ais, role))?)]);
    if let Some(map) = &ais.spec.hostname_map {
        data.insert(HOSTNAME_MAP_FILE.to_string(), render(&json!(map))?);
    }
    Ok(ConfigMap {
        metadata: object_meta(ais, ais.config_map_name(role), role_labels(ais, role))?,
        data: Some(data),
        ..Default::default()
    })
}

pub fn statsd_config_map(ais: &AIStore) -> Result<ConfigMap> {
    let config = json!({
        "flushInterval": 10000,
        "percentThreshold": [90, 95, 99],
        "backends": ["./backends/console"],
    });
    Ok(ConfigMap {
        metadata: object_meta(ais, ais.statsd_config_map_name(), instance_labels(ais))?,
        data: Some(BTreeMap::from([(STATSD_CONFIG_FILE.to_string(), render(&config)?)])),
        ..Default::default()
    })
}

fn global_config(ais: &AIStore) -> Value {
    let primary = format!(
        "{}://{}.{}:{}",
        if ais.tls_source().is_some() { "https" } else { "http" },
        ais.default_primary_name(),
        proxy_service_host(ais),
        port_number(&ais.spec.proxy_spec.service_port).unwrap_or_default()
    );

    let mut backends = Map::new();
    for (provider, secret) in [
        ("aws", &ais.spec.aws_secret_name),
        ("gcp", &ais.spec.gcp_secret_name),
        ("oci", &ais.spec.oci_secret_name),
    ] {
        if secret.is_some() {
            backends.insert(provider.to_string(), json!({}));
        }
    }

    json!({
        "backend": backends,
        "proxy": {
            "primary_url": primary,
            "original_url": primary,
            "discovery_url": proxy_service_url(ais),
        },
        "log": {
            "level": "3",
            "max_size": "4mb",
            "max_total": "128mb",
        },
        "net": {
            "l4": { "proto": "tcp" },
            "http": {
                "use_https": ais.tls_source().is_some(),
                "server_crt": format!("{CERTS_DIR}/tls.crt"),
                "server_key": format!("{CERTS_DIR}/tls.key"),
                "skip_verify": false,
            },
        },
        "tracing": {
            "enabled": ais.spec.tracing_token_secret_name.is_some(),
            "auth_token_file": format!("{TRACES_DIR}/token"),
        },
    })
}

fn proxy_service_host(ais: &AIStore) -> String {
    format!(
        "{}.{}.svc.{}",
        ais.headless_service_name(Role::Proxy),
        ais.metadata.namespace.as_deref().unwrap_or_default(),
        ais.cluster_domain()
    )
}

fn local_config(ais: &AIStore, role: Role) -> Value {
    let spec = ais.daemon_spec(role);
    let port = |p| port_number(p).unwrap_or_default().to_string();

    let mut fspaths = Map::new();
    if role == Role::Target {
        for mount in &ais.spec.target_spec.mounts {
            fspaths.insert(
                mount.path.clone(),
                json!({ "label": mount.label.clone().unwrap_or_default() }),
            );
        }
    }

    json!({
        "role": role.token(),
        "confdir": STATE_DIR,
        "log_dir": LOGS_DIR,
        "host_net": {
            "hostname": "",
            "hostname_intra_control": "",
            "hostname_intra_data": "",
            "port": port(&spec.public_port),
            "port_intra_control": port(&spec.intra_control_port),
            "port_intra_data": port(&spec.intra_data_port),
        },
        "fspaths": fspaths,
    })
}

fn render(value: &Value) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| Error::categorize(ErrorReason::ConfigBuild, StdError::JsonSerializationError(e)))
}
