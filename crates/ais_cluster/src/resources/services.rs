use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::api::v1beta1::aistore::{port_number, AIStore};
use crate::api::v1beta1::Role;
use crate::resources::{instance_labels, object_meta, role_labels};
use crate::util::errors::Result;

pub const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";

/// In-cluster URL of the proxy service, which serves the cluster API.
pub fn proxy_service_url(ais: &AIStore) -> String {
    let scheme = if ais.tls_source().is_some() { "https" } else { "http" };
    format!(
        "{scheme}://{}.{}.svc.{}:{}",
        ais.headless_service_name(Role::Proxy),
        ais.metadata.namespace.as_deref().unwrap_or_default(),
        ais.cluster_domain(),
        port_number(&ais.spec.proxy_spec.service_port).unwrap_or_default()
    )
}

/// All services of the cluster.
///
/// Load balancers are only produced with `enableExternalLB`, one for the
/// proxies and one per target replica.
pub fn services(ais: &AIStore) -> Result<Vec<Service>> {
    let mut services = vec![proxy_headless(ais)?, target_headless(ais)?];
    if ais.spec.enable_external_lb {
        services.push(proxy_load_balancer(ais)?);
        for index in 0..ais.target_size().max(0) {
            services.push(target_load_balancer(ais, index)?);
        }
    }
    Ok(services)
}

fn proxy_headless(ais: &AIStore) -> Result<Service> {
    let spec = &ais.spec.proxy_spec;
    Ok(Service {
        metadata: object_meta(ais, ais.headless_service_name(Role::Proxy), role_labels(ais, Role::Proxy))?,
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            ports: Some(vec![port("pub", &spec.service_port, &spec.service_port)]),
            selector: Some(role_labels(ais, Role::Proxy)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn target_headless(ais: &AIStore) -> Result<Service> {
    let spec = &ais.spec.target_spec.daemon;
    let mut meta = object_meta(ais, ais.headless_service_name(Role::Target), role_labels(ais, Role::Target))?;
    meta.annotations = Some(prometheus_scrape());
    Ok(Service {
        metadata: meta,
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            ports: Some(vec![
                port("pub", &spec.service_port, &spec.service_port),
                port("control", &spec.intra_control_port, &spec.intra_control_port),
                port("data", &spec.intra_data_port, &spec.intra_data_port),
            ]),
            selector: Some(role_labels(ais, Role::Target)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn proxy_load_balancer(ais: &AIStore) -> Result<Service> {
    let spec = &ais.spec.proxy_spec;
    let mut labels = instance_labels(ais);
    labels.insert("ais.nvidia.com/lb".to_string(), Role::Proxy.token().to_string());
    Ok(Service {
        metadata: object_meta(ais, ais.proxy_lb_service_name(), labels)?,
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ports: Some(vec![port("pub", &spec.service_port, &spec.public_port)]),
            selector: Some(role_labels(ais, Role::Proxy)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Load balancer pinned to the target replica `index`.
pub fn target_load_balancer(ais: &AIStore, index: i32) -> Result<Service> {
    let spec = &ais.spec.target_spec.daemon;
    let mut labels = instance_labels(ais);
    labels.insert("ais.nvidia.com/lb".to_string(), Role::Target.token().to_string());
    let mut meta = object_meta(ais, ais.target_lb_service_name(index), labels)?;
    meta.annotations = Some(prometheus_scrape());

    let mut selector = role_labels(ais, Role::Target);
    selector.insert(POD_NAME_LABEL.to_string(), ais.pod_name(Role::Target, index));
    Ok(Service {
        metadata: meta,
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ports: Some(vec![port("pub", &spec.service_port, &spec.public_port)]),
            selector: Some(selector),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn port(name: &str, port: &IntOrString, target: &IntOrString) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        port: port_number(port).unwrap_or_default(),
        target_port: Some(target.clone()),
        ..Default::default()
    }
}

fn prometheus_scrape() -> BTreeMap<String, String> {
    BTreeMap::from([("prometheus.io/scrape".to_string(), "true".to_string())])
}
