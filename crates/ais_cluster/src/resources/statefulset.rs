use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::api::v1beta1::aistore::AIStore;
use crate::api::v1beta1::Role;
use crate::resources::{compose, object_meta, role_labels};
use crate::util::errors::Result;

/// Stateful set running `replicas` daemons of `role`.
pub fn statefulset(ais: &AIStore, role: Role, replicas: i32) -> Result<StatefulSet> {
    let composed = compose(ais, role);
    let labels = role_labels(ais, role);
    let claims = composed.claim_templates;

    Ok(StatefulSet {
        metadata: object_meta(ais, ais.statefulset_name(role), labels.clone())?,
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            service_name: Some(ais.headless_service_name(role)),
            pod_management_policy: Some("Parallel".to_string()),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            template: composed.template,
            volume_claim_templates: (!claims.is_empty()).then_some(claims),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1beta1::aistore::Mount;
    use crate::fixtures::aistore;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    #[test]
    fn replicas_and_selector() {
        let ais = aistore("demo", 3);
        let sts = statefulset(&ais, Role::Target, 3).unwrap();
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name.as_deref(), Some("demo-target"));
        assert_eq!(spec.pod_management_policy.as_deref(), Some("Parallel"));
        assert_eq!(
            spec.selector.match_labels,
            spec.template.metadata.unwrap().labels
        );
        assert!(spec.volume_claim_templates.is_none());
    }

    #[test]
    fn target_mounts_are_claimed_per_replica() {
        let mut ais = aistore("demo", 2);
        ais.spec.target_spec.mounts = vec![
            Mount {
                path: "/ais/1".to_string(),
                size: Quantity("5Gi".to_string()),
                ..Default::default()
            },
            Mount {
                path: "/ais/2".to_string(),
                size: Quantity("5Gi".to_string()),
                ..Default::default()
            },
        ];
        let spec = statefulset(&ais, Role::Target, 2).unwrap().spec.unwrap();
        let claims: Vec<_> = spec
            .volume_claim_templates
            .unwrap()
            .into_iter()
            .filter_map(|c| c.metadata.name)
            .collect();
        assert_eq!(claims, vec!["demo-ais-1", "demo-ais-2"]);
    }
}
