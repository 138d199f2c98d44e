use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};

use crate::api::v1beta1::aistore::AIStore;
use crate::resources::{instance_labels, object_meta};
use crate::util::errors::Result;

/// Service account for the daemons plus the namespaced role it is bound to.
///
/// Daemons look up their peers' services and pods and read their own config maps.
pub fn rbac_objects(ais: &AIStore) -> Result<(ServiceAccount, Role, RoleBinding)> {
    let account = ServiceAccount {
        metadata: object_meta(ais, ais.service_account_name(), instance_labels(ais))?,
        ..Default::default()
    };

    let role = Role {
        metadata: object_meta(ais, ais.rbac_role_name(), instance_labels(ais))?,
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["".to_string()]),
            resources: Some(vec![
                "services".to_string(),
                "pods".to_string(),
                "configmaps".to_string(),
            ]),
            verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
            ..Default::default()
        }]),
    };

    let binding = RoleBinding {
        metadata: object_meta(ais, ais.rbac_role_binding_name(), instance_labels(ais))?,
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: ais.rbac_role_name(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: ais.service_account_name(),
            namespace: ais.metadata.namespace.clone(),
            ..Default::default()
        }]),
    };

    Ok((account, role, binding))
}
