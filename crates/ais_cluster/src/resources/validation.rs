use std::collections::BTreeSet;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::api::v1beta1::aistore::{port_number, AIStore};
use crate::api::v1beta1::Role;
use crate::util::errors::{Error, Result};

/// Rejects specs that no amount of retrying can satisfy.
pub fn validate(ais: &AIStore) -> Result<()> {
    let spec = &ais.spec;

    for role in Role::ALL {
        match ais.daemon_spec(role).size.or(spec.size) {
            None => {
                return Err(Error::incompatible_spec(format!(
                    "no size for {role}s: set `size` or `{role}Spec.size`"
                )))
            }
            Some(size) if size < 0 => {
                return Err(Error::incompatible_spec(format!("{role} size must not be negative, got {size}")))
            }
            Some(_) => {}
        }

        let daemon = ais.daemon_spec(role);
        for (field, port) in [
            ("servicePort", &daemon.service_port),
            ("portPublic", &daemon.public_port),
            ("portIntraControl", &daemon.intra_control_port),
            ("portIntraData", &daemon.intra_data_port),
        ] {
            check_port(role, field, port)?;
        }
        if let Some(host_port) = daemon.host_port {
            if !(0..=65535).contains(&host_port) {
                return Err(Error::incompatible_spec(format!(
                    "{role}Spec.hostPort {host_port} is out of range"
                )));
            }
        }
    }

    if ais.proxy_size() == 0 && ais.target_size() > 0 {
        return Err(Error::incompatible_spec("targets need at least one proxy"));
    }

    if spec.state_storage_class.is_none() && spec.hostpath_prefix.as_deref().unwrap_or_default().is_empty() {
        return Err(Error::incompatible_spec(
            "`hostpathPrefix` is required unless `stateStorageClass` is set",
        ));
    }

    if spec.node_image.trim().is_empty() || spec.init_image.trim().is_empty() {
        return Err(Error::incompatible_spec("`nodeImage` and `initImage` must be set"));
    }

    let mut claims = BTreeSet::new();
    for mount in &spec.target_spec.mounts {
        if !mount.path.starts_with('/') {
            return Err(Error::incompatible_spec(format!(
                "mount path {:?} must be absolute",
                mount.path
            )));
        }
        let claim = ais.mount_claim_name(&mount.path);
        if !claim.ends_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(Error::incompatible_spec(format!(
                "mount path {:?} does not yield a volume claim name",
                mount.path
            )));
        }
        if !claims.insert(claim) {
            return Err(Error::incompatible_spec(format!(
                "mount path {:?} clashes with another mount's volume claim",
                mount.path
            )));
        }
    }

    Ok(())
}

fn check_port(role: Role, field: &str, port: &IntOrString) -> Result<()> {
    match port_number(port) {
        Some(p) if (1..=65535).contains(&p) => Ok(()),
        _ => Err(Error::incompatible_spec(format!(
            "{role}Spec.{field} must be a port number in 1..=65535"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1beta1::aistore::Mount;
    use crate::fixtures::aistore;
    use crate::util::errors::ErrorReason;

    fn rejected(ais: &AIStore) -> bool {
        matches!(validate(ais), Err(e) if e.reason() == ErrorReason::IncompatibleSpec)
    }

    #[test]
    fn fixture_is_valid() {
        assert!(validate(&aistore("demo", 1)).is_ok());
    }

    #[test]
    fn size_is_required_somewhere() {
        let mut ais = aistore("demo", 1);
        ais.spec.size = None;
        assert!(rejected(&ais));
        ais.spec.proxy_spec.size = Some(1);
        assert!(rejected(&ais));
        ais.spec.target_spec.daemon.size = Some(2);
        assert!(validate(&ais).is_ok());

        ais.spec.target_spec.daemon.size = Some(-1);
        assert!(rejected(&ais));
    }

    #[test]
    fn ports_must_be_numeric_and_in_range() {
        let mut ais = aistore("demo", 1);
        ais.spec.proxy_spec.public_port = IntOrString::String("public".to_string());
        assert!(rejected(&ais));

        let mut ais = aistore("demo", 1);
        ais.spec.target_spec.daemon.intra_data_port = IntOrString::Int(70000);
        assert!(rejected(&ais));

        let mut ais = aistore("demo", 1);
        ais.spec.proxy_spec.service_port = IntOrString::String("51080".to_string());
        assert!(validate(&ais).is_ok());
    }

    #[test]
    fn state_location_is_required() {
        let mut ais = aistore("demo", 1);
        ais.spec.hostpath_prefix = None;
        assert!(rejected(&ais));
        ais.spec.state_storage_class = Some("local".to_string());
        assert!(validate(&ais).is_ok());
    }

    #[test]
    fn mount_paths_absolute_and_unique() {
        let mount = |path: &str| Mount {
            path: path.to_string(),
            ..Default::default()
        };
        let mut ais = aistore("demo", 1);
        ais.spec.target_spec.mounts = vec![mount("ais/1")];
        assert!(rejected(&ais));

        ais.spec.target_spec.mounts = vec![mount("/ais/1"), mount("/ais/1/")];
        assert!(rejected(&ais));

        ais.spec.target_spec.mounts = vec![mount("/ais/1"), mount("/ais/2")];
        assert!(validate(&ais).is_ok());
    }

    #[test]
    fn mount_claim_names_must_be_distinct_and_non_empty() {
        let mount = |path: &str| Mount {
            path: path.to_string(),
            ..Default::default()
        };
        let mut ais = aistore("demo", 1);
        ais.spec.target_spec.mounts = vec![mount("/ais/disk_1"), mount("/ais/disk-1")];
        assert!(rejected(&ais));

        ais.spec.target_spec.mounts = vec![mount("/")];
        assert!(rejected(&ais));

        ais.spec.target_spec.mounts = vec![mount("/ais/_")];
        assert!(rejected(&ais));

        ais.spec.target_spec.mounts = vec![mount("/ais/disk_1"), mount("/ais/disk2")];
        assert!(validate(&ais).is_ok());
    }

    #[test]
    fn targets_without_proxies_are_rejected() {
        let mut ais = aistore("demo", 2);
        ais.spec.proxy_spec.size = Some(0);
        assert!(rejected(&ais));

        let idle = aistore("demo", 0);
        assert!(validate(&idle).is_ok());
    }
}
