//! Lifecycle transitions of one cluster, derived from what a reconcile loop observed.

use k8s_openapi::api::apps::v1::StatefulSet;

use crate::api::v1beta1::aistore::{AIStore, ClusterState};
use crate::api::v1beta1::Role;
use crate::resources::WorkloadGate;
use crate::util::errors::ErrorReason;

/// Snapshot of the cluster taken by one reconcile loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub shutdown_requested: bool,
    /// Pods still running across both roles.
    pub running_pods: i32,
    pub external_lb: bool,
    /// Load balancer services were missing before this loop and got created.
    pub lb_services_created: bool,
    /// Every load balancer service has an ingress address.
    pub lb_ingress_ready: bool,
    /// Both stateful sets exist at their effective size.
    pub workloads_submitted: bool,
    /// A stateful set still runs an outdated image or revision.
    pub rollout_in_progress: bool,
    /// Ready replicas equal the effective sizes for both roles.
    pub replicas_ready: bool,
    /// The loop created, updated or removed at least one object.
    pub changes_applied: bool,
    pub membership_converged: bool,
}

/// State after a successful loop.
pub fn next_state(current: Option<ClusterState>, obs: &Observation) -> ClusterState {
    if obs.shutdown_requested {
        return if obs.running_pods == 0 {
            ClusterState::Shutdown
        } else {
            ClusterState::ShuttingDown
        };
    }

    let proposed = if obs.external_lb && !obs.lb_ingress_ready {
        if obs.lb_services_created {
            ClusterState::InitializingLbService
        } else {
            ClusterState::PendingLbService
        }
    } else if !obs.workloads_submitted {
        ClusterState::Initialized
    } else if obs.rollout_in_progress {
        ClusterState::Upgrading
    } else if obs.replicas_ready && !obs.changes_applied && obs.membership_converged {
        ClusterState::Ready
    } else {
        ClusterState::Created
    };

    guard(current, proposed)
}

/// A running cluster never falls back to `Initialized`.
fn guard(current: Option<ClusterState>, proposed: ClusterState) -> ClusterState {
    match (current, proposed) {
        (
            Some(ClusterState::Created | ClusterState::Ready | ClusterState::Upgrading),
            ClusterState::Initialized,
        ) => ClusterState::Created,
        (_, proposed) => proposed,
    }
}

/// State after a failed loop, if the failure changes it.
///
/// Spec incompatibility fails the cluster at once. Transient errors only do so
/// after `threshold` consecutive failures; they keep being retried either way.
pub fn failure_state(reason: ErrorReason, error_count: u32, threshold: u32) -> Option<ClusterState> {
    if !reason.is_transient() || error_count >= threshold {
        Some(ClusterState::Failed)
    } else {
        None
    }
}

/// How far the workloads may be brought up in this loop.
///
/// `created` tells whether a full bring-up already happened once, in which
/// case restarts and resumes skip the primary-only phase. A cluster without
/// proxies has no primary to wait for.
pub fn workload_gate(ais: &AIStore, created: bool, primary_ready: bool, lb_ready: bool) -> WorkloadGate {
    if ais.should_shutdown() {
        WorkloadGate::Shutdown
    } else if ais.spec.enable_external_lb && !lb_ready {
        WorkloadGate::Hold
    } else if created || primary_ready || ais.proxy_size() == 0 {
        WorkloadGate::Full
    } else {
        WorkloadGate::PrimaryOnly
    }
}

/// Rollout facts of the two stateful sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub submitted: bool,
    pub running: i32,
    pub ready: bool,
    pub rolling: bool,
}

impl WorkloadStatus {
    pub fn observe(ais: &AIStore, proxy: Option<&StatefulSet>, target: Option<&StatefulSet>) -> Self {
        let mut status = WorkloadStatus {
            submitted: true,
            ready: true,
            ..Default::default()
        };
        for (role, sts) in [(Role::Proxy, proxy), (Role::Target, target)] {
            let Some(sts) = sts else {
                status.submitted = false;
                status.ready = false;
                continue;
            };
            let want = ais.effective_size(role);
            let spec_replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let observed = sts.status.clone().unwrap_or_default();

            status.running += observed.replicas;
            status.submitted &= spec_replicas == want;
            status.ready &= observed.ready_replicas.unwrap_or_default() == want;
            status.rolling |= image_outdated(ais, sts) || revision_pending(sts);
        }
        status
    }
}

fn image_outdated(ais: &AIStore, sts: &StatefulSet) -> bool {
    sts.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.image.as_deref())
        .is_some_and(|image| image != ais.spec.node_image)
}

fn revision_pending(sts: &StatefulSet) -> bool {
    let Some(status) = &sts.status else {
        return false;
    };
    let generation = sts.metadata.generation.unwrap_or_default();
    if status.observed_generation.unwrap_or_default() < generation {
        return true;
    }
    match (&status.current_revision, &status.update_revision) {
        (Some(current), Some(update)) => current != update,
        _ => false,
    }
}

/// Whether the primary proxy replica is up.
pub fn primary_ready(proxy: Option<&StatefulSet>) -> bool {
    proxy
        .and_then(|sts| sts.status.as_ref())
        .and_then(|s| s.ready_replicas)
        .unwrap_or_default()
        >= 1
}
