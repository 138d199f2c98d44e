use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info};

use crate::api::v1beta1::aistore::{AIStore, AIStoreStatus, ClusterState};
use crate::util::errors::{Error, ErrorReason, Result, StdError};
use crate::util::status::{
    find_status_condition, is_status_condition_true, latest_status_condition, set_status_condition,
    CONDITION_FALSE, CONDITION_TRUE,
};

// Constants for condition types
pub const INITIALIZED_CONDITION: &str = "Initialized";
pub const CREATED_CONDITION: &str = "Created";
pub const READY_CONDITION: &str = "Ready";
pub const RECONCILER_ERROR_CONDITION: &str = "ReconcilerError";
pub const RECONCILER_SUCCESS_CONDITION: &str = "ReconcilerSuccess";
pub const RECONCILER_SUCCESS_REASON: &str = "LastReconcileCycleSucceded";

/// In-memory view over a cluster's status document.
///
/// All mutations stamp the spec generation the tracker was created with.
/// Persisting the result is the caller's job, see [`ClusterStatusManager`].
pub struct ConditionTracker<'a> {
    status: &'a mut AIStoreStatus,
    generation: Option<i64>,
}

impl<'a> ConditionTracker<'a> {
    pub fn new(status: &'a mut AIStoreStatus, generation: Option<i64>) -> Self {
        Self { status, generation }
    }

    pub fn upsert(&mut self, condition_type: &str, status: bool, reason: &str, message: &str) -> bool {
        self.upsert_at(condition_type, status, reason, message, Utc::now())
    }

    pub fn upsert_at(
        &mut self,
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let condition = Condition {
            type_: condition_type.to_string(),
            status: if status { CONDITION_TRUE } else { CONDITION_FALSE }.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Time(now),
            observed_generation: self.generation,
        };
        set_status_condition(&mut self.status.conditions, condition, now)
    }

    pub fn latest(&self) -> Option<&Condition> {
        latest_status_condition(&self.status.conditions)
    }

    pub fn get(&self, condition_type: &str) -> Option<&Condition> {
        find_status_condition(&self.status.conditions, condition_type)
    }

    pub fn is_true(&self, condition_type: &str) -> bool {
        is_status_condition_true(&self.status.conditions, condition_type)
    }

    pub fn state(&self) -> Option<ClusterState> {
        self.status.state
    }

    pub fn set_state(&mut self, state: ClusterState) {
        self.status.state = Some(state);
    }

    pub fn has_state(&self, state: ClusterState) -> bool {
        self.status.state == Some(state)
    }

    pub fn error_count(&self) -> u32 {
        self.status.consecutive_error_count
    }

    pub fn increment_error_count(&mut self) -> u32 {
        self.status.consecutive_error_count = self.status.consecutive_error_count.saturating_add(1);
        self.status.consecutive_error_count
    }

    pub fn reset_error_count(&mut self) {
        self.status.consecutive_error_count = 0;
    }

    pub fn set_initialized(&mut self) {
        self.upsert(INITIALIZED_CONDITION, true, INITIALIZED_CONDITION, "Success initializing cluster");
    }

    pub fn set_created(&mut self) {
        self.upsert(CREATED_CONDITION, true, CREATED_CONDITION, "Success creating AIS cluster");
    }

    pub fn set_ready(&mut self) {
        self.upsert(READY_CONDITION, true, READY_CONDITION, "Cluster is ready");
    }

    pub fn unset_ready(&mut self, reason: &str, message: &str) {
        self.upsert(READY_CONDITION, false, reason, message);
    }

    /// Records a failed reconcile step.
    pub fn set_error(&mut self, error: &Error) {
        self.upsert(RECONCILER_ERROR_CONDITION, true, &error.reason().to_string(), &error.to_string());
    }

    /// Records a successful reconcile loop and clears the error streak. The
    /// state set in that loop now reflects the tracked generation.
    pub fn set_success(&mut self) {
        self.reset_error_count();
        self.status.observed_generation = self.generation;
        self.upsert(RECONCILER_SUCCESS_CONDITION, true, RECONCILER_SUCCESS_REASON, "");
        if self.is_true(RECONCILER_ERROR_CONDITION) {
            self.upsert(RECONCILER_ERROR_CONDITION, false, RECONCILER_SUCCESS_REASON, "");
        }
    }
}

// Field manager for status updates
pub const STATUS_FIELD_MANAGER: &str = "ais-cluster-status-manager";

/// Writes status documents back to the API server.
pub struct ClusterStatusManager {
    api: Api<AIStore>,
}

impl ClusterStatusManager {
    pub fn new(client: &kube::Client, cluster: &AIStore) -> Result<Self> {
        let namespace = cluster.namespace().ok_or_else(|| {
            Error::StdError(StdError::MetadataMissing("AIStore without namespace".to_string()))
        })?;
        Ok(Self {
            api: Api::namespaced(client.clone(), &namespace),
        })
    }

    /// Persists `status`, guarded by the resource version the cluster was read at.
    ///
    /// A newer write on the server makes this fail with a conflict; the caller
    /// requeues and re-derives everything from a fresh read.
    pub async fn persist(&self, cluster: &AIStore, status: &AIStoreStatus) -> Result<()> {
        if cluster.status.as_ref() == Some(status) {
            debug!("Status of {} unchanged", cluster.name_any());
            return Ok(());
        }

        let patch = Patch::Merge(json!({
            "metadata": {
                "resourceVersion": cluster.resource_version(),
            },
            "status": status,
        }));
        self.api
            .patch_status(&cluster.name_any(), &PatchParams::apply(STATUS_FIELD_MANAGER), &patch)
            .await
            .map_err(|e| Error::kube(ErrorReason::ResourceUpdate, e))?;

        info!(
            "Updated cluster {} status: state={:?} errors={}",
            cluster.name_any(),
            status.state,
            status.consecutive_error_count
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn upsert_keeps_one_entry_per_type() {
        let mut status = AIStoreStatus::default();
        let mut tracker = ConditionTracker::new(&mut status, Some(4));
        let first = Utc::now();

        tracker.upsert_at(READY_CONDITION, true, "Ready", "ok", first);
        tracker.upsert_at(READY_CONDITION, false, "Scaling", "scaling up", first + Duration::seconds(2));

        let ready: Vec<_> = status.conditions.iter().filter(|c| c.type_ == "Ready").collect();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].status, "False");
        assert!(ready[0].last_transition_time.0 > first);
        assert_eq!(ready[0].observed_generation, Some(4));
    }

    #[test]
    fn latest_returns_most_recent() {
        let mut status = AIStoreStatus::default();
        let mut tracker = ConditionTracker::new(&mut status, Some(1));
        assert!(tracker.latest().is_none());

        let now = Utc::now();
        tracker.upsert_at(INITIALIZED_CONDITION, true, "Initialized", "", now);
        tracker.upsert_at(CREATED_CONDITION, true, "Created", "", now + Duration::seconds(1));
        assert_eq!(tracker.latest().unwrap().type_, CREATED_CONDITION);
    }

    #[test]
    fn error_counter_increments_and_resets_on_success() {
        let mut status = AIStoreStatus::default();
        let mut tracker = ConditionTracker::new(&mut status, Some(1));

        let err = Error::incompatible_spec("size missing");
        tracker.set_error(&err);
        assert_eq!(tracker.increment_error_count(), 1);
        assert_eq!(tracker.increment_error_count(), 2);
        assert!(tracker.is_true(RECONCILER_ERROR_CONDITION));
        assert_eq!(tracker.get(RECONCILER_ERROR_CONDITION).unwrap().reason, "IncompatibleSpecError");

        tracker.set_success();
        assert_eq!(tracker.error_count(), 0);
        assert!(!tracker.is_true(RECONCILER_ERROR_CONDITION));
        assert!(tracker.is_true(RECONCILER_SUCCESS_CONDITION));
    }

    fn converged_pass(status: &mut AIStoreStatus) {
        let mut tracker = ConditionTracker::new(status, Some(3));
        tracker.set_initialized();
        tracker.set_created();
        tracker.set_ready();
        tracker.set_state(ClusterState::Ready);
        tracker.set_success();
    }

    #[test]
    fn repeated_converged_passes_leave_status_untouched() {
        let mut status = AIStoreStatus::default();
        converged_pass(&mut status);
        let before = status.clone();

        std::thread::sleep(std::time::Duration::from_millis(5));
        converged_pass(&mut status);
        assert_eq!(status, before);
        assert_eq!(status.observed_generation, Some(3));
    }

    #[test]
    fn failures_do_not_advance_observed_generation() {
        let mut status = AIStoreStatus::default();
        ConditionTracker::new(&mut status, Some(1)).set_success();

        let mut tracker = ConditionTracker::new(&mut status, Some(2));
        tracker.set_error(&Error::incompatible_spec("size missing"));
        tracker.increment_error_count();
        assert_eq!(status.observed_generation, Some(1));
    }

    #[test]
    fn state_round_trip() {
        let mut status = AIStoreStatus::default();
        let mut tracker = ConditionTracker::new(&mut status, None);
        assert_eq!(tracker.state(), None);
        tracker.set_state(ClusterState::Created);
        assert!(tracker.has_state(ClusterState::Created));
        assert!(!tracker.has_state(ClusterState::Ready));
    }
}
