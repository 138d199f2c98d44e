use tokio::time::Duration;

use crate::util::retry::RetryPolicy;

/// Tunables of the cluster controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    /// Requeue interval while a cluster is still converging.
    pub requeue_converging: Duration,
    /// Requeue interval once a cluster is `Ready`.
    pub requeue_ready: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Consecutive errors after which the cluster is reported as `Failed`.
    pub failure_threshold: u32,
    /// Bounds for the membership convergence check.
    pub membership: RetryPolicy,
    /// Accept self-signed certificates when querying a TLS-enabled proxy.
    pub insecure_skip_verify: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            requeue_converging: Duration::from_secs(10),
            requeue_ready: Duration::from_secs(5 * 60),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(5 * 60),
            failure_threshold: 10,
            membership: RetryPolicy::default(),
            insecure_skip_verify: true,
        }
    }
}
