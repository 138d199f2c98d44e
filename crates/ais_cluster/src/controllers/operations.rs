//! Operator intents (scale, shutdown, resume, upgrade) expressed as edits of
//! the `AIStore` document. The controller does the actual converging.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use tracing::{info, warn};

use crate::api::v1beta1::aistore::{port_number, AIStore, ClusterState, DaemonSpec};
use crate::api::v1beta1::Role;
use crate::resources::instance_selector;
use crate::util::errors::{Error, ErrorReason, Result, StdError};
use crate::util::retry::{poll_until, PollOutcome, RetryPolicy};

const CONFLICT_RETRIES: u32 = 5;

/// Which size field a scale intent edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleTarget {
    /// The cluster-wide `size`.
    Cluster,
    /// One role's override.
    Role(Role),
}

impl FromStr for ScaleTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cluster" => Ok(ScaleTarget::Cluster),
            "proxy" => Ok(ScaleTarget::Role(Role::Proxy)),
            "target" => Ok(ScaleTarget::Role(Role::Target)),
            other => Err(format!("unknown scale target {other:?}, expected cluster, proxy or target")),
        }
    }
}

impl fmt::Display for ScaleTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScaleTarget::Cluster => write!(f, "cluster"),
            ScaleTarget::Role(role) => write!(f, "{role}"),
        }
    }
}

/// Adds `delta` to the size selected by `target` and returns the new size.
pub fn apply_scale(ais: &mut AIStore, target: ScaleTarget, delta: i32) -> Result<i32> {
    let (current, field) = match target {
        ScaleTarget::Cluster => {
            let size = ais
                .spec
                .size
                .ok_or_else(|| Error::incompatible_spec("cluster-wide `size` is not set"))?;
            (size, &mut ais.spec.size)
        }
        ScaleTarget::Role(role) => {
            let size = ais.effective_size(role);
            let field = match role {
                Role::Proxy => &mut ais.spec.proxy_spec.size,
                Role::Target => &mut ais.spec.target_spec.daemon.size,
            };
            (size, field)
        }
    };

    let size = current + delta;
    if size < 0 {
        return Err(Error::incompatible_spec(format!(
            "cannot scale {target} from {current} by {delta}"
        )));
    }
    *field = Some(size);
    Ok(size)
}

pub fn apply_shutdown(ais: &mut AIStore, shutdown: bool) {
    ais.spec.shutdown_cluster = Some(shutdown);
}

pub fn apply_upgrade(ais: &mut AIStore, node_image: Option<&str>, init_image: Option<&str>) {
    if let Some(image) = node_image {
        ais.spec.node_image = image.to_string();
    }
    if let Some(image) = init_image {
        ais.spec.init_image = image.to_string();
    }
}

/// Shifts every port of both roles by the same `offset`.
///
/// A zero or absent host port stays as is. Nothing changes when any shifted
/// port would leave the valid range.
pub fn apply_host_port_offset(ais: &mut AIStore, offset: i32) -> Result<()> {
    let mut proxy = ais.spec.proxy_spec.clone();
    let mut target = ais.spec.target_spec.daemon.clone();
    shift_daemon_ports(&mut proxy, offset)?;
    shift_daemon_ports(&mut target, offset)?;
    ais.spec.proxy_spec = proxy;
    ais.spec.target_spec.daemon = target;
    Ok(())
}

fn shift_daemon_ports(daemon: &mut DaemonSpec, offset: i32) -> Result<()> {
    for port in [
        &mut daemon.service_port,
        &mut daemon.public_port,
        &mut daemon.intra_control_port,
        &mut daemon.intra_data_port,
    ] {
        let number = port_number(port)
            .ok_or_else(|| Error::incompatible_spec(format!("port {port:?} is not numeric")))?;
        *port = IntOrString::Int(shifted(number, offset)?);
    }
    if let Some(host_port) = daemon.host_port.as_mut().filter(|p| **p != 0) {
        *host_port = shifted(*host_port, offset)?;
    }
    Ok(())
}

fn shifted(port: i32, offset: i32) -> Result<i32> {
    port.checked_add(offset)
        .filter(|p| (1..=65535).contains(p))
        .ok_or_else(|| Error::incompatible_spec(format!("port {port} shifted by {offset} is out of range")))
}

fn reports_state(ais: &AIStore, state: ClusterState, generation: Option<i64>) -> bool {
    let Some(status) = ais.status.as_ref() else {
        return false;
    };
    let caught_up = match (generation, status.observed_generation) {
        (None, _) => true,
        (Some(wanted), Some(observed)) => observed >= wanted,
        (Some(_), None) => false,
    };
    caught_up && status.state == Some(state)
}

/// Runs intents against one `AIStore`.
pub struct ClusterOperations {
    api: Api<AIStore>,
    pods: Api<Pod>,
    name: String,
}

impl ClusterOperations {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }

    /// Reads, edits and replaces the document, retrying on write conflicts.
    async fn mutate<F>(&self, mut change: F) -> Result<AIStore>
    where
        F: FnMut(&mut AIStore) -> Result<()>,
    {
        for attempt in 1..=CONFLICT_RETRIES {
            let mut ais = self
                .api
                .get(&self.name)
                .await
                .map_err(|e| Error::kube(ErrorReason::ResourceFetch, e))?;
            change(&mut ais)?;

            match self.api.replace(&self.name, &PostParams::default(), &ais).await {
                Ok(updated) => return Ok(updated),
                Err(e) => {
                    let error = Error::kube(ErrorReason::ResourceUpdate, e);
                    if !error.is_conflict() {
                        return Err(error);
                    }
                    warn!(cluster = %self.name, attempt, "write conflict, retrying with a fresh read");
                }
            }
        }
        Err(Error::categorize(
            ErrorReason::ResourceUpdate,
            StdError::Conflict(format!("{} kept changing, gave up after {CONFLICT_RETRIES} attempts", self.name)),
        ))
    }

    pub async fn scale(&self, target: ScaleTarget, delta: i32) -> Result<AIStore> {
        let updated = self
            .mutate(|ais| apply_scale(ais, target, delta).map(|_| ()))
            .await?;
        info!(
            cluster = %self.name,
            %target,
            proxies = updated.proxy_size(),
            targets = updated.target_size(),
            "scaled"
        );
        Ok(updated)
    }

    pub async fn shutdown(&self) -> Result<AIStore> {
        let updated = self
            .mutate(|ais| {
                apply_shutdown(ais, true);
                Ok(())
            })
            .await?;
        info!(cluster = %self.name, "shutdown requested");
        Ok(updated)
    }

    pub async fn resume(&self) -> Result<AIStore> {
        let updated = self
            .mutate(|ais| {
                apply_shutdown(ais, false);
                Ok(())
            })
            .await?;
        info!(cluster = %self.name, "resume requested");
        Ok(updated)
    }

    /// Swaps images. The stateful sets roll the pods over on their own.
    pub async fn upgrade(&self, node_image: Option<&str>, init_image: Option<&str>) -> Result<AIStore> {
        let updated = self
            .mutate(|ais| {
                apply_upgrade(ais, node_image, init_image);
                Ok(())
            })
            .await?;
        info!(cluster = %self.name, node_image = %updated.spec.node_image, "upgrade requested");
        Ok(updated)
    }

    /// Waits until the controller reports `state` for at least `generation`
    /// of the spec. A state derived from an older spec does not count.
    pub async fn wait_for_state(
        &self,
        state: ClusterState,
        generation: Option<i64>,
        policy: &RetryPolicy,
    ) -> Result<AIStore> {
        let api = &self.api;
        let name = self.name.as_str();
        let outcome = poll_until(policy, "cluster state", move || async move {
            let ais = api
                .get(name)
                .await
                .map_err(|e| Error::kube(ErrorReason::ResourceFetch, e))?;
            Ok(reports_state(&ais, state, generation).then_some(ais))
        })
        .await;
        self.converged(outcome, &format!("state {state}"))
    }

    /// Waits for `Ready` on the spec generation of `updated`, the document an
    /// intent returned.
    pub async fn wait_for_ready(&self, updated: &AIStore, policy: &RetryPolicy) -> Result<AIStore> {
        self.wait_for_state(ClusterState::Ready, updated.metadata.generation, policy)
            .await
    }

    /// Waits until exactly `expected` pods of the cluster exist.
    pub async fn wait_for_pods(&self, expected: usize, policy: &RetryPolicy) -> Result<usize> {
        let ais = self
            .api
            .get(&self.name)
            .await
            .map_err(|e| Error::kube(ErrorReason::ResourceFetch, e))?;
        let params = ListParams::default().labels(&instance_selector(&ais));
        let pods = &self.pods;
        let params = &params;
        let outcome = poll_until(policy, "pod count", move || async move {
            let count = pods
                .list(params)
                .await
                .map_err(|e| Error::kube(ErrorReason::ResourceFetch, e))?
                .items
                .len();
            Ok((count == expected).then_some(count))
        })
        .await;
        self.converged(outcome, &format!("{expected} pods"))
    }

    fn converged<T>(&self, outcome: PollOutcome<T>, goal: &str) -> Result<T> {
        match outcome {
            PollOutcome::Converged(value) => Ok(value),
            PollOutcome::TimedOut => Err(Error::categorize(
                ErrorReason::ResourceFetch,
                StdError::Timeout(format!("{} did not reach {goal}", self.name)),
            )),
            PollOutcome::Failed(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::aistore;
    use http::{Method, Request, Response, StatusCode};
    use kube::client::Body;
    use serde_json::json;

    #[test]
    fn scaling_a_role_overrides_only_that_role() {
        let mut ais = aistore("demo", 3);
        assert_eq!(ais.target_size(), 3);

        let size = apply_scale(&mut ais, ScaleTarget::Role(Role::Target), 2).unwrap();
        assert_eq!(size, 5);
        assert_eq!(ais.target_size(), 5);
        assert_eq!(ais.proxy_size(), 3);
        assert_eq!(ais.spec.size, Some(3));

        let new_targets: Vec<_> = (3..ais.target_size())
            .map(|i| ais.pod_name(Role::Target, i))
            .collect();
        assert_eq!(new_targets, vec!["demo-target-3", "demo-target-4"]);
    }

    #[test]
    fn cluster_scale_moves_both_roles_without_overrides() {
        let mut ais = aistore("demo", 3);
        apply_scale(&mut ais, ScaleTarget::Cluster, -1).unwrap();
        assert_eq!((ais.proxy_size(), ais.target_size()), (2, 2));

        let err = apply_scale(&mut ais, ScaleTarget::Cluster, -3).unwrap_err();
        assert_eq!(err.reason(), ErrorReason::IncompatibleSpec);
        assert_eq!(ais.spec.size, Some(2));
    }

    #[test]
    fn shutdown_keeps_sizes() {
        let mut ais = aistore("demo", 3);
        apply_shutdown(&mut ais, true);
        assert!(ais.should_shutdown());
        assert_eq!(ais.target_size(), 3);
        apply_shutdown(&mut ais, false);
        assert!(!ais.should_shutdown());
    }

    #[test]
    fn upgrade_swaps_only_given_images() {
        let mut ais = aistore("demo", 1);
        apply_upgrade(&mut ais, Some("aistorage/aisnode:v3.29"), None);
        assert_eq!(ais.spec.node_image, "aistorage/aisnode:v3.29");
        assert_eq!(ais.spec.init_image, "aistorage/ais-init:v3.28");
    }

    #[test]
    fn host_port_offset_moves_all_ports_together() {
        let mut ais = aistore("demo", 1);
        ais.spec.target_spec.daemon.host_port = Some(51081);
        ais.spec.target_spec.daemon.public_port = IntOrString::Int(51080);

        apply_host_port_offset(&mut ais, 10).unwrap();

        let target = &ais.spec.target_spec.daemon;
        assert_eq!(target.host_port, Some(51091));
        assert_eq!(target.public_port, IntOrString::Int(51090));
        assert_eq!(target.intra_control_port, IntOrString::Int(51092));
        assert_eq!(target.intra_data_port, IntOrString::Int(51093));
        assert_eq!(ais.spec.proxy_spec.public_port, IntOrString::Int(51090));
        assert_eq!(ais.spec.proxy_spec.host_port, None);
    }

    #[test]
    fn host_port_offset_out_of_range_changes_nothing() {
        let mut ais = aistore("demo", 1);
        ais.spec.target_spec.daemon.host_port = Some(65530);
        let before = ais.spec.clone();

        let err = apply_host_port_offset(&mut ais, 10).unwrap_err();
        assert_eq!(err.reason(), ErrorReason::IncompatibleSpec);
        assert!(apply_host_port_offset(&mut ais, i32::MAX).is_err());
        assert_eq!(ais.spec, before);
    }

    #[test]
    fn state_counts_only_for_the_awaited_generation() {
        let mut ais = aistore("demo", 1);
        ais.metadata.generation = Some(2);
        assert!(!reports_state(&ais, ClusterState::Ready, Some(2)));

        let status = ais.status.get_or_insert_with(Default::default);
        status.state = Some(ClusterState::Ready);
        status.observed_generation = Some(1);
        assert!(!reports_state(&ais, ClusterState::Ready, Some(2)));
        assert!(reports_state(&ais, ClusterState::Ready, None));

        ais.status.as_mut().unwrap().observed_generation = Some(2);
        assert!(reports_state(&ais, ClusterState::Ready, Some(2)));
        assert!(!reports_state(&ais, ClusterState::Shutdown, Some(2)));
    }

    #[tokio::test]
    async fn scale_retries_after_a_conflict() {
        let (mock_service, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "ais");
        let stored = serde_json::to_vec(&aistore("demo", 3)).unwrap();

        let server = tokio::spawn(async move {
            for conflict in [true, false] {
                let (request, send) = handle.next_request().await.expect("service not called");
                assert_eq!(request.method(), Method::GET);
                assert_eq!(
                    request.uri().path(),
                    "/apis/ais.nvidia.com/v1beta1/namespaces/ais/aistores/demo"
                );
                send.send_response(Response::builder().body(Body::from(stored.clone())).unwrap());

                let (request, send) = handle.next_request().await.expect("service not called");
                assert_eq!(request.method(), Method::PUT);
                if conflict {
                    let status = json!({
                        "kind": "Status",
                        "apiVersion": "v1",
                        "metadata": {},
                        "status": "Failure",
                        "message": "the object has been modified",
                        "reason": "Conflict",
                        "code": 409,
                    });
                    send.send_response(
                        Response::builder()
                            .status(StatusCode::CONFLICT)
                            .body(Body::from(serde_json::to_vec(&status).unwrap()))
                            .unwrap(),
                    );
                } else {
                    let body = request.into_body().collect_bytes().await.unwrap();
                    let sent: AIStore = serde_json::from_slice(&body).unwrap();
                    assert_eq!(sent.spec.target_spec.daemon.size, Some(5));
                    send.send_response(Response::builder().body(Body::from(body.to_vec())).unwrap());
                }
            }
        });

        let ops = ClusterOperations::new(client, "ais", "demo");
        let updated = ops.scale(ScaleTarget::Role(Role::Target), 2).await.unwrap();
        assert_eq!(updated.target_size(), 5);
        assert_eq!(updated.proxy_size(), 3);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_ready_ignores_state_of_an_older_generation() {
        let (mock_service, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "ais");

        let mut scaled = aistore("demo", 3);
        scaled.metadata.generation = Some(2);
        let documents: Vec<Vec<u8>> = [1, 2]
            .into_iter()
            .map(|observed| {
                let mut ais = scaled.clone();
                let status = ais.status.get_or_insert_with(Default::default);
                status.state = Some(ClusterState::Ready);
                status.observed_generation = Some(observed);
                serde_json::to_vec(&ais).unwrap()
            })
            .collect();

        let server = tokio::spawn(async move {
            for body in documents {
                let (request, send) = handle.next_request().await.expect("service not called");
                assert_eq!(request.method(), Method::GET);
                send.send_response(Response::builder().body(Body::from(body)).unwrap());
            }
        });

        let policy = RetryPolicy {
            max_attempts: 5,
            interval: std::time::Duration::from_millis(1),
            timeout: std::time::Duration::from_secs(5),
        };
        let ops = ClusterOperations::new(client, "ais", "demo");
        let ready = ops.wait_for_ready(&scaled, &policy).await.unwrap();
        assert_eq!(ready.status.unwrap().observed_generation, Some(2));
        server.await.unwrap();
    }

    #[test]
    fn scale_targets_parse() {
        assert_eq!("cluster".parse(), Ok(ScaleTarget::Cluster));
        assert_eq!("target".parse(), Ok(ScaleTarget::Role(Role::Target)));
        assert!("gateway".parse::<ScaleTarget>().is_err());
    }
}
