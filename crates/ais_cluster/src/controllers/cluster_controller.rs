use crate::api::v1beta1::aistore::{AIStore, AIStoreStatus, ClusterState, AISTORE_FINALIZER};
use crate::api::v1beta1::Role;
use crate::controllers::membership::{wait_for_membership, HttpMembershipClient, MembershipClient};
use crate::controllers::plan::{apply_failure_reason, diff, Plan};
use crate::controllers::state_machine::{
    failure_state, next_state, primary_ready, workload_gate, Observation, WorkloadStatus,
};
use crate::resources::validation::validate;
use crate::resources::{
    desired_objects, instance_selector, ResourceKind, ResourceRegistry, WorkloadGate, LABEL_MANAGED_BY,
    MANAGED_BY,
};
use crate::util::cluster_status::{ClusterStatusManager, ConditionTracker, CREATED_CONDITION, READY_CONDITION};
use crate::util::errors::{self, Error, ErrorReason, ErrorWithRequeue, Result, StdError};
use crate::util::retry::backoff_delay;
use crate::util::settings::ControllerSettings;
use crate::util::status::is_status_condition_true;
use crate::util::metrics;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service},
};
use kube::{
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        finalizer::{finalizer, Event as Finalizer},
        watcher::{self, Config},
    },
    Resource,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::*;

pub const FIELD_MANAGER: &str = "ais-cluster-controller";

/// Load balancer services as seen before this loop applied anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LoadBalancers {
    missing: bool,
    ready: bool,
}

impl AIStore {
    // Reconcile (for non-finalizer related changes)
    pub async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let status_manager = ClusterStatusManager::new(&ctx.client, self)?;
        let mut status = self.status.clone().unwrap_or_default();
        let previous = status.state;

        let outcome = self.converge(&ctx, &mut status).await;

        let settings = &ctx.settings;
        let mut tracker = ConditionTracker::new(&mut status, self.metadata.generation);
        let action = match outcome {
            Ok(state) => {
                tracker.set_state(state);
                tracker.set_success();
                if state == ClusterState::Ready {
                    Action::requeue(settings.requeue_ready)
                } else {
                    Action::requeue(settings.requeue_converging)
                }
            }
            Err(e) => {
                let errors = tracker.increment_error_count();
                tracker.set_error(&e);
                ctx.metrics.reconcile_failure(self, &e);
                warn!(cluster = %self.name_any(), errors, reason = %e.reason(), "reconcile failed: {}", e);

                if let Some(state) = failure_state(e.reason(), errors, settings.failure_threshold) {
                    tracker.set_state(state);
                }
                if e.reason().is_transient() {
                    let delay = e
                        .requeue_after()
                        .unwrap_or_else(|| backoff_delay(errors, settings.backoff_base, settings.backoff_max));
                    Action::requeue(delay)
                } else {
                    Action::await_change()
                }
            }
        };
        let current = tracker.state();

        status_manager.persist(self, &status).await?;
        if current != previous {
            self.publish_transition(&ctx, previous, current).await;
        }
        Ok(action)
    }

    /// One pass of observe, diff, apply and state evaluation.
    async fn converge(&self, ctx: &Context, status: &mut AIStoreStatus) -> Result<ClusterState> {
        validate(self)?;
        let ns = self.namespace().ok_or_else(|| {
            Error::StdError(StdError::MetadataMissing("AIStore without namespace".to_string()))
        })?;
        let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &ns);

        let lb = if self.spec.enable_external_lb {
            self.load_balancers(&ctx.client, &ns).await?
        } else {
            LoadBalancers {
                missing: false,
                ready: true,
            }
        };
        let proxy = fetch_statefulset(&statefulsets, &self.statefulset_name(Role::Proxy)).await?;
        let created = is_status_condition_true(&status.conditions, CREATED_CONDITION);
        let gate = workload_gate(self, created, primary_ready(proxy.as_ref()), lb.ready);

        let desired = desired_objects(self, gate)?;
        let observed = self.observe(ctx, &ns).await?;
        let plan = diff(desired, &observed);
        let changes_applied = !plan.is_empty();
        self.apply(ctx, &ns, plan, gate).await?;

        let proxy = fetch_statefulset(&statefulsets, &self.statefulset_name(Role::Proxy)).await?;
        let target = fetch_statefulset(&statefulsets, &self.statefulset_name(Role::Target)).await?;
        let workloads = WorkloadStatus::observe(self, proxy.as_ref(), target.as_ref());
        let full = gate == WorkloadGate::Full;

        let mut tracker = ConditionTracker::new(status, self.metadata.generation);
        tracker.set_initialized();
        if full && workloads.submitted {
            tracker.set_created();
        }

        let membership_converged = if full && workloads.ready && !workloads.rolling && !changes_applied {
            wait_for_membership(ctx.membership.as_ref(), self, &ctx.settings.membership).await?;
            true
        } else {
            false
        };

        let observation = Observation {
            shutdown_requested: self.should_shutdown(),
            running_pods: workloads.running,
            external_lb: self.spec.enable_external_lb,
            lb_services_created: lb.missing,
            lb_ingress_ready: lb.ready,
            workloads_submitted: full && workloads.submitted,
            rollout_in_progress: workloads.rolling,
            replicas_ready: workloads.ready,
            changes_applied,
            membership_converged,
        };
        let next = next_state(tracker.state(), &observation);
        debug!(cluster = %self.name_any(), ?observation, %next, "evaluated state");

        if next == ClusterState::Ready {
            tracker.set_ready();
        } else if tracker.is_true(READY_CONDITION) {
            tracker.unset_ready(&next.to_string(), &format!("Cluster is {next}"));
        }
        Ok(next)
    }

    /// Managed objects currently in the namespace, per registered kind.
    async fn observe(&self, ctx: &Context, ns: &str) -> Result<Vec<(ResourceKind, DynamicObject)>> {
        let params = ListParams::default().labels(&instance_selector(self));
        let mut observed = Vec::new();
        for kind in ctx.resources.kinds() {
            let ar = ctx.resources.resource(kind);
            let api: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), ns, &ar);
            let list = api
                .list(&params)
                .await
                .map_err(|e| Error::kube(ErrorReason::ResourceFetch, e))?;
            observed.extend(list.items.into_iter().map(|obj| (kind, obj)));
        }
        Ok(observed)
    }

    /// Creates, then updates, then removals.
    async fn apply(&self, ctx: &Context, ns: &str, plan: Plan, gate: WorkloadGate) -> Result<()> {
        if plan.is_empty() {
            return Ok(());
        }
        info!(
            cluster = %self.name_any(),
            creates = plan.creates.len(),
            updates = plan.updates.len(),
            removals = plan.removals.len(),
            ?gate,
            "applying changes"
        );

        let api = |kind: ResourceKind| -> Api<DynamicObject> {
            Api::namespaced_with(ctx.client.clone(), ns, &ctx.resources.resource(kind))
        };
        let ssapply = PatchParams::apply(FIELD_MANAGER).force();

        for (objects, update) in [(&plan.creates, false), (&plan.updates, true)] {
            for object in objects {
                api(object.kind)
                    .patch(&object.name, &ssapply, &Patch::Apply(&object.object))
                    .await
                    .map_err(|e| Error::kube(apply_failure_reason(object, update), e))?;
                debug!(kind = ?object.kind, name = %object.name, update, "applied");
            }
        }

        for stale in &plan.removals {
            match api(stale.kind).delete(&stale.name, &DeleteParams::default()).await {
                Ok(_) => info!(kind = ?stale.kind, name = %stale.name, "removed stale object"),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(Error::kube(ErrorReason::ResourceUpdate, e)),
            }
        }
        Ok(())
    }

    async fn load_balancers(&self, client: &Client, ns: &str) -> Result<LoadBalancers> {
        let services: Api<Service> = Api::namespaced(client.clone(), ns);
        let mut names = vec![self.proxy_lb_service_name()];
        names.extend((0..self.target_size()).map(|i| self.target_lb_service_name(i)));

        let mut lb = LoadBalancers {
            missing: false,
            ready: true,
        };
        for name in names {
            let service = services
                .get_opt(&name)
                .await
                .map_err(|e| Error::kube(ErrorReason::ResourceFetch, e))?;
            match service {
                None => {
                    lb.missing = true;
                    lb.ready = false;
                }
                Some(svc) => lb.ready &= has_ingress(&svc),
            }
        }
        Ok(lb)
    }

    async fn publish_transition(&self, ctx: &Context, from: Option<ClusterState>, to: Option<ClusterState>) {
        let Some(to) = to else { return };
        let from = from.map_or_else(|| "None".to_string(), |s| s.to_string());
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
        let event = Event {
            type_: if to == ClusterState::Failed {
                EventType::Warning
            } else {
                EventType::Normal
            },
            reason: "StateChanged".into(),
            note: Some(format!("{from} -> {to}")),
            action: "Reconciling".into(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&event, &self.object_ref(&())).await {
            warn!("failed to publish event for {}: {}", self.name_any(), e);
        }
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
        recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: "DeleteRequested".into(),
                    note: Some(format!("Delete `{}`", self.name_any())),
                    action: "Deleting".into(),
                    secondary: None,
                },
                &self.object_ref(&()),
            )
            .await
            .map_err(|e| Error::kube(ErrorReason::InstanceDeletion, e))?;

        let ns = self.namespace().ok_or_else(|| {
            Error::StdError(StdError::MetadataMissing("AIStore without namespace".to_string()))
        })?;
        let statefulsets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &ns);
        let scale_down = Patch::Merge(json!({ "spec": { "replicas": 0 } }));
        for role in Role::ALL {
            match statefulsets
                .patch(&self.statefulset_name(role), &PatchParams::default(), &scale_down)
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(Error::kube(ErrorReason::InstanceDeletion, e)),
            }
        }

        let selector = ListParams::default().labels(&instance_selector(self));
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
        let running = pods
            .list(&selector)
            .await
            .map_err(|e| Error::kube(ErrorReason::InstanceDeletion, e))?
            .items
            .len();
        if running > 0 {
            info!("Waiting for {} pods of {} to exit", running, self.name_any());
            return Err(Error::ErrorWithRequeue(ErrorWithRequeue::new(
                StdError::Timeout(format!("{running} pods still running")),
                ctx.settings.requeue_converging,
            )));
        }

        if self.should_cleanup_data() {
            let claims: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &ns);
            claims
                .delete_collection(&DeleteParams::default(), &selector)
                .await
                .map_err(|e| Error::kube(ErrorReason::InstanceDeletion, e))?;
            info!("Deleted volume claims of {}", self.name_any());
        }
        Ok(Action::await_change())
    }
}

fn has_ingress(service: &Service) -> bool {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .is_some_and(|ingress| ingress.iter().any(|i| i.ip.is_some() || i.hostname.is_some()))
}

async fn fetch_statefulset(api: &Api<StatefulSet>, name: &str) -> Result<Option<StatefulSet>> {
    api.get_opt(name)
        .await
        .map_err(|e| Error::kube(ErrorReason::ResourceFetch, e))
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    /// Managed resource kinds
    resources: Arc<ResourceRegistry>,
    settings: ControllerSettings,
}

impl Default for State {
    fn default() -> Self {
        Self::new(ControllerSettings::default())
    }
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(settings: ControllerSettings) -> Self {
        Self {
            diagnostics: Arc::default(),
            registry: prometheus::Registry::default(),
            resources: Arc::new(ResourceRegistry::new()),
            settings,
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client) -> Result<Arc<Context>> {
        let membership = HttpMembershipClient::new(self.settings.insecure_skip_verify)?;
        self.context_with(client, Arc::new(membership))
    }

    /// Context using the given membership client.
    pub fn context_with(&self, client: Client, membership: Arc<dyn MembershipClient>) -> Result<Arc<Context>> {
        let metrics = metrics::Metrics::new()
            .and_then(|m| m.register(&self.registry))
            .map_err(|e| Error::StdError(StdError::MetricsError(e)))?;
        Ok(Arc::new(Context {
            client,
            metrics,
            diagnostics: self.diagnostics.clone(),
            resources: self.resources.clone(),
            membership,
            settings: self.settings.clone(),
        }))
    }
}

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: metrics::Metrics,
    pub resources: Arc<ResourceRegistry>,
    pub membership: Arc<dyn MembershipClient>,
    pub settings: ControllerSettings,
}

pub async fn reconcile(ais: Arc<AIStore>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure(&ais.name_any());
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = ais.namespace().ok_or_else(|| {
        Error::StdError(StdError::MetadataMissing("AIStore without namespace".to_string()))
    })?;
    let clusters: Api<AIStore> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling AIStore \"{}\" in {}", ais.name_any(), ns);
    finalizer(&clusters, AISTORE_FINALIZER, ais, |event| async {
        match event {
            Finalizer::Apply(ais) => ais.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(ais) => ais.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::StdError(StdError::FinalizerError(Box::new(e))))
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: MANAGED_BY.into(),
        }
    }
}
impl Diagnostics {
    fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

fn error_policy(ais: Arc<AIStore>, error: &errors::Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&ais, error);
    Action::requeue(error.requeue_after().unwrap_or(ctx.settings.backoff_base))
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State) -> Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

    let clusters = Api::<AIStore>::all(client.clone());
    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        return Err(Error::StdError(StdError::KubeError(e)));
    }

    let ctx = state.to_context(client.clone())?;
    let owned = watcher::Config::default().labels(&format!("{LABEL_MANAGED_BY}={MANAGED_BY}"));
    Controller::new(clusters, Config::default().any_semantic())
        .owns(Api::<StatefulSet>::all(client.clone()), owned.clone())
        .owns(Api::<Service>::all(client.clone()), owned.clone())
        .owns(Api::<ConfigMap>::all(client.clone()), owned)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
    Ok(())
}
