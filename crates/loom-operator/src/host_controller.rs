//! LoomHostController controller
//!
//! The host controller owns the runtime store lifecycle for the hosts that
//! select it and the workloads serving them: the server Deployment and
//! Service, the Ingress routing every selected hostname, and one Deployment
//! per required non-default backend. Store entries are created here and torn
//! down before the finalizer is released, which is what the page, utility
//! page, host, and translation reconcilers wait for.

use crate::conditions;
use crate::crd::{LoomHost, LoomHostController};
use crate::error::{Error, Result};
use crate::resources::WorkloadBuilder;
use crate::status::{patch_status, preserve_first_error};
use crate::store::RuntimeStore;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Finalizer name for host-controller cleanup
pub const HOST_CONTROLLER_FINALIZER: &str = "loom.dev/host-controller-finalizer";

/// Field manager for server-side apply
const FIELD_MANAGER: &str = "loom-operator";

/// Requeue interval for successful reconciliations
const DEFAULT_REQUEUE_SECONDS: u64 = 300;

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Context passed to the host-controller controller
pub struct HostControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Per-host runtime state store
    pub runtime: RuntimeStore,
    /// Metrics recorder
    pub metrics: Option<HostControllerMetrics>,
    /// Per-controller error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
}

/// Metrics for the host-controller controller
#[derive(Clone)]
pub struct HostControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
    /// Gauge for hosts currently present in the runtime store
    pub hosts_total: metrics::Gauge,
}

impl HostControllerMetrics {
    /// Create new host-controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("loom_host_controller_reconciliations_total"),
            errors: metrics::counter!("loom_host_controller_reconciliation_errors_total"),
            duration: metrics::histogram!("loom_host_controller_reconciliation_duration_seconds"),
            hosts_total: metrics::gauge!("loom_runtime_hosts_total"),
        }
    }
}

impl Default for HostControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the LoomHostController controller
pub async fn run_host_controller_controller(
    client: Client,
    namespace: Option<String>,
    runtime: RuntimeStore,
) -> Result<()> {
    let controllers: Api<LoomHostController> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(HostControllerContext {
        client: client.clone(),
        runtime,
        metrics: Some(HostControllerMetrics::new()),
        error_counts: dashmap::DashMap::new(),
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting LoomHostController controller"
    );

    let hosts: Api<LoomHost> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let deployments: Api<Deployment> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let services: Api<Service> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    Controller::new(controllers.clone(), Config::default())
        .owns(deployments, Config::default())
        .owns(services, Config::default())
        .watches(hosts, Config::default(), |host: LoomHost| {
            // A host change re-triggers the controller it selects
            let namespace = host.namespace();
            let mut target =
                ObjectRef::<LoomHostController>::new(&host.spec.controller_ref.name);
            if let Some(ns) = namespace {
                target = target.within(&ns);
            }
            vec![target]
        })
        .run(reconcile_host_controller, host_controller_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Host controller reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Host controller reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function for LoomHostController
#[instrument(skip(controller, ctx), fields(name = %controller.name_any(), namespace = controller.namespace()))]
async fn reconcile_host_controller(
    controller: Arc<LoomHostController>,
    ctx: Arc<HostControllerContext>,
) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = controller
        .namespace()
        .unwrap_or_else(|| "default".to_string());
    let name = controller.name_any();
    let controllers: Api<LoomHostController> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(
        &controllers,
        HOST_CONTROLLER_FINALIZER,
        controller,
        |event| async {
            match event {
                FinalizerEvent::Apply(controller) => {
                    apply_host_controller(controller, ctx.clone()).await
                }
                FinalizerEvent::Cleanup(controller) => {
                    cleanup_host_controller(controller, ctx.clone()).await
                }
            }
        },
    )
    .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
        metrics
            .hosts_total
            .set(ctx.runtime.host_names().len() as f64);
    }

    if result.is_ok() {
        ctx.error_counts.remove(&name);
    }

    result.map_err(|e| {
        if let Some(ref metrics) = ctx.metrics {
            metrics.errors.increment(1);
        }
        Error::ReconcileFailed(e.to_string())
    })
}

/// Create/update runtime store entries and workloads
#[instrument(skip(controller, ctx))]
async fn apply_host_controller(
    controller: Arc<LoomHostController>,
    ctx: Arc<HostControllerContext>,
) -> Result<Action> {
    let name = controller.name_any();
    let namespace = controller
        .namespace()
        .unwrap_or_else(|| "default".to_string());
    let generation = controller.metadata.generation.unwrap_or(0);
    let controllers: Api<LoomHostController> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(name = %name, namespace = %namespace, "Reconciling LoomHostController");

    if let Err(errors) = controller.spec.validate() {
        let error_messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter()
                    .map(move |e| format!("{}: {:?}", field, e.message))
            })
            .collect();
        let error_msg = error_messages.join("; ");
        warn!(name = %name, errors = %error_msg, "Host controller spec validation failed");

        let status = conditions::build_status(
            conditions::degraded(controller.status.as_ref(), "InvalidSpec", &error_msg),
            generation,
            BTreeMap::new(),
        );
        let write = patch_status(&controllers, &name, &status).await;
        return preserve_first_error(Err(Error::InvalidSpec(error_msg)), write);
    }

    // Which hosts select this controller
    let hosts_api: Api<LoomHost> = Api::namespaced(ctx.client.clone(), &namespace);
    let hosts = hosts_api.list(&ListParams::default()).await?;
    let hostnames = hostnames_selecting(hosts.items.iter(), &name);

    // Create or refresh the runtime entry for every selected host; drop the
    // entries for hosts that no longer select this controller.
    for hostname in &hostnames {
        ctx.runtime
            .ensure_host(hostname, &namespace, &name, &controller.spec.server_image);
    }
    for stale in ctx.runtime.hosts_for_controller(&namespace, &name) {
        if !hostnames.contains(&stale) {
            info!(name = %name, host = %stale, "Removing host from runtime store");
            ctx.runtime.remove(&stale);
        }
    }

    // Materialize the workloads
    let builder = WorkloadBuilder::new(&controller)?;

    let deployment = builder.build_deployment();
    apply_deployment(&ctx.client, &namespace, deployment).await?;

    let service = builder.build_service();
    apply_service(&ctx.client, &namespace, service).await?;

    if let Some(ingress) = builder.build_ingress(&hostnames) {
        apply_ingress(&ctx.client, &namespace, ingress).await?;
    }

    // One Deployment per required non-default backend, pruning the ones no
    // longer required
    let mut required = BTreeSet::new();
    for hostname in &hostnames {
        if let Some(handler) = ctx.runtime.get(hostname) {
            for backend in handler.required_backends() {
                if required.insert(backend.name.clone()) {
                    let deployment = builder.build_backend_deployment(&backend);
                    apply_deployment(&ctx.client, &namespace, deployment).await?;
                }
            }
        }
    }
    prune_backend_deployments(&ctx.client, &namespace, &name, &required).await;

    let mut attributes = BTreeMap::new();
    attributes.insert("hosts".to_string(), hostnames.len().to_string());
    attributes.insert("backends".to_string(), required.len().to_string());

    let status = conditions::build_status(
        conditions::ready(
            controller.status.as_ref(),
            &format!("serving {} hosts", hostnames.len()),
        ),
        generation,
        attributes,
    );
    let write = patch_status(&controllers, &name, &status).await;

    info!(name = %name, hosts = hostnames.len(), "Host controller reconciliation complete");

    preserve_first_error(
        Ok(Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS))),
        write,
    )
}

/// Hostnames of the hosts selecting the given controller
fn hostnames_selecting<'a>(
    hosts: impl Iterator<Item = &'a LoomHost>,
    controller: &str,
) -> Vec<String> {
    let mut hostnames: Vec<String> = hosts
        .filter(|h| h.spec.controller_ref.name == controller)
        .map(|h| h.spec.hostname.clone())
        .collect();
    hostnames.sort();
    hostnames.dedup();
    hostnames
}

/// Tear down the runtime entries before the finalizer is released
///
/// Workloads carry owner references and are garbage-collected by the
/// cluster.
#[instrument(skip(controller, ctx))]
async fn cleanup_host_controller(
    controller: Arc<LoomHostController>,
    ctx: Arc<HostControllerContext>,
) -> Result<Action> {
    let name = controller.name_any();
    let namespace = controller
        .namespace()
        .unwrap_or_else(|| "default".to_string());

    info!(name = %name, namespace = %namespace, "Cleaning up LoomHostController");

    for hostname in ctx.runtime.hosts_for_controller(&namespace, &name) {
        info!(name = %name, host = %hostname, "Removing host from runtime store");
        ctx.runtime.remove(&hostname);
    }

    info!(name = %name, "Cleanup complete");

    Ok(Action::await_change())
}

/// Verify the operator still owns a resource before force-applying.
///
/// An existing resource managed by a different controller (Helm, another
/// operator) is never force-applied over.
fn verify_ownership<K: Resource>(existing: &K) -> Result<()> {
    let labels = existing.meta().labels.as_ref();
    let managed_by = labels.and_then(|l| l.get("app.kubernetes.io/managed-by"));
    match managed_by {
        Some(manager) if manager != FIELD_MANAGER => {
            let name = existing.meta().name.as_deref().unwrap_or("<unknown>");
            Err(Error::InvalidSpec(format!(
                "resource '{}' is managed by '{}', not {}; \
                 refusing to force-apply to avoid ownership conflict",
                name, manager, FIELD_MANAGER
            )))
        }
        _ => Ok(()),
    }
}

/// Apply a Deployment using server-side apply
async fn apply_deployment(client: &Client, namespace: &str, deployment: Deployment) -> Result<()> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let name = deployment
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| Error::InvalidSpec("Deployment missing metadata.name".into()))?;

    debug!(name = %name, "Applying Deployment");

    if let Ok(existing) = api.get(name).await {
        verify_ownership(&existing)?;
    }

    let patch_params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(name, &patch_params, &Patch::Apply(&deployment))
        .await
        .map_err(Error::from)?;

    Ok(())
}

/// Apply a Service using server-side apply
async fn apply_service(client: &Client, namespace: &str, service: Service) -> Result<()> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let name = service
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| Error::InvalidSpec("Service missing metadata.name".into()))?;

    debug!(name = %name, "Applying Service");

    if let Ok(existing) = api.get(name).await {
        verify_ownership(&existing)?;
    }

    let patch_params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(name, &patch_params, &Patch::Apply(&service))
        .await
        .map_err(Error::from)?;

    Ok(())
}

/// Apply an Ingress using server-side apply
async fn apply_ingress(client: &Client, namespace: &str, ingress: Ingress) -> Result<()> {
    let api: Api<Ingress> = Api::namespaced(client.clone(), namespace);
    let name = ingress
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| Error::InvalidSpec("Ingress missing metadata.name".into()))?;

    debug!(name = %name, "Applying Ingress");

    if let Ok(existing) = api.get(name).await {
        verify_ownership(&existing)?;
    }

    let patch_params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(name, &patch_params, &Patch::Apply(&ingress))
        .await
        .map_err(Error::from)?;

    Ok(())
}

/// Delete backend Deployments that are no longer required
///
/// Failures are logged, not propagated: the next pass (or the periodic
/// resync) retries.
async fn prune_backend_deployments(
    client: &Client,
    namespace: &str,
    controller: &str,
    required: &BTreeSet<String>,
) {
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(&format!(
        "app.kubernetes.io/managed-by={},app.kubernetes.io/component=backend,app.kubernetes.io/instance={}",
        FIELD_MANAGER, controller
    ));

    let deployments = match api.list(&lp).await {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, "Failed to list backend Deployments for pruning");
            return;
        }
    };

    for deployment in deployments.items {
        let Some(deploy_name) = deployment.metadata.name.as_deref() else {
            continue;
        };
        let backend_name = deploy_name.strip_prefix("loom-backend-").unwrap_or(deploy_name);
        if required.contains(backend_name) {
            continue;
        }
        info!(deployment = %deploy_name, "Deleting obsolete backend Deployment");
        if let Err(e) = api.delete(deploy_name, &DeleteParams::default()).await {
            warn!(
                deployment = %deploy_name,
                error = %e,
                "Failed to delete backend Deployment (may have already been removed)"
            );
        }
    }
}

/// Error policy for the host-controller controller: exponential backoff
fn host_controller_error_policy(
    controller: Arc<LoomHostController>,
    error: &Error,
    ctx: Arc<HostControllerContext>,
) -> Action {
    let key = controller.name_any();
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    // 30s → 60s → 120s → 240s → 480s → 600s (capped)
    let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
    let backoff = base * 2u32.saturating_pow((retries - 1).min(5));
    let delay = backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS));

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Host controller reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}
