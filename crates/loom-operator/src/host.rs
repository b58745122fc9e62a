//! LoomHost controller
//!
//! A host's own reconciler installs the host-wide script-library list and
//! the backends those libraries require into the runtime state its host
//! controller created. Until the controller has created the store entry the
//! host reports Degraded with a bounded requeue, the same way a page waits
//! for a missing dependency.

use crate::collect::{backend_for, unique_backend_refs};
use crate::conditions;
use crate::crd::{
    LoomClusterScriptLibrary, LoomHost, LoomHostController, LoomScriptLibrary, RefKind,
};
use crate::error::{Error, Result};
use crate::resolver::{KubeObjectStore, ObjectStore, Resolver};
use crate::router::{self, watch_mapper};
use crate::status::{patch_status, preserve_first_error};
use crate::store::{HostScriptLibrary, RuntimeStore};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Finalizer name for host cleanup
pub const HOST_FINALIZER: &str = "loom.dev/host-finalizer";

/// Requeue interval for successful reconciliations
const DEFAULT_REQUEUE_SECONDS: u64 = 300;

/// Requeue interval for error cases
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Context passed to the host controller
pub struct HostContext {
    /// Kubernetes client
    pub client: Client,
    /// Per-host runtime state store
    pub runtime: RuntimeStore,
    /// Bounded requeue delay for missing dependencies
    pub requeue_delay: Duration,
    /// Metrics recorder
    pub metrics: Option<HostMetrics>,
}

/// Metrics for the host controller
#[derive(Clone)]
pub struct HostMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl HostMetrics {
    /// Create new host controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("loom_host_reconciliations_total"),
            errors: metrics::counter!("loom_host_reconciliation_errors_total"),
            duration: metrics::histogram!("loom_host_reconciliation_duration_seconds"),
        }
    }
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the LoomHost controller
pub async fn run_host_controller(
    client: Client,
    namespace: Option<String>,
    runtime: RuntimeStore,
    requeue_delay: Duration,
) -> Result<()> {
    let hosts: Api<LoomHost> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(HostContext {
        client: client.clone(),
        runtime,
        requeue_delay,
        metrics: Some(HostMetrics::new()),
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting LoomHost controller"
    );

    let controllers: Api<LoomHostController> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let libraries: Api<LoomScriptLibrary> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let controller = Controller::new(hosts.clone(), Config::default());
    let store = controller.store();

    controller
        .watches(
            controllers,
            Config::default(),
            watch_mapper(store.clone(), None, router::HOST_CONTROLLER_REFS),
        )
        .watches(
            libraries,
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::ScriptLibrary),
                router::HOST_SCRIPT_LIBRARY_REFS,
            ),
        )
        .watches(
            Api::<LoomClusterScriptLibrary>::all(client.clone()),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::ClusterScriptLibrary),
                router::HOST_SCRIPT_LIBRARY_REFS,
            ),
        )
        .run(reconcile_host, host_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Host reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Host reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function for LoomHost
#[instrument(skip(host, ctx), fields(name = %host.name_any(), namespace = host.namespace()))]
async fn reconcile_host(host: Arc<LoomHost>, ctx: Arc<HostContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = host.namespace().unwrap_or_else(|| "default".to_string());
    let hosts: Api<LoomHost> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&hosts, HOST_FINALIZER, host, |event| async {
        match event {
            FinalizerEvent::Apply(host) => apply_host(host, ctx.clone()).await,
            FinalizerEvent::Cleanup(host) => cleanup_host(host, ctx.clone()).await,
        }
    })
    .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    result.map_err(|e| {
        if let Some(ref metrics) = ctx.metrics {
            metrics.errors.increment(1);
        }
        Error::ReconcileFailed(e.to_string())
    })
}

/// Resolve the host-wide libraries and install them into the runtime state
#[instrument(skip(host, ctx))]
async fn apply_host(host: Arc<LoomHost>, ctx: Arc<HostContext>) -> Result<Action> {
    let name = host.name_any();
    let namespace = host.namespace().unwrap_or_else(|| "default".to_string());
    let generation = host.metadata.generation.unwrap_or(0);
    let hosts: Api<LoomHost> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(name = %name, namespace = %namespace, hostname = %host.spec.hostname, "Reconciling LoomHost");

    if let Err(errors) = host.spec.validate() {
        let error_messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter()
                    .map(move |e| format!("{}: {:?}", field, e.message))
            })
            .collect();
        let error_msg = error_messages.join("; ");
        warn!(name = %name, errors = %error_msg, "Host spec validation failed");

        let status = conditions::build_status(
            conditions::degraded(host.status.as_ref(), "InvalidSpec", &error_msg),
            generation,
            BTreeMap::new(),
        );
        let write = patch_status(&hosts, &name, &status).await;
        return preserve_first_error(Err(Error::InvalidSpec(error_msg)), write);
    }

    let objects = KubeObjectStore::new(ctx.client.clone());
    let outcome = install_host(&objects, &ctx.runtime, &namespace, &host).await;

    match outcome {
        Ok(attributes) => {
            let status = conditions::build_status(
                conditions::ready(
                    host.status.as_ref(),
                    &format!(
                        "{} script libraries in effect",
                        host.spec.script_library_refs.len()
                    ),
                ),
                generation,
                attributes,
            );
            let write = patch_status(&hosts, &name, &status).await;
            preserve_first_error(
                Ok(Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS))),
                write,
            )
        }
        Err(e) if e.is_recoverable() => {
            debug!(name = %name, error = %e, "Host waiting on a dependency");
            let status = conditions::build_status(
                conditions::degraded(host.status.as_ref(), e.reason(), &e.to_string()),
                generation,
                host.status
                    .as_ref()
                    .map(|s| s.attributes.clone())
                    .unwrap_or_default(),
            );
            let write = patch_status(&hosts, &name, &status).await;
            preserve_first_error(Ok(Action::requeue(ctx.requeue_delay)), write)
        }
        Err(e) => Err(e),
    }
}

/// Resolve every host-wide script library and write the results into the
/// host's runtime state
async fn install_host(
    objects: &dyn ObjectStore,
    runtime: &RuntimeStore,
    namespace: &str,
    host: &LoomHost,
) -> Result<BTreeMap<String, String>> {
    let hostname = &host.spec.hostname;
    let handler = runtime
        .get(hostname)
        .ok_or_else(|| Error::HostNotReady(hostname.clone()))?;
    let default_server_image = handler.default_server_image();

    let mut resolver = Resolver::new(objects, namespace);
    resolver.record("host", hostname.clone());

    let mut libraries = Vec::new();
    let mut backends = Vec::new();
    for reference in &host.spec.script_library_refs {
        let role = format!("library.{}", reference.name);
        // A named reference either resolves or short-circuits the pass
        let Some(library) = resolver.script_library(&role, Some(reference)).await? else {
            continue;
        };

        let kind = if library.namespace.is_some() {
            RefKind::ScriptLibrary
        } else {
            RefKind::ClusterScriptLibrary
        };
        if let Some(backend) = backend_for(
            kind.as_kind(),
            &library.name,
            library.namespace.as_deref().unwrap_or(""),
            library.spec.server_image.as_deref(),
            library.spec.static_image.as_deref(),
            &default_server_image,
        ) {
            backends.push(backend);
        }

        libraries.push(HostScriptLibrary {
            name: library.name,
            scripts: library.spec.scripts,
            package: library.spec.package_ref,
        });
    }

    handler.set_script_libraries(libraries);
    handler.set_host_backends(unique_backend_refs(backends));

    Ok(resolver.into_attributes())
}

/// Drop host-level state before the finalizer is released
///
/// The store entry itself belongs to the host controller; the host's own
/// cleanup only retracts what it installed.
#[instrument(skip(host, ctx))]
async fn cleanup_host(host: Arc<LoomHost>, ctx: Arc<HostContext>) -> Result<Action> {
    let name = host.name_any();

    info!(name = %name, hostname = %host.spec.hostname, "Cleaning up LoomHost");

    if let Some(handler) = ctx.runtime.get(&host.spec.hostname) {
        handler.set_script_libraries(Vec::new());
        handler.set_host_backends(Vec::new());
    }

    Ok(Action::await_change())
}

/// Error policy for the host controller
fn host_error_policy(_host: Arc<LoomHost>, error: &Error, _ctx: Arc<HostContext>) -> Action {
    warn!(error = %error, "Host reconciliation error, will retry");
    Action::requeue(Duration::from_secs(ERROR_REQUEUE_SECONDS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        LocalObjectReference, LoomHostSpec, ScriptDefinition, ScriptLibrarySpec,
        TypedObjectReference,
    };
    use crate::resolver::fake::FakeStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn host(refs: Vec<TypedObjectReference>) -> LoomHost {
        LoomHost {
            metadata: ObjectMeta {
                name: Some("site".to_string()),
                namespace: Some("tenant-a".to_string()),
                ..Default::default()
            },
            spec: LoomHostSpec {
                hostname: "www.example.org".to_string(),
                controller_ref: LocalObjectReference::new("main"),
                script_library_refs: refs,
                title_prefix: None,
                default_language: "en".to_string(),
            },
            status: None,
        }
    }

    #[tokio::test]
    async fn test_install_host_requires_store_entry() {
        let objects = FakeStore::new();
        let runtime = RuntimeStore::new();

        let err = install_host(&objects, &runtime, "tenant-a", &host(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HostNotReady(_)));
    }

    #[tokio::test]
    async fn test_install_host_writes_libraries_and_backends() {
        let objects = FakeStore::new();
        objects.put_library(
            RefKind::ScriptLibrary,
            Some("tenant-a"),
            "base",
            ScriptLibrarySpec {
                scripts: vec![ScriptDefinition {
                    tag: "script".to_string(),
                    content: "base.js".to_string(),
                }],
                package_ref: None,
                server_image: Some("registry.example.org/custom:1".to_string()),
                static_image: None,
            },
            2,
        );
        let runtime = RuntimeStore::new();
        runtime.ensure_host("www.example.org", "tenant-a", "main", "default:1");

        let attrs = install_host(
            &objects,
            &runtime,
            "tenant-a",
            &host(vec![TypedObjectReference::new(RefKind::ScriptLibrary, "base")]),
        )
        .await
        .unwrap();

        assert_eq!(attrs.get("library.base.generation"), Some(&"2".to_string()));

        let handler = runtime.get("www.example.org").unwrap();
        let libraries = handler.script_libraries();
        assert_eq!(libraries.len(), 1);
        assert_eq!(libraries[0].name, "base");

        let backends = handler.required_backends();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].image, "registry.example.org/custom:1");
    }

    #[tokio::test]
    async fn test_install_host_missing_library_is_recoverable() {
        let objects = FakeStore::new();
        let runtime = RuntimeStore::new();
        runtime.ensure_host("www.example.org", "tenant-a", "main", "default:1");

        let err = install_host(
            &objects,
            &runtime,
            "tenant-a",
            &host(vec![TypedObjectReference::new(RefKind::ScriptLibrary, "gone")]),
        )
        .await
        .unwrap_err();
        assert!(err.is_recoverable());
    }
}
