//! LoomUtilityPage controller
//!
//! Utility pages (error pages and the like) run through the same composition
//! engine as ordinary pages but live outside the page hierarchy: no path, no
//! parent. The composed record lands in the host's utility-page collection.

use crate::compose::compose_utility_page;
use crate::conditions;
use crate::crd::{
    LoomApp, LoomClusterFooter, LoomClusterHeader, LoomClusterNavigation,
    LoomClusterPageArchetype, LoomClusterScriptLibrary, LoomFooter, LoomHeader, LoomHost,
    LoomNavigation, LoomPageArchetype, LoomScriptLibrary, LoomStatus, LoomUtilityPage, RefKind,
};
use crate::error::{Error, Result};
use crate::resolver::KubeObjectStore;
use crate::router::{self, watch_mapper};
use crate::status::{patch_status, preserve_first_error};
use crate::store::RuntimeStore;
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

/// Finalizer name for utility-page cleanup
pub const UTILITY_FINALIZER: &str = "loom.dev/utility-page-finalizer";

/// Requeue interval for successful reconciliations
const DEFAULT_REQUEUE_SECONDS: u64 = 300;

/// Requeue interval for error cases
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Context passed to the utility-page controller
pub struct UtilityControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Per-host runtime state store
    pub runtime: RuntimeStore,
    /// Bounded requeue delay for missing dependencies
    pub requeue_delay: Duration,
    /// Metrics recorder
    pub metrics: Option<UtilityControllerMetrics>,
}

/// Metrics for the utility-page controller
#[derive(Clone)]
pub struct UtilityControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl UtilityControllerMetrics {
    /// Create new utility-page controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("loom_utility_page_reconciliations_total"),
            errors: metrics::counter!("loom_utility_page_reconciliation_errors_total"),
            duration: metrics::histogram!("loom_utility_page_reconciliation_duration_seconds"),
        }
    }
}

impl Default for UtilityControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn scoped<K>(client: &Client, namespace: &Option<String>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Start the LoomUtilityPage controller
pub async fn run_utility_controller(
    client: Client,
    namespace: Option<String>,
    runtime: RuntimeStore,
    requeue_delay: Duration,
) -> Result<()> {
    let pages: Api<LoomUtilityPage> = scoped(&client, &namespace);

    let ctx = Arc::new(UtilityControllerContext {
        client: client.clone(),
        runtime,
        requeue_delay,
        metrics: Some(UtilityControllerMetrics::new()),
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting LoomUtilityPage controller"
    );

    let controller = Controller::new(pages.clone(), Config::default());
    let store = controller.store();

    controller
        .watches(
            scoped::<LoomHost>(&client, &namespace),
            Config::default(),
            watch_mapper(store.clone(), None, router::UTILITY_HOST_REFS),
        )
        .watches(
            scoped::<LoomApp>(&client, &namespace),
            Config::default(),
            watch_mapper(store.clone(), None, router::UTILITY_APP_REFS),
        )
        .watches(
            scoped::<LoomPageArchetype>(&client, &namespace),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::PageArchetype),
                router::UTILITY_ARCHETYPE_REFS,
            ),
        )
        .watches(
            Api::<LoomClusterPageArchetype>::all(client.clone()),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::ClusterPageArchetype),
                router::UTILITY_ARCHETYPE_REFS,
            ),
        )
        .watches(
            scoped::<LoomHeader>(&client, &namespace),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::Header),
                router::UTILITY_HEADER_REFS,
            ),
        )
        .watches(
            Api::<LoomClusterHeader>::all(client.clone()),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::ClusterHeader),
                router::UTILITY_HEADER_REFS,
            ),
        )
        .watches(
            scoped::<LoomFooter>(&client, &namespace),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::Footer),
                router::UTILITY_FOOTER_REFS,
            ),
        )
        .watches(
            Api::<LoomClusterFooter>::all(client.clone()),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::ClusterFooter),
                router::UTILITY_FOOTER_REFS,
            ),
        )
        .watches(
            scoped::<LoomNavigation>(&client, &namespace),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::Navigation),
                router::UTILITY_NAVIGATION_REFS,
            ),
        )
        .watches(
            Api::<LoomClusterNavigation>::all(client.clone()),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::ClusterNavigation),
                router::UTILITY_NAVIGATION_REFS,
            ),
        )
        .watches(
            scoped::<LoomScriptLibrary>(&client, &namespace),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::ScriptLibrary),
                router::UTILITY_SCRIPT_LIBRARY_REFS,
            ),
        )
        .watches(
            Api::<LoomClusterScriptLibrary>::all(client.clone()),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::ClusterScriptLibrary),
                router::UTILITY_SCRIPT_LIBRARY_REFS,
            ),
        )
        .run(reconcile_utility_page, utility_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Utility page reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Utility page reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function for LoomUtilityPage
#[instrument(skip(page, ctx), fields(name = %page.name_any(), namespace = page.namespace()))]
async fn reconcile_utility_page(
    page: Arc<LoomUtilityPage>,
    ctx: Arc<UtilityControllerContext>,
) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = page.namespace().unwrap_or_else(|| "default".to_string());
    let pages: Api<LoomUtilityPage> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&pages, UTILITY_FINALIZER, page, |event| async {
        match event {
            FinalizerEvent::Apply(page) => apply_utility_page(page, ctx.clone()).await,
            FinalizerEvent::Cleanup(page) => cleanup_utility_page(page, ctx.clone()).await,
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

/// Compose the utility page and persist the outcome as conditions
#[instrument(skip(page, ctx))]
async fn apply_utility_page(
    page: Arc<LoomUtilityPage>,
    ctx: Arc<UtilityControllerContext>,
) -> Result<Action> {
    let name = page.name_any();
    let namespace = page.namespace().unwrap_or_else(|| "default".to_string());
    let generation = page.metadata.generation.unwrap_or(0);
    let pages: Api<LoomUtilityPage> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(name = %name, namespace = %namespace, "Reconciling LoomUtilityPage");

    if let Err(errors) = page.spec.validate() {
        let error_messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter()
                    .map(move |e| format!("{}: {:?}", field, e.message))
            })
            .collect();
        let error_msg = error_messages.join("; ");
        warn!(name = %name, errors = %error_msg, "Utility page spec validation failed");

        remove_served_utility_page(&ctx.runtime, &page);
        let status = conditions::build_status(
            conditions::degraded(page.status.as_ref(), "InvalidSpec", &error_msg),
            generation,
            previous_attributes(page.status.as_ref()),
        );
        let write = patch_status(&pages, &name, &status).await;
        return preserve_first_error(Err(Error::InvalidSpec(error_msg)), write);
    }

    if page.status.is_none() {
        let status = conditions::build_status(
            conditions::progressing(None),
            generation,
            BTreeMap::new(),
        );
        patch_status(&pages, &name, &status).await?;
    }

    let objects = KubeObjectStore::new(ctx.client.clone());
    let outcome = compose_utility_page(&objects, &ctx.runtime, &namespace, &name, &page.spec).await;

    match outcome {
        Ok(composition) => {
            let status = conditions::build_status(
                conditions::ready(
                    page.status.as_ref(),
                    &format!("utility page composed for host '{}'", composition.hostname),
                ),
                generation,
                composition.attributes,
            );
            let write = patch_status(&pages, &name, &status).await;
            info!(name = %name, host = %composition.hostname, "Utility page composition complete");
            preserve_first_error(
                Ok(Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS))),
                write,
            )
        }
        Err(e) if e.is_recoverable() => {
            remove_served_utility_page(&ctx.runtime, &page);

            debug!(name = %name, error = %e, "Utility page waiting on a dependency");
            let status = conditions::build_status(
                conditions::degraded(page.status.as_ref(), e.reason(), &e.to_string()),
                generation,
                previous_attributes(page.status.as_ref()),
            );
            let write = patch_status(&pages, &name, &status).await;
            preserve_first_error(Ok(Action::requeue(ctx.requeue_delay)), write)
        }
        Err(e @ Error::InvalidSpec(_)) => {
            remove_served_utility_page(&ctx.runtime, &page);

            warn!(name = %name, error = %e, "Utility page violates a structural invariant");
            let status = conditions::build_status(
                conditions::degraded(page.status.as_ref(), e.reason(), &e.to_string()),
                generation,
                previous_attributes(page.status.as_ref()),
            );
            let write = patch_status(&pages, &name, &status).await;
            preserve_first_error(Err(e), write)
        }
        Err(e) => Err(e),
    }
}

/// Remove the utility page's composed record before the finalizer is
/// released
#[instrument(skip(page, ctx))]
async fn cleanup_utility_page(
    page: Arc<LoomUtilityPage>,
    ctx: Arc<UtilityControllerContext>,
) -> Result<Action> {
    info!(name = %page.name_any(), "Cleaning up LoomUtilityPage");
    remove_served_utility_page(&ctx.runtime, &page);

    Ok(Action::await_change())
}

/// The name the composed record is filed under within its host
fn utility_page_name(page: &LoomUtilityPage) -> String {
    page.spec.name.clone().unwrap_or_else(|| page.name_any())
}

fn remove_served_utility_page(runtime: &RuntimeStore, page: &LoomUtilityPage) {
    let Some(hostname) = page.status.as_ref().and_then(|s| s.attribute("host")) else {
        return;
    };
    if let Some(handler) = runtime.get(hostname) {
        handler.remove_utility_page(&utility_page_name(page));
    }
}

fn previous_attributes(status: Option<&LoomStatus>) -> BTreeMap<String, String> {
    status.map(|s| s.attributes.clone()).unwrap_or_default()
}

/// Error policy for the utility-page controller
fn utility_error_policy(
    _page: Arc<LoomUtilityPage>,
    error: &Error,
    _ctx: Arc<UtilityControllerContext>,
) -> Action {
    warn!(error = %error, "Utility page reconciliation error, will retry");
    Action::requeue(Duration::from_secs(ERROR_REQUEUE_SECONDS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LocalObjectReference, LoomUtilityPageSpec, TypedObjectReference};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn utility(name: &str, slot_name: Option<&str>, host_attr: Option<&str>) -> LoomUtilityPage {
        LoomUtilityPage {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("tenant-a".to_string()),
                ..Default::default()
            },
            spec: LoomUtilityPageSpec {
                host_ref: LocalObjectReference::new("site"),
                name: slot_name.map(str::to_string),
                archetype_ref: TypedObjectReference::new(
                    crate::crd::RefKind::PageArchetype,
                    "standard",
                ),
                content: vec![],
                header_ref: None,
                footer_ref: None,
                navigation_refs: BTreeMap::new(),
                script_library_ref: None,
            },
            status: host_attr.map(|host| LoomStatus {
                conditions: vec![],
                observed_generation: 1,
                attributes: BTreeMap::from([("host".to_string(), host.to_string())]),
            }),
        }
    }

    #[test]
    fn test_utility_page_name_defaults_to_object_name() {
        assert_eq!(utility_page_name(&utility("not-found", None, None)), "not-found");
        assert_eq!(
            utility_page_name(&utility("not-found", Some("404"), None)),
            "404"
        );
    }

    #[test]
    fn test_remove_served_utility_page() {
        let runtime = RuntimeStore::new();
        let handler = runtime.ensure_host("www.example.org", "tenant-a", "main", "img");
        handler.add_or_update_translation("en", BTreeMap::new());

        let page = utility("not-found", Some("404"), Some("www.example.org"));
        // Nothing filed yet: removal is a no-op
        remove_served_utility_page(&runtime, &page);
        assert!(runtime.get("www.example.org").is_some());
    }
}
