//! LoomPageBinding controller
//!
//! Watches page bindings and every kind they can reference, re-running the
//! composition engine whenever the binding or any dependency changes. A
//! successful pass writes the composed page into the runtime store and
//! reports Ready; a missing dependency reports Degraded and retries after a
//! bounded delay; a structural violation reports Degraded and waits for a
//! spec change.

use crate::compose::compose_page;
use crate::conditions;
use crate::crd::{
    LoomApp, LoomClusterFooter, LoomClusterHeader, LoomClusterNavigation,
    LoomClusterPageArchetype, LoomClusterScriptLibrary, LoomFooter, LoomHeader, LoomHost,
    LoomNavigation, LoomPageArchetype, LoomPageBinding, LoomScriptLibrary, LoomStatus, RefKind,
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

/// Finalizer name for page-binding cleanup
pub const PAGE_FINALIZER: &str = "loom.dev/page-binding-finalizer";

/// Requeue interval for successful reconciliations (periodic resync)
const DEFAULT_REQUEUE_SECONDS: u64 = 300;

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Context passed to the page controller
pub struct PageControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Per-host runtime state store
    pub runtime: RuntimeStore,
    /// Bounded requeue delay for missing dependencies
    pub requeue_delay: Duration,
    /// Metrics recorder
    pub metrics: Option<PageControllerMetrics>,
    /// Per-binding error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
}

/// Metrics for the page controller
#[derive(Clone)]
pub struct PageControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl PageControllerMetrics {
    /// Create new page controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("loom_page_reconciliations_total"),
            errors: metrics::counter!("loom_page_reconciliation_errors_total"),
            duration: metrics::histogram!("loom_page_reconciliation_duration_seconds"),
        }
    }
}

impl Default for PageControllerMetrics {
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

/// Start the LoomPageBinding controller
pub async fn run_page_controller(
    client: Client,
    namespace: Option<String>,
    runtime: RuntimeStore,
    requeue_delay: Duration,
) -> Result<()> {
    let pages: Api<LoomPageBinding> = scoped(&client, &namespace);

    let ctx = Arc::new(PageControllerContext {
        client: client.clone(),
        runtime,
        requeue_delay,
        metrics: Some(PageControllerMetrics::new()),
        error_counts: dashmap::DashMap::new(),
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting LoomPageBinding controller"
    );

    let controller = Controller::new(pages.clone(), Config::default());
    let store = controller.store();

    controller
        .watches(
            scoped::<LoomHost>(&client, &namespace),
            Config::default(),
            watch_mapper(store.clone(), None, router::PAGE_HOST_REFS),
        )
        .watches(
            scoped::<LoomPageBinding>(&client, &namespace),
            Config::default(),
            watch_mapper(store.clone(), None, router::PAGE_PARENT_REFS),
        )
        .watches(
            scoped::<LoomApp>(&client, &namespace),
            Config::default(),
            watch_mapper(store.clone(), None, router::PAGE_APP_REFS),
        )
        .watches(
            scoped::<LoomPageArchetype>(&client, &namespace),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::PageArchetype),
                router::PAGE_ARCHETYPE_REFS,
            ),
        )
        .watches(
            Api::<LoomClusterPageArchetype>::all(client.clone()),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::ClusterPageArchetype),
                router::PAGE_ARCHETYPE_REFS,
            ),
        )
        .watches(
            scoped::<LoomHeader>(&client, &namespace),
            Config::default(),
            watch_mapper(store.clone(), Some(RefKind::Header), router::PAGE_HEADER_REFS),
        )
        .watches(
            Api::<LoomClusterHeader>::all(client.clone()),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::ClusterHeader),
                router::PAGE_HEADER_REFS,
            ),
        )
        .watches(
            scoped::<LoomFooter>(&client, &namespace),
            Config::default(),
            watch_mapper(store.clone(), Some(RefKind::Footer), router::PAGE_FOOTER_REFS),
        )
        .watches(
            Api::<LoomClusterFooter>::all(client.clone()),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::ClusterFooter),
                router::PAGE_FOOTER_REFS,
            ),
        )
        .watches(
            scoped::<LoomNavigation>(&client, &namespace),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::Navigation),
                router::PAGE_NAVIGATION_REFS,
            ),
        )
        .watches(
            Api::<LoomClusterNavigation>::all(client.clone()),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::ClusterNavigation),
                router::PAGE_NAVIGATION_REFS,
            ),
        )
        .watches(
            scoped::<LoomScriptLibrary>(&client, &namespace),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::ScriptLibrary),
                router::PAGE_SCRIPT_LIBRARY_REFS,
            ),
        )
        .watches(
            Api::<LoomClusterScriptLibrary>::all(client.clone()),
            Config::default(),
            watch_mapper(
                store.clone(),
                Some(RefKind::ClusterScriptLibrary),
                router::PAGE_SCRIPT_LIBRARY_REFS,
            ),
        )
        .run(reconcile_page, page_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Page reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Page reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function for LoomPageBinding
#[instrument(skip(page, ctx), fields(name = %page.name_any(), namespace = page.namespace()))]
async fn reconcile_page(
    page: Arc<LoomPageBinding>,
    ctx: Arc<PageControllerContext>,
) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = page.namespace().unwrap_or_else(|| "default".to_string());
    let name = page.name_any();
    let pages: Api<LoomPageBinding> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&pages, PAGE_FINALIZER, page, |event| async {
        match event {
            FinalizerEvent::Apply(page) => apply_page(page, ctx.clone()).await,
            FinalizerEvent::Cleanup(page) => cleanup_page(page, ctx.clone()).await,
        }
    })
    .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
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

/// Compose the page and persist the outcome as conditions
#[instrument(skip(page, ctx))]
async fn apply_page(page: Arc<LoomPageBinding>, ctx: Arc<PageControllerContext>) -> Result<Action> {
    let name = page.name_any();
    let namespace = page.namespace().unwrap_or_else(|| "default".to_string());
    let generation = page.metadata.generation.unwrap_or(0);
    let pages: Api<LoomPageBinding> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(name = %name, namespace = %namespace, "Reconciling LoomPageBinding");

    // Validate the spec before touching anything
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
        warn!(name = %name, errors = %error_msg, "Page binding spec validation failed");

        remove_served_page(&ctx.runtime, page.status.as_ref(), &name);
        let status = conditions::build_status(
            conditions::degraded(page.status.as_ref(), "InvalidSpec", &error_msg),
            generation,
            previous_attributes(page.status.as_ref()),
        );
        let write = patch_status(&pages, &name, &status).await;
        return preserve_first_error(Err(Error::InvalidSpec(error_msg)), write);
    }

    // Transient Ready=Unknown between finalizer attachment and the first
    // resolution pass
    if page.status.is_none() {
        let status = conditions::build_status(
            conditions::progressing(None),
            generation,
            BTreeMap::new(),
        );
        patch_status(&pages, &name, &status).await?;
    }

    let objects = KubeObjectStore::new(ctx.client.clone());
    let outcome = compose_page(&objects, &ctx.runtime, &namespace, &name, &page.spec).await;

    match outcome {
        Ok(composition) => {
            let status = conditions::build_status(
                conditions::ready(
                    page.status.as_ref(),
                    &format!("page composed for host '{}'", composition.hostname),
                ),
                generation,
                composition.attributes,
            );
            let write = patch_status(&pages, &name, &status).await;
            info!(name = %name, host = %composition.hostname, "Page composition complete");
            preserve_first_error(
                Ok(Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS))),
                write,
            )
        }
        Err(e) if e.is_recoverable() => {
            // Stop serving a stale record while the page cannot compose
            remove_served_page(&ctx.runtime, page.status.as_ref(), &name);

            debug!(name = %name, error = %e, "Page composition waiting on a dependency");
            let status = conditions::build_status(
                conditions::degraded(page.status.as_ref(), e.reason(), &e.to_string()),
                generation,
                previous_attributes(page.status.as_ref()),
            );
            let write = patch_status(&pages, &name, &status).await;
            preserve_first_error(Ok(Action::requeue(ctx.requeue_delay)), write)
        }
        Err(e @ Error::InvalidSpec(_)) => {
            remove_served_page(&ctx.runtime, page.status.as_ref(), &name);

            warn!(name = %name, error = %e, "Page binding violates a structural invariant");
            let status = conditions::build_status(
                conditions::degraded(page.status.as_ref(), e.reason(), &e.to_string()),
                generation,
                previous_attributes(page.status.as_ref()),
            );
            let write = patch_status(&pages, &name, &status).await;
            preserve_first_error(Err(e), write)
        }
        // Object-store failures propagate without rewriting conditions
        Err(e) => Err(e),
    }
}

/// Remove the binding's composed record before the finalizer is released
#[instrument(skip(page, ctx))]
async fn cleanup_page(
    page: Arc<LoomPageBinding>,
    ctx: Arc<PageControllerContext>,
) -> Result<Action> {
    let name = page.name_any();

    info!(name = %name, "Cleaning up LoomPageBinding");
    remove_served_page(&ctx.runtime, page.status.as_ref(), &name);

    Ok(Action::await_change())
}

/// Drop the composed record from the host it was last filed under
fn remove_served_page(runtime: &RuntimeStore, status: Option<&LoomStatus>, name: &str) {
    let Some(hostname) = status.and_then(|s| s.attribute("host")) else {
        return;
    };
    if let Some(handler) = runtime.get(hostname) {
        handler.remove_page(name);
    }
}

fn previous_attributes(status: Option<&LoomStatus>) -> BTreeMap<String, String> {
    status.map(|s| s.attributes.clone()).unwrap_or_default()
}

/// Error policy for the page controller: exponential backoff per binding
fn page_error_policy(
    page: Arc<LoomPageBinding>,
    error: &Error,
    ctx: Arc<PageControllerContext>,
) -> Action {
    let key = page.name_any();
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
        "Page reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        condition_status, condition_type, LocalObjectReference, LoomPageBindingSpec,
        TypedObjectReference,
    };
    use crate::store::{PageHandler, PageSource};

    fn status_with_host(host: &str) -> LoomStatus {
        LoomStatus {
            conditions: conditions::ready(None, "page composed"),
            observed_generation: 1,
            attributes: BTreeMap::from([("host".to_string(), host.to_string())]),
        }
    }

    fn handler(host: &str, name: &str) -> PageHandler {
        PageHandler {
            host: host.to_string(),
            name: name.to_string(),
            path: Some("/docs".to_string()),
            template: String::new(),
            header: String::new(),
            footer: String::new(),
            navigation: BTreeMap::new(),
            content: BTreeMap::new(),
            packages: vec![],
            backends: vec![],
            scripts: vec![],
            source: PageSource::Binding(LoomPageBindingSpec {
                host_ref: LocalObjectReference::new("site"),
                path: "/docs".to_string(),
                archetype_ref: TypedObjectReference::new(
                    crate::crd::RefKind::PageArchetype,
                    "standard",
                ),
                parent_ref: None,
                content: vec![],
                header_ref: None,
                footer_ref: None,
                navigation_refs: BTreeMap::new(),
                script_library_ref: None,
            }),
        }
    }

    #[test]
    fn test_remove_served_page_uses_host_attribute() {
        let runtime = RuntimeStore::new();
        let host = runtime.ensure_host("www.example.org", "tenant-a", "main", "img");
        host.set_page(handler("www.example.org", "docs"));

        remove_served_page(&runtime, Some(&status_with_host("www.example.org")), "docs");
        assert!(runtime.get("www.example.org").unwrap().page("docs").is_none());
    }

    #[test]
    fn test_remove_served_page_without_attribute_is_noop() {
        let runtime = RuntimeStore::new();
        let host = runtime.ensure_host("www.example.org", "tenant-a", "main", "img");
        host.set_page(handler("www.example.org", "docs"));

        remove_served_page(&runtime, None, "docs");
        assert!(runtime.get("www.example.org").unwrap().page("docs").is_some());
    }

    #[test]
    fn test_degraded_status_preserves_previous_attributes() {
        let previous = status_with_host("www.example.org");
        let status = conditions::build_status(
            conditions::degraded(Some(&previous), "DependencyMissing", "footer missing"),
            2,
            previous_attributes(Some(&previous)),
        );
        assert_eq!(status.attribute("host"), Some("www.example.org"));
        assert_eq!(
            status.condition(condition_type::DEGRADED).unwrap().status,
            condition_status::TRUE
        );
        assert_eq!(status.observed_generation, 2);
    }
}
