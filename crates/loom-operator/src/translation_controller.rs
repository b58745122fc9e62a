//! LoomTranslation controller
//!
//! Merges one language's translation entries into the owning host's runtime
//! catalog (last writer wins per language) and removes the language again
//! when the resource goes away.

use crate::conditions;
use crate::crd::{LoomStatus, LoomTranslation};
use crate::error::{Error, Result};
use crate::resolver::{KubeObjectStore, ObjectStore, Resolver};
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

/// Finalizer name for translation cleanup
pub const TRANSLATION_FINALIZER: &str = "loom.dev/translation-finalizer";

/// Requeue interval for successful reconciliations
const DEFAULT_REQUEUE_SECONDS: u64 = 300;

/// Requeue interval for error cases
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Context passed to the translation controller
pub struct TranslationControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Per-host runtime state store
    pub runtime: RuntimeStore,
    /// Bounded requeue delay for missing dependencies
    pub requeue_delay: Duration,
    /// Metrics recorder
    pub metrics: Option<TranslationControllerMetrics>,
}

/// Metrics for the translation controller
#[derive(Clone)]
pub struct TranslationControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl TranslationControllerMetrics {
    /// Create new translation controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("loom_translation_reconciliations_total"),
            errors: metrics::counter!("loom_translation_reconciliation_errors_total"),
            duration: metrics::histogram!("loom_translation_reconciliation_duration_seconds"),
        }
    }
}

impl Default for TranslationControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the LoomTranslation controller
pub async fn run_translation_controller(
    client: Client,
    namespace: Option<String>,
    runtime: RuntimeStore,
    requeue_delay: Duration,
) -> Result<()> {
    let translations: Api<LoomTranslation> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(TranslationControllerContext {
        client: client.clone(),
        runtime,
        requeue_delay,
        metrics: Some(TranslationControllerMetrics::new()),
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting LoomTranslation controller"
    );

    Controller::new(translations.clone(), Config::default())
        .run(reconcile_translation, translation_error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Translation reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Translation reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function for LoomTranslation
#[instrument(skip(translation, ctx), fields(name = %translation.name_any(), namespace = translation.namespace()))]
async fn reconcile_translation(
    translation: Arc<LoomTranslation>,
    ctx: Arc<TranslationControllerContext>,
) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = translation
        .namespace()
        .unwrap_or_else(|| "default".to_string());
    let translations: Api<LoomTranslation> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&translations, TRANSLATION_FINALIZER, translation, |event| async {
        match event {
            FinalizerEvent::Apply(translation) => apply_translation(translation, ctx.clone()).await,
            FinalizerEvent::Cleanup(translation) => {
                cleanup_translation(translation, ctx.clone()).await
            }
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

/// Install the translation entries into the host catalog
#[instrument(skip(translation, ctx))]
async fn apply_translation(
    translation: Arc<LoomTranslation>,
    ctx: Arc<TranslationControllerContext>,
) -> Result<Action> {
    let name = translation.name_any();
    let namespace = translation
        .namespace()
        .unwrap_or_else(|| "default".to_string());
    let generation = translation.metadata.generation.unwrap_or(0);
    let translations: Api<LoomTranslation> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(name = %name, namespace = %namespace, language = %translation.spec.language, "Reconciling LoomTranslation");

    if let Err(errors) = translation.spec.validate() {
        let error_messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter()
                    .map(move |e| format!("{}: {:?}", field, e.message))
            })
            .collect();
        let error_msg = error_messages.join("; ");
        warn!(name = %name, errors = %error_msg, "Translation spec validation failed");

        let status = conditions::build_status(
            conditions::degraded(translation.status.as_ref(), "InvalidSpec", &error_msg),
            generation,
            BTreeMap::new(),
        );
        let write = patch_status(&translations, &name, &status).await;
        return preserve_first_error(Err(Error::InvalidSpec(error_msg)), write);
    }

    let objects = KubeObjectStore::new(ctx.client.clone());
    let outcome = install_translation(&objects, &ctx.runtime, &namespace, &translation).await;

    match outcome {
        Ok(attributes) => {
            let status = conditions::build_status(
                conditions::ready(
                    translation.status.as_ref(),
                    &format!(
                        "{} entries installed for language '{}'",
                        translation.spec.entries.len(),
                        translation.spec.language
                    ),
                ),
                generation,
                attributes,
            );
            let write = patch_status(&translations, &name, &status).await;
            preserve_first_error(
                Ok(Action::requeue(Duration::from_secs(DEFAULT_REQUEUE_SECONDS))),
                write,
            )
        }
        Err(e) if e.is_recoverable() => {
            debug!(name = %name, error = %e, "Translation waiting on its host");
            let status = conditions::build_status(
                conditions::degraded(translation.status.as_ref(), e.reason(), &e.to_string()),
                generation,
                translation
                    .status
                    .as_ref()
                    .map(|s| s.attributes.clone())
                    .unwrap_or_default(),
            );
            let write = patch_status(&translations, &name, &status).await;
            preserve_first_error(Ok(Action::requeue(ctx.requeue_delay)), write)
        }
        Err(e) => Err(e),
    }
}

/// Resolve the host and merge the entries into its catalog
async fn install_translation(
    objects: &dyn ObjectStore,
    runtime: &RuntimeStore,
    namespace: &str,
    translation: &LoomTranslation,
) -> Result<BTreeMap<String, String>> {
    let mut resolver = Resolver::new(objects, namespace);
    let host = resolver.host(&translation.spec.host_ref).await?;
    let hostname = host.spec.hostname.clone();

    let handler = runtime
        .get(&hostname)
        .ok_or_else(|| Error::HostNotReady(hostname.clone()))?;

    handler.add_or_update_translation(&translation.spec.language, translation.spec.entries.clone());

    Ok(resolver.into_attributes())
}

/// Remove the language from the host catalog before the finalizer is
/// released
#[instrument(skip(translation, ctx))]
async fn cleanup_translation(
    translation: Arc<LoomTranslation>,
    ctx: Arc<TranslationControllerContext>,
) -> Result<Action> {
    let name = translation.name_any();

    info!(name = %name, language = %translation.spec.language, "Cleaning up LoomTranslation");

    if let Some(hostname) = translation.status.as_ref().and_then(|s| s.attribute("host")) {
        if let Some(handler) = ctx.runtime.get(hostname) {
            handler.remove_translation(&translation.spec.language);
        }
    }

    Ok(Action::await_change())
}

/// Error policy for the translation controller
fn translation_error_policy(
    _translation: Arc<LoomTranslation>,
    error: &Error,
    _ctx: Arc<TranslationControllerContext>,
) -> Action {
    warn!(error = %error, "Translation reconciliation error, will retry");
    Action::requeue(Duration::from_secs(ERROR_REQUEUE_SECONDS))
}
