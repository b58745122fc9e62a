//! Reverse dependency routing for watch events
//!
//! When a referenced resource (fragment, archetype, script library, app,
//! host) changes, the reconcilers for every dependent resource must be
//! re-triggered. The original JSONPath-driven reverse mapping is expressed
//! here as explicit per-kind extraction tables: for each watcher kind a list
//! of functions pulling reference targets out of the spec, OR-composed per
//! watched kind.
//!
//! Matching compares the changed object's identity against each extracted
//! reference's *effective* target: name, kind, and the namespace the
//! reference would resolve in (explicit, else the watcher instance's own,
//! none for cluster-scoped kinds). A dependent in namespace B is therefore
//! never triggered by a same-named resource in namespace A unless its
//! reference explicitly says so.

use crate::crd::{
    LocalObjectReference, LoomHost, LoomPageBinding, LoomUtilityPage, RefKind,
    TypedObjectReference,
};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Resource, ResourceExt};
use std::sync::Arc;

/// One extracted reference target
#[derive(Debug, Clone, PartialEq)]
pub enum RefTarget {
    /// Same-namespace reference; kind implied by the watch edge using the
    /// extractor
    Local(LocalObjectReference),
    /// Fully qualified typed reference
    Typed(TypedObjectReference),
}

/// Pulls reference targets of one role out of a watcher instance
pub type Extractor<K> = fn(&K) -> Vec<RefTarget>;

/// Identity of a changed object on a watch stream
#[derive(Debug, Clone)]
pub struct ChangedObject {
    /// Kind of the changed object, when the watch edge carries typed
    /// references; `None` for kind-implied (local) edges
    pub kind: Option<RefKind>,
    pub name: String,
    pub namespace: Option<String>,
}

fn matches(changed: &ChangedObject, instance_namespace: Option<&str>, target: &RefTarget) -> bool {
    match target {
        RefTarget::Local(local) => {
            // Zero-value references never match anything
            if local.name.is_empty() {
                return false;
            }
            local.name == changed.name && instance_namespace == changed.namespace.as_deref()
        }
        RefTarget::Typed(typed) => {
            if typed.is_empty() {
                return false;
            }
            let Some(changed_kind) = changed.kind else {
                return false;
            };
            if typed.kind != changed_kind || typed.name != changed.name {
                return false;
            }
            let effective = instance_namespace
                .and_then(|ns| typed.effective_namespace(ns))
                .or_else(|| {
                    // Cluster-scoped watcher instances can still hold
                    // explicitly namespaced references
                    if typed.kind.is_cluster_scoped() {
                        None
                    } else {
                        typed.namespace.clone()
                    }
                });
            effective.as_deref() == changed.namespace.as_deref()
        }
    }
}

/// Match a changed object against a set of watcher instances
///
/// Returns one reconcile request per matching instance; an instance matches
/// when any extractor yields a reference to the changed object.
pub fn match_dependents<K>(
    instances: impl IntoIterator<Item = Arc<K>>,
    changed: &ChangedObject,
    extractors: &[Extractor<K>],
) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()> + ResourceExt,
{
    let mut requests = Vec::new();
    for instance in instances {
        let instance_namespace = instance.namespace();
        let hit = extractors.iter().any(|extract| {
            extract(&instance)
                .iter()
                .any(|target| matches(changed, instance_namespace.as_deref(), target))
        });
        if hit {
            requests.push(ObjectRef::from_obj(&*instance));
        }
    }
    requests
}

/// Match a changed object against a reflector store of the watcher kind
///
/// A failed or empty store yields an empty request set; the periodic resync
/// recovers anything a lost event would have triggered.
pub fn dependents<K>(
    store: &Store<K>,
    changed: &ChangedObject,
    extractors: &[Extractor<K>],
) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()> + ResourceExt + Clone,
{
    match_dependents(store.state(), changed, extractors)
}

/// Build a `.watches()` mapper routing changes of kind `W` back to
/// dependents of kind `K`
pub fn watch_mapper<K, W>(
    store: Store<K>,
    kind: Option<RefKind>,
    extractors: &'static [Extractor<K>],
) -> impl Fn(W) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()> + ResourceExt + Clone,
    W: Resource<DynamicType = ()> + ResourceExt,
{
    move |changed: W| {
        let changed = ChangedObject {
            kind,
            name: changed.name_any(),
            namespace: changed.namespace(),
        };
        dependents(&store, &changed, extractors)
    }
}

// ============================================================================
// Extraction tables
// ============================================================================

fn typed_targets(refs: &[Option<&TypedObjectReference>]) -> Vec<RefTarget> {
    refs.iter()
        .flatten()
        .map(|r| RefTarget::Typed((*r).clone()))
        .collect()
}

/// Page-binding references to header kinds
pub const PAGE_HEADER_REFS: &[Extractor<LoomPageBinding>] =
    &[|pb| typed_targets(&[pb.spec.header_ref.as_ref()])];

/// Page-binding references to footer kinds
pub const PAGE_FOOTER_REFS: &[Extractor<LoomPageBinding>] =
    &[|pb| typed_targets(&[pb.spec.footer_ref.as_ref()])];

/// Page-binding references to navigation kinds (every slot)
pub const PAGE_NAVIGATION_REFS: &[Extractor<LoomPageBinding>] = &[|pb| {
    pb.spec
        .navigation_refs
        .values()
        .map(|r| RefTarget::Typed(r.clone()))
        .collect()
}];

/// Page-binding references to script-library kinds
pub const PAGE_SCRIPT_LIBRARY_REFS: &[Extractor<LoomPageBinding>] =
    &[|pb| typed_targets(&[pb.spec.script_library_ref.as_ref()])];

/// Page-binding references to archetype kinds
pub const PAGE_ARCHETYPE_REFS: &[Extractor<LoomPageBinding>] =
    &[|pb| typed_targets(&[Some(&pb.spec.archetype_ref)])];

/// Page-binding references to apps (all content entries)
pub const PAGE_APP_REFS: &[Extractor<LoomPageBinding>] = &[|pb| {
    pb.spec
        .content
        .iter()
        .filter_map(|entry| entry.app_ref.as_ref())
        .map(|r| RefTarget::Local(r.clone()))
        .collect()
}];

/// Page-binding reference to its host
pub const PAGE_HOST_REFS: &[Extractor<LoomPageBinding>] =
    &[|pb| vec![RefTarget::Local(pb.spec.host_ref.clone())]];

/// Page-binding reference to its parent page
pub const PAGE_PARENT_REFS: &[Extractor<LoomPageBinding>] = &[|pb| {
    pb.spec
        .parent_ref
        .iter()
        .map(|r| RefTarget::Local(r.clone()))
        .collect()
}];

/// Utility-page references to header kinds
pub const UTILITY_HEADER_REFS: &[Extractor<LoomUtilityPage>] =
    &[|up| typed_targets(&[up.spec.header_ref.as_ref()])];

/// Utility-page references to footer kinds
pub const UTILITY_FOOTER_REFS: &[Extractor<LoomUtilityPage>] =
    &[|up| typed_targets(&[up.spec.footer_ref.as_ref()])];

/// Utility-page references to navigation kinds
pub const UTILITY_NAVIGATION_REFS: &[Extractor<LoomUtilityPage>] = &[|up| {
    up.spec
        .navigation_refs
        .values()
        .map(|r| RefTarget::Typed(r.clone()))
        .collect()
}];

/// Utility-page references to script-library kinds
pub const UTILITY_SCRIPT_LIBRARY_REFS: &[Extractor<LoomUtilityPage>] =
    &[|up| typed_targets(&[up.spec.script_library_ref.as_ref()])];

/// Utility-page references to archetype kinds
pub const UTILITY_ARCHETYPE_REFS: &[Extractor<LoomUtilityPage>] =
    &[|up| typed_targets(&[Some(&up.spec.archetype_ref)])];

/// Utility-page references to apps
pub const UTILITY_APP_REFS: &[Extractor<LoomUtilityPage>] = &[|up| {
    up.spec
        .content
        .iter()
        .filter_map(|entry| entry.app_ref.as_ref())
        .map(|r| RefTarget::Local(r.clone()))
        .collect()
}];

/// Utility-page reference to its host
pub const UTILITY_HOST_REFS: &[Extractor<LoomUtilityPage>] =
    &[|up| vec![RefTarget::Local(up.spec.host_ref.clone())]];

/// Host references to script-library kinds
pub const HOST_SCRIPT_LIBRARY_REFS: &[Extractor<LoomHost>] = &[|h| {
    h.spec
        .script_library_refs
        .iter()
        .map(|r| RefTarget::Typed(r.clone()))
        .collect()
}];

/// Host reference to its controller
pub const HOST_CONTROLLER_REFS: &[Extractor<LoomHost>] =
    &[|h| vec![RefTarget::Local(h.spec.controller_ref.clone())]];
