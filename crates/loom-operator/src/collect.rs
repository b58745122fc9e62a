//! Deduplication utilities for collected page dependencies
//!
//! Composition walks many resources (archetype, fragments, script libraries,
//! apps) and accumulates their package references, script definitions, and
//! required backends. These helpers collapse the accumulated lists into the
//! deterministic sets the composed record carries.

use crate::crd::{PackageReference, ScriptDefinition};
use crate::store::BackendRef;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::warn;

/// Deduplicate package references by `name@version`, stable-sorted by name
/// then version
///
/// Refs sharing a key are expected identical, so which one survives is
/// irrelevant; the sort makes the output independent of collection order.
pub fn unique_package_refs(mut refs: Vec<PackageReference>) -> Vec<PackageReference> {
    refs.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
    let mut seen = BTreeSet::new();
    refs.retain(|r| seen.insert(r.key()));
    refs
}

/// Content hash identifying a script definition
///
/// The hash covers the canonical JSON serialization of the definition, so
/// two scripts that render identically collapse to one even when they come
/// from different libraries.
pub fn script_hash(def: &ScriptDefinition) -> String {
    // BTreeMap-free struct with a fixed field order serializes canonically
    let canonical = serde_json::to_vec(def).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    format!("{:x}", digest)
}

/// Deduplicate script definitions by content hash, preserving first-seen
/// order
pub fn unique_script_defs(defs: Vec<ScriptDefinition>) -> Vec<ScriptDefinition> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(defs.len());
    for def in defs {
        if seen.insert(script_hash(&def)) {
            out.push(def);
        }
    }
    out
}

/// Deduplicate backend references by name, stable-sorted by name
///
/// Name-only keying assumes kind and namespace are consistent per name; when
/// they are not, the conflict is logged instead of silently collapsed.
pub fn unique_backend_refs(mut refs: Vec<BackendRef>) -> Vec<BackendRef> {
    refs.sort_by(|a, b| a.name.cmp(&b.name));
    let mut out: Vec<BackendRef> = Vec::with_capacity(refs.len());
    for r in refs {
        match out.last() {
            Some(prev) if prev.name == r.name => {
                if prev.kind != r.kind || prev.namespace != r.namespace {
                    warn!(
                        name = %r.name,
                        kept_kind = %prev.kind,
                        kept_namespace = %prev.namespace,
                        dropped_kind = %r.kind,
                        dropped_namespace = %r.namespace,
                        "conflicting backend references share a name; keeping the first"
                    );
                }
            }
            _ => out.push(r),
        }
    }
    out
}

/// Backend reference for a resource, if it requires a non-default backend
///
/// A resource needs its own backend when it declares a static image, or a
/// server image different from the cluster-wide default.
pub fn backend_for(
    kind: &str,
    name: &str,
    namespace: &str,
    server_image: Option<&str>,
    static_image: Option<&str>,
    default_server_image: &str,
) -> Option<BackendRef> {
    let image = match (static_image, server_image) {
        (Some(img), _) if !img.is_empty() => img,
        (_, Some(img)) if !img.is_empty() && img != default_server_image => img,
        _ => return None,
    };
    Some(BackendRef {
        kind: kind.to_string(),
        name: name.to_string(),
        namespace: namespace.to_string(),
        image: image.to_string(),
    })
}
