//! Custom Resource Definitions for the Loom operator
//!
//! This module defines the resource kinds that make up a Loom hosting
//! platform: hosts and their controllers, page bindings, utility pages,
//! translations, and the referenced-only building blocks (archetypes,
//! fragments, script libraries, apps). Fragment-like kinds come in a
//! namespace-scoped and a cluster-scoped variant sharing one spec shape.

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group for all Loom resources
pub const API_GROUP: &str = "loom.dev";

/// API version for all Loom resources
pub const API_VERSION: &str = "v1alpha1";

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Regex for validating hostnames (lowercase DNS labels joined by dots)
static HOSTNAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

/// Regex for validating language tags (e.g. "en", "de", "pt-BR")
static LANGUAGE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2,3}(-[A-Za-z0-9]{2,8})*$").unwrap());

/// Validate a Kubernetes name (RFC 1123 subdomain)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty is allowed for optional fields
    }
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate an optional Kubernetes name
fn validate_optional_k8s_name(value: &str) -> Result<(), ValidationError> {
    validate_k8s_name(value)
}

/// Validate a hostname
fn validate_hostname(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || value.len() > 253 {
        return Err(ValidationError::new("invalid_hostname")
            .with_message("hostname must be 1-253 characters".into()));
    }
    if !HOSTNAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_hostname")
            .with_message(format!("'{}' is not a valid hostname", value).into()));
    }
    Ok(())
}

/// Validate a page path: absolute, normalized, no trailing slash except root
fn validate_path(value: &str) -> Result<(), ValidationError> {
    if !value.starts_with('/') {
        return Err(ValidationError::new("invalid_path")
            .with_message(format!("path '{}' must start with '/'", value).into()));
    }
    if value.len() > 1 && value.ends_with('/') {
        return Err(ValidationError::new("invalid_path")
            .with_message("path must not end with '/'".into()));
    }
    if value.contains("//") || value.contains("..") {
        return Err(ValidationError::new("invalid_path")
            .with_message(format!("path '{}' is not normalized", value).into()));
    }
    Ok(())
}

/// Validate a language tag
fn validate_language(value: &str) -> Result<(), ValidationError> {
    if !LANGUAGE_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_language")
            .with_message(format!("'{}' is not a valid language tag", value).into()));
    }
    Ok(())
}

/// Validate a container image reference
fn validate_image(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty is allowed (uses default)
    }
    if value.len() > 255 {
        return Err(ValidationError::new("image_too_long")
            .with_message("image reference exceeds 255 characters".into()));
    }
    if value.contains("..") || value.starts_with('/') || value.starts_with('-') {
        return Err(ValidationError::new("invalid_image")
            .with_message(format!("'{}' is not a valid container image", value).into()));
    }
    Ok(())
}

/// Validate content entries: unique slots, exactly one content source each
fn validate_content_entries(entries: &[ContentEntry]) -> Result<(), ValidationError> {
    let mut slots = BTreeSet::new();
    for entry in entries {
        if entry.slot.is_empty() {
            return Err(ValidationError::new("empty_slot")
                .with_message("content entry slot must not be empty".into()));
        }
        if !slots.insert(entry.slot.as_str()) {
            return Err(ValidationError::new("duplicate_slot").with_message(
                format!("content slot '{}' is declared more than once", entry.slot).into(),
            ));
        }
        match (&entry.inline, &entry.app_ref) {
            (Some(_), Some(_)) => {
                return Err(ValidationError::new("ambiguous_content").with_message(
                    format!(
                        "content slot '{}' declares both inline markup and an app reference",
                        entry.slot
                    )
                    .into(),
                ));
            }
            (None, None) => {
                return Err(ValidationError::new("empty_content").with_message(
                    format!("content slot '{}' declares no content source", entry.slot).into(),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

// ============================================================================
// References
// ============================================================================

/// Resource kinds a typed reference may point at
///
/// Every fragment-like kind exists in a namespace-scoped and a cluster-scoped
/// variant; the reference's kind field selects which one is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, JsonSchema)]
pub enum RefKind {
    #[serde(rename = "LoomHeader")]
    Header,
    #[serde(rename = "LoomClusterHeader")]
    ClusterHeader,
    #[serde(rename = "LoomFooter")]
    Footer,
    #[serde(rename = "LoomClusterFooter")]
    ClusterFooter,
    #[serde(rename = "LoomNavigation")]
    Navigation,
    #[serde(rename = "LoomClusterNavigation")]
    ClusterNavigation,
    #[serde(rename = "LoomScriptLibrary")]
    ScriptLibrary,
    #[serde(rename = "LoomClusterScriptLibrary")]
    ClusterScriptLibrary,
    #[serde(rename = "LoomPageArchetype")]
    PageArchetype,
    #[serde(rename = "LoomClusterPageArchetype")]
    ClusterPageArchetype,
    #[serde(rename = "LoomApp")]
    App,
}

/// Reference families: the logical role a kind pair plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefFamily {
    Header,
    Footer,
    Navigation,
    ScriptLibrary,
    Archetype,
    App,
}

impl RefKind {
    /// Whether this kind has no namespace
    pub fn is_cluster_scoped(self) -> bool {
        matches!(
            self,
            RefKind::ClusterHeader
                | RefKind::ClusterFooter
                | RefKind::ClusterNavigation
                | RefKind::ClusterScriptLibrary
                | RefKind::ClusterPageArchetype
        )
    }

    /// The Kubernetes kind string
    pub fn as_kind(self) -> &'static str {
        match self {
            RefKind::Header => "LoomHeader",
            RefKind::ClusterHeader => "LoomClusterHeader",
            RefKind::Footer => "LoomFooter",
            RefKind::ClusterFooter => "LoomClusterFooter",
            RefKind::Navigation => "LoomNavigation",
            RefKind::ClusterNavigation => "LoomClusterNavigation",
            RefKind::ScriptLibrary => "LoomScriptLibrary",
            RefKind::ClusterScriptLibrary => "LoomClusterScriptLibrary",
            RefKind::PageArchetype => "LoomPageArchetype",
            RefKind::ClusterPageArchetype => "LoomClusterPageArchetype",
            RefKind::App => "LoomApp",
        }
    }

    /// The logical family this kind belongs to
    pub fn family(self) -> RefFamily {
        match self {
            RefKind::Header | RefKind::ClusterHeader => RefFamily::Header,
            RefKind::Footer | RefKind::ClusterFooter => RefFamily::Footer,
            RefKind::Navigation | RefKind::ClusterNavigation => RefFamily::Navigation,
            RefKind::ScriptLibrary | RefKind::ClusterScriptLibrary => RefFamily::ScriptLibrary,
            RefKind::PageArchetype | RefKind::ClusterPageArchetype => RefFamily::Archetype,
            RefKind::App => RefFamily::App,
        }
    }
}

impl std::fmt::Display for RefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_kind())
    }
}

/// Reference to a same-namespace resource whose kind is implied by the field
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    /// Name of the referenced resource
    #[validate(length(min = 1, max = 63, message = "name must be 1-63 characters"))]
    #[validate(custom(function = "validate_k8s_name"))]
    pub name: String,
}

impl LocalObjectReference {
    /// Build a reference to the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Fully qualified reference carrying a kind and an optional namespace
///
/// If `namespace` is empty the referencing object's own namespace applies,
/// unless `kind` is a cluster-scoped variant, in which case no namespace
/// applies at all.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TypedObjectReference {
    /// Kind of the referenced resource
    pub kind: RefKind,

    /// Name of the referenced resource
    #[validate(length(min = 1, max = 63, message = "name must be 1-63 characters"))]
    #[validate(custom(function = "validate_k8s_name"))]
    pub name: String,

    /// Namespace of the referenced resource (defaults to the referencing
    /// object's namespace; ignored for cluster-scoped kinds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_optional_k8s_name"))]
    pub namespace: Option<String>,
}

impl TypedObjectReference {
    /// Build a same-namespace reference of the given kind
    pub fn new(kind: RefKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: None,
        }
    }

    /// Resolution namespace for this reference given the referencing
    /// object's namespace; `None` for cluster-scoped target kinds
    pub fn effective_namespace(&self, fallback: &str) -> Option<String> {
        if self.kind.is_cluster_scoped() {
            None
        } else {
            match self.namespace.as_deref() {
                Some(ns) if !ns.is_empty() => Some(ns.to_string()),
                _ => Some(fallback.to_string()),
            }
        }
    }

    /// Whether this reference holds no usable target
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

// ============================================================================
// Shared status
// ============================================================================

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Condition types written by every Loom reconciler
pub mod condition_type {
    pub const READY: &str = "Ready";
    pub const DEGRADED: &str = "Degraded";
    pub const PROGRESSING: &str = "Progressing";
}

/// One status condition
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (Ready, Degraded, Progressing)
    pub r#type: String,
    /// Condition status (True, False, Unknown)
    pub status: String,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// RFC 3339 timestamp of the last status change
    pub last_transition_time: String,
}

/// Status shared by every reconciled Loom kind
///
/// `attributes` carries dependency-generation fingerprints such as
/// `header.generation`, letting observers detect which dependency versions
/// produced the current composed state.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoomStatus {
    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation of the spec this status was produced from
    #[serde(default)]
    pub observed_generation: i64,

    /// Free-form attributes (dependency generation fingerprints)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl LoomStatus {
    /// Look up a condition by type
    pub fn condition(&self, r#type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }

    /// Look up an attribute value
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

// ============================================================================
// LoomHost
// ============================================================================

/// LoomHost custom resource
///
/// A host is one tenant website: a hostname served by the host controller it
/// selects, with an optional host-wide script-library list.
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomHost",
    plural = "loomhosts",
    shortname = "lho",
    namespaced,
    status = "LoomStatus",
    printcolumn = r#"{"name":"Hostname", "type":"string", "jsonPath":".spec.hostname"}"#,
    printcolumn = r#"{"name":"Controller", "type":"string", "jsonPath":".spec.controllerRef.name"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomHostSpec {
    /// Hostname this host serves (e.g. "www.example.org")
    #[validate(custom(function = "validate_hostname"))]
    pub hostname: String,

    /// Host controller serving this host (same namespace)
    #[validate(nested)]
    pub controller_ref: LocalObjectReference,

    /// Script libraries in effect for the host overall (max 32)
    #[serde(default)]
    #[validate(length(max = 32, message = "maximum 32 script library references allowed"))]
    pub script_library_refs: Vec<TypedObjectReference>,

    /// Prefix prepended to every page title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_prefix: Option<String>,

    /// Default language for translation lookups
    #[serde(default = "default_language")]
    #[validate(custom(function = "validate_language"))]
    pub default_language: String,
}

// ============================================================================
// LoomHostController
// ============================================================================

/// LoomHostController custom resource
///
/// The host controller owns the runtime state and workloads for every
/// LoomHost in its namespace that selects it: the server Deployment, its
/// Service, the Ingress routing the selected hostnames, and one Deployment
/// per required non-default backend.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomHostController",
    plural = "loomhostcontrollers",
    shortname = "lhc",
    namespaced,
    status = "LoomStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".spec.serverImage"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomHostControllerSpec {
    /// Number of server replicas (1-10)
    #[serde(default = "default_replicas")]
    #[validate(range(min = 1, max = 10, message = "replicas must be between 1 and 10"))]
    pub replicas: i32,

    /// Default server image executing page backends
    #[serde(default = "default_server_image")]
    #[validate(custom(function = "validate_image"))]
    pub server_image: String,

    /// Image pull policy (Always, IfNotPresent, Never)
    #[serde(default = "default_image_pull_policy")]
    #[validate(custom(function = "validate_pull_policy"))]
    pub image_pull_policy: String,

    /// Resource requirements for the server container
    #[serde(default)]
    #[schemars(skip)]
    pub resources: Option<k8s_openapi::api::core::v1::ResourceRequirements>,

    /// Ingress settings
    #[serde(default)]
    #[validate(nested)]
    pub ingress: IngressSpec,

    /// Node selector for pod scheduling
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations for pod scheduling
    #[serde(default)]
    #[schemars(skip)]
    pub tolerations: Vec<k8s_openapi::api::core::v1::Toleration>,

    /// Additional pod annotations
    #[serde(default)]
    pub pod_annotations: BTreeMap<String, String>,

    /// Additional pod labels
    #[serde(default)]
    pub pod_labels: BTreeMap<String, String>,

    /// Service account name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_optional_k8s_name"))]
    pub service_account: Option<String>,
}

/// Ingress settings for a host controller
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Whether an Ingress is created for the selected hosts
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Ingress class name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_optional_k8s_name"))]
    pub class_name: Option<String>,

    /// TLS secret holding certificates for the selected hostnames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_optional_k8s_name"))]
    pub tls_secret_name: Option<String>,
}

impl Default for IngressSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            class_name: None,
            tls_secret_name: None,
        }
    }
}

impl LoomHostControllerSpec {
    /// Standard labels for resources owned by this controller
    pub fn get_labels(&self, name: &str) -> BTreeMap<String, String> {
        let mut labels = self.get_selector_labels(name);
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "loom-operator".to_string(),
        );
        labels.extend(self.pod_labels.clone());
        labels
    }

    /// Selector labels identifying this controller's pods
    pub fn get_selector_labels(&self, name: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/name".to_string(), "loom-server".to_string());
        labels.insert("app.kubernetes.io/instance".to_string(), name.to_string());
        labels
    }
}

// ============================================================================
// LoomPageBinding
// ============================================================================

/// One content slot's source: inline markup or an app reference
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ContentEntry {
    /// Slot name, unique within one binding
    #[validate(length(min = 1, max = 63, message = "slot must be 1-63 characters"))]
    pub slot: String,

    /// Raw inline markup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,

    /// Reference to a LoomApp providing the slot content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub app_ref: Option<LocalObjectReference>,
}

/// LoomPageBinding custom resource
///
/// A page binding describes one page of a host: its path, content-slot
/// assignments, and optional overrides for the archetype's default
/// header/footer/navigation/script-library fragments.
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomPageBinding",
    plural = "loompagebindings",
    shortname = "lpb",
    namespaced,
    status = "LoomStatus",
    printcolumn = r#"{"name":"Host", "type":"string", "jsonPath":".spec.hostRef.name"}"#,
    printcolumn = r#"{"name":"Path", "type":"string", "jsonPath":".spec.path"}"#,
    printcolumn = r#"{"name":"Archetype", "type":"string", "jsonPath":".spec.archetypeRef.name"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomPageBindingSpec {
    /// Host this page belongs to (same namespace)
    #[validate(nested)]
    pub host_ref: LocalObjectReference,

    /// Absolute page path (e.g. "/" or "/docs/setup")
    #[validate(custom(function = "validate_path"))]
    pub path: String,

    /// Page archetype providing the main template and default fragments
    #[validate(nested)]
    pub archetype_ref: TypedObjectReference,

    /// Parent page in the page hierarchy; a root page (path "/") must not
    /// declare one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub parent_ref: Option<LocalObjectReference>,

    /// Content-slot assignments (max 32 slots)
    #[serde(default)]
    #[validate(length(max = 32, message = "maximum 32 content entries allowed"))]
    #[validate(custom(function = "validate_content_entries"))]
    pub content: Vec<ContentEntry>,

    /// Header override (defaults to the archetype's header)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub header_ref: Option<TypedObjectReference>,

    /// Footer override (defaults to the archetype's footer)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub footer_ref: Option<TypedObjectReference>,

    /// Navigation overrides, merged over the archetype's defaults per slot
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub navigation_refs: BTreeMap<String, TypedObjectReference>,

    /// Script library attached directly to this page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub script_library_ref: Option<TypedObjectReference>,
}

// ============================================================================
// LoomUtilityPage
// ============================================================================

/// LoomUtilityPage custom resource
///
/// A page-like resource outside the normal page hierarchy (error pages and
/// the like): composed by the same engine but with no path and no parent.
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomUtilityPage",
    plural = "loomutilitypages",
    shortname = "lup",
    namespaced,
    status = "LoomStatus",
    printcolumn = r#"{"name":"Host", "type":"string", "jsonPath":".spec.hostRef.name"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomUtilityPageSpec {
    /// Host this utility page belongs to (same namespace)
    #[validate(nested)]
    pub host_ref: LocalObjectReference,

    /// Utility page name within the host (defaults to the object name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_optional_k8s_name"))]
    pub name: Option<String>,

    /// Page archetype providing the main template and default fragments
    #[validate(nested)]
    pub archetype_ref: TypedObjectReference,

    /// Content-slot assignments (max 32 slots)
    #[serde(default)]
    #[validate(length(max = 32, message = "maximum 32 content entries allowed"))]
    #[validate(custom(function = "validate_content_entries"))]
    pub content: Vec<ContentEntry>,

    /// Header override (defaults to the archetype's header)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub header_ref: Option<TypedObjectReference>,

    /// Footer override (defaults to the archetype's footer)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub footer_ref: Option<TypedObjectReference>,

    /// Navigation overrides, merged over the archetype's defaults per slot
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub navigation_refs: BTreeMap<String, TypedObjectReference>,

    /// Script library attached directly to this page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub script_library_ref: Option<TypedObjectReference>,
}

// ============================================================================
// LoomTranslation
// ============================================================================

/// LoomTranslation custom resource
///
/// One language's translation entries for a host. Entries for the same
/// language key replace each other wholesale (last writer wins).
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomTranslation",
    plural = "loomtranslations",
    shortname = "ltr",
    namespaced,
    status = "LoomStatus",
    printcolumn = r#"{"name":"Host", "type":"string", "jsonPath":".spec.hostRef.name"}"#,
    printcolumn = r#"{"name":"Language", "type":"string", "jsonPath":".spec.language"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomTranslationSpec {
    /// Host this translation belongs to (same namespace)
    #[validate(nested)]
    pub host_ref: LocalObjectReference,

    /// Language tag (e.g. "en", "pt-BR")
    #[validate(custom(function = "validate_language"))]
    pub language: String,

    /// Translation entries (max 2000 keys)
    #[serde(default)]
    #[validate(length(max = 2000, message = "maximum 2000 translation entries allowed"))]
    pub entries: BTreeMap<String, String>,
}

// ============================================================================
// Archetypes
// ============================================================================

/// Common archetype spec shape shared by the namespace- and cluster-scoped
/// variants
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ArchetypeSpec {
    /// Primary content template
    pub template: String,

    /// Default header fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub header_ref: Option<TypedObjectReference>,

    /// Default footer fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub footer_ref: Option<TypedObjectReference>,

    /// Default navigation fragments per slot
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub navigation_refs: BTreeMap<String, TypedObjectReference>,

    /// Named extra navigation fragments
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_navigation_refs: BTreeMap<String, TypedObjectReference>,

    /// Script library attached to the archetype
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub script_library_ref: Option<TypedObjectReference>,
}

/// LoomPageArchetype custom resource (namespace-scoped)
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomPageArchetype",
    plural = "loompagearchetypes",
    shortname = "lpa",
    namespaced,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomPageArchetypeSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub archetype: ArchetypeSpec,
}

/// LoomClusterPageArchetype custom resource (cluster-scoped)
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomClusterPageArchetype",
    plural = "loomclusterpagearchetypes",
    shortname = "lcpa",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomClusterPageArchetypeSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub archetype: ArchetypeSpec,
}

// ============================================================================
// Fragments
// ============================================================================

/// Common fragment spec shape (headers, footers, navigations)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FragmentSpec {
    /// Fragment markup
    pub content: String,

    /// Script library the fragment depends on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub script_library_ref: Option<TypedObjectReference>,
}

/// LoomHeader custom resource (namespace-scoped)
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomHeader",
    plural = "loomheaders",
    namespaced,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomHeaderSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub fragment: FragmentSpec,
}

/// LoomClusterHeader custom resource (cluster-scoped)
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomClusterHeader",
    plural = "loomclusterheaders",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomClusterHeaderSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub fragment: FragmentSpec,
}

/// LoomFooter custom resource (namespace-scoped)
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomFooter",
    plural = "loomfooters",
    namespaced,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomFooterSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub fragment: FragmentSpec,
}

/// LoomClusterFooter custom resource (cluster-scoped)
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomClusterFooter",
    plural = "loomclusterfooters",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomClusterFooterSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub fragment: FragmentSpec,
}

/// LoomNavigation custom resource (namespace-scoped)
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomNavigation",
    plural = "loomnavigations",
    namespaced,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomNavigationSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub fragment: FragmentSpec,
}

/// LoomClusterNavigation custom resource (cluster-scoped)
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomClusterNavigation",
    plural = "loomclusternavigations",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomClusterNavigationSpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub fragment: FragmentSpec,
}

// ============================================================================
// Script libraries
// ============================================================================

/// One script's tag and content
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ScriptDefinition {
    /// Tag the script renders as (e.g. "script", "style")
    #[serde(default = "default_script_tag")]
    #[validate(length(min = 1, max = 32, message = "tag must be 1-32 characters"))]
    pub tag: String,

    /// Script body
    pub content: String,
}

/// Reference to an externally hosted package, unique per name@version
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PackageReference {
    /// Package name
    #[validate(length(min = 1, max = 214, message = "package name must be 1-214 characters"))]
    pub name: String,

    /// Package version
    #[validate(length(min = 1, max = 64, message = "package version must be 1-64 characters"))]
    pub version: String,

    /// Secret holding registry credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_optional_k8s_name"))]
    pub secret_ref: Option<String>,
}

impl PackageReference {
    /// The deduplication key, `name@version`
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Common script-library spec shape shared by the namespace- and
/// cluster-scoped variants
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ScriptLibrarySpec {
    /// Script definitions in this library (max 64)
    #[serde(default)]
    #[validate(length(max = 64, message = "maximum 64 scripts allowed"))]
    pub scripts: Vec<ScriptDefinition>,

    /// Package this library is built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub package_ref: Option<PackageReference>,

    /// Server image override; requires a non-default backend when it
    /// differs from the cluster default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_image"))]
    pub server_image: Option<String>,

    /// Static image serving this library's assets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_image"))]
    pub static_image: Option<String>,
}

/// LoomScriptLibrary custom resource (namespace-scoped)
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomScriptLibrary",
    plural = "loomscriptlibraries",
    shortname = "lsl",
    namespaced,
    printcolumn = r#"{"name":"Package", "type":"string", "jsonPath":".spec.packageRef.name"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomScriptLibrarySpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub library: ScriptLibrarySpec,
}

/// LoomClusterScriptLibrary custom resource (cluster-scoped)
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomClusterScriptLibrary",
    plural = "loomclusterscriptlibraries",
    shortname = "lcsl",
    printcolumn = r#"{"name":"Package", "type":"string", "jsonPath":".spec.packageRef.name"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomClusterScriptLibrarySpec {
    #[serde(flatten)]
    #[validate(nested)]
    pub library: ScriptLibrarySpec,
}

// ============================================================================
// LoomApp
// ============================================================================

/// LoomApp custom resource
///
/// An app provides rendered content for one page slot, plus the scripts,
/// package, and backend image its dynamic behavior requires.
#[derive(CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "loom.dev",
    version = "v1alpha1",
    kind = "LoomApp",
    plural = "loomapps",
    shortname = "lap",
    namespaced,
    printcolumn = r#"{"name":"Package", "type":"string", "jsonPath":".spec.packageRef.name"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LoomAppSpec {
    /// Rendered markup for the slot
    pub template: String,

    /// Scripts the app requires (max 64)
    #[serde(default)]
    #[validate(length(max = 64, message = "maximum 64 scripts allowed"))]
    pub scripts: Vec<ScriptDefinition>,

    /// Package this app is built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub package_ref: Option<PackageReference>,

    /// Server image override; requires a non-default backend when it
    /// differs from the cluster default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_image"))]
    pub server_image: Option<String>,

    /// Static image serving this app's assets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_image"))]
    pub static_image: Option<String>,
}

// ============================================================================
// Defaults
// ============================================================================

fn default_replicas() -> i32 {
    1
}

fn default_server_image() -> String {
    "ghcr.io/loom-sh/loom-server:latest".to_string()
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_script_tag() -> String {
    "script".to_string()
}

fn default_true() -> bool {
    true
}

/// Validate image pull policy
fn validate_pull_policy(policy: &str) -> Result<(), ValidationError> {
    match policy {
        "Always" | "IfNotPresent" | "Never" => Ok(()),
        _ => Err(ValidationError::new("invalid_pull_policy").with_message(
            format!(
                "'{}' is not a valid pull policy (Always, IfNotPresent, Never)",
                policy
            )
            .into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typed(kind: RefKind, name: &str) -> TypedObjectReference {
        TypedObjectReference::new(kind, name)
    }

    #[test]
    fn test_ref_kind_scope() {
        assert!(RefKind::ClusterFooter.is_cluster_scoped());
        assert!(RefKind::ClusterScriptLibrary.is_cluster_scoped());
        assert!(!RefKind::Footer.is_cluster_scoped());
        assert!(!RefKind::App.is_cluster_scoped());
    }

    #[test]
    fn test_ref_kind_family_pairs() {
        assert_eq!(RefKind::Footer.family(), RefKind::ClusterFooter.family());
        assert_eq!(RefKind::Header.family(), RefKind::ClusterHeader.family());
        assert_ne!(RefKind::Footer.family(), RefKind::Header.family());
    }

    #[test]
    fn test_ref_kind_serializes_as_kind_string() {
        let json = serde_json::to_string(&RefKind::ClusterHeader).unwrap();
        assert_eq!(json, "\"LoomClusterHeader\"");
        let back: RefKind = serde_json::from_str("\"LoomFooter\"").unwrap();
        assert_eq!(back, RefKind::Footer);
    }

    #[test]
    fn test_effective_namespace_defaults_to_referencing_object() {
        let r = typed(RefKind::Footer, "main");
        assert_eq!(r.effective_namespace("tenant-a"), Some("tenant-a".to_string()));
    }

    #[test]
    fn test_effective_namespace_explicit() {
        let mut r = typed(RefKind::Footer, "main");
        r.namespace = Some("shared".to_string());
        assert_eq!(r.effective_namespace("tenant-a"), Some("shared".to_string()));
    }

    #[test]
    fn test_effective_namespace_cluster_scoped_ignores_both() {
        let mut r = typed(RefKind::ClusterFooter, "main");
        r.namespace = Some("shared".to_string());
        assert_eq!(r.effective_namespace("tenant-a"), None);
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/docs/setup").is_ok());
        assert!(validate_path("docs").is_err());
        assert!(validate_path("/docs/").is_err());
        assert!(validate_path("/a//b").is_err());
        assert!(validate_path("/a/../b").is_err());
    }

    #[test]
    fn test_validate_hostname() {
        assert!(validate_hostname("www.example.org").is_ok());
        assert!(validate_hostname("example").is_ok());
        assert!(validate_hostname("Example.org").is_err());
        assert!(validate_hostname("-bad.example.org").is_err());
        assert!(validate_hostname("").is_err());
    }

    #[test]
    fn test_validate_language() {
        assert!(validate_language("en").is_ok());
        assert!(validate_language("pt-BR").is_ok());
        assert!(validate_language("english").is_err());
        assert!(validate_language("").is_err());
    }

    #[test]
    fn test_content_entries_unique_slots() {
        let entries = vec![
            ContentEntry {
                slot: "main".to_string(),
                inline: Some("<p>hi</p>".to_string()),
                app_ref: None,
            },
            ContentEntry {
                slot: "main".to_string(),
                inline: Some("<p>again</p>".to_string()),
                app_ref: None,
            },
        ];
        assert!(validate_content_entries(&entries).is_err());
    }

    #[test]
    fn test_content_entries_exactly_one_source() {
        let both = vec![ContentEntry {
            slot: "main".to_string(),
            inline: Some("<p>hi</p>".to_string()),
            app_ref: Some(LocalObjectReference::new("shop")),
        }];
        assert!(validate_content_entries(&both).is_err());

        let neither = vec![ContentEntry {
            slot: "main".to_string(),
            inline: None,
            app_ref: None,
        }];
        assert!(validate_content_entries(&neither).is_err());

        let inline_only = vec![ContentEntry {
            slot: "main".to_string(),
            inline: Some("<p>hi</p>".to_string()),
            app_ref: None,
        }];
        assert!(validate_content_entries(&inline_only).is_ok());
    }

    #[test]
    fn test_page_binding_spec_validation() {
        let spec = LoomPageBindingSpec {
            host_ref: LocalObjectReference::new("site"),
            path: "/docs".to_string(),
            archetype_ref: typed(RefKind::PageArchetype, "standard"),
            parent_ref: None,
            content: vec![],
            header_ref: None,
            footer_ref: None,
            navigation_refs: BTreeMap::new(),
            script_library_ref: None,
        };
        assert!(spec.validate().is_ok());

        let mut bad = spec.clone();
        bad.path = "docs".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_package_reference_key() {
        let p = PackageReference {
            name: "@acme/widgets".to_string(),
            version: "2.1.0".to_string(),
            secret_ref: None,
        };
        assert_eq!(p.key(), "@acme/widgets@2.1.0");
    }

    #[test]
    fn test_typed_ref_roundtrip_camel_case() {
        let mut r = typed(RefKind::ScriptLibrary, "base");
        r.namespace = Some("shared".to_string());
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["kind"], "LoomScriptLibrary");
        assert_eq!(json["name"], "base");
        assert_eq!(json["namespace"], "shared");
        let back: TypedObjectReference = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_host_spec_defaults() {
        let json = serde_json::json!({
            "hostname": "www.example.org",
            "controllerRef": {"name": "main"}
        });
        let spec: LoomHostSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.default_language, "en");
        assert!(spec.script_library_refs.is_empty());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_host_controller_defaults() {
        let spec: LoomHostControllerSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.image_pull_policy, "IfNotPresent");
        assert!(spec.ingress.enabled);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_fragment_spec_flattens() {
        let json = serde_json::json!({
            "content": "<header>hi</header>",
            "scriptLibraryRef": {"kind": "LoomClusterScriptLibrary", "name": "base"}
        });
        let spec: LoomHeaderSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.fragment.content, "<header>hi</header>");
        assert_eq!(
            spec.fragment.script_library_ref.as_ref().unwrap().kind,
            RefKind::ClusterScriptLibrary
        );
    }

    #[test]
    fn test_status_condition_lookup() {
        let status = LoomStatus {
            conditions: vec![Condition {
                r#type: condition_type::READY.to_string(),
                status: condition_status::TRUE.to_string(),
                reason: "Composed".to_string(),
                message: "page composed".to_string(),
                last_transition_time: "2026-01-01T00:00:00Z".to_string(),
            }],
            observed_generation: 3,
            attributes: BTreeMap::from([(
                "header.generation".to_string(),
                "5".to_string(),
            )]),
        };
        assert_eq!(
            status.condition(condition_type::READY).unwrap().status,
            condition_status::TRUE
        );
        assert_eq!(status.attribute("header.generation"), Some("5"));
        assert!(status.condition(condition_type::DEGRADED).is_none());
    }
}
