//! Per-host runtime state store
//!
//! The reconcilers materialize composed pages into this in-memory store; the
//! page-serving runtime reads from it. Hosts map to [`HostHandler`]s holding
//! the composed page and utility-page records, the translation catalog, and
//! the host-wide script libraries. Page handlers are immutable snapshots
//! behind `Arc`s and are replaced wholesale, so readers never observe a
//! half-written record.

use crate::crd::{LoomPageBindingSpec, LoomUtilityPageSpec, PackageReference, ScriptDefinition};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

/// Reference to a resource requiring a non-default execution backend
///
/// Identity for deduplication is the name alone; `image` rides along so the
/// workload layer can materialize the backend without refetching the source
/// resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendRef {
    /// Kind of the resource requiring the backend
    pub kind: String,
    /// Name of the resource (deduplication key)
    pub name: String,
    /// Namespace of the resource
    pub namespace: String,
    /// Image the backend runs
    pub image: String,
}

/// One resolved content slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackedContent {
    /// Rendered markup for the slot
    pub markup: String,
    /// Generation of the app that produced the markup, for app-backed slots
    pub app_generation: Option<i64>,
}

/// Back-pointer from a composed record to the spec it was composed from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PageSource {
    Binding(LoomPageBindingSpec),
    Utility(LoomUtilityPageSpec),
}

/// The fully resolved, ready-to-serve representation of one page
///
/// Created or replaced wholesale on every successful reconciliation of the
/// owning resource; removed when that resource is deleted or stops being
/// Ready. Re-composing unchanged inputs yields a byte-identical handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageHandler {
    /// Hostname this page belongs to
    pub host: String,
    /// Page name within the host
    pub name: String,
    /// Page path; utility pages have none
    pub path: Option<String>,
    /// Main content template from the archetype
    pub template: String,
    /// Resolved header markup
    pub header: String,
    /// Resolved footer markup
    pub footer: String,
    /// Resolved navigation markup per slot
    pub navigation: BTreeMap<String, String>,
    /// Resolved content per slot
    pub content: BTreeMap<String, PackedContent>,
    /// Deduplicated package references
    pub packages: Vec<PackageReference>,
    /// Deduplicated required backends
    pub backends: Vec<BackendRef>,
    /// Deduplicated script definitions
    pub scripts: Vec<ScriptDefinition>,
    /// The spec this record was composed from
    pub source: PageSource,
}

/// A script library in effect for a host overall
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostScriptLibrary {
    /// Library name
    pub name: String,
    /// Script definitions
    pub scripts: Vec<ScriptDefinition>,
    /// Package the library is built from
    pub package: Option<PackageReference>,
}

/// Mutable host metadata, set by the host controller
#[derive(Debug, Clone, PartialEq)]
struct HostMeta {
    namespace: String,
    controller: String,
    default_server_image: String,
}

/// Per-host runtime state: composed pages, utility pages, translations,
/// host-wide script libraries, and required backends
pub struct HostHandler {
    hostname: String,
    meta: RwLock<HostMeta>,
    pages: DashMap<String, Arc<PageHandler>>,
    utility_pages: DashMap<String, Arc<PageHandler>>,
    translations: DashMap<String, Arc<BTreeMap<String, String>>>,
    script_libraries: RwLock<Vec<HostScriptLibrary>>,
    host_backends: RwLock<Vec<BackendRef>>,
}

impl HostHandler {
    fn new(hostname: &str, namespace: &str, controller: &str, default_server_image: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            meta: RwLock::new(HostMeta {
                namespace: namespace.to_string(),
                controller: controller.to_string(),
                default_server_image: default_server_image.to_string(),
            }),
            pages: DashMap::new(),
            utility_pages: DashMap::new(),
            translations: DashMap::new(),
            script_libraries: RwLock::new(Vec::new()),
            host_backends: RwLock::new(Vec::new()),
        }
    }

    /// Hostname this handler serves
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Namespace of the owning host resource
    pub fn namespace(&self) -> String {
        self.meta.read().unwrap().namespace.clone()
    }

    /// Name of the owning host controller
    pub fn controller(&self) -> String {
        self.meta.read().unwrap().controller.clone()
    }

    /// Cluster-default server image for this host
    pub fn default_server_image(&self) -> String {
        self.meta.read().unwrap().default_server_image.clone()
    }

    fn update_meta(&self, namespace: &str, controller: &str, default_server_image: &str) {
        let mut meta = self.meta.write().unwrap();
        meta.namespace = namespace.to_string();
        meta.controller = controller.to_string();
        meta.default_server_image = default_server_image.to_string();
    }

    /// Look up a composed page by name
    pub fn page(&self, name: &str) -> Option<Arc<PageHandler>> {
        self.pages.get(name).map(|p| Arc::clone(&p))
    }

    /// Insert or replace a composed page
    pub fn set_page(&self, handler: PageHandler) {
        self.pages.insert(handler.name.clone(), Arc::new(handler));
    }

    /// Remove a composed page
    pub fn remove_page(&self, name: &str) {
        self.pages.remove(name);
    }

    /// Names of all composed pages
    pub fn page_names(&self) -> Vec<String> {
        self.pages.iter().map(|e| e.key().clone()).collect()
    }

    /// Look up a composed utility page by name
    pub fn utility_page(&self, name: &str) -> Option<Arc<PageHandler>> {
        self.utility_pages.get(name).map(|p| Arc::clone(&p))
    }

    /// Insert or replace a composed utility page
    pub fn set_utility_page(&self, handler: PageHandler) {
        self.utility_pages
            .insert(handler.name.clone(), Arc::new(handler));
    }

    /// Remove a composed utility page
    pub fn remove_utility_page(&self, name: &str) {
        self.utility_pages.remove(name);
    }

    /// Replace one language's translation entries (last writer wins)
    pub fn add_or_update_translation(&self, language: &str, entries: BTreeMap<String, String>) {
        self.translations
            .insert(language.to_string(), Arc::new(entries));
    }

    /// Remove one language from the catalog
    pub fn remove_translation(&self, language: &str) {
        self.translations.remove(language);
    }

    /// Look up a translation by language and key
    pub fn translation(&self, language: &str, key: &str) -> Option<String> {
        self.translations
            .get(language)
            .and_then(|entries| entries.get(key).cloned())
    }

    /// Languages present in the catalog
    pub fn languages(&self) -> Vec<String> {
        self.translations.iter().map(|e| e.key().clone()).collect()
    }

    /// Replace the host-wide script-library list
    pub fn set_script_libraries(&self, libraries: Vec<HostScriptLibrary>) {
        *self.script_libraries.write().unwrap() = libraries;
    }

    /// The host-wide script-library list
    pub fn script_libraries(&self) -> Vec<HostScriptLibrary> {
        self.script_libraries.read().unwrap().clone()
    }

    /// Replace the host-level required backends (from host script libraries)
    pub fn set_host_backends(&self, backends: Vec<BackendRef>) {
        *self.host_backends.write().unwrap() = backends;
    }

    /// Union of host-level backends and every composed record's backends,
    /// deduplicated by name
    pub fn required_backends(&self) -> Vec<BackendRef> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        let mut push = |b: &BackendRef| {
            if seen.insert(b.name.clone()) {
                out.push(b.clone());
            }
        };
        for b in self.host_backends.read().unwrap().iter() {
            push(b);
        }
        for entry in self.pages.iter() {
            for b in &entry.value().backends {
                push(b);
            }
        }
        for entry in self.utility_pages.iter() {
            for b in &entry.value().backends {
                push(b);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

/// Thread-safe mapping from hostname to host handler
///
/// Cloning is cheap; all clones share the same underlying map.
#[derive(Clone, Default)]
pub struct RuntimeStore {
    hosts: Arc<DashMap<String, Arc<HostHandler>>>,
}

impl RuntimeStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a host handler
    pub fn get(&self, hostname: &str) -> Option<Arc<HostHandler>> {
        self.hosts.get(hostname).map(|h| Arc::clone(&h))
    }

    /// Get or create the handler for a hostname, refreshing its metadata
    ///
    /// Existing page, utility-page, and translation collections survive a
    /// metadata refresh.
    pub fn ensure_host(
        &self,
        hostname: &str,
        namespace: &str,
        controller: &str,
        default_server_image: &str,
    ) -> Arc<HostHandler> {
        let handler = self
            .hosts
            .entry(hostname.to_string())
            .or_insert_with(|| {
                Arc::new(HostHandler::new(
                    hostname,
                    namespace,
                    controller,
                    default_server_image,
                ))
            })
            .clone();
        handler.update_meta(namespace, controller, default_server_image);
        handler
    }

    /// Remove a host and all composed state under it
    pub fn remove(&self, hostname: &str) {
        self.hosts.remove(hostname);
    }

    /// All hostnames currently present
    pub fn host_names(&self) -> Vec<String> {
        self.hosts.iter().map(|e| e.key().clone()).collect()
    }

    /// Hostnames owned by the given controller in the given namespace
    pub fn hosts_for_controller(&self, namespace: &str, controller: &str) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|e| {
                let meta = e.value().meta.read().unwrap();
                meta.namespace == namespace && meta.controller == controller
            })
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LocalObjectReference, RefKind, TypedObjectReference};

    fn sample_page(host: &str, name: &str) -> PageHandler {
        PageHandler {
            host: host.to_string(),
            name: name.to_string(),
            path: Some("/".to_string()),
            template: "<main>{content}</main>".to_string(),
            header: "<header/>".to_string(),
            footer: "<footer/>".to_string(),
            navigation: BTreeMap::new(),
            content: BTreeMap::new(),
            packages: vec![],
            backends: vec![],
            scripts: vec![],
            source: PageSource::Binding(LoomPageBindingSpec {
                host_ref: LocalObjectReference::new("site"),
                path: "/".to_string(),
                archetype_ref: TypedObjectReference::new(RefKind::PageArchetype, "standard"),
                parent_ref: None,
                content: vec![],
                header_ref: None,
                footer_ref: None,
                navigation_refs: BTreeMap::new(),
                script_library_ref: None,
            }),
        }
    }

    fn backend(name: &str) -> BackendRef {
        BackendRef {
            kind: "LoomApp".to_string(),
            name: name.to_string(),
            namespace: "tenant-a".to_string(),
            image: "registry.example.org/custom:1".to_string(),
        }
    }

    #[test]
    fn test_ensure_host_then_get() {
        let store = RuntimeStore::new();
        assert!(store.get("www.example.org").is_none());

        store.ensure_host("www.example.org", "tenant-a", "main", "default:1");
        let handler = store.get("www.example.org").unwrap();
        assert_eq!(handler.hostname(), "www.example.org");
        assert_eq!(handler.controller(), "main");
    }

    #[test]
    fn test_ensure_host_preserves_pages_on_meta_refresh() {
        let store = RuntimeStore::new();
        let handler = store.ensure_host("www.example.org", "tenant-a", "main", "default:1");
        handler.set_page(sample_page("www.example.org", "home"));

        let handler = store.ensure_host("www.example.org", "tenant-a", "main", "default:2");
        assert!(handler.page("home").is_some());
        assert_eq!(handler.default_server_image(), "default:2");
    }

    #[test]
    fn test_page_replace_wholesale() {
        let store = RuntimeStore::new();
        let handler = store.ensure_host("www.example.org", "tenant-a", "main", "default:1");

        handler.set_page(sample_page("www.example.org", "home"));
        let before = handler.page("home").unwrap();

        let mut updated = sample_page("www.example.org", "home");
        updated.header = "<header>v2</header>".to_string();
        handler.set_page(updated);

        let after = handler.page("home").unwrap();
        assert_ne!(before.header, after.header);
        // The old snapshot is untouched
        assert_eq!(before.header, "<header/>");
    }

    #[test]
    fn test_remove_host_drops_all_pages() {
        let store = RuntimeStore::new();
        let handler = store.ensure_host("www.example.org", "tenant-a", "main", "default:1");
        handler.set_page(sample_page("www.example.org", "home"));

        store.remove("www.example.org");
        assert!(store.get("www.example.org").is_none());
    }

    #[test]
    fn test_translation_last_writer_wins() {
        let store = RuntimeStore::new();
        let handler = store.ensure_host("www.example.org", "tenant-a", "main", "default:1");

        handler.add_or_update_translation(
            "de",
            BTreeMap::from([("greeting".to_string(), "Hallo".to_string())]),
        );
        handler.add_or_update_translation(
            "de",
            BTreeMap::from([("greeting".to_string(), "Moin".to_string())]),
        );

        assert_eq!(
            handler.translation("de", "greeting"),
            Some("Moin".to_string())
        );
        assert_eq!(handler.translation("en", "greeting"), None);

        handler.remove_translation("de");
        assert_eq!(handler.translation("de", "greeting"), None);
    }

    #[test]
    fn test_required_backends_union() {
        let store = RuntimeStore::new();
        let handler = store.ensure_host("www.example.org", "tenant-a", "main", "default:1");

        handler.set_host_backends(vec![backend("host-lib")]);

        let mut page = sample_page("www.example.org", "home");
        page.backends = vec![backend("shop"), backend("host-lib")];
        handler.set_page(page);

        let backends = handler.required_backends();
        let names: Vec<&str> = backends.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["host-lib", "shop"]);
    }

    #[test]
    fn test_required_backends_shrink_after_page_removal() {
        let store = RuntimeStore::new();
        let handler = store.ensure_host("www.example.org", "tenant-a", "main", "default:1");

        let mut page = sample_page("www.example.org", "home");
        page.backends = vec![backend("shop")];
        handler.set_page(page);
        assert_eq!(handler.required_backends().len(), 1);

        handler.remove_page("home");
        assert!(handler.required_backends().is_empty());
    }

    #[test]
    fn test_hosts_for_controller() {
        let store = RuntimeStore::new();
        store.ensure_host("a.example.org", "tenant-a", "main", "default:1");
        store.ensure_host("b.example.org", "tenant-a", "other", "default:1");
        store.ensure_host("c.example.org", "tenant-b", "main", "default:1");

        let mut hosts = store.hosts_for_controller("tenant-a", "main");
        hosts.sort();
        assert_eq!(hosts, vec!["a.example.org"]);
    }

    #[test]
    fn test_concurrent_writers_distinct_pages() {
        let store = RuntimeStore::new();
        store.ensure_host("www.example.org", "tenant-a", "main", "default:1");

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let handler = store.get("www.example.org").unwrap();
                handler.set_page(sample_page("www.example.org", &format!("page-{}", i)));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let handler = store.get("www.example.org").unwrap();
        assert_eq!(handler.page_names().len(), 8);
    }

    #[test]
    fn test_page_handler_serialization_is_deterministic() {
        let a = serde_json::to_vec(&sample_page("www.example.org", "home")).unwrap();
        let b = serde_json::to_vec(&sample_page("www.example.org", "home")).unwrap();
        assert_eq!(a, b);
    }
}
