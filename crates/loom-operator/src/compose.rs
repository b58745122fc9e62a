//! The composition engine
//!
//! Given a page binding (or utility page), resolve its full reference graph
//! in a fixed order, accumulate script/package/backend collections and
//! generation fingerprints, and assemble the composed [`PageHandler`] into
//! the owning host's runtime state.
//!
//! Every resolution step that hits a missing dependency short-circuits the
//! whole pass with a recoverable error; the steps after it run again on the
//! next attempt, once more of the graph may exist. Re-running with unchanged
//! inputs produces a byte-identical handler.

use crate::collect::{backend_for, unique_backend_refs, unique_package_refs, unique_script_defs};
use crate::crd::{
    ContentEntry, LocalObjectReference, LoomPageBindingSpec, LoomUtilityPageSpec, PackageReference,
    RefFamily, RefKind, ScriptDefinition, TypedObjectReference,
};
use crate::error::{Error, Result};
use crate::resolver::{ObjectStore, ResolvedApp, ResolvedScriptLibrary, Resolver};
use crate::store::{BackendRef, PackedContent, PageHandler, PageSource, RuntimeStore};
use std::collections::BTreeMap;

/// The explicit result of one composition pass
///
/// The controller wrapper turns this into status conditions; the handler has
/// already been written into the runtime store.
#[derive(Debug, Clone)]
pub struct Composition {
    /// Hostname the handler was filed under
    pub hostname: String,
    /// Dependency-generation fingerprints accumulated during resolution
    pub attributes: BTreeMap<String, String>,
    /// The composed record
    pub handler: PageHandler,
}

/// Accumulates scripts, packages, and backends across resolution steps
#[derive(Default)]
struct Accumulator {
    scripts: Vec<ScriptDefinition>,
    packages: Vec<PackageReference>,
    backends: Vec<BackendRef>,
}

impl Accumulator {
    fn library(&mut self, library: &ResolvedScriptLibrary, default_server_image: &str) {
        self.scripts.extend(library.spec.scripts.iter().cloned());
        if let Some(package) = &library.spec.package_ref {
            self.packages.push(package.clone());
        }
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
            default_server_image,
        ) {
            self.backends.push(backend);
        }
    }

    fn app(&mut self, app: &ResolvedApp, default_server_image: &str) {
        self.scripts.extend(app.spec.scripts.iter().cloned());
        if let Some(package) = &app.spec.package_ref {
            self.packages.push(package.clone());
        }
        if let Some(backend) = backend_for(
            RefKind::App.as_kind(),
            &app.name,
            &app.namespace,
            app.spec.server_image.as_deref(),
            app.spec.static_image.as_deref(),
            default_server_image,
        ) {
            self.backends.push(backend);
        }
    }
}

/// Common shape of the two page-like specs
struct PageLike<'a> {
    host_ref: &'a LocalObjectReference,
    archetype_ref: &'a TypedObjectReference,
    content: &'a [ContentEntry],
    header_ref: Option<&'a TypedObjectReference>,
    footer_ref: Option<&'a TypedObjectReference>,
    navigation_refs: &'a BTreeMap<String, TypedObjectReference>,
    script_library_ref: Option<&'a TypedObjectReference>,
    parent_ref: Option<&'a LocalObjectReference>,
    path: Option<&'a str>,
}

/// Compose a page binding into its host's page collection
pub async fn compose_page(
    objects: &dyn ObjectStore,
    runtime: &RuntimeStore,
    namespace: &str,
    name: &str,
    spec: &LoomPageBindingSpec,
) -> Result<Composition> {
    // Structural invariant first: a root page must not declare a parent,
    // regardless of whether any dependency resolves.
    if spec.path == "/" && spec.parent_ref.is_some() {
        return Err(Error::InvalidSpec(format!(
            "page binding '{}' has base path \"/\" and must not declare a parent page",
            name
        )));
    }

    let view = PageLike {
        host_ref: &spec.host_ref,
        archetype_ref: &spec.archetype_ref,
        content: &spec.content,
        header_ref: spec.header_ref.as_ref(),
        footer_ref: spec.footer_ref.as_ref(),
        navigation_refs: &spec.navigation_refs,
        script_library_ref: spec.script_library_ref.as_ref(),
        parent_ref: spec.parent_ref.as_ref(),
        path: Some(spec.path.as_str()),
    };

    let composition = compose(
        objects,
        runtime,
        namespace,
        name,
        view,
        PageSource::Binding(spec.clone()),
    )
    .await?;

    runtime
        .get(&composition.hostname)
        .ok_or_else(|| Error::HostNotReady(composition.hostname.clone()))?
        .set_page(composition.handler.clone());

    Ok(composition)
}

/// Compose a utility page into its host's utility-page collection
pub async fn compose_utility_page(
    objects: &dyn ObjectStore,
    runtime: &RuntimeStore,
    namespace: &str,
    name: &str,
    spec: &LoomUtilityPageSpec,
) -> Result<Composition> {
    let page_name = spec.name.clone().unwrap_or_else(|| name.to_string());

    let view = PageLike {
        host_ref: &spec.host_ref,
        archetype_ref: &spec.archetype_ref,
        content: &spec.content,
        header_ref: spec.header_ref.as_ref(),
        footer_ref: spec.footer_ref.as_ref(),
        navigation_refs: &spec.navigation_refs,
        script_library_ref: spec.script_library_ref.as_ref(),
        parent_ref: None,
        path: None,
    };

    let composition = compose(
        objects,
        runtime,
        namespace,
        &page_name,
        view,
        PageSource::Utility(spec.clone()),
    )
    .await?;

    runtime
        .get(&composition.hostname)
        .ok_or_else(|| Error::HostNotReady(composition.hostname.clone()))?
        .set_utility_page(composition.handler.clone());

    Ok(composition)
}

async fn compose(
    objects: &dyn ObjectStore,
    runtime: &RuntimeStore,
    namespace: &str,
    name: &str,
    view: PageLike<'_>,
    source: PageSource,
) -> Result<Composition> {
    let mut resolver = Resolver::new(objects, namespace);
    let mut acc = Accumulator::default();

    // The owning host: the LoomHost object names the hostname, the runtime
    // store entry for it must already have been created by the host
    // controller. Both absences are expected transient states.
    let host = resolver.host(view.host_ref).await?;
    let hostname = host.spec.hostname.clone();
    let handler = runtime
        .get(&hostname)
        .ok_or_else(|| Error::HostNotReady(hostname.clone()))?;
    let default_server_image = handler.default_server_image();
    drop(handler);

    // 1. Archetype
    let archetype = resolver.archetype("archetype", view.archetype_ref).await?;

    // 2. The archetype's own script library
    if let Some(library) = resolver
        .script_library(
            "archetype.library",
            archetype.spec.script_library_ref.as_ref(),
        )
        .await?
    {
        acc.library(&library, &default_server_image);
    }

    // 3. Content entries
    let mut content = BTreeMap::new();
    for entry in view.content {
        let packed = match (&entry.inline, &entry.app_ref) {
            (Some(markup), _) => PackedContent {
                markup: markup.clone(),
                app_generation: None,
            },
            (None, Some(app_ref)) => {
                let app = resolver
                    .app(&format!("content.{}", entry.slot), app_ref)
                    .await?;
                acc.app(&app, &default_server_image);
                PackedContent {
                    markup: app.spec.template.clone(),
                    app_generation: Some(app.generation),
                }
            }
            (None, None) => {
                // Validation rejects this; an empty slot composed anyway
                // renders as nothing rather than failing the page.
                PackedContent {
                    markup: String::new(),
                    app_generation: None,
                }
            }
        };
        content.insert(entry.slot.clone(), packed);
    }

    // 4. Effective header, footer, and navigation: explicit override if
    //    present, else the archetype's default; for navigation the override
    //    map merges over the defaults (and the archetype's named extras),
    //    override wins per key. Each resolved fragment's own script library
    //    is one more hop.
    let header = match view.header_ref.or(archetype.spec.header_ref.as_ref()) {
        Some(reference) => {
            let fragment = resolver
                .fragment("header", reference, RefFamily::Header)
                .await?;
            if let Some(library) = resolver
                .script_library("header.library", fragment.script_library_ref.as_ref())
                .await?
            {
                acc.library(&library, &default_server_image);
            }
            fragment.content
        }
        None => String::new(),
    };

    let footer = match view.footer_ref.or(archetype.spec.footer_ref.as_ref()) {
        Some(reference) => {
            let fragment = resolver
                .fragment("footer", reference, RefFamily::Footer)
                .await?;
            if let Some(library) = resolver
                .script_library("footer.library", fragment.script_library_ref.as_ref())
                .await?
            {
                acc.library(&library, &default_server_image);
            }
            fragment.content
        }
        None => String::new(),
    };

    let mut navigation_refs: BTreeMap<&str, &TypedObjectReference> = BTreeMap::new();
    for (slot, reference) in &archetype.spec.navigation_refs {
        navigation_refs.insert(slot.as_str(), reference);
    }
    for (slot, reference) in &archetype.spec.extra_navigation_refs {
        navigation_refs.insert(slot.as_str(), reference);
    }
    for (slot, reference) in view.navigation_refs {
        navigation_refs.insert(slot.as_str(), reference);
    }

    let mut navigation = BTreeMap::new();
    for (slot, reference) in navigation_refs {
        let role = format!("navigation.{}", slot);
        let fragment = resolver
            .fragment(&role, reference, RefFamily::Navigation)
            .await?;
        if let Some(library) = resolver
            .script_library(
                &format!("{}.library", role),
                fragment.script_library_ref.as_ref(),
            )
            .await?
        {
            acc.library(&library, &default_server_image);
        }
        navigation.insert(slot.to_string(), fragment.content);
    }

    // 5. Parent page: existence and generation only
    if let Some(parent_ref) = view.parent_ref {
        resolver.parent_page(parent_ref).await?;
    }

    // 6. The binding's own script library
    if let Some(library) = resolver
        .script_library("library", view.script_library_ref)
        .await?
    {
        acc.library(&library, &default_server_image);
    }

    // 7. Deduplicate the accumulated collections
    let packages = unique_package_refs(acc.packages);
    let backends = unique_backend_refs(acc.backends);
    let scripts = unique_script_defs(acc.scripts);

    let handler = PageHandler {
        host: hostname.clone(),
        name: name.to_string(),
        path: view.path.map(str::to_string),
        template: archetype.spec.template.clone(),
        header,
        footer,
        navigation,
        content,
        packages,
        backends,
        scripts,
        source,
    };

    Ok(Composition {
        hostname,
        attributes: resolver.into_attributes(),
        handler,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ArchetypeSpec, LoomAppSpec, LoomHostSpec, ScriptLibrarySpec};
    use crate::resolver::fake::FakeStore;

    const NS: &str = "tenant-a";
    const HOSTNAME: &str = "www.example.org";
    const DEFAULT_IMAGE: &str = "ghcr.io/loom-sh/loom-server:latest";

    fn typed(kind: RefKind, name: &str) -> TypedObjectReference {
        TypedObjectReference::new(kind, name)
    }

    fn host_spec() -> LoomHostSpec {
        LoomHostSpec {
            hostname: HOSTNAME.to_string(),
            controller_ref: LocalObjectReference::new("main"),
            script_library_refs: vec![],
            title_prefix: None,
            default_language: "en".to_string(),
        }
    }

    fn binding_spec() -> LoomPageBindingSpec {
        LoomPageBindingSpec {
            host_ref: LocalObjectReference::new("site"),
            path: "/docs".to_string(),
            archetype_ref: typed(RefKind::PageArchetype, "standard"),
            parent_ref: None,
            content: vec![],
            header_ref: None,
            footer_ref: None,
            navigation_refs: BTreeMap::new(),
            script_library_ref: None,
        }
    }

    fn script(content: &str) -> ScriptDefinition {
        ScriptDefinition {
            tag: "script".to_string(),
            content: content.to_string(),
        }
    }

    fn library_with(scripts: Vec<ScriptDefinition>) -> ScriptLibrarySpec {
        ScriptLibrarySpec {
            scripts,
            package_ref: None,
            server_image: None,
            static_image: None,
        }
    }

    /// Fake store with host "site", archetype "standard", and a prepared
    /// runtime entry for the hostname
    fn seeded() -> (FakeStore, RuntimeStore) {
        let objects = FakeStore::new();
        objects.put_host(NS, "site", host_spec(), 1);
        objects.put_archetype(
            RefKind::PageArchetype,
            Some(NS),
            "standard",
            ArchetypeSpec {
                template: "<main>{content}</main>".to_string(),
                ..Default::default()
            },
            1,
        );
        let runtime = RuntimeStore::new();
        runtime.ensure_host(HOSTNAME, NS, "main", DEFAULT_IMAGE);
        (objects, runtime)
    }

    #[tokio::test]
    async fn test_missing_archetype_is_recoverable_then_converges() {
        let objects = FakeStore::new();
        objects.put_host(NS, "site", host_spec(), 1);
        let runtime = RuntimeStore::new();
        runtime.ensure_host(HOSTNAME, NS, "main", DEFAULT_IMAGE);

        let spec = binding_spec();
        let err = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("archetype"));

        // Create the archetype; the retry now succeeds and the page lands
        // in the host's collection.
        objects.put_archetype(
            RefKind::PageArchetype,
            Some(NS),
            "standard",
            ArchetypeSpec {
                template: "<main/>".to_string(),
                ..Default::default()
            },
            1,
        );
        let composition = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap();
        assert_eq!(composition.hostname, HOSTNAME);
        assert!(runtime.get(HOSTNAME).unwrap().page("docs").is_some());
    }

    #[tokio::test]
    async fn test_missing_host_object_vs_missing_store_entry() {
        // Host object absent entirely
        let objects = FakeStore::new();
        let runtime = RuntimeStore::new();
        let spec = binding_spec();
        let err = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DependencyMissing { .. }));

        // Host object present, store entry not created yet
        objects.put_host(NS, "site", host_spec(), 1);
        let err = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HostNotReady(ref h) if h == HOSTNAME));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_root_page_with_parent_is_fatal_regardless_of_dependencies() {
        // Nothing else exists; the invariant still fires first.
        let objects = FakeStore::new();
        let runtime = RuntimeStore::new();

        let mut spec = binding_spec();
        spec.path = "/".to_string();
        spec.parent_ref = Some(LocalObjectReference::new("other"));

        let err = compose_page(&objects, &runtime, NS, "home", &spec)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_header_falls_back_to_archetype_default() {
        let (objects, runtime) = seeded();
        objects.put_archetype(
            RefKind::PageArchetype,
            Some(NS),
            "standard",
            ArchetypeSpec {
                template: "<main/>".to_string(),
                header_ref: Some(typed(RefKind::Header, "default-header")),
                ..Default::default()
            },
            2,
        );
        objects.put_fragment(
            RefKind::Header,
            Some(NS),
            "default-header",
            "<header>default</header>",
            None,
            1,
        );
        objects.put_fragment(
            RefKind::Header,
            Some(NS),
            "special-header",
            "<header>special</header>",
            None,
            1,
        );

        // No override: archetype default applies
        let spec = binding_spec();
        let composition = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap();
        assert_eq!(composition.handler.header, "<header>default</header>");

        // Override wins
        let mut spec = binding_spec();
        spec.header_ref = Some(typed(RefKind::Header, "special-header"));
        let composition = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap();
        assert_eq!(composition.handler.header, "<header>special</header>");
    }

    #[tokio::test]
    async fn test_navigation_override_merges_per_key() {
        let (objects, runtime) = seeded();
        objects.put_archetype(
            RefKind::PageArchetype,
            Some(NS),
            "standard",
            ArchetypeSpec {
                template: "<main/>".to_string(),
                navigation_refs: BTreeMap::from([
                    ("top".to_string(), typed(RefKind::Navigation, "top-default")),
                    ("side".to_string(), typed(RefKind::Navigation, "side-default")),
                ]),
                extra_navigation_refs: BTreeMap::from([(
                    "legal".to_string(),
                    typed(RefKind::Navigation, "legal-nav"),
                )]),
                ..Default::default()
            },
            1,
        );
        for (name, markup) in [
            ("top-default", "<nav>top default</nav>"),
            ("side-default", "<nav>side default</nav>"),
            ("legal-nav", "<nav>legal</nav>"),
            ("top-special", "<nav>top special</nav>"),
        ] {
            objects.put_fragment(RefKind::Navigation, Some(NS), name, markup, None, 1);
        }

        let mut spec = binding_spec();
        spec.navigation_refs.insert(
            "top".to_string(),
            typed(RefKind::Navigation, "top-special"),
        );

        let composition = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap();
        let nav = &composition.handler.navigation;
        assert_eq!(nav["top"], "<nav>top special</nav>");
        assert_eq!(nav["side"], "<nav>side default</nav>");
        assert_eq!(nav["legal"], "<nav>legal</nav>");
    }

    #[tokio::test]
    async fn test_fragment_script_library_collected_one_hop() {
        let (objects, runtime) = seeded();
        objects.put_fragment(
            RefKind::Footer,
            Some(NS),
            "main",
            "<footer/>",
            Some(typed(RefKind::ScriptLibrary, "footer-lib")),
            1,
        );
        objects.put_library(
            RefKind::ScriptLibrary,
            Some(NS),
            "footer-lib",
            library_with(vec![script("footer.js")]),
            1,
        );

        let mut spec = binding_spec();
        spec.footer_ref = Some(typed(RefKind::Footer, "main"));

        let composition = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap();
        assert_eq!(composition.handler.scripts.len(), 1);
        assert_eq!(composition.handler.scripts[0].content, "footer.js");
        assert!(composition
            .attributes
            .contains_key("footer.library.generation"));
    }

    #[tokio::test]
    async fn test_identical_scripts_from_different_libraries_collapse() {
        let (objects, runtime) = seeded();
        objects.put_archetype(
            RefKind::PageArchetype,
            Some(NS),
            "standard",
            ArchetypeSpec {
                template: "<main/>".to_string(),
                script_library_ref: Some(typed(RefKind::ScriptLibrary, "lib-a")),
                ..Default::default()
            },
            1,
        );
        objects.put_library(
            RefKind::ScriptLibrary,
            Some(NS),
            "lib-a",
            library_with(vec![script("analytics.js"), script("shared.js")]),
            1,
        );
        objects.put_library(
            RefKind::ScriptLibrary,
            Some(NS),
            "lib-b",
            library_with(vec![script("shared.js")]),
            1,
        );

        let mut spec = binding_spec();
        spec.script_library_ref = Some(typed(RefKind::ScriptLibrary, "lib-b"));

        let composition = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap();
        let contents: Vec<&str> = composition
            .handler
            .scripts
            .iter()
            .map(|s| s.content.as_str())
            .collect();
        assert_eq!(contents, vec!["analytics.js", "shared.js"]);
    }

    #[tokio::test]
    async fn test_package_refs_deduplicated_across_sources() {
        let (objects, runtime) = seeded();
        let package = PackageReference {
            name: "widgets".to_string(),
            version: "1.0.0".to_string(),
            secret_ref: None,
        };
        objects.put_library(
            RefKind::ScriptLibrary,
            Some(NS),
            "lib-a",
            ScriptLibrarySpec {
                package_ref: Some(package.clone()),
                ..Default::default()
            },
            1,
        );
        objects.put_app(
            NS,
            "shop",
            LoomAppSpec {
                template: "<div>shop</div>".to_string(),
                scripts: vec![],
                package_ref: Some(package),
                server_image: None,
                static_image: None,
            },
            1,
        );

        let mut spec = binding_spec();
        spec.script_library_ref = Some(typed(RefKind::ScriptLibrary, "lib-a"));
        spec.content = vec![ContentEntry {
            slot: "main".to_string(),
            inline: None,
            app_ref: Some(LocalObjectReference::new("shop")),
        }];

        let composition = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap();
        assert_eq!(composition.handler.packages.len(), 1);
        assert_eq!(composition.handler.packages[0].key(), "widgets@1.0.0");
    }

    #[tokio::test]
    async fn test_app_content_packed_with_generation_and_backend() {
        let (objects, runtime) = seeded();
        objects.put_app(
            NS,
            "shop",
            LoomAppSpec {
                template: "<div>shop</div>".to_string(),
                scripts: vec![script("shop.js")],
                package_ref: None,
                server_image: Some("registry.example.org/shop-backend:2".to_string()),
                static_image: None,
            },
            9,
        );

        let mut spec = binding_spec();
        spec.content = vec![
            ContentEntry {
                slot: "main".to_string(),
                inline: None,
                app_ref: Some(LocalObjectReference::new("shop")),
            },
            ContentEntry {
                slot: "intro".to_string(),
                inline: Some("<p>welcome</p>".to_string()),
                app_ref: None,
            },
        ];

        let composition = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap();
        let handler = &composition.handler;

        assert_eq!(handler.content["main"].markup, "<div>shop</div>");
        assert_eq!(handler.content["main"].app_generation, Some(9));
        assert_eq!(handler.content["intro"].markup, "<p>welcome</p>");
        assert_eq!(handler.content["intro"].app_generation, None);

        assert_eq!(handler.backends.len(), 1);
        assert_eq!(handler.backends[0].name, "shop");
        assert_eq!(handler.backends[0].image, "registry.example.org/shop-backend:2");

        assert_eq!(
            composition.attributes.get("content.main.generation"),
            Some(&"9".to_string())
        );
    }

    #[tokio::test]
    async fn test_default_server_image_collects_no_backend() {
        let (objects, runtime) = seeded();
        objects.put_app(
            NS,
            "plain",
            LoomAppSpec {
                template: "<div/>".to_string(),
                scripts: vec![],
                package_ref: None,
                server_image: Some(DEFAULT_IMAGE.to_string()),
                static_image: None,
            },
            1,
        );

        let mut spec = binding_spec();
        spec.content = vec![ContentEntry {
            slot: "main".to_string(),
            inline: None,
            app_ref: Some(LocalObjectReference::new("plain")),
        }];

        let composition = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap();
        assert!(composition.handler.backends.is_empty());
    }

    #[tokio::test]
    async fn test_idempotent_composition_is_byte_identical() {
        let (objects, runtime) = seeded();
        objects.put_fragment(RefKind::Footer, Some(NS), "main", "<footer/>", None, 1);

        let mut spec = binding_spec();
        spec.footer_ref = Some(typed(RefKind::Footer, "main"));

        let first = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap();
        let second = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap();

        assert_eq!(
            serde_json::to_vec(&first.handler).unwrap(),
            serde_json::to_vec(&second.handler).unwrap()
        );
        assert_eq!(first.attributes, second.attributes);
    }

    #[tokio::test]
    async fn test_parent_resolution_recorded() {
        let (objects, runtime) = seeded();
        objects.put_binding(NS, "home", "/", 3);

        let mut spec = binding_spec();
        spec.parent_ref = Some(LocalObjectReference::new("home"));

        let composition = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap();
        assert_eq!(
            composition.attributes.get("parent.generation"),
            Some(&"3".to_string())
        );

        // Parent missing stalls the pass recoverably
        let mut spec = binding_spec();
        spec.parent_ref = Some(LocalObjectReference::new("gone"));
        let err = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_utility_page_lands_in_utility_collection() {
        let (objects, runtime) = seeded();

        let spec = LoomUtilityPageSpec {
            host_ref: LocalObjectReference::new("site"),
            name: Some("404".to_string()),
            archetype_ref: typed(RefKind::PageArchetype, "standard"),
            content: vec![ContentEntry {
                slot: "main".to_string(),
                inline: Some("<p>not found</p>".to_string()),
                app_ref: None,
            }],
            header_ref: None,
            footer_ref: None,
            navigation_refs: BTreeMap::new(),
            script_library_ref: None,
        };

        let composition = compose_utility_page(&objects, &runtime, NS, "not-found", &spec)
            .await
            .unwrap();
        assert_eq!(composition.handler.name, "404");
        assert!(composition.handler.path.is_none());

        let handler = runtime.get(HOSTNAME).unwrap();
        assert!(handler.utility_page("404").is_some());
        assert!(handler.page("404").is_none());
    }

    #[tokio::test]
    async fn test_cluster_scoped_archetype_and_library() {
        let objects = FakeStore::new();
        objects.put_host(NS, "site", host_spec(), 1);
        objects.put_archetype(
            RefKind::ClusterPageArchetype,
            None,
            "corporate",
            ArchetypeSpec {
                template: "<main/>".to_string(),
                script_library_ref: Some(typed(RefKind::ClusterScriptLibrary, "base")),
                ..Default::default()
            },
            1,
        );
        objects.put_library(
            RefKind::ClusterScriptLibrary,
            None,
            "base",
            library_with(vec![script("base.js")]),
            1,
        );
        let runtime = RuntimeStore::new();
        runtime.ensure_host(HOSTNAME, NS, "main", DEFAULT_IMAGE);

        let mut spec = binding_spec();
        spec.archetype_ref = typed(RefKind::ClusterPageArchetype, "corporate");

        let composition = compose_page(&objects, &runtime, NS, "docs", &spec)
            .await
            .unwrap();
        assert_eq!(composition.handler.scripts.len(), 1);
        assert_eq!(
            composition.attributes.get("archetype.generation"),
            Some(&"1".to_string())
        );
    }
}
