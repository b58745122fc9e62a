//! Typed-reference resolution
//!
//! Every composition step goes through [`Resolver`]: it dispatches a
//! [`TypedObjectReference`] onto the namespace- or cluster-scoped variant of
//! the target kind, normalizes both variants into one extracted shape, and
//! records the resolved object's generation under `<role>.generation` so the
//! produced status can fingerprint its dependency versions.
//!
//! A missing target is not a hard failure: it becomes
//! [`Error::DependencyMissing`], the recoverable class the reconcilers turn
//! into a Degraded condition plus a bounded requeue. Any other object-store
//! error propagates unchanged.
//!
//! Object fetching sits behind the [`ObjectStore`] trait so the composition
//! engine is testable against an in-memory store.

use crate::crd::{
    ArchetypeSpec, LocalObjectReference, LoomApp, LoomAppSpec, LoomClusterFooter,
    LoomClusterHeader, LoomClusterNavigation, LoomClusterPageArchetype, LoomClusterScriptLibrary,
    LoomFooter, LoomHeader, LoomHost, LoomHostSpec, LoomNavigation, LoomPageArchetype,
    LoomPageBinding, LoomScriptLibrary, RefFamily, RefKind, TypedObjectReference,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::Api;
use kube::Client;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// A fragment (header, footer, navigation) normalized across its
/// namespace- and cluster-scoped variants
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFragment {
    pub content: String,
    pub script_library_ref: Option<TypedObjectReference>,
    pub generation: i64,
}

/// An archetype normalized across its two variants
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedArchetype {
    pub spec: ArchetypeSpec,
    pub generation: i64,
}

/// A script library normalized across its two variants
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedScriptLibrary {
    pub name: String,
    /// None for the cluster-scoped variant
    pub namespace: Option<String>,
    pub spec: crate::crd::ScriptLibrarySpec,
    pub generation: i64,
}

/// A resolved app
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedApp {
    pub name: String,
    pub namespace: String,
    pub spec: LoomAppSpec,
    pub generation: i64,
}

/// A resolved host
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedHost {
    pub name: String,
    pub namespace: String,
    pub spec: LoomHostSpec,
    pub generation: i64,
}

/// A resolved parent page (existence-only dependency)
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParent {
    pub name: String,
    pub path: String,
    pub generation: i64,
}

/// Read access to the object graph the composition engine resolves against
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a fragment by kind; `Ok(None)` when the target does not exist
    async fn fragment(
        &self,
        kind: RefKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ResolvedFragment>>;

    /// Fetch an archetype by kind
    async fn archetype(
        &self,
        kind: RefKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ResolvedArchetype>>;

    /// Fetch a script library by kind
    async fn script_library(
        &self,
        kind: RefKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ResolvedScriptLibrary>>;

    /// Fetch an app
    async fn app(&self, namespace: &str, name: &str) -> Result<Option<ResolvedApp>>;

    /// Fetch a host
    async fn host(&self, namespace: &str, name: &str) -> Result<Option<ResolvedHost>>;

    /// Fetch a page binding (for parent-page resolution)
    async fn page_binding(&self, namespace: &str, name: &str) -> Result<Option<ResolvedParent>>;
}

/// Object store backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_opt<K>(&self, api: Api<K>, name: &str) -> Result<Option<K>>
    where
        K: kube::Resource + Clone + DeserializeOwned + Debug,
    {
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn namespaced<K>(&self, namespace: Option<&str>) -> Result<Api<K>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        let ns = namespace.ok_or_else(|| {
            Error::InvalidSpec("namespaced reference resolved without a namespace".to_string())
        })?;
        Ok(Api::namespaced(self.client.clone(), ns))
    }

    fn cluster<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>,
        K::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }
}

fn generation_of<K: kube::Resource>(obj: &K) -> i64 {
    obj.meta().generation.unwrap_or(0)
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn fragment(
        &self,
        kind: RefKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ResolvedFragment>> {
        let resolved = match kind {
            RefKind::Header => self
                .get_opt(self.namespaced::<LoomHeader>(namespace)?, name)
                .await?
                .map(|o| (o.spec.fragment.clone(), generation_of(&o))),
            RefKind::ClusterHeader => self
                .get_opt(self.cluster::<LoomClusterHeader>(), name)
                .await?
                .map(|o| (o.spec.fragment.clone(), generation_of(&o))),
            RefKind::Footer => self
                .get_opt(self.namespaced::<LoomFooter>(namespace)?, name)
                .await?
                .map(|o| (o.spec.fragment.clone(), generation_of(&o))),
            RefKind::ClusterFooter => self
                .get_opt(self.cluster::<LoomClusterFooter>(), name)
                .await?
                .map(|o| (o.spec.fragment.clone(), generation_of(&o))),
            RefKind::Navigation => self
                .get_opt(self.namespaced::<LoomNavigation>(namespace)?, name)
                .await?
                .map(|o| (o.spec.fragment.clone(), generation_of(&o))),
            RefKind::ClusterNavigation => self
                .get_opt(self.cluster::<LoomClusterNavigation>(), name)
                .await?
                .map(|o| (o.spec.fragment.clone(), generation_of(&o))),
            other => {
                return Err(Error::InvalidSpec(format!(
                    "kind {} is not a fragment kind",
                    other
                )))
            }
        };

        Ok(resolved.map(|(fragment, generation)| ResolvedFragment {
            content: fragment.content,
            script_library_ref: fragment.script_library_ref,
            generation,
        }))
    }

    async fn archetype(
        &self,
        kind: RefKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ResolvedArchetype>> {
        let resolved = match kind {
            RefKind::PageArchetype => self
                .get_opt(self.namespaced::<LoomPageArchetype>(namespace)?, name)
                .await?
                .map(|o| (o.spec.archetype.clone(), generation_of(&o))),
            RefKind::ClusterPageArchetype => self
                .get_opt(self.cluster::<LoomClusterPageArchetype>(), name)
                .await?
                .map(|o| (o.spec.archetype.clone(), generation_of(&o))),
            other => {
                return Err(Error::InvalidSpec(format!(
                    "kind {} is not an archetype kind",
                    other
                )))
            }
        };

        Ok(resolved.map(|(spec, generation)| ResolvedArchetype { spec, generation }))
    }

    async fn script_library(
        &self,
        kind: RefKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ResolvedScriptLibrary>> {
        let resolved = match kind {
            RefKind::ScriptLibrary => self
                .get_opt(self.namespaced::<LoomScriptLibrary>(namespace)?, name)
                .await?
                .map(|o| {
                    let generation = generation_of(&o);
                    ResolvedScriptLibrary {
                        name: name.to_string(),
                        namespace: namespace.map(str::to_string),
                        spec: o.spec.library.clone(),
                        generation,
                    }
                }),
            RefKind::ClusterScriptLibrary => self
                .get_opt(self.cluster::<LoomClusterScriptLibrary>(), name)
                .await?
                .map(|o| {
                    let generation = generation_of(&o);
                    ResolvedScriptLibrary {
                        name: name.to_string(),
                        namespace: None,
                        spec: o.spec.library.clone(),
                        generation,
                    }
                }),
            other => {
                return Err(Error::InvalidSpec(format!(
                    "kind {} is not a script library kind",
                    other
                )))
            }
        };

        Ok(resolved)
    }

    async fn app(&self, namespace: &str, name: &str) -> Result<Option<ResolvedApp>> {
        let api: Api<LoomApp> = Api::namespaced(self.client.clone(), namespace);
        Ok(self.get_opt(api, name).await?.map(|o| {
            let generation = generation_of(&o);
            ResolvedApp {
                name: name.to_string(),
                namespace: namespace.to_string(),
                spec: o.spec.clone(),
                generation,
            }
        }))
    }

    async fn host(&self, namespace: &str, name: &str) -> Result<Option<ResolvedHost>> {
        let api: Api<LoomHost> = Api::namespaced(self.client.clone(), namespace);
        Ok(self.get_opt(api, name).await?.map(|o| {
            let generation = generation_of(&o);
            ResolvedHost {
                name: name.to_string(),
                namespace: namespace.to_string(),
                spec: o.spec.clone(),
                generation,
            }
        }))
    }

    async fn page_binding(&self, namespace: &str, name: &str) -> Result<Option<ResolvedParent>> {
        let api: Api<LoomPageBinding> = Api::namespaced(self.client.clone(), namespace);
        Ok(self.get_opt(api, name).await?.map(|o| {
            let generation = generation_of(&o);
            ResolvedParent {
                name: name.to_string(),
                path: o.spec.path.clone(),
                generation,
            }
        }))
    }
}

/// Resolves references for one reconciliation pass, stamping generation
/// fingerprints as it goes
pub struct Resolver<'a> {
    store: &'a dyn ObjectStore,
    namespace: String,
    attributes: BTreeMap<String, String>,
}

impl<'a> Resolver<'a> {
    /// Create a resolver for an object living in `namespace`
    pub fn new(store: &'a dyn ObjectStore, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// The accumulated generation fingerprints
    pub fn into_attributes(self) -> BTreeMap<String, String> {
        self.attributes
    }

    /// Record an arbitrary attribute
    pub fn record(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    fn record_generation(&mut self, role: &str, generation: i64) {
        self.attributes
            .insert(format!("{}.generation", role), generation.to_string());
    }

    fn check_family(reference: &TypedObjectReference, family: RefFamily) -> Result<()> {
        if reference.kind.family() != family {
            return Err(Error::InvalidSpec(format!(
                "reference '{}' has kind {}, which is not valid here",
                reference.name, reference.kind
            )));
        }
        Ok(())
    }

    /// Resolve a required fragment reference
    pub async fn fragment(
        &mut self,
        role: &str,
        reference: &TypedObjectReference,
        family: RefFamily,
    ) -> Result<ResolvedFragment> {
        Self::check_family(reference, family)?;
        let ns = reference.effective_namespace(&self.namespace);
        let resolved = self
            .store
            .fragment(reference.kind, ns.as_deref(), &reference.name)
            .await?
            .ok_or_else(|| Error::missing(role, reference.kind, &reference.name, ns))?;
        self.record_generation(role, resolved.generation);
        Ok(resolved)
    }

    /// Resolve an optional fragment reference; `None` in, `None` out
    pub async fn optional_fragment(
        &mut self,
        role: &str,
        reference: Option<&TypedObjectReference>,
        family: RefFamily,
    ) -> Result<Option<ResolvedFragment>> {
        match reference {
            Some(r) if !r.is_empty() => Ok(Some(self.fragment(role, r, family).await?)),
            _ => Ok(None),
        }
    }

    /// Resolve the archetype reference
    pub async fn archetype(
        &mut self,
        role: &str,
        reference: &TypedObjectReference,
    ) -> Result<ResolvedArchetype> {
        Self::check_family(reference, RefFamily::Archetype)?;
        let ns = reference.effective_namespace(&self.namespace);
        let resolved = self
            .store
            .archetype(reference.kind, ns.as_deref(), &reference.name)
            .await?
            .ok_or_else(|| Error::missing(role, reference.kind, &reference.name, ns))?;
        self.record_generation(role, resolved.generation);
        Ok(resolved)
    }

    /// Resolve an optional script-library reference
    pub async fn script_library(
        &mut self,
        role: &str,
        reference: Option<&TypedObjectReference>,
    ) -> Result<Option<ResolvedScriptLibrary>> {
        let reference = match reference {
            Some(r) if !r.is_empty() => r,
            _ => return Ok(None),
        };
        Self::check_family(reference, RefFamily::ScriptLibrary)?;
        let ns = reference.effective_namespace(&self.namespace);
        let resolved = self
            .store
            .script_library(reference.kind, ns.as_deref(), &reference.name)
            .await?
            .ok_or_else(|| Error::missing(role, reference.kind, &reference.name, ns))?;
        self.record_generation(role, resolved.generation);
        Ok(Some(resolved))
    }

    /// Resolve an app reference (same namespace, kind implied)
    pub async fn app(&mut self, role: &str, reference: &LocalObjectReference) -> Result<ResolvedApp> {
        let resolved = self
            .store
            .app(&self.namespace, &reference.name)
            .await?
            .ok_or_else(|| {
                Error::missing(
                    role,
                    RefKind::App,
                    &reference.name,
                    Some(self.namespace.clone()),
                )
            })?;
        self.record_generation(role, resolved.generation);
        Ok(resolved)
    }

    /// Resolve the owning host reference
    pub async fn host(&mut self, reference: &LocalObjectReference) -> Result<ResolvedHost> {
        let resolved = self
            .store
            .host(&self.namespace, &reference.name)
            .await?
            .ok_or_else(|| {
                Error::missing_kind(
                    "host",
                    "LoomHost",
                    &reference.name,
                    Some(self.namespace.clone()),
                )
            })?;
        self.record_generation("host", resolved.generation);
        self.record("host", resolved.spec.hostname.clone());
        Ok(resolved)
    }

    /// Resolve a parent-page reference (existence-only dependency)
    pub async fn parent_page(&mut self, reference: &LocalObjectReference) -> Result<ResolvedParent> {
        let resolved = self
            .store
            .page_binding(&self.namespace, &reference.name)
            .await?
            .ok_or_else(|| {
                Error::missing_kind(
                    "parent",
                    "LoomPageBinding",
                    &reference.name,
                    Some(self.namespace.clone()),
                )
            })?;
        self.record_generation("parent", resolved.generation);
        Ok(resolved)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory object store for engine tests

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Key = (RefKind, Option<String>, String);

    /// HashMap-backed [`ObjectStore`]
    #[derive(Default)]
    pub struct FakeStore {
        pub fragments: Mutex<HashMap<Key, ResolvedFragment>>,
        pub archetypes: Mutex<HashMap<Key, ResolvedArchetype>>,
        pub libraries: Mutex<HashMap<Key, ResolvedScriptLibrary>>,
        pub apps: Mutex<HashMap<(String, String), ResolvedApp>>,
        pub hosts: Mutex<HashMap<(String, String), ResolvedHost>>,
        pub bindings: Mutex<HashMap<(String, String), ResolvedParent>>,
    }

    impl FakeStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn put_fragment(
            &self,
            kind: RefKind,
            namespace: Option<&str>,
            name: &str,
            content: &str,
            library: Option<TypedObjectReference>,
            generation: i64,
        ) {
            self.fragments.lock().unwrap().insert(
                (kind, namespace.map(str::to_string), name.to_string()),
                ResolvedFragment {
                    content: content.to_string(),
                    script_library_ref: library,
                    generation,
                },
            );
        }

        pub fn put_archetype(
            &self,
            kind: RefKind,
            namespace: Option<&str>,
            name: &str,
            spec: ArchetypeSpec,
            generation: i64,
        ) {
            self.archetypes.lock().unwrap().insert(
                (kind, namespace.map(str::to_string), name.to_string()),
                ResolvedArchetype { spec, generation },
            );
        }

        pub fn put_library(
            &self,
            kind: RefKind,
            namespace: Option<&str>,
            name: &str,
            spec: crate::crd::ScriptLibrarySpec,
            generation: i64,
        ) {
            self.libraries.lock().unwrap().insert(
                (kind, namespace.map(str::to_string), name.to_string()),
                ResolvedScriptLibrary {
                    name: name.to_string(),
                    namespace: namespace.map(str::to_string),
                    spec,
                    generation,
                },
            );
        }

        pub fn put_app(&self, namespace: &str, name: &str, spec: LoomAppSpec, generation: i64) {
            self.apps.lock().unwrap().insert(
                (namespace.to_string(), name.to_string()),
                ResolvedApp {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    spec,
                    generation,
                },
            );
        }

        pub fn put_host(&self, namespace: &str, name: &str, spec: LoomHostSpec, generation: i64) {
            self.hosts.lock().unwrap().insert(
                (namespace.to_string(), name.to_string()),
                ResolvedHost {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    spec,
                    generation,
                },
            );
        }

        pub fn put_binding(&self, namespace: &str, name: &str, path: &str, generation: i64) {
            self.bindings.lock().unwrap().insert(
                (namespace.to_string(), name.to_string()),
                ResolvedParent {
                    name: name.to_string(),
                    path: path.to_string(),
                    generation,
                },
            );
        }
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn fragment(
            &self,
            kind: RefKind,
            namespace: Option<&str>,
            name: &str,
        ) -> Result<Option<ResolvedFragment>> {
            Ok(self
                .fragments
                .lock()
                .unwrap()
                .get(&(kind, namespace.map(str::to_string), name.to_string()))
                .cloned())
        }

        async fn archetype(
            &self,
            kind: RefKind,
            namespace: Option<&str>,
            name: &str,
        ) -> Result<Option<ResolvedArchetype>> {
            Ok(self
                .archetypes
                .lock()
                .unwrap()
                .get(&(kind, namespace.map(str::to_string), name.to_string()))
                .cloned())
        }

        async fn script_library(
            &self,
            kind: RefKind,
            namespace: Option<&str>,
            name: &str,
        ) -> Result<Option<ResolvedScriptLibrary>> {
            Ok(self
                .libraries
                .lock()
                .unwrap()
                .get(&(kind, namespace.map(str::to_string), name.to_string()))
                .cloned())
        }

        async fn app(&self, namespace: &str, name: &str) -> Result<Option<ResolvedApp>> {
            Ok(self
                .apps
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn host(&self, namespace: &str, name: &str) -> Result<Option<ResolvedHost>> {
            Ok(self
                .hosts
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn page_binding(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<ResolvedParent>> {
            Ok(self
                .bindings
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }
    }
}
