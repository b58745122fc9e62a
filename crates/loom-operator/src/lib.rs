//! # Loom Kubernetes Operator
//!
//! Kubernetes operator assembling a multi-tenant web-hosting platform from
//! custom resources: hosts, page bindings, archetypes, header/footer/
//! navigation fragments, script libraries, apps, and translations.
//!
//! The operator's core is a reference-resolution and composition engine:
//! given a page binding and its web of possibly-missing, possibly-
//! cross-namespace, possibly-cluster-scoped references, it deterministically
//! resolves them into one composed page record, tracks dependency
//! generations for idempotent re-reconciliation, deduplicates collected
//! script/package/backend references, and reports partial failure through
//! status conditions — handling not-yet-created dependencies with a bounded
//! requeue instead of hard failure.
//!
//! ## Architecture
//!
//! Five reconcilers cooperate over a shared in-memory runtime store:
//!
//! 1. **LoomHostController** creates the per-host runtime entries and
//!    materializes the serving workloads (Deployment, Service, Ingress,
//!    backend Deployments)
//! 2. **LoomHost** installs the host-wide script libraries
//! 3. **LoomPageBinding** composes ordinary pages
//! 4. **LoomUtilityPage** composes pages outside the hierarchy (error pages)
//! 5. **LoomTranslation** maintains the per-language translation catalog
//!
//! Dependency changes propagate through watch edges: each controller watches
//! the kinds its resources can reference, and the [`router`] maps a changed
//! object back to the dependents that must re-reconcile.
//!
//! ## Custom Resources
//!
//! ```yaml
//! apiVersion: loom.dev/v1alpha1
//! kind: LoomHost
//! metadata:
//!   name: site
//!   namespace: tenant-a
//! spec:
//!   hostname: www.example.org
//!   controllerRef:
//!     name: main
//! ---
//! apiVersion: loom.dev/v1alpha1
//! kind: LoomPageBinding
//! metadata:
//!   name: docs
//!   namespace: tenant-a
//! spec:
//!   hostRef:
//!     name: site
//!   path: /docs
//!   archetypeRef:
//!     kind: LoomClusterPageArchetype
//!     name: standard
//!   content:
//!     - slot: main
//!       inline: "<h1>Documentation</h1>"
//!     - slot: side
//!       appRef:
//!         name: search
//! ```
//!
//! ## Conditions
//!
//! Every reconciled resource carries `Ready`, `Degraded`, and `Progressing`
//! conditions plus an `attributes` map of dependency-generation fingerprints
//! (`header.generation`, `archetype.generation`, …). A missing dependency is
//! an expected transient state: the resource reports `Degraded=True` with a
//! reason naming the missing reference and retries on a bounded interval
//! until the dependency appears.

pub mod collect;
pub mod compose;
pub mod conditions;
pub mod crd;
pub mod error;
pub mod host;
pub mod host_controller;
pub mod page_controller;
pub mod resolver;
pub mod resources;
pub mod router;
pub mod status;
pub mod store;
pub mod translation_controller;
pub mod utility_controller;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::compose::{compose_page, compose_utility_page, Composition};
    pub use crate::crd::{
        Condition, ContentEntry, LocalObjectReference, LoomApp, LoomHost, LoomHostController,
        LoomPageArchetype, LoomPageBinding, LoomStatus, LoomTranslation, LoomUtilityPage,
        PackageReference, RefKind, ScriptDefinition, TypedObjectReference,
    };
    pub use crate::error::{Error, Result};
    pub use crate::host::run_host_controller;
    pub use crate::host_controller::run_host_controller_controller;
    pub use crate::page_controller::run_page_controller;
    pub use crate::resolver::{KubeObjectStore, ObjectStore, Resolver};
    pub use crate::store::{BackendRef, HostHandler, PageHandler, RuntimeStore};
    pub use crate::translation_controller::run_translation_controller;
    pub use crate::utility_controller::run_utility_controller;
}
