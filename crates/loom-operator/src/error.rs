//! Error types for the Loom operator

use crate::crd::RefKind;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// A referenced dependency does not exist yet
    ///
    /// This is the expected transient state of an eventually consistent
    /// resource graph, not a user error: the reconciler reports Degraded
    /// and retries after a bounded delay.
    #[error("dependency not found: {role} {kind} '{name}'{}", namespace.as_deref().map(|ns| format!(" in namespace {}", ns)).unwrap_or_default())]
    DependencyMissing {
        /// Logical role of the reference (e.g. "header", "archetype")
        role: String,
        /// Kind of the missing target
        kind: String,
        /// Name of the missing target
        name: String,
        /// Resolution namespace, if the kind is namespaced
        namespace: Option<String>,
    },

    /// The owning host has no runtime store entry yet
    ///
    /// Controller ordering race: the page reconciler ran before the host
    /// controller created the store entry. Handled like a missing
    /// dependency, but kept distinct so the condition reason tells a
    /// startup race apart from a dangling reference.
    #[error("host '{0}' is not present in the runtime store yet")]
    HostNotReady(String),

    /// The spec violates a structural invariant and will not reconcile
    /// until the user fixes it
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Finalizer error
    #[error("finalizer error: {0}")]
    Finalizer(String),

    /// Reconciliation failed
    #[error("reconciliation failed: {0}")]
    ReconcileFailed(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a `DependencyMissing` for a typed reference role
    pub fn missing(
        role: impl Into<String>,
        kind: RefKind,
        name: impl Into<String>,
        namespace: Option<String>,
    ) -> Self {
        Error::DependencyMissing {
            role: role.into(),
            kind: kind.as_kind().to_string(),
            name: name.into(),
            namespace,
        }
    }

    /// Build a `DependencyMissing` for a kind outside the typed-reference set
    pub fn missing_kind(
        role: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: Option<String>,
    ) -> Self {
        Error::DependencyMissing {
            role: role.into(),
            kind: kind.into(),
            name: name.into(),
            namespace,
        }
    }

    /// Whether this error is the expected not-yet-created state handled
    /// with a bounded requeue instead of backoff
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::DependencyMissing { .. } | Error::HostNotReady(_))
    }

    /// Condition reason for this error
    pub fn reason(&self) -> &'static str {
        match self {
            Error::DependencyMissing { .. } => "DependencyMissing",
            Error::HostNotReady(_) => "HostNotReady",
            Error::InvalidSpec(_) => "InvalidSpec",
            Error::Kube(_) => "KubeApiError",
            Error::Serialization(_) | Error::Yaml(_) => "SerializationError",
            Error::Finalizer(_) => "FinalizerError",
            Error::ReconcileFailed(_) => "ReconcileFailed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_missing_display() {
        let err = Error::missing(
            "footer",
            RefKind::Footer,
            "main",
            Some("tenant-a".to_string()),
        );
        let msg = err.to_string();
        assert!(msg.contains("footer"));
        assert!(msg.contains("LoomFooter"));
        assert!(msg.contains("'main'"));
        assert!(msg.contains("tenant-a"));
    }

    #[test]
    fn test_cluster_scoped_missing_display_has_no_namespace() {
        let err = Error::missing("footer", RefKind::ClusterFooter, "main", None);
        assert!(!err.to_string().contains("namespace"));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::missing("archetype", RefKind::PageArchetype, "a", None).is_recoverable());
        assert!(Error::HostNotReady("www.example.org".to_string()).is_recoverable());
        assert!(!Error::InvalidSpec("root page with parent".to_string()).is_recoverable());
        assert!(!Error::ReconcileFailed("boom".to_string()).is_recoverable());
    }

    #[test]
    fn test_reasons() {
        assert_eq!(
            Error::missing("header", RefKind::Header, "h", None).reason(),
            "DependencyMissing"
        );
        assert_eq!(
            Error::HostNotReady("www".to_string()).reason(),
            "HostNotReady"
        );
        assert_eq!(Error::InvalidSpec("x".to_string()).reason(), "InvalidSpec");
    }
}
