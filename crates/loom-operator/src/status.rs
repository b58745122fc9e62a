//! Status subresource persistence
//!
//! Every reconciler persists whatever conditions it decided on, success or
//! failure, at the end of the pass. When both the business logic and the
//! status write fail, the business error is the one that propagates; a
//! status-write failure only surfaces when the pass itself succeeded.

use crate::crd::LoomStatus;
use crate::error::{Error, Result};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, warn};

/// Patch the status subresource of a Loom resource
pub async fn patch_status<K>(api: &Api<K>, name: &str, status: &LoomStatus) -> Result<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    debug!(name = %name, "Updating status");

    let patch = serde_json::json!({
        "status": status
    });

    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::from)?;

    Ok(())
}

/// Combine a business outcome with the result of the status write
///
/// Whichever failed first is preserved; the status-write failure only
/// overrides a successful pass.
pub fn preserve_first_error(
    business: Result<Action>,
    status_write: Result<()>,
) -> Result<Action> {
    match (business, status_write) {
        (Ok(action), Ok(())) => Ok(action),
        (Ok(_), Err(status_err)) => Err(status_err),
        (Err(business_err), Ok(())) => Err(business_err),
        (Err(business_err), Err(status_err)) => {
            warn!(
                error = %status_err,
                "Status update failed while handling an earlier error"
            );
            Err(business_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_both_ok() {
        let out = preserve_first_error(Ok(Action::requeue(Duration::from_secs(5))), Ok(()));
        assert!(out.is_ok());
    }

    #[test]
    fn test_status_failure_surfaces_on_success() {
        let out = preserve_first_error(
            Ok(Action::requeue(Duration::from_secs(5))),
            Err(Error::ReconcileFailed("patch failed".to_string())),
        );
        assert!(matches!(out, Err(Error::ReconcileFailed(_))));
    }

    #[test]
    fn test_business_error_wins_over_status_error() {
        let out = preserve_first_error(
            Err(Error::InvalidSpec("root page with parent".to_string())),
            Err(Error::ReconcileFailed("patch failed".to_string())),
        );
        assert!(matches!(out, Err(Error::InvalidSpec(_))));
    }

    #[test]
    fn test_business_error_preserved_when_status_succeeds() {
        let out = preserve_first_error(
            Err(Error::HostNotReady("www.example.org".to_string())),
            Ok(()),
        );
        assert!(matches!(out, Err(Error::HostNotReady(_))));
    }
}
