//! Custom Resource Definitions for the multishare reconciler
//!
//! - ShareInfo: shadow record of a share
//! - InstanceInfo: shadow record of a shared instance

pub mod instance_info;
pub mod share_info;

pub use instance_info::*;
pub use share_info::*;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carrying the pool tag on storage classes and instance records
pub const POOL_TAG_LABEL: &str = "multishare.filestore.csi.storage.gke.io/instance-pool-tag";

/// Cleanup guard held by instance records while a delete is in flight
pub const CLEANUP_FINALIZER: &str = "multishare.filestore.csi.storage.gke.io/instance-cleanup";

/// Lifecycle state shared by share and instance records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceStatus {
    #[default]
    Creating,
    Ready,
    Updating,
    Deleted,
}

impl ResourceStatus {
    /// Translate a backend resource state.
    ///
    /// Returns `None` for states that carry no lifecycle information
    /// (unspecified, unknown, `ERROR`); callers keep the current status then.
    /// A backend delete can still fail, so `DELETING` is in progress and never
    /// yields `DELETED`. That state is only set once the share is gone.
    pub fn from_backend(state: &str) -> Option<Self> {
        match state {
            "CREATING" => Some(ResourceStatus::Creating),
            "READY" => Some(ResourceStatus::Ready),
            "UPDATING" | "REPAIRING" | "RESTORING" | "SUSPENDING" | "SUSPENDED" | "RESUMING"
            | "DELETING" => Some(ResourceStatus::Updating),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Creating => write!(f, "CREATING"),
            ResourceStatus::Ready => write!(f, "READY"),
            ResourceStatus::Updating => write!(f, "UPDATING"),
            ResourceStatus::Deleted => write!(f, "DELETED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_state_translation() {
        assert_eq!(ResourceStatus::from_backend("READY"), Some(ResourceStatus::Ready));
        assert_eq!(ResourceStatus::from_backend("CREATING"), Some(ResourceStatus::Creating));
        assert_eq!(ResourceStatus::from_backend("REPAIRING"), Some(ResourceStatus::Updating));
        assert_eq!(ResourceStatus::from_backend("DELETING"), Some(ResourceStatus::Updating));
        assert_eq!(ResourceStatus::from_backend("DELETED"), None);
        assert_eq!(ResourceStatus::from_backend("ERROR"), None);
        assert_eq!(ResourceStatus::from_backend("STATE_UNSPECIFIED"), None);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(format!("{}", ResourceStatus::Updating), "UPDATING");
        assert_eq!(ResourceStatus::default(), ResourceStatus::Creating);
    }
}
