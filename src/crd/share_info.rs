//! ShareInfo CRD
//!
//! Shadow record of one share hosted on a multishare instance. The spec is
//! written once at creation; the status mirrors what the backend reports and
//! carries the pointer to the owning instance.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ResourceStatus;

// =============================================================================
// ShareInfo CRD
// =============================================================================

/// ShareInfo tracks the desired and observed state of a single share.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "multishare.filestore.csi.storage.gke.io",
    version = "v1",
    kind = "ShareInfo",
    plural = "shareinfos",
    shortname = "si",
    status = "ShareInfoStatus",
    printcolumn = r#"{"name": "Share", "type": "string", "jsonPath": ".spec.shareName"}"#,
    printcolumn = r#"{"name": "Instance", "type": "string", "jsonPath": ".status.instanceHandle"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".status.capacityBytes"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.shareStatus"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct ShareInfoSpec {
    /// Name of the share on the backend
    pub share_name: String,

    /// Requested capacity in bytes
    #[serde(default)]
    pub capacity_bytes: u64,

    /// Pool tag of the storage class the share was requested from
    #[serde(default)]
    pub instance_pool_tag: String,

    /// Region the share must be placed in
    #[serde(default)]
    pub region: String,

    /// Provisioning parameters copied from the request
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the ShareInfo
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShareInfoStatus {
    /// URI of the instance hosting this share, empty while unassigned
    #[serde(default)]
    pub instance_handle: String,

    /// Capacity reported by the backend
    #[serde(default)]
    pub capacity_bytes: u64,

    /// Lifecycle state
    #[serde(default)]
    pub share_status: ResourceStatus,

    /// Last error observed for this share
    #[serde(default)]
    pub error: String,
}

// =============================================================================
// Implementations
// =============================================================================

impl ShareInfo {
    /// URI of the owning instance, if assigned
    pub fn instance_handle(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.instance_handle.as_str())
            .filter(|h| !h.is_empty())
    }

    /// Whether the record carries a deletion marker
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the backend confirmed the share is gone
    pub fn is_deleted(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.share_status == ResourceStatus::Deleted)
            .unwrap_or(false)
    }

    /// Current status, or the default for a record that has none yet
    pub fn status_or_default(&self) -> ShareInfoStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Record name
    pub fn record_name(&self) -> String {
        self.name_any()
    }
}
