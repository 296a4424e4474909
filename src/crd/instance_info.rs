//! InstanceInfo CRD
//!
//! Shadow record of one multishare instance. `status.shareNames` is the
//! authoritative assignment list for the instance.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ResourceStatus, POOL_TAG_LABEL};

// =============================================================================
// InstanceInfo CRD
// =============================================================================

/// InstanceInfo tracks the desired size and observed state of a shared instance.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "multishare.filestore.csi.storage.gke.io",
    version = "v1",
    kind = "InstanceInfo",
    plural = "instanceinfos",
    shortname = "ii",
    status = "InstanceInfoStatus",
    printcolumn = r#"{"name": "StorageClass", "type": "string", "jsonPath": ".spec.storageClassName"}"#,
    printcolumn = r#"{"name": "Requested", "type": "integer", "jsonPath": ".spec.capacityBytes"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".status.capacityBytes"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.instanceStatus"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfoSpec {
    /// Capacity the instance should be resized to
    #[serde(default)]
    pub capacity_bytes: u64,

    /// Storage class the instance was created from
    #[serde(default)]
    pub storage_class_name: String,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the InstanceInfo
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfoStatus {
    /// Share record names assigned to this instance
    #[serde(default)]
    pub share_names: Vec<String>,

    /// Capacity reported by the backend
    #[serde(default)]
    pub capacity_bytes: u64,

    /// Lifecycle state
    #[serde(default)]
    pub instance_status: ResourceStatus,

    /// Resize granularity in bytes, 0 when unknown
    #[serde(default)]
    pub capacity_step_size_bytes: u64,

    /// Reserved IP range of the instance network
    #[serde(default)]
    pub reserved_ip_range: String,

    /// Last error observed for this instance
    #[serde(default)]
    pub error: String,
}

impl InstanceInfoStatus {
    /// Add a share name, returning false if it was already present
    pub fn add_share(&mut self, name: &str) -> bool {
        if self.share_names.iter().any(|n| n == name) {
            return false;
        }
        self.share_names.push(name.to_string());
        true
    }

    /// Remove a share name, returning false if it was not present
    pub fn remove_share(&mut self, name: &str) -> bool {
        let before = self.share_names.len();
        self.share_names.retain(|n| n != name);
        self.share_names.len() != before
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl InstanceInfo {
    /// Build a new record with the pool tag label set
    pub fn from_spec(name: &str, pool_tag: &str, spec: InstanceInfoSpec) -> Self {
        let mut instance = InstanceInfo::new(name, spec);
        if !pool_tag.is_empty() {
            instance
                .labels_mut()
                .insert(POOL_TAG_LABEL.to_string(), pool_tag.to_string());
        }
        instance
    }

    /// Pool tag label, empty if absent
    pub fn pool_tag(&self) -> &str {
        self.labels()
            .get(POOL_TAG_LABEL)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Assigned share names; empty when the status is nil
    pub fn share_names(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.share_names.as_slice())
            .unwrap_or(&[])
    }

    /// Whether `name` is in the assignment list
    pub fn has_share(&self, name: &str) -> bool {
        self.share_names().iter().any(|n| n == name)
    }

    /// Whether the record carries a deletion marker
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Resize granularity, 0 when unknown
    pub fn step_size_bytes(&self) -> u64 {
        self.status
            .as_ref()
            .map(|s| s.capacity_step_size_bytes)
            .unwrap_or(0)
    }

    /// Current status, or the default for a record that has none yet
    pub fn status_or_default(&self) -> InstanceInfoStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Record name
    pub fn record_name(&self) -> String {
        self.name_any()
    }
}
