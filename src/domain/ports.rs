//! Domain Ports - Collaborator boundaries of the reconciler
//!
//! The reconciler consumes four external systems: the desired-state record
//! store, its watch cache, the storage-class catalog and the cloud inventory.
//! Adapters implement these traits; the reconciler only sees the traits.

use crate::error::Result;
use async_trait::async_trait;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::crd::{InstanceInfo, ShareInfo};

// =============================================================================
// Records
// =============================================================================

/// A record type held by the desired-state store
pub trait Record:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Kind used in logs and errors
    const KIND: &'static str;
}

impl Record for ShareInfo {
    const KIND: &'static str = "ShareInfo";
}

impl Record for InstanceInfo {
    const KIND: &'static str = "InstanceInfo";
}

/// Equality-based label selector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector(pub BTreeMap<String, String>);

impl Selector {
    /// Selector matching everything
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selector requiring a single label
    pub fn label(key: &str, value: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(key.to_string(), value.to_string());
        Self(labels)
    }

    /// Whether `labels` satisfy every requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", rendered.join(","))
    }
}

// =============================================================================
// Desired-State Store Port
// =============================================================================

/// Authoritative record store with optimistic concurrency.
///
/// Mutations carry the record's `resourceVersion`; a stale version fails with
/// [`crate::Error::Conflict`].
#[async_trait]
pub trait RecordStore<K: Record>: Send + Sync {
    /// Get a record by name
    async fn get(&self, name: &str) -> Result<Option<K>>;

    /// List records matching a selector
    async fn list(&self, selector: &Selector) -> Result<Vec<K>>;

    /// Create a record
    async fn create(&self, record: &K) -> Result<K>;

    /// Replace metadata and spec of a record
    async fn update(&self, record: &K) -> Result<K>;

    /// Replace the status subresource of a record
    async fn update_status(&self, record: &K) -> Result<K>;

    /// Delete a record, optionally requiring its current version to match
    async fn delete(&self, name: &str, resource_version: Option<&str>) -> Result<()>;
}

// =============================================================================
// Watch Cache Port
// =============================================================================

/// Eventually consistent mirror of the record store
pub trait WatchCache<K: Record>: Send + Sync {
    /// List cached records matching a selector
    fn list(&self, selector: &Selector) -> Vec<K>;

    /// Whether the initial listing has completed
    fn has_synced(&self) -> bool;
}

// =============================================================================
// Storage-Class Catalog Port
// =============================================================================

/// Read-only view of a storage class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageClassInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
}

/// Read-only catalog of storage classes
#[async_trait]
pub trait StorageClassCatalog: Send + Sync {
    async fn list(&self, selector: &Selector) -> Result<Vec<StorageClassInfo>>;
}

// =============================================================================
// Cloud Inventory Port
// =============================================================================

/// Location wildcard accepted by inventory filters
pub const ALL_LOCATIONS: &str = "-";

/// Filter for inventory listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFilter {
    pub project: String,
    /// Location, or [`ALL_LOCATIONS`]
    pub location: String,
    /// Restrict shares to one parent instance URI
    pub instance_uri: Option<String>,
}

impl ListFilter {
    /// Filter over every location of a project
    pub fn all_locations(project: &str) -> Self {
        Self {
            project: project.to_string(),
            location: ALL_LOCATIONS.to_string(),
            instance_uri: None,
        }
    }
}

/// Live instance as reported by the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Full resource path
    pub name: String,
    pub capacity_bytes: u64,
    /// Resize granularity, 0 when the backend does not report one
    pub capacity_step_size_bytes: u64,
    /// Native backend state, e.g. `READY`
    pub state: String,
    pub labels: BTreeMap<String, String>,
    pub reserved_ip_range: String,
    pub tier: String,
}

/// Live share as reported by the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Share {
    /// Full resource path `{instance}/shares/{share}`
    pub name: String,
    pub capacity_bytes: u64,
    pub state: String,
    pub labels: BTreeMap<String, String>,
    pub mount_name: String,
}

/// Backend operation in flight or terminally failed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub id: String,
    /// Verb, e.g. `create`, `update`, `delete`
    pub op_type: String,
    /// Resource path the operation acts on
    pub target: String,
    pub done: bool,
    pub error: Option<String>,
}

/// Live inventory reported by the storage backend
#[async_trait]
pub trait CloudInventory: Send + Sync {
    async fn list_instances(&self, filter: &ListFilter) -> Result<Vec<Instance>>;

    async fn list_shares(&self, filter: &ListFilter) -> Result<Vec<Share>>;

    async fn list_operations(&self, filter: &ListFilter) -> Result<Vec<Op>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ShareStoreRef = Arc<dyn RecordStore<ShareInfo>>;
pub type InstanceStoreRef = Arc<dyn RecordStore<InstanceInfo>>;
pub type ShareCacheRef = Arc<dyn WatchCache<ShareInfo>>;
pub type InstanceCacheRef = Arc<dyn WatchCache<InstanceInfo>>;
pub type StorageClassCatalogRef = Arc<dyn StorageClassCatalog>;
pub type CloudInventoryRef = Arc<dyn CloudInventory>;
