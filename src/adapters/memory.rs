//! In-Memory Adapters
//!
//! Process-local implementations of every collaborator port. They back the
//! standalone mode, the benches and the reconciler tests.
//!
//! [`MemoryRecordStore`] follows the semantics of a declarative object store
//! closely enough for the reconciler to be exercised end to end: versions are
//! checked on every write, the status is only changed through
//! `update_status`, and deleting a record that holds finalizers only marks it.

use crate::domain::naming::{self, InstanceUri};
use crate::domain::{
    CloudInventory, Instance, ListFilter, Op, Record, RecordStore, Selector, Share,
    StorageClassCatalog, StorageClassInfo, WatchCache, ALL_LOCATIONS,
};
use crate::error::{Error, Result, StatusCode};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// =============================================================================
// Record Store
// =============================================================================

/// Record store and watch cache held in a single map
pub struct MemoryRecordStore<K: Record> {
    records: RwLock<BTreeMap<String, K>>,
    /// Last issued resource version
    version: AtomicU64,
    /// Write attempts, including rejected ones
    writes: AtomicU64,
    deletes: AtomicU64,
    /// Names whose writes fail with a temporary error
    failing: RwLock<BTreeSet<String>>,
    synced: AtomicBool,
}

impl<K: Record> MemoryRecordStore<K> {
    /// Create an empty, synced store
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            failing: RwLock::new(BTreeSet::new()),
            synced: AtomicBool::new(true),
        }
    }

    /// Number of write attempts
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of delete attempts
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Make every write to `name` fail with a temporary error
    pub fn fail_writes_for(&self, name: &str) {
        self.failing.write().insert(name.to_string());
    }

    /// Stop injecting failures
    pub fn clear_failures(&self) {
        self.failing.write().clear();
    }

    /// Flip the watch-cache sync signal
    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::Relaxed);
    }

    /// Attach a finalizer owned by another controller
    pub fn add_finalizer(&self, name: &str, finalizer: &str) -> bool {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(name) else {
            return false;
        };
        record.finalizers_mut().push(finalizer.to_string());
        let version = self.next_version();
        record.meta_mut().resource_version = Some(version);
        true
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn begin_write(&self, name: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.failing.read().contains(name) {
            return Err(Error::temporary(
                StatusCode::Unavailable,
                format!("injected failure writing {}/{}", K::KIND, name),
            ));
        }
        Ok(())
    }

    fn check_version(stored: &K, requested: Option<&str>, name: &str) -> Result<()> {
        match requested {
            Some(rv) if stored.resource_version().as_deref() != Some(rv) => Err(Error::Conflict {
                kind: K::KIND.to_string(),
                name: name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn not_found(name: &str) -> Error {
        Error::ResourceNotFound {
            kind: K::KIND.to_string(),
            name: name.to_string(),
        }
    }
}

impl<K: Record> Default for MemoryRecordStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy of `target` carrying the status of `source`
fn with_status_of<K: Record>(target: &K, source: &K) -> Result<K> {
    let mut value = serde_json::to_value(target)?;
    let status = serde_json::to_value(source)?
        .get("status")
        .cloned()
        .filter(|s| !s.is_null());
    if let Some(object) = value.as_object_mut() {
        match status {
            Some(status) => {
                object.insert("status".to_string(), status);
            }
            None => {
                object.remove("status");
            }
        }
    }
    Ok(serde_json::from_value(value)?)
}

fn without_status<K: Record>(record: &K) -> Result<K> {
    let mut value = serde_json::to_value(record)?;
    if let Some(object) = value.as_object_mut() {
        object.remove("status");
    }
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl<K: Record> RecordStore<K> for MemoryRecordStore<K> {
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.records.read().get(name).cloned())
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<K>> {
        Ok(WatchCache::list(self, selector))
    }

    async fn create(&self, record: &K) -> Result<K> {
        let name = record.name_any();
        self.begin_write(&name)?;
        let mut records = self.records.write();
        if records.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: K::KIND.to_string(),
                name,
            });
        }
        let mut created = without_status(record)?;
        let meta = created.meta_mut();
        meta.resource_version = Some(self.next_version());
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.deletion_timestamp = None;
        records.insert(name, created.clone());
        Ok(created)
    }

    async fn update(&self, record: &K) -> Result<K> {
        let name = record.name_any();
        self.begin_write(&name)?;
        let mut records = self.records.write();
        let stored = records.get(&name).ok_or_else(|| Self::not_found(&name))?;
        Self::check_version(stored, record.resource_version().as_deref(), &name)?;

        let mut updated = with_status_of(record, stored)?;
        let deletion = stored.meta().deletion_timestamp.clone();
        let meta = updated.meta_mut();
        meta.deletion_timestamp = deletion;
        meta.resource_version = Some(self.next_version());

        if updated.meta().deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            records.remove(&name);
        } else {
            records.insert(name, updated.clone());
        }
        Ok(updated)
    }

    async fn update_status(&self, record: &K) -> Result<K> {
        let name = record.name_any();
        self.begin_write(&name)?;
        let mut records = self.records.write();
        let stored = records.get(&name).ok_or_else(|| Self::not_found(&name))?;
        Self::check_version(stored, record.resource_version().as_deref(), &name)?;

        let mut updated = with_status_of(stored, record)?;
        updated.meta_mut().resource_version = Some(self.next_version());
        records.insert(name, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, name: &str, resource_version: Option<&str>) -> Result<()> {
        self.begin_write(name)?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.write();
        let stored = records.get(name).ok_or_else(|| Self::not_found(name))?;
        Self::check_version(stored, resource_version, name)?;

        if stored.finalizers().is_empty() {
            records.remove(name);
            return Ok(());
        }
        if stored.meta().deletion_timestamp.is_none() {
            let mut marked = stored.clone();
            let meta = marked.meta_mut();
            meta.deletion_timestamp = Some(Time(Utc::now()));
            meta.resource_version = Some(self.next_version());
            records.insert(name.to_string(), marked);
        }
        Ok(())
    }
}

impl<K: Record> WatchCache<K> for MemoryRecordStore<K> {
    fn list(&self, selector: &Selector) -> Vec<K> {
        self.records
            .read()
            .values()
            .filter(|r| selector.matches(r.labels()))
            .cloned()
            .collect()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Storage-Class Catalog
// =============================================================================

/// Fixed list of storage classes
#[derive(Default)]
pub struct MemoryCatalog {
    classes: RwLock<Vec<StorageClassInfo>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class carrying `pool_tag`
    pub fn add(&self, name: &str, pool_tag: &str) {
        let mut labels = BTreeMap::new();
        labels.insert(crate::crd::POOL_TAG_LABEL.to_string(), pool_tag.to_string());
        self.insert(StorageClassInfo {
            name: name.to_string(),
            labels,
            parameters: BTreeMap::new(),
        });
    }

    pub fn insert(&self, class: StorageClassInfo) {
        let mut classes = self.classes.write();
        classes.retain(|c| c.name != class.name);
        classes.push(class);
    }
}

#[async_trait]
impl StorageClassCatalog for MemoryCatalog {
    async fn list(&self, selector: &Selector) -> Result<Vec<StorageClassInfo>> {
        Ok(self
            .classes
            .read()
            .iter()
            .filter(|c| selector.matches(&c.labels))
            .cloned()
            .collect())
    }
}

// =============================================================================
// Cloud Inventory
// =============================================================================

/// Scripted backend inventory
#[derive(Default)]
pub struct MemoryInventory {
    instances: RwLock<Vec<Instance>>,
    shares: RwLock<Vec<Share>>,
    operations: RwLock<Vec<Op>>,
    unavailable: AtomicBool,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an instance
    pub fn upsert_instance(&self, instance: Instance) {
        let mut instances = self.instances.write();
        instances.retain(|i| i.name != instance.name);
        instances.push(instance);
    }

    /// Remove an instance and its shares
    pub fn remove_instance(&self, uri: &str) {
        self.instances.write().retain(|i| i.name != uri);
        let prefix = format!("{}/shares/", uri);
        self.shares.write().retain(|s| !s.name.starts_with(&prefix));
    }

    /// Add or replace a share
    pub fn upsert_share(&self, share: Share) {
        let mut shares = self.shares.write();
        shares.retain(|s| s.name != share.name);
        shares.push(share);
    }

    pub fn remove_share(&self, name: &str) {
        self.shares.write().retain(|s| s.name != name);
    }

    pub fn set_operations(&self, operations: Vec<Op>) {
        *self.operations.write() = operations;
    }

    /// Make every listing fail with a temporary error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(Error::temporary(
                StatusCode::Unavailable,
                "inventory unavailable",
            ));
        }
        Ok(())
    }
}

fn in_scope(uri: &str, filter: &ListFilter) -> bool {
    match InstanceUri::parse(uri) {
        Ok(parsed) => {
            parsed.project == filter.project
                && (filter.location == ALL_LOCATIONS || parsed.location == filter.location)
        }
        Err(_) => false,
    }
}

#[async_trait]
impl CloudInventory for MemoryInventory {
    async fn list_instances(&self, filter: &ListFilter) -> Result<Vec<Instance>> {
        self.check_available()?;
        Ok(self
            .instances
            .read()
            .iter()
            .filter(|i| in_scope(&i.name, filter))
            .cloned()
            .collect())
    }

    async fn list_shares(&self, filter: &ListFilter) -> Result<Vec<Share>> {
        self.check_available()?;
        Ok(self
            .shares
            .read()
            .iter()
            .filter(|s| match naming::parse_share_uri(&s.name) {
                Ok((parent, _)) => {
                    in_scope(&parent, filter)
                        && filter.instance_uri.as_ref().map_or(true, |u| *u == parent)
                }
                Err(_) => false,
            })
            .cloned()
            .collect())
    }

    async fn list_operations(&self, filter: &ListFilter) -> Result<Vec<Op>> {
        self.check_available()?;
        let prefix = format!("projects/{}/", filter.project);
        Ok(self
            .operations
            .read()
            .iter()
            .filter(|op| op.target.starts_with(&prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{InstanceInfo, InstanceInfoSpec, InstanceInfoStatus, CLEANUP_FINALIZER};
    use assert_matches::assert_matches;

    const NAME: &str = "p.us-central1.fs-1";

    fn record() -> InstanceInfo {
        InstanceInfo::from_spec(NAME, "tag-a", InstanceInfoSpec::default())
    }

    #[tokio::test]
    async fn test_create_ignores_status() {
        let store = MemoryRecordStore::<InstanceInfo>::new();
        let mut instance = record();
        instance.status = Some(InstanceInfoStatus::default());

        let created = store.create(&instance).await.unwrap();
        assert!(created.status.is_none());
        assert!(created.resource_version().is_some());
        assert_matches!(
            store.create(&instance).await,
            Err(Error::ResourceExists { .. })
        );
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = MemoryRecordStore::<InstanceInfo>::new();
        let created = store.create(&record()).await.unwrap();

        let mut first = created.clone();
        first.spec.capacity_bytes = 1;
        store.update(&first).await.unwrap();

        let mut stale = created;
        stale.spec.capacity_bytes = 2;
        assert_matches!(store.update(&stale).await, Err(Error::Conflict { .. }));
        assert_matches!(
            store.delete(NAME, Some("1")).await,
            Err(Error::Conflict { .. })
        );
    }

    #[tokio::test]
    async fn test_update_and_update_status_are_separate() {
        let store = MemoryRecordStore::<InstanceInfo>::new();
        let created = store.create(&record()).await.unwrap();

        let mut with_status = created.clone();
        with_status.status = Some(InstanceInfoStatus {
            share_names: vec!["pvc-1".into()],
            ..Default::default()
        });
        with_status.spec.capacity_bytes = 42;
        let written = store.update_status(&with_status).await.unwrap();
        assert_eq!(written.share_names(), ["pvc-1".to_string()]);
        assert_eq!(written.spec.capacity_bytes, 0);

        let mut resized = written.clone();
        resized.spec.capacity_bytes = 42;
        resized.status = None;
        let written = store.update(&resized).await.unwrap();
        assert_eq!(written.spec.capacity_bytes, 42);
        assert_eq!(written.share_names(), ["pvc-1".to_string()]);
    }

    #[tokio::test]
    async fn test_finalizer_gated_delete() {
        let store = MemoryRecordStore::<InstanceInfo>::new();
        let mut instance = record();
        instance.metadata.finalizers = Some(vec![CLEANUP_FINALIZER.into()]);
        store.create(&instance).await.unwrap();

        store.delete(NAME, None).await.unwrap();
        let marked = store.get(NAME).await.unwrap().unwrap();
        assert!(marked.is_terminating());

        let mut released = marked;
        released.metadata.finalizers = None;
        store.update(&released).await.unwrap();
        assert!(store.get(NAME).await.unwrap().is_none());
        assert_eq!(store.deletes(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryRecordStore::<InstanceInfo>::new();
        store.fail_writes_for(NAME);
        let err = store.create(&record()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.is_empty());

        store.clear_failures();
        store.create(&record()).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_inventory_filters() {
        let inventory = MemoryInventory::new();
        inventory.upsert_instance(Instance {
            name: "projects/p/locations/us-central1/instances/fs-1".into(),
            ..Default::default()
        });
        inventory.upsert_instance(Instance {
            name: "projects/other/locations/us-central1/instances/fs-2".into(),
            ..Default::default()
        });
        inventory.upsert_share(Share {
            name: "projects/p/locations/us-central1/instances/fs-1/shares/pvc_1".into(),
            ..Default::default()
        });

        let all = ListFilter::all_locations("p");
        assert_eq!(inventory.list_instances(&all).await.unwrap().len(), 1);
        assert_eq!(inventory.list_shares(&all).await.unwrap().len(), 1);

        let elsewhere = ListFilter {
            location: "europe-west4".into(),
            ..all.clone()
        };
        assert!(inventory.list_instances(&elsewhere).await.unwrap().is_empty());

        inventory.remove_instance("projects/p/locations/us-central1/instances/fs-1");
        assert!(inventory.list_shares(&all).await.unwrap().is_empty());

        inventory.set_unavailable(true);
        assert!(inventory.list_instances(&all).await.is_err());
    }

    #[tokio::test]
    async fn test_catalog_selects_by_pool_tag() {
        let catalog = MemoryCatalog::new();
        catalog.add("class-a", "tag-a");
        catalog.add("class-b", "tag-b");

        let selected = catalog
            .list(&Selector::label(crate::crd::POOL_TAG_LABEL, "tag-b"))
            .await
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "class-b");
    }
}
