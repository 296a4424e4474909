//! Per-pass state shared by the reconciler components
//!
//! A pass owns a [`WorkingSet`] rebuilt from the watch cache; components mutate
//! it freely because only the single worker touches it. Records read from the
//! cache are never modified in place: every write clones, persists, and stores
//! the object returned by the store back into the working set.

use crate::config::ReconcilerConfig;
use crate::crd::{InstanceInfo, ShareInfo, POOL_TAG_LABEL};
use crate::domain::naming;
use crate::domain::{
    CloudInventoryRef, InstanceCacheRef, InstanceStoreRef, Op, Record, Selector, ShareCacheRef,
    ShareStoreRef, StorageClassCatalogRef,
};
use crate::error::{Error, ErrorClass, Result};
use crate::metrics::ReconcilerMetrics;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, warn};

// =============================================================================
// Collaborators
// =============================================================================

/// External systems the reconciler reads from and writes to
#[derive(Clone)]
pub struct Collaborators {
    pub share_store: ShareStoreRef,
    pub instance_store: InstanceStoreRef,
    pub share_cache: ShareCacheRef,
    pub instance_cache: InstanceCacheRef,
    pub classes: StorageClassCatalogRef,
    pub inventory: CloudInventoryRef,
}

// =============================================================================
// Working Set
// =============================================================================

/// Snapshot of all records for one pass
#[derive(Debug, Clone, Default)]
pub struct WorkingSet {
    /// Share record name -> record
    pub shares: BTreeMap<String, ShareInfo>,
    /// Instance URI -> record
    pub instances: BTreeMap<String, InstanceInfo>,
}

impl WorkingSet {
    /// Build the snapshot from cached records.
    ///
    /// Instance records whose name does not map back to a URI are returned
    /// separately so the caller can report them.
    pub fn from_cache(
        shares: Vec<ShareInfo>,
        instances: Vec<InstanceInfo>,
    ) -> (Self, Vec<(String, Error)>) {
        let mut rejected = Vec::new();
        let shares = shares.into_iter().map(|s| (s.name_any(), s)).collect();
        let mut by_uri = BTreeMap::new();
        for instance in instances {
            let name = instance.name_any();
            match naming::instance_uri_from_record_name(&name) {
                Ok(uri) => {
                    by_uri.insert(uri, instance);
                }
                Err(e) => rejected.push((name, e)),
            }
        }
        (
            Self {
                shares,
                instances: by_uri,
            },
            rejected,
        )
    }

    /// Snapshot of share names, safe to iterate while mutating the map
    pub fn share_keys(&self) -> Vec<String> {
        self.shares.keys().cloned().collect()
    }

    /// Snapshot of instance URIs, safe to iterate while mutating the map
    pub fn instance_keys(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    /// URI of an instance already listing `share_name`, if any
    pub fn instance_listing(&self, share_name: &str) -> Option<&str> {
        self.instances
            .iter()
            .find(|(_, i)| i.has_share(share_name))
            .map(|(uri, _)| uri.as_str())
    }
}

// =============================================================================
// Pass Report
// =============================================================================

/// One object skipped during a pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectFailure {
    pub component: String,
    pub object: String,
    pub message: String,
}

/// Summary of a reconciliation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub managed_instances: usize,
    pub managed_shares: usize,
    pub records_created: usize,
    pub records_updated: usize,
    pub records_deleted: usize,
    pub shares_placed: usize,
    pub instances_resized: usize,
    pub operations_in_flight: usize,
    pub failed_operations: Vec<Op>,
    pub failures: Vec<ObjectFailure>,
}

impl PassReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            managed_instances: 0,
            managed_shares: 0,
            records_created: 0,
            records_updated: 0,
            records_deleted: 0,
            shares_placed: 0,
            instances_resized: 0,
            operations_in_flight: 0,
            failed_operations: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Total store writes issued
    pub fn writes(&self) -> usize {
        self.records_created + self.records_updated + self.records_deleted
    }
}

// =============================================================================
// Pass Context
// =============================================================================

/// Shared handles and the report of the pass in progress
pub struct PassContext<'a> {
    pub config: &'a ReconcilerConfig,
    pub ports: &'a Collaborators,
    pub metrics: &'a ReconcilerMetrics,
    report: Mutex<PassReport>,
    /// Pool tag -> storage class name, resolved at most once per pass
    classes: Mutex<BTreeMap<String, Option<String>>>,
}

impl<'a> PassContext<'a> {
    pub fn new(
        config: &'a ReconcilerConfig,
        ports: &'a Collaborators,
        metrics: &'a ReconcilerMetrics,
    ) -> Self {
        Self {
            config,
            ports,
            metrics,
            report: Mutex::new(PassReport::new()),
            classes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Mutate the report; the lock is never held across an await
    pub fn with_report<T>(&self, f: impl FnOnce(&mut PassReport) -> T) -> T {
        f(&mut self.report.lock())
    }

    /// Close the report
    pub fn finish(self) -> PassReport {
        let mut report = self.report.into_inner();
        report.finished_at = Some(Utc::now());
        report
    }

    /// Record that `object` was skipped by `component`
    pub fn fail(&self, component: &str, object: &str, err: &Error) {
        match err.class() {
            ErrorClass::Transient => {
                warn!("{}: skipping {} for this pass: {}", component, object, err)
            }
            ErrorClass::Anomaly | ErrorClass::Fatal => {
                error!("{}: {} needs attention: {}", component, object, err)
            }
        }
        self.metrics.record_failure(component);
        self.with_report(|r| {
            r.failures.push(ObjectFailure {
                component: component.to_string(),
                object: object.to_string(),
                message: err.to_string(),
            })
        });
    }

    /// Name of the storage class carrying `pool_tag`, if any.
    ///
    /// When several classes share a tag the lexically first name wins so the
    /// choice is stable across passes.
    pub async fn storage_class_for(&self, pool_tag: &str) -> Result<Option<String>> {
        let cached = self.classes.lock().get(pool_tag).cloned();
        if let Some(cached) = cached {
            return Ok(cached);
        }
        let selector = Selector::label(POOL_TAG_LABEL, pool_tag);
        let found = self
            .ports
            .classes
            .list(&selector)
            .await?
            .into_iter()
            .map(|class| class.name)
            .min();
        self.classes
            .lock()
            .insert(pool_tag.to_string(), found.clone());
        Ok(found)
    }

    // =========================================================================
    // Store writes
    // =========================================================================

    fn written<K: Record>(&self, operation: &str) {
        self.metrics.record_write(K::KIND, operation);
        self.with_report(|r| match operation {
            "create" => r.records_created += 1,
            "delete" => r.records_deleted += 1,
            _ => r.records_updated += 1,
        });
    }

    /// Copy of `record` carrying the configured selector labels, so records
    /// created here stay visible to later passes
    fn labeled<K: Record>(&self, record: &K) -> Result<K> {
        let selector = self.config.selector()?;
        let mut labeled = record.clone();
        labeled.labels_mut().extend(selector.0);
        Ok(labeled)
    }

    pub async fn create_share(&self, share: &ShareInfo) -> Result<ShareInfo> {
        let created = self.ports.share_store.create(&self.labeled(share)?).await?;
        self.written::<ShareInfo>("create");
        Ok(created)
    }

    pub async fn update_share_status(&self, share: &ShareInfo) -> Result<ShareInfo> {
        let updated = self.ports.share_store.update_status(share).await?;
        self.written::<ShareInfo>("update_status");
        Ok(updated)
    }

    pub async fn create_instance(&self, instance: &InstanceInfo) -> Result<InstanceInfo> {
        let created = self
            .ports
            .instance_store
            .create(&self.labeled(instance)?)
            .await?;
        self.written::<InstanceInfo>("create");
        Ok(created)
    }

    pub async fn update_instance(&self, instance: &InstanceInfo) -> Result<InstanceInfo> {
        let updated = self.ports.instance_store.update(instance).await?;
        self.written::<InstanceInfo>("update");
        Ok(updated)
    }

    pub async fn update_instance_status(&self, instance: &InstanceInfo) -> Result<InstanceInfo> {
        let updated = self.ports.instance_store.update_status(instance).await?;
        self.written::<InstanceInfo>("update_status");
        Ok(updated)
    }

    pub async fn delete_instance(&self, name: &str, resource_version: Option<&str>) -> Result<()> {
        self.ports.instance_store.delete(name, resource_version).await?;
        self.written::<InstanceInfo>("delete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{InstanceInfoSpec, InstanceInfoStatus, ShareInfoSpec};

    #[test]
    fn test_working_set_from_cache() {
        let share = ShareInfo::new("pvc-1", ShareInfoSpec::default());
        let good =
            InstanceInfo::from_spec("p.us-central1.fs-1", "tag", InstanceInfoSpec::default());
        let bad = InstanceInfo::from_spec("not-an-instance", "tag", InstanceInfoSpec::default());

        let (ws, rejected) = WorkingSet::from_cache(vec![share], vec![good, bad]);
        assert_eq!(ws.share_keys(), vec!["pvc-1"]);
        assert_eq!(
            ws.instance_keys(),
            vec!["projects/p/locations/us-central1/instances/fs-1"]
        );
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0, "not-an-instance");
    }

    #[test]
    fn test_instance_listing() {
        let mut instance =
            InstanceInfo::from_spec("p.us-central1.fs-1", "tag", InstanceInfoSpec::default());
        instance.status = Some(InstanceInfoStatus {
            share_names: vec!["pvc-1".into()],
            ..Default::default()
        });
        let (ws, _) = WorkingSet::from_cache(vec![], vec![instance]);
        assert_eq!(
            ws.instance_listing("pvc-1"),
            Some("projects/p/locations/us-central1/instances/fs-1")
        );
        assert_eq!(ws.instance_listing("pvc-2"), None);
    }
}
