//! Multishare Reconciler
//!
//! Periodic control loop reconciling the record store, its watch cache and
//! the live backend inventory into one consistent share-to-instance
//! assignment. Each pass runs the components in a fixed order:
//!
//! ```text
//! ownership ─► shadow (shares, instances) ─► pointers ─► placement ─► capacity / lifecycle
//! ```
//!
//! A pass is never transactional. Every step is idempotent and re-derived
//! from scratch on the next pass, so partial progress is always safe.

pub mod capacity;
pub mod context;
pub mod lifecycle;
pub mod ownership;
pub mod placement;
pub mod pointers;
pub mod shadow;

pub use context::{Collaborators, ObjectFailure, PassContext, PassReport, WorkingSet};
pub use ownership::{filter_owned, ClusterIdentity, OwnedInventory};

use crate::config::ReconcilerConfig;
use crate::domain::ListFilter;
use crate::error::{Error, Result};
use crate::metrics::ReconcilerMetrics;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often the cache sync signal is polled at startup
const CACHE_SYNC_POLL: Duration = Duration::from_millis(200);

// =============================================================================
// Reconciler
// =============================================================================

/// Single-worker reconciler for multishare instances
pub struct MultishareReconciler {
    config: ReconcilerConfig,
    identity: ClusterIdentity,
    ports: Collaborators,
    metrics: Arc<ReconcilerMetrics>,
    /// Set once the watch caches completed their initial sync
    ready: AtomicBool,
    last_report: RwLock<Option<PassReport>>,
}

impl MultishareReconciler {
    pub fn new(
        config: ReconcilerConfig,
        ports: Collaborators,
        metrics: Arc<ReconcilerMetrics>,
    ) -> Self {
        Self {
            identity: ClusterIdentity::from_config(&config),
            config,
            ports,
            metrics,
            ready: AtomicBool::new(false),
            last_report: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ReconcilerMetrics> {
        &self.metrics
    }

    /// Whether the caches synced and passes are running
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Report of the most recent completed pass
    pub fn last_report(&self) -> Option<PassReport> {
        self.last_report.read().clone()
    }

    /// Block until both watch caches synced, failing if `shutdown` fires first
    pub async fn wait_for_cache_sync(&self, shutdown: &CancellationToken) -> Result<()> {
        loop {
            if self.ports.share_cache.has_synced() && self.ports.instance_cache.has_synced() {
                self.ready.store(true, Ordering::Relaxed);
                info!("Watch caches synced");
                return Ok(());
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Err(Error::CacheSyncFailed),
                _ = tokio::time::sleep(CACHE_SYNC_POLL) => {}
            }
        }
    }

    /// Run passes on the configured interval until `shutdown` fires.
    ///
    /// A pass in progress always completes; the signal is only observed
    /// between passes.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.wait_for_cache_sync(&shutdown).await?;

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Reconciling every {}s for cluster {} in {}",
            self.config.interval_secs, self.identity.name, self.identity.location
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        error!("Reconciliation pass failed: {}", e);
                    }
                }
            }
        }

        self.ready.store(false, Ordering::Relaxed);
        info!("Reconciler stopped");
        Ok(())
    }

    /// Run a single pass
    pub async fn reconcile_once(&self) -> Result<PassReport> {
        let started = Instant::now();
        self.metrics.passes_total.inc();

        let result = self.pass().await;
        self.metrics
            .pass_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(report) => {
                *self.last_report.write() = Some(report.clone());
                Ok(report)
            }
            Err(e) => {
                self.metrics.pass_failures_total.inc();
                Err(e)
            }
        }
    }

    async fn pass(&self) -> Result<PassReport> {
        let ctx = PassContext::new(&self.config, &self.ports, &self.metrics);
        let selector = self.config.selector()?;
        let filter = ListFilter::all_locations(&self.config.project);

        let instances = self.ports.inventory.list_instances(&filter).await?;
        let shares = self.ports.inventory.list_shares(&filter).await?;
        let owned = filter_owned(&self.identity, instances, shares)?;
        debug!(
            "Owned inventory: {} instances, {} shares",
            owned.instances.len(),
            owned.shares.len()
        );

        self.report_operations(&ctx, &filter).await;

        let (mut ws, rejected) = WorkingSet::from_cache(
            self.ports.share_cache.list(&selector),
            self.ports.instance_cache.list(&selector),
        );
        for (name, e) in rejected {
            ctx.fail("working-set", &name, &e);
        }

        shadow::sync_shares(&ctx, &mut ws, &owned).await;
        shadow::sync_instances(&ctx, &mut ws, &owned).await;
        pointers::fix_pointers(&ctx, &mut ws, &owned).await;
        placement::place_shares(&ctx, &mut ws).await;

        for uri in ws.instance_keys() {
            match lifecycle::retire_if_empty(&ctx, &mut ws, &uri).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    ctx.fail("lifecycle", &uri, &e);
                    continue;
                }
            }
            if let Err(e) = capacity::plan_capacity(&ctx, &mut ws, &uri).await {
                ctx.fail("capacity", &uri, &e);
            }
        }

        self.metrics.managed_instances.set(owned.instances.len() as i64);
        self.metrics.managed_shares.set(owned.shares.len() as i64);
        ctx.with_report(|r| {
            r.managed_instances = owned.instances.len();
            r.managed_shares = owned.shares.len();
        });

        let report = ctx.finish();
        info!(
            "Pass complete: {} instances, {} shares managed; {} writes, {} placed, {} resized, {} failures",
            report.managed_instances,
            report.managed_shares,
            report.writes(),
            report.shares_placed,
            report.instances_resized,
            report.failures.len()
        );
        Ok(report)
    }

    async fn report_operations(&self, ctx: &PassContext<'_>, filter: &ListFilter) {
        let operations = match self.ports.inventory.list_operations(filter).await {
            Ok(operations) => operations,
            Err(e) => {
                warn!("Listing backend operations failed: {}", e);
                return;
            }
        };

        let mut in_flight = 0;
        let mut failed = Vec::new();
        for op in operations {
            match &op.error {
                Some(err) => {
                    warn!("Operation {} ({} {}) failed: {}", op.id, op.op_type, op.target, err);
                    failed.push(op);
                }
                None if !op.done => in_flight += 1,
                None => {}
            }
        }
        ctx.with_report(|r| {
            r.operations_in_flight = in_flight;
            r.failed_operations = failed;
        });
    }
}

// =============================================================================
// Test Support
// =============================================================================


#[cfg(test)]
mod tests {
    use super::testing::{live_instance, live_share, Harness, INSTANCE_URI};
    use super::*;
    use crate::crd::{ResourceStatus, ShareInfo, ShareInfoSpec, CLEANUP_FINALIZER};
    use crate::domain::{Op, RecordStore, Selector};
    use assert_matches::assert_matches;
    use kube::ResourceExt;

    fn total_writes(harness: &Harness) -> u64 {
        harness.shares.writes() + harness.instances.writes()
    }

    #[tokio::test]
    async fn test_empty_inventory_writes_nothing() {
        let harness = Harness::new();
        let report = harness.reconciler().reconcile_once().await.unwrap();

        assert_eq!(report.managed_instances, 0);
        assert_eq!(report.managed_shares, 0);
        assert_eq!(report.writes(), 0);
        assert!(report.failures.is_empty());
        assert_eq!(total_writes(&harness), 0);
        assert!(harness.shares.is_empty());
        assert!(harness.instances.is_empty());
    }

    #[tokio::test]
    async fn test_instance_with_two_shares() {
        let harness = Harness::new();
        harness.catalog.add("filestore-multishare", "tag-a");
        harness.inventory.upsert_instance(live_instance("fs-1", "tag-a"));
        harness.inventory.upsert_share(live_share("fs-1", "pvc_1", 100));
        harness.inventory.upsert_share(live_share("fs-1", "pvc_2", 200));

        let report = harness.reconciler().reconcile_once().await.unwrap();
        assert_eq!(report.managed_instances, 1);
        assert_eq!(report.managed_shares, 2);
        assert!(report.failures.is_empty());

        let instance = harness
            .instances
            .get("p.us-central1.fs-1")
            .await
            .unwrap()
            .unwrap();
        let mut names = instance.share_names().to_vec();
        names.sort();
        assert_eq!(names, vec!["pvc-1", "pvc-2"]);
        assert_eq!(instance.spec.capacity_bytes, 1 << 40);

        for name in ["pvc-1", "pvc-2"] {
            let share = harness.shares.get(name).await.unwrap().unwrap();
            assert_eq!(share.instance_handle(), Some(INSTANCE_URI));
        }
    }

    #[tokio::test]
    async fn test_second_pass_is_write_free() {
        let harness = Harness::new();
        harness.catalog.add("filestore-multishare", "tag-a");
        harness.inventory.upsert_instance(live_instance("fs-1", "tag-a"));
        harness.inventory.upsert_share(live_share("fs-1", "pvc_1", 700));
        harness.inventory.upsert_share(live_share("fs-1", "pvc_2", 700));
        let reconciler = harness.reconciler();

        let first = reconciler.reconcile_once().await.unwrap();
        assert!(first.writes() > 0);
        assert_eq!(first.instances_resized, 1);

        let writes = total_writes(&harness);
        let second = reconciler.reconcile_once().await.unwrap();
        assert_eq!(second.writes(), 0);
        assert_eq!(total_writes(&harness), writes);

        let instance = harness
            .instances
            .get("p.us-central1.fs-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instance.spec.capacity_bytes, 1536 << 30);
    }

    #[tokio::test]
    async fn test_failed_backend_delete_keeps_share_counted() {
        let harness = Harness::new();
        harness.catalog.add("filestore-multishare", "tag-a");
        harness.inventory.upsert_instance(live_instance("fs-1", "tag-a"));
        harness.inventory.upsert_share(live_share("fs-1", "pvc_1", 900));
        harness.inventory.upsert_share(live_share("fs-1", "pvc_2", 900));
        let reconciler = harness.reconciler();
        reconciler.reconcile_once().await.unwrap();

        let mut deleting = live_share("fs-1", "pvc_2", 900);
        deleting.state = "DELETING".into();
        harness.inventory.upsert_share(deleting);
        reconciler.reconcile_once().await.unwrap();
        let share = harness.shares.get("pvc-2").await.unwrap().unwrap();
        assert!(!share.is_deleted());

        harness.inventory.upsert_share(live_share("fs-1", "pvc_2", 900));
        reconciler.reconcile_once().await.unwrap();
        reconciler.reconcile_once().await.unwrap();

        let share = harness.shares.get("pvc-2").await.unwrap().unwrap();
        assert_eq!(
            share.status.as_ref().map(|s| s.share_status),
            Some(ResourceStatus::Ready)
        );
        let instance = harness
            .instances
            .get("p.us-central1.fs-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instance.spec.capacity_bytes, 2048 << 30);
    }

    #[tokio::test]
    async fn test_selector_keeps_created_instances_visible() {
        let mut harness = Harness::new();
        harness.config.record_selector = "team=a".into();
        harness.catalog.add("filestore-multishare", "tag-a");
        let reconciler = harness.reconciler();

        for name in ["pvc-a", "pvc-b"] {
            let mut share = ShareInfo::new(
                name,
                ShareInfoSpec {
                    share_name: name.replace('-', "_"),
                    capacity_bytes: 100 << 30,
                    instance_pool_tag: "tag-a".into(),
                    region: "us-central1".into(),
                    ..Default::default()
                },
            );
            share.labels_mut().insert("team".into(), "a".into());
            harness.seed_share(share).await;
            let report = reconciler.reconcile_once().await.unwrap();
            assert_eq!(report.shares_placed, 1);
        }

        let instances = RecordStore::list(&*harness.instances, &Selector::everything())
            .await
            .unwrap();
        assert_eq!(instances.len(), 1);
        assert!(instances[0].has_share("pvc-a"));
        assert!(instances[0].has_share("pvc-b"));
        assert_eq!(instances[0].labels().get("team").map(String::as_str), Some("a"));
    }

    #[tokio::test]
    async fn test_pending_share_is_placed_on_new_instance() {
        let harness = Harness::new();
        harness.catalog.add("filestore-multishare", "tag-a");
        harness
            .seed_share(ShareInfo::new(
                "pvc-new",
                ShareInfoSpec {
                    share_name: "pvc_new".into(),
                    capacity_bytes: 100 << 30,
                    instance_pool_tag: "tag-a".into(),
                    region: "us-central1".into(),
                    ..Default::default()
                },
            ))
            .await;

        let report = harness.reconciler().reconcile_once().await.unwrap();
        assert_eq!(report.shares_placed, 1);

        let share = harness.shares.get("pvc-new").await.unwrap().unwrap();
        let handle = share.instance_handle().unwrap().to_string();
        let record_name = crate::domain::naming::instance_record_name(&handle).unwrap();
        let instance = harness.instances.get(&record_name).await.unwrap().unwrap();
        assert!(instance.has_share("pvc-new"));
        assert_eq!(instance.spec.capacity_bytes, harness.config.min_instance_bytes);
        assert!(!instance.is_terminating());
    }

    #[tokio::test]
    async fn test_empty_instance_is_retired_then_released() {
        let harness = Harness::new();
        harness.inventory.upsert_instance(live_instance("fs-1", "tag-a"));
        let reconciler = harness.reconciler();

        reconciler.reconcile_once().await.unwrap();
        let record = harness
            .instances
            .get("p.us-central1.fs-1")
            .await
            .unwrap()
            .unwrap();
        assert!(record.is_terminating());
        assert_eq!(record.finalizers(), [CLEANUP_FINALIZER.to_string()]);

        // Still live: the guard stays.
        reconciler.reconcile_once().await.unwrap();
        assert!(harness
            .instances
            .get("p.us-central1.fs-1")
            .await
            .unwrap()
            .is_some());

        harness.inventory.remove_instance(INSTANCE_URI);
        reconciler.reconcile_once().await.unwrap();
        assert!(harness
            .instances
            .get("p.us-central1.fs-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_region_failure_aborts_pass() {
        let mut harness = Harness::new();
        harness.config.regional = true;
        harness.config.cluster_location = "global".into();
        harness.inventory.upsert_instance(live_instance("fs-1", "tag-a"));
        let reconciler = harness.reconciler();

        assert_matches!(
            reconciler.reconcile_once().await,
            Err(Error::RegionResolution { .. })
        );
        assert_eq!(total_writes(&harness), 0);
        assert_eq!(harness.metrics.pass_failures_total.get(), 1);
        assert!(reconciler.last_report().is_none());
    }

    #[tokio::test]
    async fn test_inventory_outage_aborts_pass() {
        let harness = Harness::new();
        harness.inventory.set_unavailable(true);
        let result = harness.reconciler().reconcile_once().await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(total_writes(&harness), 0);
    }

    #[tokio::test]
    async fn test_operations_are_reported() {
        let harness = Harness::new();
        harness.inventory.set_operations(vec![
            Op {
                id: "op-1".into(),
                op_type: "update".into(),
                target: INSTANCE_URI.into(),
                done: false,
                error: None,
            },
            Op {
                id: "op-2".into(),
                op_type: "create".into(),
                target: INSTANCE_URI.into(),
                done: true,
                error: Some("quota exceeded".into()),
            },
        ]);

        let report = harness.reconciler().reconcile_once().await.unwrap();
        assert_eq!(report.operations_in_flight, 1);
        assert_eq!(report.failed_operations.len(), 1);
        assert_eq!(report.failed_operations[0].id, "op-2");
    }

    #[tokio::test]
    async fn test_cache_sync_aborted_by_shutdown() {
        let harness = Harness::new();
        harness.shares.set_synced(false);
        let reconciler = harness.reconciler();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert_matches!(
            reconciler.clone().run(shutdown).await,
            Err(Error::CacheSyncFailed)
        );
        assert!(!reconciler.is_ready());
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let harness = Harness::new();
        let reconciler = harness.reconciler();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(reconciler.clone().run(shutdown.clone()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while reconciler.last_report().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(reconciler.is_ready());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(!reconciler.is_ready());
        assert!(harness.metrics.passes_total.get() >= 1);
    }
}
