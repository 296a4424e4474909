//! Lifecycle Manager
//!
//! Retires empty instance records through a finalizer-gated delete and
//! releases the guard once a terminating record is gone from the backend.

use super::context::{PassContext, WorkingSet};
use crate::crd::{InstanceInfo, CLEANUP_FINALIZER};
use crate::domain::Record;
use crate::error::{Error, Result};
use kube::ResourceExt;
use tracing::{error, info};

/// An instance is empty when its status is known and lists no shares.
///
/// A nil status means nothing has been observed yet, so it is never empty.
pub fn instance_empty(instance: &InstanceInfo) -> bool {
    instance
        .status
        .as_ref()
        .map(|s| s.share_names.is_empty())
        .unwrap_or(false)
}

fn holds_only_cleanup_guard(instance: &InstanceInfo) -> bool {
    matches!(instance.finalizers(), [only] if only == CLEANUP_FINALIZER)
}

/// Guard and delete the instance at `uri` if it is empty and not terminating.
///
/// Returns true when a delete was issued; the record leaves the working set.
pub async fn retire_if_empty(
    ctx: &PassContext<'_>,
    ws: &mut WorkingSet,
    uri: &str,
) -> Result<bool> {
    let Some(instance) = ws.instances.get(uri) else {
        return Ok(false);
    };
    if instance.is_terminating() || !instance_empty(instance) {
        return Ok(false);
    }
    let name = instance.record_name();

    let guarded = if holds_only_cleanup_guard(instance) {
        instance.clone()
    } else {
        if !instance.finalizers().is_empty() {
            error!(
                "Instance {} carries unexpected finalizers {:?}, replacing with {}",
                name,
                instance.finalizers(),
                CLEANUP_FINALIZER
            );
        }
        let mut updated = instance.clone();
        updated.metadata.finalizers = Some(vec![CLEANUP_FINALIZER.to_string()]);
        let written = ctx.update_instance(&updated).await?;
        ws.instances.insert(uri.to_string(), written.clone());
        written
    };

    if !guarded.finalizers().iter().any(|f| f == CLEANUP_FINALIZER) {
        return Err(Error::anomaly(
            InstanceInfo::KIND,
            &name,
            "cleanup finalizer missing after it was persisted",
        ));
    }

    ctx.delete_instance(&name, guarded.metadata.resource_version.as_deref())
        .await?;
    ws.instances.remove(uri);
    info!("Deleting empty instance record {}", name);
    Ok(true)
}

/// Strip the cleanup guard from a terminating instance so the store can
/// collect it. Returns true when the guard was removed.
pub async fn release_guard(
    ctx: &PassContext<'_>,
    ws: &mut WorkingSet,
    uri: &str,
) -> Result<bool> {
    let Some(instance) = ws.instances.get(uri) else {
        return Ok(false);
    };
    if !instance.is_terminating() {
        return Ok(false);
    }
    let name = instance.record_name();

    if instance.status.is_none() {
        return Err(Error::anomaly(
            InstanceInfo::KIND,
            &name,
            "deletion marker set on a record with nil status",
        ));
    }

    match instance.finalizers().len() {
        0 => Ok(false),
        1 => {
            let mut updated = instance.clone();
            updated.metadata.finalizers = None;
            ctx.update_instance(&updated).await?;
            ws.instances.remove(uri);
            info!("Released cleanup guard on {}", name);
            Ok(true)
        }
        n => Err(Error::anomaly(
            InstanceInfo::KIND,
            &name,
            format!("expected a single finalizer, found {}", n),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{InstanceInfoSpec, InstanceInfoStatus};
    use crate::domain::RecordStore;
    use crate::reconciler::testing::Harness;
    use assert_matches::assert_matches;

    const URI: &str = "projects/p/locations/us-central1/instances/fs-1";
    const NAME: &str = "p.us-central1.fs-1";

    fn record(shares: Option<Vec<&str>>) -> InstanceInfo {
        let mut instance = InstanceInfo::from_spec(NAME, "tag-a", InstanceInfoSpec::default());
        instance.status = shares.map(|names| InstanceInfoStatus {
            share_names: names.into_iter().map(String::from).collect(),
            ..Default::default()
        });
        instance
    }

    #[test]
    fn test_instance_empty() {
        assert!(instance_empty(&record(Some(vec![]))));
        assert!(!instance_empty(&record(Some(vec!["pvc-1"]))));
        assert!(!instance_empty(&record(None)));
    }

    #[tokio::test]
    async fn test_empty_instance_gets_single_guard_and_delete() {
        let harness = Harness::new();
        harness.seed_instance(record(Some(vec![]))).await;
        let mut ws = harness.working_set();

        let ctx = harness.context();
        assert!(retire_if_empty(&ctx, &mut ws, URI).await.unwrap());
        assert!(!ws.instances.contains_key(URI));

        let stored = harness.instances.get(NAME).await.unwrap().unwrap();
        assert_eq!(stored.finalizers(), [CLEANUP_FINALIZER.to_string()]);
        assert!(stored.is_terminating());
        assert_eq!(harness.instances.deletes(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_finalizers_are_replaced() {
        let harness = Harness::new();
        let mut instance = record(Some(vec![]));
        instance.metadata.finalizers = Some(vec!["a/b".into(), "c/d".into()]);
        harness.seed_instance(instance).await;
        let mut ws = harness.working_set();

        let ctx = harness.context();
        assert!(retire_if_empty(&ctx, &mut ws, URI).await.unwrap());
        let stored = harness.instances.get(NAME).await.unwrap().unwrap();
        assert_eq!(stored.finalizers(), [CLEANUP_FINALIZER.to_string()]);
    }

    #[tokio::test]
    async fn test_non_empty_or_unknown_instances_are_kept() {
        let harness = Harness::new();
        harness.seed_instance(record(None)).await;
        let mut ws = harness.working_set();

        let ctx = harness.context();
        assert!(!retire_if_empty(&ctx, &mut ws, URI).await.unwrap());
        assert_eq!(harness.instances.writes(), 0);
    }

    #[tokio::test]
    async fn test_terminating_instance_never_gains_a_finalizer() {
        let harness = Harness::new();
        let mut instance = record(Some(vec![]));
        instance.metadata.finalizers = Some(vec![CLEANUP_FINALIZER.into()]);
        harness.seed_instance(instance).await;
        harness.instances.delete(NAME, None).await.unwrap();
        let mut ws = harness.working_set();

        let ctx = harness.context();
        let before = harness.instances.writes();
        assert!(!retire_if_empty(&ctx, &mut ws, URI).await.unwrap());
        assert_eq!(harness.instances.writes(), before);
    }

    #[tokio::test]
    async fn test_release_guard_strips_single_finalizer() {
        let harness = Harness::new();
        let mut instance = record(Some(vec![]));
        instance.metadata.finalizers = Some(vec![CLEANUP_FINALIZER.into()]);
        harness.seed_instance(instance).await;
        harness.instances.delete(NAME, None).await.unwrap();
        let mut ws = harness.working_set();

        let ctx = harness.context();
        assert!(release_guard(&ctx, &mut ws, URI).await.unwrap());
        assert!(harness.instances.get(NAME).await.unwrap().is_none());
        assert!(!ws.instances.contains_key(URI));
    }

    #[tokio::test]
    async fn test_release_guard_anomalies_leave_record_untouched() {
        let harness = Harness::new();
        let mut instance = record(Some(vec![]));
        instance.metadata.finalizers = Some(vec![CLEANUP_FINALIZER.into(), "other/guard".into()]);
        harness.seed_instance(instance).await;
        harness.instances.delete(NAME, None).await.unwrap();
        let mut ws = harness.working_set();
        let before = harness.instances.writes();

        let ctx = harness.context();
        assert_matches!(
            release_guard(&ctx, &mut ws, URI).await,
            Err(Error::Anomaly { .. })
        );
        assert_eq!(harness.instances.writes(), before);

        let harness = Harness::new();
        let mut instance = record(None);
        instance.metadata.finalizers = Some(vec![CLEANUP_FINALIZER.into()]);
        harness.seed_instance(instance).await;
        harness.instances.delete(NAME, None).await.unwrap();
        let mut ws = harness.working_set();

        let ctx = harness.context();
        assert_matches!(
            release_guard(&ctx, &mut ws, URI).await,
            Err(Error::Anomaly { .. })
        );
        assert!(harness.instances.get(NAME).await.unwrap().is_some());
    }
}
