//! Placement Engine
//!
//! Assigns unassigned shares first-fit to an existing instance of the same
//! pool, or to a freshly created instance record when none has room.
//!
//! The instance side is written before the share's pointer. If the pointer
//! write fails the pointer fixer stamps it on the next pass.

use super::context::{PassContext, WorkingSet};
use crate::config::ReconcilerConfig;
use crate::crd::{
    InstanceInfo, InstanceInfoSpec, InstanceInfoStatus, ResourceStatus, ShareInfo,
};
use crate::domain::naming::{self, InstanceUri};
use crate::error::{Error, Result};
use tracing::{debug, info};

const COMPONENT: &str = "placement";

/// Whether `instance` at `uri` can take one more share of `pool_tag` in `region`.
///
/// An empty `region` matches any location. Instances without a status are
/// treated as holding no shares.
pub fn eligible(
    config: &ReconcilerConfig,
    uri: &str,
    instance: &InstanceInfo,
    pool_tag: &str,
    region: &str,
) -> bool {
    if instance.is_terminating() || instance.pool_tag() != pool_tag {
        return false;
    }
    if let Some(status) = &instance.status {
        if status.instance_status == ResourceStatus::Deleted
            || status.share_names.len() >= config.max_shares_per_instance
        {
            return false;
        }
    }
    if region.is_empty() {
        return true;
    }
    InstanceUri::parse(uri)
        .and_then(|parsed| naming::region_from_location(&parsed.location))
        .map(|r| r == region)
        .unwrap_or(false)
}

/// Place every share that has no instance yet.
pub async fn place_shares(ctx: &PassContext<'_>, ws: &mut WorkingSet) {
    for name in ws.share_keys() {
        let Some(share) = ws.shares.get(&name) else {
            continue;
        };
        if share.is_terminating() || share.is_deleted() || share.instance_handle().is_some() {
            continue;
        }
        if let Some(uri) = ws.instance_listing(&name) {
            debug!("Share {} already listed on {}, leaving it to the pointer fixer", name, uri);
            continue;
        }

        match place_share(ctx, ws, &name).await {
            Ok(uri) => {
                info!("Placed share {} on {}", name, uri);
                ctx.with_report(|r| r.shares_placed += 1);
            }
            Err(e) => {
                ctx.fail(COMPONENT, &name, &e);
                if matches!(
                    e,
                    Error::PoolTagMissing { .. }
                        | Error::RegionMissing { .. }
                        | Error::NoStorageClass { .. }
                ) {
                    record_error(ctx, ws, &name, &e).await;
                }
            }
        }
    }
}

async fn place_share(ctx: &PassContext<'_>, ws: &mut WorkingSet, name: &str) -> Result<String> {
    let share = ws
        .shares
        .get(name)
        .cloned()
        .ok_or_else(|| Error::Internal(format!("share {} left the working set", name)))?;
    let pool_tag = share.spec.instance_pool_tag.as_str();
    if pool_tag.is_empty() {
        return Err(Error::PoolTagMissing {
            share: name.to_string(),
        });
    }
    let region = share.spec.region.as_str();

    let candidate = ws
        .instances
        .iter()
        .find(|(uri, instance)| eligible(ctx.config, uri, instance, pool_tag, region))
        .map(|(uri, _)| uri.clone());

    let uri = match candidate {
        Some(uri) => {
            assign_existing(ctx, ws, &uri, name).await?;
            uri
        }
        None => create_instance_for(ctx, ws, name, pool_tag, region).await?,
    };

    let mut updated = share;
    let mut status = updated.status_or_default();
    status.instance_handle = uri.clone();
    status.error.clear();
    updated.status = Some(status);
    let written = ctx.update_share_status(&updated).await?;
    ws.shares.insert(name.to_string(), written);
    Ok(uri)
}

async fn assign_existing(
    ctx: &PassContext<'_>,
    ws: &mut WorkingSet,
    uri: &str,
    share: &str,
) -> Result<()> {
    let Some(instance) = ws.instances.get(uri) else {
        return Err(Error::Internal(format!("instance {} left the working set", uri)));
    };
    let mut updated = instance.clone();
    let mut status = updated.status_or_default();
    status.add_share(share);
    updated.status = Some(status);
    let written = ctx.update_instance_status(&updated).await?;
    ws.instances.insert(uri.to_string(), written);
    Ok(())
}

async fn create_instance_for(
    ctx: &PassContext<'_>,
    ws: &mut WorkingSet,
    share: &str,
    pool_tag: &str,
    region: &str,
) -> Result<String> {
    if region.is_empty() {
        return Err(Error::RegionMissing {
            share: share.to_string(),
        });
    }
    let storage_class_name =
        ctx.storage_class_for(pool_tag)
            .await?
            .ok_or_else(|| Error::NoStorageClass {
                pool_tag: pool_tag.to_string(),
            })?;

    let uri = naming::new_instance_uri(&ctx.config.project, region, &ctx.config.instance_prefix);
    let record_name = naming::instance_record_name(&uri)?;
    let spec = InstanceInfoSpec {
        capacity_bytes: ctx.config.min_instance_bytes,
        storage_class_name,
    };
    let created = ctx
        .create_instance(&InstanceInfo::from_spec(&record_name, pool_tag, spec))
        .await?;
    info!("Created instance record {} for share {}", record_name, share);
    ws.instances.insert(uri.clone(), created.clone());

    let mut updated = created;
    updated.status = Some(InstanceInfoStatus {
        share_names: vec![share.to_string()],
        instance_status: ResourceStatus::Creating,
        ..Default::default()
    });
    let written = ctx.update_instance_status(&updated).await?;
    ws.instances.insert(uri.clone(), written);
    Ok(uri)
}

/// Surface a placement error on the share's status when it changed
async fn record_error(ctx: &PassContext<'_>, ws: &mut WorkingSet, name: &str, err: &Error) {
    let Some(share) = ws.shares.get(name) else {
        return;
    };
    let message = err.to_string();
    if share.status.as_ref().map(|s| s.error == message).unwrap_or(false) {
        return;
    }
    let mut updated: ShareInfo = share.clone();
    let mut status = updated.status_or_default();
    status.error = message;
    updated.status = Some(status);
    match ctx.update_share_status(&updated).await {
        Ok(written) => {
            ws.shares.insert(name.to_string(), written);
        }
        Err(e) => ctx.fail(COMPONENT, name, &e),
    }
}
