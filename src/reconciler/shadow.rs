//! Shadow Synchronizer
//!
//! Ensures every owned live share and instance has a record in the store and
//! that the record's status mirrors what the backend reports. Writes are only
//! issued for fields that actually differ.

use super::context::{PassContext, WorkingSet};
use super::lifecycle;
use super::ownership::OwnedInventory;
use crate::crd::{
    InstanceInfo, InstanceInfoSpec, InstanceInfoStatus, ResourceStatus, ShareInfo,
    ShareInfoSpec, ShareInfoStatus,
};
use crate::domain::naming::{self, InstanceUri};
use crate::domain::{Instance, Share};
use crate::error::Result;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const COMPONENT: &str = "shadow-sync";

/// Backend state reported for a resource in a failed state
const BACKEND_ERROR_STATE: &str = "ERROR";

fn backend_error(state: &str) -> Option<String> {
    (state == BACKEND_ERROR_STATE)
        .then(|| "backend reports the resource in ERROR state".to_string())
}

// =============================================================================
// Shares
// =============================================================================

/// Mirror every owned live share into its record, then confirm deletions.
pub async fn sync_shares(ctx: &PassContext<'_>, ws: &mut WorkingSet, owned: &OwnedInventory) {
    for live in &owned.shares {
        if let Err(e) = sync_share(ctx, ws, owned, live).await {
            ctx.fail(COMPONENT, &live.name, &e);
        }
    }

    for name in ws.share_keys() {
        if let Err(e) = confirm_share_deleted(ctx, ws, owned, &name).await {
            ctx.fail(COMPONENT, &name, &e);
        }
    }
}

async fn sync_share(
    ctx: &PassContext<'_>,
    ws: &mut WorkingSet,
    owned: &OwnedInventory,
    live: &Share,
) -> Result<()> {
    let (parent, live_name) = naming::parse_share_uri(&live.name)?;
    let record_name = naming::share_record_name(&live_name);

    let record = match ws.shares.get(&record_name) {
        Some(record) => record.clone(),
        None => match ctx.ports.share_store.get(&record_name).await? {
            Some(record) => record,
            None => {
                let region = naming::region_from_location(&InstanceUri::parse(&parent)?.location)?;
                let spec = ShareInfoSpec {
                    share_name: live_name.clone(),
                    capacity_bytes: live.capacity_bytes,
                    instance_pool_tag: owned.pool_tag_of(&parent).unwrap_or_default().to_string(),
                    region,
                    parameters: BTreeMap::new(),
                };
                let created = ctx.create_share(&ShareInfo::new(&record_name, spec)).await?;
                info!("Created share record {} for {}", record_name, live.name);
                created
            }
        },
    };

    if record.is_deleted() {
        ws.shares.insert(record_name, record);
        return Ok(());
    }

    let current = record.status_or_default();
    let desired = ShareInfoStatus {
        instance_handle: parent,
        capacity_bytes: live.capacity_bytes,
        share_status: ResourceStatus::from_backend(&live.state).unwrap_or(current.share_status),
        error: backend_error(&live.state).unwrap_or_default(),
    };

    if record.status.as_ref() == Some(&desired) {
        ws.shares.insert(record_name, record);
        return Ok(());
    }
    if !current.instance_handle.is_empty() && current.instance_handle != desired.instance_handle {
        warn!(
            "Share {} recorded on {} but lives on {}, following the backend",
            record_name, current.instance_handle, desired.instance_handle
        );
    }

    let mut updated = record;
    updated.status = Some(desired);
    let written = ctx.update_share_status(&updated).await?;
    debug!("Updated status of share record {}", record_name);
    ws.shares.insert(record_name, written);
    Ok(())
}

/// Mark a terminating share DELETED once its live share is gone.
async fn confirm_share_deleted(
    ctx: &PassContext<'_>,
    ws: &mut WorkingSet,
    owned: &OwnedInventory,
    name: &str,
) -> Result<()> {
    let Some(record) = ws.shares.get(name) else {
        return Ok(());
    };
    let Some(handle) = record.instance_handle() else {
        return Ok(());
    };
    let observed = record.status.as_ref().map(|s| s.share_status);
    let was_live = matches!(
        observed,
        Some(ResourceStatus::Ready) | Some(ResourceStatus::Updating)
    );
    if !record.is_terminating()
        || !was_live
        || !owned.has_instance(handle)
        || owned.has_share(handle, name)
    {
        return Ok(());
    }

    let mut updated = record.clone();
    let mut status = updated.status_or_default();
    status.share_status = ResourceStatus::Deleted;
    updated.status = Some(status);
    let written = ctx.update_share_status(&updated).await?;
    info!("Share {} is gone from {}, marked DELETED", name, handle);
    ws.shares.insert(name.to_string(), written);
    Ok(())
}

// =============================================================================
// Instances
// =============================================================================

/// Mirror every owned live instance into its record, then release guards on
/// terminating records whose instance is no longer live.
pub async fn sync_instances(ctx: &PassContext<'_>, ws: &mut WorkingSet, owned: &OwnedInventory) {
    for (uri, live) in &owned.instances {
        if let Err(e) = sync_instance(ctx, ws, owned, uri, live).await {
            ctx.fail(COMPONENT, uri, &e);
        }
    }

    for uri in ws.instance_keys() {
        let terminating = ws
            .instances
            .get(&uri)
            .map(InstanceInfo::is_terminating)
            .unwrap_or(false);
        if !terminating || owned.has_instance(&uri) {
            continue;
        }
        if let Err(e) = lifecycle::release_guard(ctx, ws, &uri).await {
            ctx.fail("lifecycle", &uri, &e);
        }
    }
}

async fn sync_instance(
    ctx: &PassContext<'_>,
    ws: &mut WorkingSet,
    owned: &OwnedInventory,
    uri: &str,
    live: &Instance,
) -> Result<()> {
    let record_name = naming::instance_record_name(uri)?;

    let record = match ws.instances.get(uri) {
        Some(record) => record.clone(),
        None => match ctx.ports.instance_store.get(&record_name).await? {
            Some(record) => record,
            None => {
                let pool_tag = owned.pool_tag_of(uri).unwrap_or_default();
                let storage_class_name = match ctx.storage_class_for(pool_tag).await? {
                    Some(class) => class,
                    None => {
                        warn!("No storage class carries pool tag {:?} of {}", pool_tag, uri);
                        String::new()
                    }
                };
                let spec = InstanceInfoSpec {
                    capacity_bytes: live.capacity_bytes,
                    storage_class_name,
                };
                let created = ctx
                    .create_instance(&InstanceInfo::from_spec(&record_name, pool_tag, spec))
                    .await?;
                info!("Created instance record {} for {}", record_name, uri);
                created
            }
        },
    };

    let current = record.status_or_default();
    let mut desired = InstanceInfoStatus {
        share_names: current.share_names.clone(),
        capacity_bytes: live.capacity_bytes,
        instance_status: ResourceStatus::from_backend(&live.state)
            .unwrap_or(current.instance_status),
        capacity_step_size_bytes: live.capacity_step_size_bytes,
        reserved_ip_range: live.reserved_ip_range.clone(),
        error: backend_error(&live.state).unwrap_or_default(),
    };
    for share in owned.shares_of(uri) {
        let (_, live_name) = naming::parse_share_uri(&share.name)?;
        desired.add_share(&naming::share_record_name(&live_name));
    }

    if record.status.as_ref() == Some(&desired) {
        ws.instances.insert(uri.to_string(), record);
        return Ok(());
    }

    let mut updated = record;
    updated.status = Some(desired);
    let written = ctx.update_instance_status(&updated).await?;
    debug!("Updated status of instance record {}", record_name);
    ws.instances.insert(uri.to_string(), written);
    Ok(())
}
