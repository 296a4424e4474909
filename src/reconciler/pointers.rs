//! Pointer Consistency Fixer
//!
//! Repairs the two-way link between `InstanceInfo.status.shareNames` and
//! `ShareInfo.status.instanceHandle`. A share without a handle adopts the
//! instance listing it. A share pointing elsewhere keeps its pointer, since
//! its live data may already exist there, and the listing moves instead.

use super::context::{PassContext, WorkingSet};
use super::ownership::OwnedInventory;
use crate::crd::{InstanceInfo, InstanceInfoSpec};
use crate::domain::naming;
use crate::error::Result;
use tracing::{debug, info, warn};

const COMPONENT: &str = "pointer-fixer";

/// Outcome of checking one listed share name
enum Listing {
    Keep,
    Drop,
}

/// Run the repair over every instance record with a known status.
pub async fn fix_pointers(ctx: &PassContext<'_>, ws: &mut WorkingSet, owned: &OwnedInventory) {
    for uri in ws.instance_keys() {
        let Some(instance) = ws.instances.get(&uri) else {
            continue;
        };
        if instance.status.is_none() {
            continue;
        }

        let mut dropped = Vec::new();
        for name in instance.share_names().to_vec() {
            match check_listing(ctx, ws, owned, &uri, &name).await {
                Ok(Listing::Keep) => {}
                Ok(Listing::Drop) => dropped.push(name),
                Err(e) => ctx.fail(COMPONENT, &name, &e),
            }
        }
        if dropped.is_empty() {
            continue;
        }

        // Re-read: moving a share may have touched the working set.
        let Some(instance) = ws.instances.get(&uri) else {
            continue;
        };
        let mut updated = instance.clone();
        let mut status = updated.status_or_default();
        for name in &dropped {
            status.remove_share(name);
        }
        updated.status = Some(status);
        match ctx.update_instance_status(&updated).await {
            Ok(written) => {
                debug!("Removed {:?} from {}", dropped, uri);
                ws.instances.insert(uri.clone(), written);
            }
            Err(e) => ctx.fail(COMPONENT, &uri, &e),
        }
    }
}

async fn check_listing(
    ctx: &PassContext<'_>,
    ws: &mut WorkingSet,
    owned: &OwnedInventory,
    uri: &str,
    name: &str,
) -> Result<Listing> {
    let live = owned.has_share(uri, name);
    let Some(share) = ws.shares.get(name) else {
        if live {
            return Ok(Listing::Keep);
        }
        info!("Pruning {} from {}: no share record", name, uri);
        return Ok(Listing::Drop);
    };
    if share.is_deleted() {
        if live {
            return Ok(Listing::Keep);
        }
        info!("Pruning {} from {}: share is deleted", name, uri);
        return Ok(Listing::Drop);
    }

    match share.instance_handle() {
        None => {
            let mut updated = share.clone();
            let mut status = updated.status_or_default();
            status.instance_handle = uri.to_string();
            updated.status = Some(status);
            let written = ctx.update_share_status(&updated).await?;
            debug!("Share {} now points to {}", name, uri);
            ws.shares.insert(name.to_string(), written);
            Ok(Listing::Keep)
        }
        Some(handle) if handle == uri => Ok(Listing::Keep),
        Some(handle) => {
            let target = handle.to_string();
            let pool_tag = share.spec.instance_pool_tag.clone();
            warn!(
                "Share {} is listed on {} but points to {}, moving the listing",
                name, uri, target
            );
            ensure_listed(ctx, ws, &target, name, &pool_tag).await?;
            Ok(Listing::Drop)
        }
    }
}

/// Make sure the instance at `target` lists `share`, creating a placeholder
/// record when the instance is unknown to the store.
async fn ensure_listed(
    ctx: &PassContext<'_>,
    ws: &mut WorkingSet,
    target: &str,
    share: &str,
    pool_tag: &str,
) -> Result<()> {
    let instance = match ws.instances.get(target) {
        Some(instance) => instance.clone(),
        None => {
            let record_name = naming::instance_record_name(target)?;
            match ctx.ports.instance_store.get(&record_name).await? {
                Some(instance) => instance,
                None => {
                    warn!("Creating placeholder record {} for share {}", record_name, share);
                    let placeholder = InstanceInfo::from_spec(
                        &record_name,
                        pool_tag,
                        InstanceInfoSpec::default(),
                    );
                    ctx.create_instance(&placeholder).await?
                }
            }
        }
    };

    if instance.has_share(share) {
        ws.instances.insert(target.to_string(), instance);
        return Ok(());
    }

    let mut updated = instance;
    let mut status = updated.status_or_default();
    status.add_share(share);
    updated.status = Some(status);
    let written = ctx.update_instance_status(&updated).await?;
    ws.instances.insert(target.to_string(), written);
    Ok(())
}
