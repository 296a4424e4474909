//! Capacity Planner
//!
//! Sizes each instance to the sum of its assigned shares, rounded up to the
//! backend's resize step and bounded to the allowed instance sizes.

use super::context::{PassContext, WorkingSet};
use crate::config::gib;
use crate::error::Result;
use tracing::{info, warn};

/// Capacity an instance needs to host shares of the given sizes.
///
/// The total is rounded up to a multiple of `step` (the minimum size when the
/// step is unknown) and clamped into `[min, max]`.
pub fn required_capacity(
    sizes: impl IntoIterator<Item = u64>,
    step: u64,
    min: u64,
    max: u64,
) -> u64 {
    let total = sizes.into_iter().fold(0u64, u64::saturating_add);
    let step = if step == 0 { min } else { step };
    let rounded = if step == 0 {
        total
    } else {
        total.div_ceil(step).saturating_mul(step)
    };
    rounded.max(min).min(max)
}

/// Persist a new spec capacity for the instance at `uri` when it changed.
///
/// Returns true if a write was issued.
pub async fn plan_capacity(
    ctx: &PassContext<'_>,
    ws: &mut WorkingSet,
    uri: &str,
) -> Result<bool> {
    let Some(instance) = ws.instances.get(uri) else {
        return Ok(false);
    };
    if instance.is_terminating() || instance.share_names().is_empty() {
        return Ok(false);
    }

    let mut sizes = Vec::with_capacity(instance.share_names().len());
    for name in instance.share_names() {
        match ws.shares.get(name) {
            Some(share) if share.is_deleted() => {}
            Some(share) => sizes.push(share.spec.capacity_bytes),
            None => warn!("Instance {} lists unknown share {}, not counted", uri, name),
        }
    }

    let total = sizes.iter().fold(0u64, |acc, s| acc.saturating_add(*s));
    if total > ctx.config.max_instance_bytes {
        warn!(
            "Shares on {} need {} which exceeds the maximum instance size {}",
            uri,
            gib(total),
            gib(ctx.config.max_instance_bytes)
        );
    }

    let required = required_capacity(
        sizes,
        instance.step_size_bytes(),
        ctx.config.min_instance_bytes,
        ctx.config.max_instance_bytes,
    );
    if required == instance.spec.capacity_bytes {
        return Ok(false);
    }

    let mut updated = instance.clone();
    let previous = updated.spec.capacity_bytes;
    updated.spec.capacity_bytes = required;
    let written = ctx.update_instance(&updated).await?;
    ws.instances.insert(uri.to_string(), written);
    ctx.with_report(|r| r.instances_resized += 1);

    info!("Resized {} from {} to {}", uri, gib(previous), gib(required));
    Ok(true)
}
