//! Picking free PCI devices for passthrough.
//!
//! There is no reservation table. Free means "not referenced by any VM
//! config right now", so two callers allocating on the same host at the same
//! time can both pick the same device. The provider rejects the second
//! attach with "already in use", which surfaces as a retryable
//! [`Error::Conflict`]. Run at most one create per host at a time.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::scanner;
use crate::types::{DeviceClass, PciDevice};
use std::collections::HashSet;

/// Devices of `class` on `host` that no VM references.
///
/// Network candidates are virtual functions only. Storage candidates
/// exclude the reserved devices from the settings.
pub fn find_unattached(ctx: &Context, host: &str, class: DeviceClass) -> Result<Vec<PciDevice>> {
    let candidates = match class {
        DeviceClass::Network => scanner::network_vfs(ctx, host)?,
        DeviceClass::Storage => scanner::list_devices(ctx, host, Some(DeviceClass::Storage))?
            .into_iter()
            .filter(|d| !ctx.settings.reserved_devices.contains(&d.id))
            .collect(),
    };

    let attached: HashSet<String> = scanner::list_attached(ctx, host)?
        .into_iter()
        .map(|d| d.id)
        .collect();

    Ok(candidates
        .into_iter()
        .filter(|d| !attached.contains(&d.id))
        .collect())
}

/// First `count` free devices of `class` in scan order.
///
/// # Errors
///
/// Returns `Error::ResourceExhausted` if fewer than `count` are free; in
/// that case nothing is handed out.
pub fn allocate(
    ctx: &Context,
    host: &str,
    class: DeviceClass,
    count: usize,
) -> Result<Vec<PciDevice>> {
    let mut free = find_unattached(ctx, host, class)?;
    if free.len() < count {
        log::error!(
            "not enough unattached {class} devices on {host}: have {}, require {count}",
            free.len()
        );
        return Err(Error::ResourceExhausted {
            host: host.to_string(),
            class: class.to_string(),
            requested: count,
            available: free.len(),
        });
    }

    free.truncate(count);
    log::debug!(
        "allocated {class} devices on {host}: {}",
        free.iter().map(|d| d.id.as_str()).collect::<Vec<_>>().join(", ")
    );
    Ok(free)
}
