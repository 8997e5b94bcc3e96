//! Fixed-interval polling of eventually consistent provider state.
//!
//! [`wait_until`] probes until an acceptance check passes or the attempt
//! budget (`timeout / interval`) runs out. Transient errors are retried;
//! running out of attempts is not an error but a [`PollOutcome::TimedOut`]
//! carrying the last good sample, which callers proceed with.

use crate::backend::Provider;
use crate::error::Result;
use crate::types::{AddressPurpose, GuestInterface, IpAddressInfo, PollConfig, VmStatus};
use ipnet::Ipv4Net;
use std::thread;

/// Result of a bounded wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The acceptance check passed on this sample
    Ready(T),
    /// Attempts ran out; holds the last successful sample, if any
    TimedOut(Option<T>),
}

impl<T> PollOutcome<T> {
    /// Whether the acceptance check passed.
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready(_))
    }

    /// Best available value, ready or partial.
    pub fn into_inner(self) -> Option<T> {
        match self {
            PollOutcome::Ready(value) => Some(value),
            PollOutcome::TimedOut(partial) => partial,
        }
    }
}

/// Probe until `accept` passes or the attempt budget is spent.
///
/// Transient probe errors count as an attempt and are retried after
/// `config.interval`. Any other error is returned immediately.
pub fn wait_until<T, P, A>(
    config: &PollConfig,
    what: &str,
    mut probe: P,
    mut accept: A,
) -> Result<PollOutcome<T>>
where
    P: FnMut() -> Result<T>,
    A: FnMut(&T) -> bool,
{
    let attempts = config.attempts();
    let mut last = None;

    for attempt in 1..=attempts {
        match probe() {
            Ok(value) if accept(&value) => {
                log::debug!("{what}: ready after {attempt} attempt(s)");
                return Ok(PollOutcome::Ready(value));
            }
            Ok(value) => last = Some(value),
            Err(e) if e.is_transient() => {
                log::debug!("{what}: attempt {attempt}/{attempts}: {e}");
            }
            Err(e) => return Err(e),
        }

        if attempt < attempts {
            thread::sleep(config.interval);
        }
    }

    log::warn!(
        "{what}: not ready after {attempts} attempt(s) ({}s), continuing with partial result",
        config.timeout.as_secs()
    );
    Ok(PollOutcome::TimedOut(last))
}

/// Wait for a VM to reach `target` power state.
pub fn wait_for_status(
    provider: &dyn Provider,
    node: &str,
    vmid: u32,
    target: VmStatus,
    config: &PollConfig,
) -> Result<PollOutcome<VmStatus>> {
    wait_until(
        config,
        &format!("VM {vmid} {target}"),
        || provider.vm_status(node, vmid),
        |status| *status == target,
    )
}

/// Wait until the guest agent reports at least `expected` IPv4 addresses.
pub fn wait_for_addresses(
    provider: &dyn Provider,
    node: &str,
    vmid: u32,
    access: Option<&Ipv4Net>,
    expected: usize,
    config: &PollConfig,
) -> Result<PollOutcome<Vec<IpAddressInfo>>> {
    wait_until(
        config,
        &format!("VM {vmid} addresses"),
        || {
            provider
                .guest_interfaces(node, vmid)
                .map(|interfaces| classify_addresses(&interfaces, access))
        },
        |addresses| addresses.len() >= expected,
    )
}

/// Classify every non-loopback IPv4 address as access or data.
///
/// Addresses inside `access` are access addresses; everything else, or
/// everything when no access subnet is known, is data.
pub fn classify_addresses(
    interfaces: &[GuestInterface],
    access: Option<&Ipv4Net>,
) -> Vec<IpAddressInfo> {
    interfaces
        .iter()
        .filter(|iface| iface.name != "lo")
        .flat_map(|iface| {
            iface.ipv4_addresses.iter().map(|ip| IpAddressInfo {
                name: iface.name.clone(),
                ipv4: *ip,
                purpose: match access {
                    Some(network) if network.contains(ip) => AddressPurpose::Access,
                    _ => AddressPurpose::Data,
                },
            })
        })
        .collect()
}
