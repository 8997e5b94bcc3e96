//! PCI device discovery and attachment scanning.
//!
//! Attachment is never recorded anywhere. A device counts as attached when
//! some VM's live `hostpciN` config references its bus address.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::poll::{PollOutcome, wait_until};
use crate::types::{DeviceClass, PciDevice, VmConfig};

/// PCI class prefixes hidden from listings (bridges, memory and system
/// controllers, serial buses, signal processors, unassigned).
pub const PCI_CLASS_BLACKLIST: &str = "05;06;07;08;0b;0c;11;ff";

/// List PCI devices on `host`, optionally restricted to one class.
pub fn list_devices(
    ctx: &Context,
    host: &str,
    class: Option<DeviceClass>,
) -> Result<Vec<PciDevice>> {
    let devices = ctx.provider.pci_devices(host, PCI_CLASS_BLACKLIST)?;
    Ok(match class {
        Some(class) => devices.into_iter().filter(|d| d.is_class(class)).collect(),
        None => devices,
    })
}

/// Network virtual functions on `host`.
pub fn network_vfs(ctx: &Context, host: &str) -> Result<Vec<PciDevice>> {
    Ok(list_devices(ctx, host, Some(DeviceClass::Network))?
        .into_iter()
        .filter(PciDevice::is_virtual_function)
        .collect())
}

/// Devices on `host` referenced by any VM's live configuration.
pub fn list_attached(ctx: &Context, host: &str) -> Result<Vec<PciDevice>> {
    let devices = list_devices(ctx, host, None)?;
    let configs = vm_configs(ctx, host)?;

    Ok(devices
        .into_iter()
        .filter(|device| configs.iter().any(|config| references(config, &device.id)))
        .collect())
}

/// Whether any `hostpciN` entry of `config` names `device_id`.
pub fn references(config: &VmConfig, device_id: &str) -> bool {
    config.hostpci_values().any(|value| value.contains(device_id))
}

/// Live configs of every VM on `host`, waiting out creation locks.
fn vm_configs(ctx: &Context, host: &str) -> Result<Vec<VmConfig>> {
    ctx.provider
        .node_vms(host)?
        .iter()
        .map(|vm| wait_for_unlock(ctx, host, vm.vmid))
        .collect()
}

/// Read a VM's config once it no longer carries a lock.
pub fn wait_for_unlock(ctx: &Context, host: &str, vmid: u32) -> Result<VmConfig> {
    let outcome = wait_until(
        &ctx.settings.config_lock_poll,
        &format!("VM {vmid} config unlock"),
        || ctx.provider.vm_config(host, vmid),
        |config| !config.is_locked(),
    )?;
    match outcome {
        PollOutcome::Ready(config) => Ok(config),
        PollOutcome::TimedOut(_) => Err(Error::Transient {
            message: format!("config of VM {vmid} on {host} is still locked"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockProvider, MockTransfer};
    use crate::context::Settings;
    use std::sync::Arc;
    use std::time::Duration;

    fn device(id: &str, class: &str, name: &str) -> PciDevice {
        PciDevice {
            id: id.into(),
            class: class.into(),
            device_name: name.into(),
            vendor_name: String::new(),
        }
    }

    fn context(mock: &MockProvider) -> Context {
        Context::new(Arc::new(mock.clone()), Arc::new(MockTransfer::new())).with_settings(
            Settings::default().with_polling(Duration::from_millis(1), Duration::from_millis(5)),
        )
    }

    fn host_with_devices() -> MockProvider {
        let mock = MockProvider::new();
        mock.add_pci_device("h1", device("0000:41:00.0", "0x020000", "Ethernet Controller XL710"));
        for id in ["0000:41:02.0", "0000:41:02.1"] {
            let vf = device(id, "0x020000", "Ethernet Virtual Function 700 Series");
            mock.add_pci_device("h1", vf);
        }
        mock.add_pci_device("h1", device("0000:82:00.0", "0x010802", "NVMe SSD Controller"));
        mock.add_pci_device("h1", device("0000:00:14.0", "0x0c0330", "USB controller"));
        mock
    }

    #[test]
    fn test_list_devices_by_class() {
        let mock = host_with_devices();
        let ctx = context(&mock);

        assert_eq!(list_devices(&ctx, "h1", None).unwrap().len(), 4);
        assert_eq!(list_devices(&ctx, "h1", Some(DeviceClass::Network)).unwrap().len(), 3);
        let storage = list_devices(&ctx, "h1", Some(DeviceClass::Storage)).unwrap();
        assert_eq!(storage.len(), 1);
        assert_eq!(storage[0].id, "0000:82:00.0");
    }

    #[test]
    fn test_network_vfs() {
        let mock = host_with_devices();
        let vfs = network_vfs(&context(&mock), "h1").unwrap();
        let ids: Vec<_> = vfs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["0000:41:02.0", "0000:41:02.1"]);
    }

    #[test]
    fn test_list_attached_reads_hostpci() {
        let mock = host_with_devices();
        mock.add_vm("h1", 100, "a", "");
        mock.set_config(100, "hostpci0", "0000:41:02.1,pcie=0");
        mock.add_vm("h2", 200, "b", "");
        mock.set_config(200, "hostpci0", "0000:41:02.0,pcie=0");

        let attached = list_attached(&context(&mock), "h1").unwrap();
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].id, "0000:41:02.1");
    }

    #[test]
    fn test_list_attached_waits_for_lock() {
        let mock = host_with_devices();
        mock.add_vm("h1", 100, "a", "");
        mock.set_config(100, "hostpci1", "0000:82:00.0,pcie=0");
        mock.lock_config_reads(100, 2);

        let attached = list_attached(&context(&mock), "h1").unwrap();
        assert_eq!(attached.len(), 1);
        assert_eq!(mock.call_count("config", 100), 3);
    }

    #[test]
    fn test_list_attached_lock_never_released() {
        let mock = host_with_devices();
        mock.add_vm("h1", 100, "a", "");
        mock.lock_config_reads(100, 100);

        let err = list_attached(&context(&mock), "h1").unwrap_err();
        assert!(err.is_transient());
    }
}
