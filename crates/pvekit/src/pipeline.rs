//! Per-machine provisioning.
//!
//! A [`MachinePlan`] is resolved and validated before anything is created.
//! [`Pipeline::provision`] then runs the steps for one machine in order:
//! reserve an id, create the VM from the machine type, wait for the disk
//! import to settle, attach NICs, seed cloud-init, attach SSDs.
//!
//! A failed step stops that machine only. Nothing is rolled back; partially
//! created VMs carry their tags and are removed by a normal teardown.

use crate::backend::CreateVm;
use crate::cloud_init;
use crate::context::Context;
use crate::devices;
use crate::error::{Error, Result};
use crate::poll::wait_for_status;
use crate::scanner::wait_for_unlock;
use crate::size::{parse_size_kib, parse_size_mib};
use crate::tags::TagSet;
use crate::types::{DeviceClass, MachineSpec, MachineTypeProfile, NetworkSpec, SsdLayout, VmStatus};

/// A machine with its profile resolved and its inputs validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachinePlan {
    /// Machine name from the descriptor (e.g. `s00`)
    pub machine: String,
    /// Full VM name, `<host>-<allocation>-<machine>`
    pub vm_name: String,
    /// Allocation id
    pub allocation_id: String,
    /// Resolved machine type
    pub profile: MachineTypeProfile,
    /// Memory in MiB
    pub memory_mib: u64,
    /// Size of each emulated disk in KiB, when the profile has them
    pub disk_size_kib: Option<u64>,
    /// Tags stamped at creation
    pub tags: TagSet,
}

impl MachinePlan {
    /// Resolve one descriptor entry.
    ///
    /// Identity tags (`node`, `vm`, `role`, `allocation`) always win over
    /// `extra_tags`.
    pub fn new(
        host: &str,
        allocation_id: &str,
        spec: &MachineSpec,
        profile: MachineTypeProfile,
        extra_tags: &TagSet,
    ) -> Result<Self> {
        let vm_name = format!("{host}-{allocation_id}-{}", spec.name);
        let memory_mib = parse_size_mib(&profile.base_memory)?;
        let disk_size_kib = match &profile.ssds {
            Some(SsdLayout::Emulated { size, .. }) => Some(parse_size_kib(size)?),
            _ => None,
        };

        let mut tags = TagSet::new()
            .with_node(host)
            .with_vm_name(&vm_name)
            .with_role(spec.role)
            .with_allocation(allocation_id);
        tags.merge_missing(extra_tags);
        tags.validate()?;

        Ok(Self {
            machine: spec.name.clone(),
            vm_name,
            allocation_id: allocation_id.to_string(),
            profile,
            memory_mib,
            disk_size_kib,
            tags,
        })
    }

    /// Creation request for this machine.
    pub fn create_request(&self, vmid: u32, storage: &str) -> CreateVm {
        let image = format!(
            "/mnt/pve/{storage}/template/iso/{}.img",
            self.profile.os_image
        );
        let request = CreateVm::new(vmid, &self.vm_name)
            .param("memory", self.memory_mib)
            .param("cores", self.profile.cores)
            .param("sockets", 1)
            .param("cpu", "host")
            .param("onboot", 1)
            .param("agent", 1)
            .param("tags", self.tags.encode())
            .param("scsihw", "virtio-scsi-pci")
            .param("virtio0", format!("{storage}:0,import-from={image}"))
            .param("boot", "order=virtio0;ide2;net0")
            .param("citype", "nocloud")
            .param("ciuser", "root")
            .param("ide2", format!("{storage}:cloudinit"));
        if self.profile.numa {
            request.param("numa", 1)
        } else {
            request
        }
    }
}

/// A machine that failed part-way.
#[derive(Debug)]
pub struct ProvisionFailure {
    /// Id of the VM, if it was reserved before the failure
    pub vmid: Option<u32>,
    /// What went wrong
    pub error: Error,
}

/// Provisioning steps bound to one host and storage.
pub struct Pipeline<'a> {
    ctx: &'a Context,
    host: &'a str,
    storage: &'a str,
}

impl<'a> Pipeline<'a> {
    /// Create a pipeline for `host`, putting disks and snippets on `storage`.
    pub fn new(ctx: &'a Context, host: &'a str, storage: &'a str) -> Self {
        Self { ctx, host, storage }
    }

    /// Provision one machine. Returns its vmid.
    pub fn provision(&self, plan: &MachinePlan) -> std::result::Result<u32, ProvisionFailure> {
        let vmid = self
            .ctx
            .provider
            .next_vmid()
            .map_err(|error| ProvisionFailure { vmid: None, error })?;

        self.provision_vm(vmid, plan).map_err(|error| {
            log::error!("failed to provision {} ({vmid}): {error}", plan.vm_name);
            if matches!(error, Error::Conflict { .. }) {
                log::error!("{}: device claimed by another VM, re-run create", plan.vm_name);
            }
            ProvisionFailure {
                vmid: Some(vmid),
                error,
            }
        })?;

        log::debug!("created VM {} with vmid {vmid}", plan.vm_name);
        Ok(vmid)
    }

    fn provision_vm(&self, vmid: u32, plan: &MachinePlan) -> Result<()> {
        let provider = &self.ctx.provider;

        provider.create_vm(self.host, &plan.create_request(vmid, self.storage))?;
        wait_for_status(
            provider.as_ref(),
            self.host,
            vmid,
            VmStatus::Stopped,
            &self.ctx.settings.status_poll,
        )?;
        // the image import can still hold `lock: create` after the VM reports stopped
        wait_for_unlock(self.ctx, self.host, vmid)?;

        let mut slot = 0;
        self.attach_networks(vmid, plan, &mut slot)?;

        cloud_init::seed(self.ctx, self.host, self.storage, vmid, &plan.vm_name)?;

        match (&plan.profile.ssds, plan.disk_size_kib) {
            (Some(SsdLayout::Emulated { count, .. }), Some(size_kib)) => {
                create_emulated_disks(self.ctx, self.host, self.storage, vmid, *count, size_kib)?;
                let args = emulated_disk_args(
                    self.storage,
                    vmid,
                    *count,
                    &plan.allocation_id,
                    &plan.machine,
                );
                provider.update_config(self.host, vmid, &[("args".to_string(), args)])?;
            }
            (Some(SsdLayout::Passthrough { count }), _) => {
                let claimed = devices::allocate(self.ctx, self.host, DeviceClass::Storage, *count)?;
                for device in claimed {
                    log::info!("attaching SSD {} to VM {vmid}", device.id);
                    self.attach_device(vmid, &mut slot, &device.id)?;
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn attach_networks(&self, vmid: u32, plan: &MachinePlan, slot: &mut usize) -> Result<()> {
        for network in &plan.profile.networks {
            match network {
                NetworkSpec::Bridge { name, bridge } => {
                    self.ctx.provider.update_config(
                        self.host,
                        vmid,
                        &[(name.clone(), format!("virtio,bridge={bridge},firewall=1"))],
                    )?;
                }
                NetworkSpec::Passthrough { .. } => {
                    let vf = devices::allocate(self.ctx, self.host, DeviceClass::Network, 1)?;
                    for device in vf {
                        log::debug!("attaching VF {} to VM {vmid}", device.id);
                        self.attach_device(vmid, slot, &device.id)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn attach_device(&self, vmid: u32, slot: &mut usize, device_id: &str) -> Result<()> {
        let key = format!("hostpci{slot}");
        self.ctx
            .provider
            .update_config(self.host, vmid, &[(key, format!("{device_id},pcie=0"))])?;
        *slot += 1;
        Ok(())
    }
}

fn disk_file(index: usize) -> String {
    format!("nvme{index:02}.raw")
}

/// QEMU arguments exposing `count` raw files as NVMe drives.
pub fn emulated_disk_args(
    storage: &str,
    vmid: u32,
    count: usize,
    allocation_id: &str,
    machine: &str,
) -> String {
    (0..count)
        .map(|i| {
            let id = format!("nvme{i:02}");
            format!(
                " -drive file=/mnt/pve/{storage}/images/{vmid}/{id}.raw,if=none,id={id} \
                 -device nvme,drive={id},serial={allocation_id}-{machine}-{id}"
            )
        })
        .collect()
}

/// Create `count` raw disks for a VM, skipping any that already exist.
/// Returns the volids of the disks created by this call.
pub fn create_emulated_disks(
    ctx: &Context,
    host: &str,
    storage: &str,
    vmid: u32,
    count: usize,
    size_kib: u64,
) -> Result<Vec<String>> {
    let existing = ctx.provider.storage_content(host, storage, vmid)?;
    let mut created = Vec::new();

    for index in 0..count {
        let filename = disk_file(index);
        let volid = format!("{storage}:{vmid}/{filename}");
        if existing.iter().any(|v| v.volid == volid) {
            log::debug!("emulated disk {volid} already exists");
            continue;
        }
        created.push(ctx.provider.create_disk(host, storage, vmid, &filename, size_kib)?);
        log::debug!("created emulated disk {volid} ({size_kib} KiB)");
    }

    Ok(created)
}

/// Delete every raw volume of a VM. Returns how many were removed.
pub fn delete_emulated_disks(ctx: &Context, host: &str, storage: &str, vmid: u32) -> Result<usize> {
    let volumes = ctx.provider.storage_content(host, storage, vmid)?;
    let mut removed = 0;
    for volume in volumes.iter().filter(|v| v.format == "raw") {
        ctx.provider.delete_volume(host, storage, &volume.volid)?;
        log::debug!("deleted {}", volume.volid);
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockProvider, MockTransfer};
    use crate::context::Settings;
    use crate::error::ErrorCategory;
    use crate::tags::{Role, TagKey};
    use crate::types::PciDevice;
    use std::sync::Arc;
    use std::time::Duration;

    fn context(mock: &MockProvider, transfer: &MockTransfer) -> Context {
        Context::new(Arc::new(mock.clone()), Arc::new(transfer.clone())).with_settings(
            Settings::default().with_polling(Duration::from_millis(1), Duration::from_millis(5)),
        )
    }

    fn spec(name: &str) -> MachineSpec {
        MachineSpec {
            name: name.into(),
            role: Role::Target,
            machine_type: "small".into(),
        }
    }

    fn profile(ssds: Option<SsdLayout>, networks: Vec<NetworkSpec>) -> MachineTypeProfile {
        MachineTypeProfile {
            name: "small".into(),
            os_image: "rocky-9".into(),
            cores: 4,
            base_memory: "16GB".into(),
            numa: false,
            networks,
            ssds,
        }
    }

    fn bridge() -> NetworkSpec {
        NetworkSpec::Bridge {
            name: "net0".into(),
            bridge: "vmbr0".into(),
        }
    }

    fn pci(id: &str, class: &str, name: &str) -> PciDevice {
        PciDevice {
            id: id.into(),
            class: class.into(),
            device_name: name.into(),
            vendor_name: String::new(),
        }
    }

    #[test]
    fn test_plan_tags_and_sizes() {
        let extra = TagSet::new()
            .with_node("elsewhere")
            .with(TagKey::Other("owner".into()), "dana");
        let plan = MachinePlan::new(
            "h1",
            "b178",
            &spec("s00"),
            profile(
                Some(SsdLayout::Emulated {
                    count: 2,
                    size: "12GB".into(),
                }),
                vec![bridge()],
            ),
            &extra,
        )
        .unwrap();

        assert_eq!(plan.vm_name, "h1-b178-s00");
        assert_eq!(plan.memory_mib, 16 * 1024);
        assert_eq!(plan.disk_size_kib, Some(12 * 1024 * 1024));
        assert_eq!(
            plan.tags.encode(),
            "node.h1;vm.h1-b178-s00;role.target;allocation.b178;owner.dana"
        );
    }

    #[test]
    fn test_plan_rejects_bad_size() {
        let mut bad = profile(None, vec![]);
        bad.base_memory = "16 gigs".into();
        let err = MachinePlan::new("h1", "b178", &spec("s00"), bad, &TagSet::new()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[test]
    fn test_create_request_shape() {
        let plan =
            MachinePlan::new("h1", "b178", &spec("s00"), profile(None, vec![]), &TagSet::new())
                .unwrap();
        let request = plan.create_request(104, "lb-local-storage");
        let param = |k: &str| request.params.get(k).map(String::as_str);

        assert_eq!(request.name, "h1-b178-s00");
        assert_eq!(param("memory"), Some("16384"));
        assert_eq!(param("cores"), Some("4"));
        assert_eq!(
            param("virtio0"),
            Some("lb-local-storage:0,import-from=/mnt/pve/lb-local-storage/template/iso/rocky-9.img")
        );
        assert_eq!(param("boot"), Some("order=virtio0;ide2;net0"));
        assert_eq!(param("ide2"), Some("lb-local-storage:cloudinit"));
        assert_eq!(param("numa"), None);
    }

    #[test]
    fn test_emulated_disk_args() {
        let args = emulated_disk_args("s", 104, 2, "b178", "s00");
        assert_eq!(
            args,
            " -drive file=/mnt/pve/s/images/104/nvme00.raw,if=none,id=nvme00 -device nvme,drive=nvme00,serial=b178-s00-nvme00 \
             -drive file=/mnt/pve/s/images/104/nvme01.raw,if=none,id=nvme01 -device nvme,drive=nvme01,serial=b178-s00-nvme01"
        );
    }

    #[test]
    fn test_create_emulated_disks_skips_existing() {
        let mock = MockProvider::new();
        mock.add_volume("h1", 104, "s:104/nvme00.raw", "raw");
        let ctx = context(&mock, &MockTransfer::new());

        let created = create_emulated_disks(&ctx, "h1", "s", 104, 3, 1024).unwrap();
        assert_eq!(created, vec!["s:104/nvme01.raw", "s:104/nvme02.raw"]);
        assert_eq!(mock.volumes(104).len(), 3);
    }

    #[test]
    fn test_delete_emulated_disks_only_raw() {
        let mock = MockProvider::new();
        mock.add_volume("h1", 104, "s:104/nvme00.raw", "raw");
        mock.add_volume("h1", 104, "s:104/vm-104-disk-0.qcow2", "qcow2");
        let ctx = context(&mock, &MockTransfer::new());

        assert_eq!(delete_emulated_disks(&ctx, "h1", "s", 104).unwrap(), 1);
        assert_eq!(mock.volumes(104).len(), 1);
    }

    #[test]
    fn test_provision_full_machine() {
        let mock = MockProvider::new();
        mock.add_pci_device("h1", pci("0000:41:02.0", "0x020000", "Ethernet Virtual Function"));
        mock.add_pci_device("h1", pci("0000:82:00.0", "0x010802", "NVMe SSD Controller"));
        mock.add_pci_device("h1", pci("0000:83:00.0", "0x010802", "NVMe SSD Controller"));
        let transfer = MockTransfer::new();
        let ctx = context(&mock, &transfer);

        let plan = MachinePlan::new(
            "h1",
            "b178",
            &spec("s00"),
            profile(
                Some(SsdLayout::Passthrough { count: 2 }),
                vec![bridge(), NetworkSpec::Passthrough { name: "data".into() }],
            ),
            &TagSet::new(),
        )
        .unwrap();

        let vmid = Pipeline::new(&ctx, "h1", "s").provision(&plan).unwrap();
        let config = mock.config(vmid).unwrap();

        assert_eq!(config.get("net0"), Some("virtio,bridge=vmbr0,firewall=1"));
        assert_eq!(config.get("hostpci0"), Some("0000:41:02.0,pcie=0"));
        assert_eq!(config.get("hostpci1"), Some("0000:82:00.0,pcie=0"));
        assert_eq!(config.get("hostpci2"), Some("0000:83:00.0,pcie=0"));
        assert_eq!(config.get("cicustom"), Some(&*cloud_init::cicustom("s", vmid)));
        assert!(transfer.file("h1", &cloud_init::snippet_path("s", "user", vmid)).is_some());
    }

    #[test]
    fn test_provision_emulated_disks_sets_args() {
        let mock = MockProvider::new();
        let ctx = context(&mock, &MockTransfer::new());
        let plan = MachinePlan::new(
            "h1",
            "b178",
            &spec("s01"),
            profile(
                Some(SsdLayout::Emulated {
                    count: 1,
                    size: "1GB".into(),
                }),
                vec![],
            ),
            &TagSet::new(),
        )
        .unwrap();

        let vmid = Pipeline::new(&ctx, "h1", "s").provision(&plan).unwrap();
        let args = mock.config(vmid).unwrap().get("args").unwrap_or_default().to_string();
        assert!(args.contains("serial=b178-s01-nvme00"));
        assert_eq!(mock.volumes(vmid)[0].size, 1024 * 1024 * 1024);
    }

    #[test]
    fn test_provision_waits_for_create_lock() {
        let mock = MockProvider::new();
        mock.lock_config_reads(100, 2);
        let ctx = context(&mock, &MockTransfer::new());
        let plan = MachinePlan::new(
            "h1",
            "b178",
            &spec("s00"),
            profile(None, vec![bridge()]),
            &TagSet::new(),
        )
        .unwrap();

        let vmid = Pipeline::new(&ctx, "h1", "s").provision(&plan).unwrap();
        assert_eq!(vmid, 100);
        assert_eq!(
            mock.config(vmid).unwrap().get("net0"),
            Some("virtio,bridge=vmbr0,firewall=1")
        );
        assert!(mock.call_count("config", vmid) >= 3);
    }

    #[test]
    fn test_provision_create_lock_never_released() {
        let mock = MockProvider::new();
        mock.lock_config_reads(100, 1000);
        let ctx = context(&mock, &MockTransfer::new());
        let plan = MachinePlan::new(
            "h1",
            "b178",
            &spec("s00"),
            profile(None, vec![bridge()]),
            &TagSet::new(),
        )
        .unwrap();

        let failure = Pipeline::new(&ctx, "h1", "s").provision(&plan).unwrap_err();
        assert_eq!(failure.vmid, Some(100));
        assert!(failure.error.is_transient());
        assert_eq!(mock.call_count("update", 100), 0);
    }

    #[test]
    fn test_provision_upload_failure_keeps_vmid() {
        let mock = MockProvider::new();
        let transfer = MockTransfer::new();
        transfer.fail_uploads("connection reset");
        let ctx = context(&mock, &transfer);
        let plan = MachinePlan::new(
            "h1",
            "b178",
            &spec("s00"),
            profile(None, vec![bridge()]),
            &TagSet::new(),
        )
        .unwrap();

        let failure = Pipeline::new(&ctx, "h1", "s").provision(&plan).unwrap_err();
        assert!(matches!(failure.error, Error::Transfer { .. }));
        let vmid = failure.vmid.unwrap();
        assert!(mock.config(vmid).unwrap().get("cicustom").is_none());
        assert_eq!(transfer.file_count(), 0);
    }

    #[test]
    fn test_provision_without_free_vf_keeps_vmid() {
        let mock = MockProvider::new();
        let ctx = context(&mock, &MockTransfer::new());
        let plan = MachinePlan::new(
            "h1",
            "b178",
            &spec("s00"),
            profile(None, vec![NetworkSpec::Passthrough { name: String::new() }]),
            &TagSet::new(),
        )
        .unwrap();

        let failure = Pipeline::new(&ctx, "h1", "s").provision(&plan).unwrap_err();
        assert_eq!(failure.error.category(), ErrorCategory::ResourceExhausted);
        let vmid = failure.vmid.unwrap();
        // no rollback: the VM stays for teardown
        assert!(mock.vm(vmid).is_some());
    }
}
