//! In-memory test doubles for [`Provider`] and [`FileTransfer`].
//!
//! The mock keeps a small model of a cluster: VMs with configs and tags, PCI
//! devices per node, bridges and storage volumes. It reproduces the provider
//! behaviors the core depends on (device conflicts, config locks, guest agent
//! not ready, scripted power-state sequences) and records every mutating
//! call so tests can assert on what happened.

use crate::backend::{CreateVm, FileTransfer, Provider};
use crate::error::{Error, Result};
use crate::tags::TagSet;
use crate::types::{GuestInterface, PciDevice, StorageVolume, VmConfig, VmHandle, VmStatus};
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const FIRST_VMID: u32 = 100;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn provider_error(message: impl AsRef<str>) -> Error {
    Error::from_provider_message(Some(500), message.as_ref())
}

fn missing_vm(node: &str, vmid: u32) -> Error {
    provider_error(format!(
        "Configuration file 'nodes/{node}/qemu-server/{vmid}.conf' does not exist"
    ))
}

#[derive(Debug, Clone)]
struct MockVm {
    node: String,
    status: VmStatus,
    config: VmConfig,
    interfaces: Vec<GuestInterface>,
}

impl MockVm {
    fn handle(&self, vmid: u32) -> VmHandle {
        VmHandle {
            vmid,
            node: self.node.clone(),
            name: self.config.get("name").unwrap_or_default().to_string(),
            status: self.status,
            tags: TagSet::decode(self.config.get("tags").unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone)]
struct MockVolume {
    node: String,
    vmid: u32,
    volume: StorageVolume,
}

#[derive(Debug)]
struct State {
    next_vmid: u32,
    vms: BTreeMap<u32, MockVm>,
    pci: HashMap<String, Vec<PciDevice>>,
    bridges: HashMap<(String, String), Ipv4Net>,
    volumes: BTreeMap<String, MockVolume>,
    status_scripts: HashMap<u32, VecDeque<VmStatus>>,
    locked_reads: HashMap<u32, u32>,
    agent_delays: HashMap<u32, u32>,
    failures: HashMap<(String, u32), String>,
    calls: Vec<String>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            next_vmid: FIRST_VMID,
            vms: BTreeMap::new(),
            pci: HashMap::new(),
            bridges: HashMap::new(),
            volumes: BTreeMap::new(),
            status_scripts: HashMap::new(),
            locked_reads: HashMap::new(),
            agent_delays: HashMap::new(),
            failures: HashMap::new(),
            calls: Vec::new(),
        }
    }
}

impl State {
    /// Record a call and return the injected failure for it, if any.
    fn enter(&mut self, op: &str, vmid: u32) -> Result<()> {
        self.calls.push(format!("{op}:{vmid}"));
        let injected = self
            .failures
            .get(&(op.to_string(), vmid))
            .or_else(|| self.failures.get(&(op.to_string(), 0)));
        match injected {
            Some(message) => Err(provider_error(message)),
            None => Ok(()),
        }
    }

    fn vm_mut(&mut self, node: &str, vmid: u32) -> Result<&mut MockVm> {
        match self.vms.get_mut(&vmid) {
            Some(vm) if vm.node == node => Ok(vm),
            _ => Err(missing_vm(node, vmid)),
        }
    }

    /// Owner of a PCI device on `node`, other than `vmid`.
    fn device_owner(&self, node: &str, vmid: u32, device_id: &str) -> Option<u32> {
        self.vms
            .iter()
            .filter(|(other, vm)| **other != vmid && vm.node == node)
            .find(|(_, vm)| vm.config.hostpci_values().any(|v| v.contains(device_id)))
            .map(|(other, _)| *other)
    }
}

/// In-memory [`Provider`] for tests.
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<State>>,
}

impl MockProvider {
    /// Create an empty mock cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stopped VM with an encoded tag string.
    pub fn add_vm(&self, node: &str, vmid: u32, name: &str, tags: &str) {
        let mut state = lock(&self.state);
        let mut config = VmConfig::default();
        config.0.insert("name".into(), name.into());
        if !tags.is_empty() {
            config.0.insert("tags".into(), tags.into());
        }
        state.vms.insert(
            vmid,
            MockVm {
                node: node.to_string(),
                status: VmStatus::Stopped,
                config,
                interfaces: Vec::new(),
            },
        );
        state.next_vmid = state.next_vmid.max(vmid + 1);
    }

    /// Add a PCI device to a node.
    pub fn add_pci_device(&self, node: &str, device: PciDevice) {
        lock(&self.state)
            .pci
            .entry(node.to_string())
            .or_default()
            .push(device);
    }

    /// Give a bridge an address.
    pub fn set_bridge(&self, node: &str, bridge: &str, cidr: Ipv4Net) {
        lock(&self.state)
            .bridges
            .insert((node.to_string(), bridge.to_string()), cidr);
    }

    /// Add an existing volume.
    pub fn add_volume(&self, node: &str, vmid: u32, volid: &str, format: &str) {
        lock(&self.state).volumes.insert(
            volid.to_string(),
            MockVolume {
                node: node.to_string(),
                vmid,
                volume: StorageVolume {
                    volid: volid.to_string(),
                    format: format.to_string(),
                    size: 0,
                },
            },
        );
    }

    /// Force a VM's power state.
    pub fn set_status(&self, vmid: u32, status: VmStatus) {
        if let Some(vm) = lock(&self.state).vms.get_mut(&vmid) {
            vm.status = status;
        }
    }

    /// Set a raw config value on a VM.
    pub fn set_config(&self, vmid: u32, key: &str, value: &str) {
        if let Some(vm) = lock(&self.state).vms.get_mut(&vmid) {
            vm.config.0.insert(key.to_string(), value.to_string());
        }
    }

    /// Make the next status reads return `statuses` in order, then fall back
    /// to the VM's real state.
    pub fn script_status(&self, vmid: u32, statuses: impl IntoIterator<Item = VmStatus>) {
        lock(&self.state)
            .status_scripts
            .insert(vmid, statuses.into_iter().collect());
    }

    /// Hold a `create` lock on the VM until its config has been read
    /// `reads` more times. Config updates fail while the lock is held.
    pub fn lock_config_reads(&self, vmid: u32, reads: u32) {
        lock(&self.state).locked_reads.insert(vmid, reads);
    }

    /// Interfaces the guest agent reports once the VM is running.
    pub fn set_interfaces(&self, vmid: u32, interfaces: Vec<GuestInterface>) {
        if let Some(vm) = lock(&self.state).vms.get_mut(&vmid) {
            vm.interfaces = interfaces;
        }
    }

    /// Report the guest agent as not running for the next `reads` queries.
    pub fn delay_agent(&self, vmid: u32, reads: u32) {
        lock(&self.state).agent_delays.insert(vmid, reads);
    }

    /// Make every call of `op` on `vmid` fail with `message`. A `vmid` of 0
    /// applies to every VM.
    ///
    /// Operations: `create`, `update`, `config`, `start`, `stop`, `delete`,
    /// `status`, `agent`, `disk`, `volume-delete`.
    pub fn fail(&self, op: &str, vmid: u32, message: &str) {
        lock(&self.state)
            .failures
            .insert((op.to_string(), vmid), message.to_string());
    }

    /// Every recorded call as `op:vmid`, in call order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Number of recorded calls of `op` on `vmid`.
    pub fn call_count(&self, op: &str, vmid: u32) -> usize {
        let needle = format!("{op}:{vmid}");
        lock(&self.state).calls.iter().filter(|c| **c == needle).count()
    }

    /// Look up a VM.
    pub fn vm(&self, vmid: u32) -> Option<VmHandle> {
        lock(&self.state).vms.get(&vmid).map(|vm| vm.handle(vmid))
    }

    /// Live config of a VM.
    pub fn config(&self, vmid: u32) -> Option<VmConfig> {
        lock(&self.state).vms.get(&vmid).map(|vm| vm.config.clone())
    }

    /// Ids of every VM in the mock.
    pub fn vmids(&self) -> Vec<u32> {
        lock(&self.state).vms.keys().copied().collect()
    }

    /// Volumes belonging to a VM.
    pub fn volumes(&self, vmid: u32) -> Vec<StorageVolume> {
        lock(&self.state)
            .volumes
            .values()
            .filter(|v| v.vmid == vmid)
            .map(|v| v.volume.clone())
            .collect()
    }
}

impl Provider for MockProvider {
    fn next_vmid(&self) -> Result<u32> {
        let mut state = lock(&self.state);
        state.enter("nextid", 0)?;
        let vmid = state.next_vmid;
        state.next_vmid += 1;
        Ok(vmid)
    }

    fn create_vm(&self, node: &str, request: &CreateVm) -> Result<()> {
        let mut state = lock(&self.state);
        state.enter("create", request.vmid)?;
        if state.vms.contains_key(&request.vmid) {
            return Err(provider_error(format!(
                "unable to create VM {} - VM {} already exists",
                request.vmid, request.vmid
            )));
        }

        let mut config = VmConfig(request.params.clone());
        config.0.insert("name".into(), request.name.clone());
        state.vms.insert(
            request.vmid,
            MockVm {
                node: node.to_string(),
                status: VmStatus::Stopped,
                config,
                interfaces: Vec::new(),
            },
        );
        state.next_vmid = state.next_vmid.max(request.vmid + 1);
        Ok(())
    }

    fn update_config(&self, node: &str, vmid: u32, values: &[(String, String)]) -> Result<()> {
        let mut state = lock(&self.state);
        state.enter("update", vmid)?;
        state.vm_mut(node, vmid)?;
        if state.locked_reads.get(&vmid).is_some_and(|reads| *reads > 0) {
            return Err(provider_error(format!("VM {vmid} is locked (create)")));
        }

        for (key, value) in values {
            if !key.starts_with("hostpci") {
                continue;
            }
            let device_id = value.split(',').next().unwrap_or_default();
            if let Some(owner) = state.device_owner(node, vmid, device_id) {
                return Err(provider_error(format!(
                    "PCI device '{device_id}' already in use by VMID '{owner}'"
                )));
            }
        }

        let vm = state.vm_mut(node, vmid)?;
        for (key, value) in values {
            vm.config.0.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn vm_config(&self, node: &str, vmid: u32) -> Result<VmConfig> {
        let mut state = lock(&self.state);
        state.enter("config", vmid)?;
        let mut config = state.vm_mut(node, vmid)?.config.clone();
        if let Some(reads) = state.locked_reads.get_mut(&vmid).filter(|r| **r > 0) {
            *reads -= 1;
            config.0.insert("lock".into(), "create".into());
        }
        Ok(config)
    }

    fn start_vm(&self, node: &str, vmid: u32) -> Result<()> {
        let mut state = lock(&self.state);
        state.enter("start", vmid)?;
        state.vm_mut(node, vmid)?.status = VmStatus::Running;
        Ok(())
    }

    fn stop_vm(&self, node: &str, vmid: u32, _timeout: Duration) -> Result<()> {
        let mut state = lock(&self.state);
        state.enter("stop", vmid)?;
        state.vm_mut(node, vmid)?.status = VmStatus::Stopped;
        Ok(())
    }

    fn delete_vm(&self, node: &str, vmid: u32) -> Result<()> {
        let mut state = lock(&self.state);
        state.enter("delete", vmid)?;
        if state.vm_mut(node, vmid)?.status == VmStatus::Running {
            return Err(provider_error(format!("VM {vmid} is running - destroy failed")));
        }
        state.vms.remove(&vmid);
        Ok(())
    }

    fn vm_status(&self, node: &str, vmid: u32) -> Result<VmStatus> {
        let mut state = lock(&self.state);
        state.enter("status", vmid)?;
        let actual = state.vm_mut(node, vmid)?.status;
        let scripted = state
            .status_scripts
            .get_mut(&vmid)
            .and_then(VecDeque::pop_front);
        Ok(scripted.unwrap_or(actual))
    }

    fn guest_interfaces(&self, node: &str, vmid: u32) -> Result<Vec<GuestInterface>> {
        let mut state = lock(&self.state);
        state.enter("agent", vmid)?;
        if state.vm_mut(node, vmid)?.status != VmStatus::Running {
            return Err(provider_error(format!("VM {vmid} is not running")));
        }
        if let Some(reads) = state.agent_delays.get_mut(&vmid).filter(|r| **r > 0) {
            *reads -= 1;
            return Err(provider_error("QEMU guest agent is not running"));
        }
        Ok(state.vm_mut(node, vmid)?.interfaces.clone())
    }

    fn node_vms(&self, node: &str) -> Result<Vec<VmHandle>> {
        let state = lock(&self.state);
        Ok(state
            .vms
            .iter()
            .filter(|(_, vm)| vm.node == node)
            .map(|(vmid, vm)| vm.handle(*vmid))
            .collect())
    }

    fn cluster_vms(&self) -> Result<Vec<VmHandle>> {
        let state = lock(&self.state);
        Ok(state.vms.iter().map(|(vmid, vm)| vm.handle(*vmid)).collect())
    }

    fn pci_devices(&self, node: &str, class_blacklist: &str) -> Result<Vec<PciDevice>> {
        let blacklist: Vec<&str> = class_blacklist.split(';').collect();
        let state = lock(&self.state);
        Ok(state
            .pci
            .get(node)
            .into_iter()
            .flatten()
            .filter(|device| {
                let class = device.class.trim_start_matches("0x");
                !blacklist.iter().any(|prefix| class.starts_with(prefix))
            })
            .cloned()
            .collect())
    }

    fn bridge_cidr(&self, node: &str, bridge: &str) -> Result<Option<Ipv4Net>> {
        let state = lock(&self.state);
        Ok(state
            .bridges
            .get(&(node.to_string(), bridge.to_string()))
            .copied())
    }

    fn storage_content(&self, node: &str, storage: &str, vmid: u32) -> Result<Vec<StorageVolume>> {
        let prefix = format!("{storage}:");
        let state = lock(&self.state);
        Ok(state
            .volumes
            .values()
            .filter(|v| v.node == node && v.vmid == vmid && v.volume.volid.starts_with(&prefix))
            .map(|v| v.volume.clone())
            .collect())
    }

    fn create_disk(
        &self,
        node: &str,
        storage: &str,
        vmid: u32,
        filename: &str,
        size_kib: u64,
    ) -> Result<String> {
        let mut state = lock(&self.state);
        state.enter("disk", vmid)?;
        let volid = format!("{storage}:{vmid}/{filename}");
        if state.volumes.contains_key(&volid) {
            return Err(provider_error(format!(
                "volume '{volid}' already exists"
            )));
        }
        state.volumes.insert(
            volid.clone(),
            MockVolume {
                node: node.to_string(),
                vmid,
                volume: StorageVolume {
                    volid: volid.clone(),
                    format: "raw".into(),
                    size: size_kib * 1024,
                },
            },
        );
        Ok(volid)
    }

    fn delete_volume(&self, _node: &str, _storage: &str, volid: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let vmid = state.volumes.get(volid).map(|v| v.vmid).unwrap_or_default();
        state.enter("volume-delete", vmid)?;
        match state.volumes.remove(volid) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound {
                what: format!("volume '{volid}'"),
            }),
        }
    }
}

/// In-memory [`FileTransfer`] for tests.
#[derive(Debug, Clone, Default)]
pub struct MockTransfer {
    files: Arc<Mutex<BTreeMap<(String, String), Vec<u8>>>>,
    upload_failure: Arc<Mutex<Option<String>>>,
}

impl MockTransfer {
    /// Create an empty file session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a file in place as if uploaded earlier.
    pub fn add_file(&self, host: &str, path: &str, contents: &str) {
        lock(&self.files).insert(
            (host.to_string(), path.to_string()),
            contents.as_bytes().to_vec(),
        );
    }

    /// Contents of an uploaded file.
    pub fn file(&self, host: &str, path: &str) -> Option<String> {
        lock(&self.files)
            .get(&(host.to_string(), path.to_string()))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Number of files held.
    pub fn file_count(&self) -> usize {
        lock(&self.files).len()
    }

    /// Make every upload fail with `message`.
    pub fn fail_uploads(&self, message: &str) {
        *lock(&self.upload_failure) = Some(message.to_string());
    }
}

impl FileTransfer for MockTransfer {
    fn upload(&self, host: &str, path: &str, contents: &[u8]) -> Result<()> {
        if let Some(message) = lock(&self.upload_failure).clone() {
            return Err(Error::Transfer {
                host: host.to_string(),
                path: path.to_string(),
                message,
            });
        }
        lock(&self.files).insert((host.to_string(), path.to_string()), contents.to_vec());
        Ok(())
    }

    fn remove(&self, host: &str, path: &str) -> Result<()> {
        match lock(&self.files).remove(&(host.to_string(), path.to_string())) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound {
                what: format!("{host}:{path}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    fn vf(id: &str) -> PciDevice {
        PciDevice {
            id: id.into(),
            class: "0x020000".into(),
            device_name: "Ethernet Virtual Function 700 Series".into(),
            vendor_name: "Intel Corporation".into(),
        }
    }

    #[test]
    fn test_hostpci_conflict_is_reported() {
        let mock = MockProvider::new();
        mock.add_vm("h1", 100, "a", "");
        mock.add_vm("h1", 101, "b", "");
        let value = vec![("hostpci0".to_string(), "0000:41:02.1,pcie=0".to_string())];

        mock.update_config("h1", 100, &value).unwrap();
        let err = mock.update_config("h1", 101, &value).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Conflict);
        assert!(err.to_string().contains("VMID '100'"));
    }

    #[test]
    fn test_status_script_then_actual() {
        let mock = MockProvider::new();
        mock.add_vm("h1", 100, "a", "");
        mock.script_status(100, [VmStatus::Unknown, VmStatus::Running]);

        assert_eq!(mock.vm_status("h1", 100).unwrap(), VmStatus::Unknown);
        assert_eq!(mock.vm_status("h1", 100).unwrap(), VmStatus::Running);
        assert_eq!(mock.vm_status("h1", 100).unwrap(), VmStatus::Stopped);
    }

    #[test]
    fn test_pci_blacklist_filters_classes() {
        let mock = MockProvider::new();
        mock.add_pci_device("h1", vf("0000:41:02.1"));
        mock.add_pci_device(
            "h1",
            PciDevice {
                id: "0000:00:1f.0".into(),
                class: "0x060100".into(),
                device_name: "ISA bridge".into(),
                vendor_name: String::new(),
            },
        );
        let devices = mock.pci_devices("h1", "05;06;07;08;0b;0c;11;ff").unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "0000:41:02.1");
    }

    #[test]
    fn test_agent_not_running_is_transient() {
        let mock = MockProvider::new();
        mock.add_vm("h1", 100, "a", "");
        assert!(mock.guest_interfaces("h1", 100).unwrap_err().is_transient());

        mock.set_status(100, VmStatus::Running);
        mock.delay_agent(100, 1);
        assert!(mock.guest_interfaces("h1", 100).unwrap_err().is_transient());
        assert!(mock.guest_interfaces("h1", 100).unwrap().is_empty());
    }

    #[test]
    fn test_injected_failure_applies_to_one_vm() {
        let mock = MockProvider::new();
        mock.add_vm("h1", 100, "a", "");
        mock.add_vm("h1", 101, "b", "");
        mock.fail("stop", 101, "got timeout");

        assert!(mock.stop_vm("h1", 100, Duration::from_secs(1)).is_ok());
        assert!(mock.stop_vm("h1", 101, Duration::from_secs(1)).is_err());
        assert_eq!(mock.call_count("stop", 101), 1);
    }

    #[test]
    fn test_transfer_remove_missing_is_not_found() {
        let transfer = MockTransfer::new();
        transfer.upload("h1", "/tmp/a", b"x").unwrap();
        assert_eq!(transfer.file("h1", "/tmp/a").as_deref(), Some("x"));
        transfer.remove("h1", "/tmp/a").unwrap();
        let err = transfer.remove("h1", "/tmp/a").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }
}
