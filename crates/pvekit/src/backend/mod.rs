//! Contracts for the external collaborators of the allocation core.
//!
//! [`Provider`] is the compute-management API of the cluster and
//! [`FileTransfer`] a remote file session on a named host. The real
//! implementations are [`rest::RestProvider`] and [`ssh::SshTransfer`].
//!
//! # Testing
//!
//! Use [`MockProvider`] and [`MockTransfer`] to exercise the core without a
//! cluster:
//!
//! ```
//! use pvekit::backend::{MockProvider, Provider};
//!
//! let mock = MockProvider::new();
//! mock.add_vm("h1", 100, "h1-b178-s00", "node.h1;allocation.b178");
//! assert_eq!(mock.cluster_vms().unwrap().len(), 1);
//! ```

pub mod mock;
pub mod rest;
pub mod ssh;

pub use mock::{MockProvider, MockTransfer};

use crate::error::Result;
use crate::types::{GuestInterface, PciDevice, StorageVolume, VmConfig, VmHandle, VmStatus};
use ipnet::Ipv4Net;
use std::collections::BTreeMap;
use std::time::Duration;

/// Parameters for creating a VM.
///
/// Values are passed to the provider verbatim; the pipeline decides the
/// shape of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVm {
    /// Id obtained from [`Provider::next_vmid`]
    pub vmid: u32,
    /// VM name
    pub name: String,
    /// Every other creation parameter (`cores`, `memory`, `tags`, ...)
    pub params: BTreeMap<String, String>,
}

impl CreateVm {
    /// Start a creation request.
    pub fn new(vmid: u32, name: impl Into<String>) -> Self {
        Self {
            vmid,
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    /// Builder: add a parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }
}

/// Compute-management API of the cluster.
///
/// Every call is blocking. Errors are classified with
/// [`Error::from_provider_message`](crate::Error::from_provider_message) so
/// callers can tell transient state from real failures.
pub trait Provider: Send + Sync {
    /// Reserve the next free VM id of the cluster.
    fn next_vmid(&self) -> Result<u32>;

    /// Create a VM on `node`. Creation may finish asynchronously; wait for
    /// the VM to settle before configuring it.
    fn create_vm(&self, node: &str, request: &CreateVm) -> Result<()>;

    /// Set configuration values on a VM.
    fn update_config(&self, node: &str, vmid: u32, values: &[(String, String)]) -> Result<()>;

    /// Read the live configuration of a VM.
    fn vm_config(&self, node: &str, vmid: u32) -> Result<VmConfig>;

    /// Power on a VM.
    fn start_vm(&self, node: &str, vmid: u32) -> Result<()>;

    /// Request a shutdown, letting the provider force it after `timeout`.
    fn stop_vm(&self, node: &str, vmid: u32, timeout: Duration) -> Result<()>;

    /// Destroy a VM and its config.
    fn delete_vm(&self, node: &str, vmid: u32) -> Result<()>;

    /// Current power state.
    fn vm_status(&self, node: &str, vmid: u32) -> Result<VmStatus>;

    /// Interfaces reported by the guest agent.
    fn guest_interfaces(&self, node: &str, vmid: u32) -> Result<Vec<GuestInterface>>;

    /// VMs on one node.
    fn node_vms(&self, node: &str) -> Result<Vec<VmHandle>>;

    /// VMs on every node of the cluster.
    fn cluster_vms(&self) -> Result<Vec<VmHandle>>;

    /// PCI devices on a node, excluding the classes in `class_blacklist`
    /// (`;`-separated class prefixes).
    fn pci_devices(&self, node: &str, class_blacklist: &str) -> Result<Vec<PciDevice>>;

    /// Address of a host bridge, if it has one.
    fn bridge_cidr(&self, node: &str, bridge: &str) -> Result<Option<Ipv4Net>>;

    /// Volumes of `vmid` on a storage.
    fn storage_content(&self, node: &str, storage: &str, vmid: u32) -> Result<Vec<StorageVolume>>;

    /// Allocate a raw volume. Returns its volid.
    fn create_disk(
        &self,
        node: &str,
        storage: &str,
        vmid: u32,
        filename: &str,
        size_kib: u64,
    ) -> Result<String>;

    /// Delete a volume by volid.
    fn delete_volume(&self, node: &str, storage: &str, volid: &str) -> Result<()>;
}

/// Remote file session on a named host.
pub trait FileTransfer: Send + Sync {
    /// Write `contents` to `path` on `host`, replacing any existing file.
    fn upload(&self, host: &str, path: &str, contents: &[u8]) -> Result<()>;

    /// Remove `path` on `host`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the file does not exist.
    fn remove(&self, host: &str, path: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_vm_builder() {
        let request = CreateVm::new(104, "h1-b178-s00")
            .param("cores", 4)
            .param("cpu", "host");
        assert_eq!(request.vmid, 104);
        assert_eq!(request.params.get("cores").map(String::as_str), Some("4"));
        assert_eq!(request.params.get("cpu").map(String::as_str), Some("host"));
    }
}
