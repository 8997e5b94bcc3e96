//! Core types for VM allocation.

use crate::error::{Error, Result};
use crate::tags::{Role, TagSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Descriptors and machine types
// =============================================================================

/// One machine inside an allocation descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Short machine name, unique within the descriptor (e.g. `s00`)
    pub name: String,
    /// Role the machine plays in the allocation
    pub role: Role,
    /// Name of the [`MachineTypeProfile`] to instantiate
    pub machine_type: String,
}

/// Template for a group of machines created together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationDescriptor {
    /// Descriptor name, used to look it up
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Machines in creation order
    pub machines: Vec<MachineSpec>,
}

/// A network interface declared by a machine type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NetworkSpec {
    /// Virtio NIC attached to a host bridge
    Bridge {
        /// Config key of the interface (e.g. `net0`)
        name: String,
        /// Host bridge (e.g. `vmbr0`)
        bridge: String,
    },
    /// SR-IOV virtual function passed through to the guest
    Passthrough {
        /// Descriptive name, not used as a config key
        #[serde(default)]
        name: String,
    },
}

/// Disk layout declared by a machine type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SsdLayout {
    /// Raw backing files exposed to the guest as NVMe devices
    Emulated {
        /// Number of disks
        count: usize,
        /// Size of each disk (e.g. `"12GB"`)
        size: String,
    },
    /// Physical NVMe devices passed through to the guest
    Passthrough {
        /// Number of devices
        count: usize,
    },
}

impl SsdLayout {
    /// Number of disks in the layout.
    pub fn count(&self) -> usize {
        match self {
            SsdLayout::Emulated { count, .. } | SsdLayout::Passthrough { count } => *count,
        }
    }
}

/// Named hardware shape a machine is created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineTypeProfile {
    /// Profile name; filled from the catalog key when omitted
    #[serde(default)]
    pub name: String,
    /// OS image file name (without `.img`) under the storage's ISO directory
    pub os_image: String,
    /// Number of vCPUs
    pub cores: u32,
    /// Memory size string (e.g. `"16GB"`)
    pub base_memory: String,
    /// Whether NUMA is enabled for the guest
    #[serde(default)]
    pub numa: bool,
    /// Network interfaces in attach order
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
    /// Optional SSD layout
    #[serde(default)]
    pub ssds: Option<SsdLayout>,
}

// =============================================================================
// PCI devices
// =============================================================================

/// Class of PCI device that can be passed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Ethernet controller
    Network,
    /// NVMe controller
    Storage,
}

impl DeviceClass {
    /// PCI class code as reported by the provider.
    pub fn class_code(&self) -> &'static str {
        match self {
            DeviceClass::Network => "0x020000",
            DeviceClass::Storage => "0x010802",
        }
    }

    /// Name used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Network => "network",
            DeviceClass::Storage => "storage",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "network" => Ok(DeviceClass::Network),
            "storage" => Ok(DeviceClass::Storage),
            other => Err(Error::validation(format!(
                "invalid device class '{other}' (expected network or storage)"
            ))),
        }
    }
}

/// A PCI device visible on a host.
///
/// Whether it is attached is never stored here; it is computed by scanning
/// VM configurations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDevice {
    /// Bus address (e.g. `0000:41:02.1`)
    pub id: String,
    /// PCI class code (e.g. `0x020000`)
    pub class: String,
    /// Device description
    #[serde(default)]
    pub device_name: String,
    /// Vendor description
    #[serde(default)]
    pub vendor_name: String,
}

impl PciDevice {
    /// Whether this device is an SR-IOV virtual function.
    pub fn is_virtual_function(&self) -> bool {
        self.device_name.contains("Virtual Function")
    }

    /// Whether this device belongs to the given class.
    pub fn is_class(&self, class: DeviceClass) -> bool {
        self.class == class.class_code()
    }
}

// =============================================================================
// Virtual machines
// =============================================================================

/// Power state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// Powered on
    Running,
    /// Powered off
    Stopped,
    /// Paused or suspended
    Paused,
    /// Anything else the provider reports
    #[serde(other)]
    Unknown,
}

impl VmStatus {
    /// Status as written by the provider.
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Paused => "paused",
            VmStatus::Unknown => "unknown",
        }
    }

    /// Parse a provider status string; unknown strings map to `Unknown`.
    pub fn parse(status: &str) -> Self {
        match status {
            "running" => VmStatus::Running,
            "stopped" => VmStatus::Stopped,
            "paused" | "suspended" => VmStatus::Paused,
            _ => VmStatus::Unknown,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A VM as seen in the cluster, identified by id and host.
///
/// Grouping and ownership come entirely from `tags`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHandle {
    /// Provider VM id
    pub vmid: u32,
    /// Host the VM lives on
    pub node: String,
    /// VM name
    #[serde(default)]
    pub name: String,
    /// Last observed power state
    pub status: VmStatus,
    /// Live tags
    pub tags: TagSet,
}

/// Live configuration of a VM, as flat key/value strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig(pub BTreeMap<String, String>);

impl VmConfig {
    /// Get a config value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether the config is held by a lock (e.g. mid-creation).
    pub fn is_locked(&self) -> bool {
        self.0.contains_key("lock")
    }

    /// Values of every `hostpciN` entry.
    pub fn hostpci_values(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(key, _)| key.starts_with("hostpci"))
            .map(|(_, value)| value.as_str())
    }
}

/// One guest network interface reported by the guest agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestInterface {
    /// Interface name inside the guest (e.g. `eth0`)
    pub name: String,
    /// IPv4 addresses on the interface
    pub ipv4_addresses: Vec<Ipv4Addr>,
}

/// What an address is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressPurpose {
    /// Inside the lab access subnet
    Access,
    /// Anything else (storage data plane)
    Data,
}

/// A classified guest IPv4 address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddressInfo {
    /// Guest interface name
    pub name: String,
    /// Address
    pub ipv4: Ipv4Addr,
    /// Access or data
    pub purpose: AddressPurpose,
}

/// A volume on a storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageVolume {
    /// Volume id (`<storage>:<vmid>/<file>`)
    pub volid: String,
    /// Format (`raw`, `qcow2`, ...)
    #[serde(default)]
    pub format: String,
    /// Size in bytes
    #[serde(default)]
    pub size: u64,
}

// =============================================================================
// Polling
// =============================================================================

/// Fixed-interval polling settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Sleep between attempts
    pub interval: Duration,
    /// Overall budget; attempts = timeout / interval
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        }
    }
}

impl PollConfig {
    /// Create a poll config.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Number of probes to make. A zero interval or timeout means one probe.
    pub fn attempts(&self) -> u32 {
        if self.interval.is_zero() || self.timeout.is_zero() {
            return 1;
        }
        let attempts = self.timeout.as_nanos() / self.interval.as_nanos();
        u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Outcome for one VM of a freshly created allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmReport {
    /// Provider VM id
    pub vmid: u32,
    /// Full VM name
    pub name: String,
    /// Power state observed at the end of the wait
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<VmStatus>,
    /// Addresses discovered through the guest agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<Vec<IpAddressInfo>>,
    /// Seconds spent starting and waiting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<f64>,
    /// Start/wait failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VmReport {
    /// Report for a VM that was created but not started.
    pub fn created(vmid: u32, name: impl Into<String>) -> Self {
        Self {
            vmid,
            name: name.into(),
            status: None,
            ip_address: None,
            elapsed_time: None,
            error: None,
        }
    }
}

/// A machine that could not be provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineFailure {
    /// Full VM name that was being created
    pub name: String,
    /// Provider VM id, if one was obtained before the failure
    pub vmid: Option<u32>,
    /// Error message
    pub error: String,
}

/// Result of creating an allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationReport {
    /// Short random id tagged on every member
    pub allocation_id: String,
    /// Descriptor the allocation was created from
    pub descriptor: String,
    /// Host the VMs were created on
    pub host: String,
    /// When creation started
    pub created_at: DateTime<Utc>,
    /// One entry per created VM, keyed by vmid (not by position)
    pub servers: Vec<VmReport>,
    /// Machines whose provisioning failed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<MachineFailure>,
}

impl AllocationReport {
    /// Look up the report for a VM.
    pub fn server(&self, vmid: u32) -> Option<&VmReport> {
        self.servers.iter().find(|s| s.vmid == vmid)
    }

    /// Whether every machine was provisioned and started without error.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.servers.iter().all(|s| s.error.is_none())
    }
}

/// Result of tearing down the VMs matching a tag query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownSummary {
    /// VMs fully removed
    pub removed: Vec<u32>,
    /// VMs whose teardown failed, with the error
    pub failed: Vec<(u32, String)>,
}

impl TeardownSummary {
    /// Whether every matched VM was removed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Total number of VMs processed.
    pub fn total(&self) -> usize {
        self.removed.len() + self.failed.len()
    }
}

/// A VM listed under its allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationMember {
    /// Provider VM id
    pub vmid: u32,
    /// Host
    pub node: String,
    /// VM name tag
    pub name: Option<String>,
    /// Role tag
    pub role: Option<Role>,
    /// Power state
    pub status: VmStatus,
    /// Encoded tags
    pub tags: String,
}

/// A host entry of a cluster inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryHost {
    /// VM name tag
    pub name: String,
    /// Provider VM id
    pub vmid: u32,
    /// Host the VM lives on
    pub node: String,
    /// First address in the access subnet
    pub access_ip: Option<Ipv4Addr>,
    /// Every data-plane address, in discovery order
    pub data_ips: Vec<Ipv4Addr>,
    /// Tags after enrichment
    pub tags: String,
}

/// Allocation members grouped for cluster deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInventory {
    /// Allocation the inventory was built from
    pub allocation_id: String,
    /// Cluster id stamped on every member
    pub cluster_id: String,
    /// Version stamped on targets, if any
    pub version: Option<String>,
    /// Target servers
    pub targets: Vec<InventoryHost>,
    /// Initiators
    pub initiators: Vec<InventoryHost>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_attempts() {
        let config = PollConfig::new(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(config.attempts(), 12);
        assert_eq!(
            PollConfig::new(Duration::ZERO, Duration::from_secs(60)).attempts(),
            1
        );
        assert_eq!(
            PollConfig::new(Duration::from_secs(10), Duration::from_secs(5)).attempts(),
            1
        );
    }

    #[test]
    fn test_device_class_codes() {
        assert_eq!(DeviceClass::Network.class_code(), "0x020000");
        assert_eq!(DeviceClass::Storage.class_code(), "0x010802");
        assert_eq!("storage".parse::<DeviceClass>().unwrap(), DeviceClass::Storage);
        assert!("gpu".parse::<DeviceClass>().is_err());
    }

    #[test]
    fn test_virtual_function_detection() {
        let vf = PciDevice {
            id: "0000:41:02.1".into(),
            class: "0x020000".into(),
            device_name: "Ethernet Adaptive Virtual Function".into(),
            vendor_name: "Intel Corporation".into(),
        };
        assert!(vf.is_virtual_function());
        assert!(vf.is_class(DeviceClass::Network));
        assert!(!vf.is_class(DeviceClass::Storage));
    }

    #[test]
    fn test_vm_config_hostpci_and_lock() {
        let mut config = VmConfig::default();
        config.0.insert("hostpci0".into(), "0000:41:02.1,pcie=0".into());
        config.0.insert("hostpci1".into(), "0000:82:00.0,pcie=0".into());
        config.0.insert("net0".into(), "virtio,bridge=vmbr0".into());
        assert_eq!(config.hostpci_values().count(), 2);
        assert!(!config.is_locked());

        config.0.insert("lock".into(), "create".into());
        assert!(config.is_locked());
    }

    #[test]
    fn test_machine_type_from_toml() {
        let profile: MachineTypeProfile = toml::from_str(
            r#"
            os_image = "rocky-9"
            cores = 4
            base_memory = "16GB"
            networks = [
                { type = "bridge", name = "net0", bridge = "vmbr0" },
                { type = "passthrough" },
            ]
            ssds = { type = "emulated", count = 2, size = "12GB" }
            "#,
        )
        .unwrap();
        assert_eq!(profile.cores, 4);
        assert_eq!(profile.networks.len(), 2);
        assert_eq!(profile.ssds.as_ref().map(SsdLayout::count), Some(2));
    }

    #[test]
    fn test_vm_status_parse() {
        assert_eq!(VmStatus::parse("running"), VmStatus::Running);
        assert_eq!(VmStatus::parse("prelaunch"), VmStatus::Unknown);
    }
}
