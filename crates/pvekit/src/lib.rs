//! # pvekit
//!
//! Allocate and tear down tagged groups of VMs on a Proxmox VE cluster.
//!
//! This crate provides functionality for:
//! - Creating every machine of an allocation descriptor on one host
//! - Passing through free network VFs and NVMe devices, or creating
//!   emulated NVMe disks
//! - Seeding cloud-init user-data
//! - Starting VMs concurrently and waiting for their addresses
//! - Tearing allocations down by tag query
//!
//! There is no database. Every VM carries its identity in its tags
//! (`node.h1;vm.h1-b178-s00;role.target;allocation.b178`), and an allocation
//! is simply the set of VMs sharing one `allocation` tag.
//!
//! ## Example
//!
//! ```no_run
//! use pvekit::backend::rest::{RestOptions, RestProvider};
//! use pvekit::backend::ssh::SshTransfer;
//! use pvekit::{Allocator, Context, CreateOptions, StaticCatalog, TagSet};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let provider = RestProvider::connect("pve01", &RestOptions::new("root", "secret")).unwrap();
//! let ctx = Context::new(Arc::new(provider), Arc::new(SshTransfer::new("root")));
//! let catalog = StaticCatalog::load(Path::new("catalog.toml")).unwrap();
//! let allocator = Allocator::new(ctx, Arc::new(catalog));
//!
//! if let Some(report) = allocator.create("pair", "pve01", &CreateOptions::default()).unwrap() {
//!     println!("allocation {}", report.allocation_id);
//!     allocator
//!         .delete(&TagSet::new().with_allocation(&report.allocation_id), None, "lb-local-storage")
//!         .unwrap();
//! }
//! ```
//!
//! ## Concurrency
//!
//! Creation is sequential; starting, address discovery and teardown fan out
//! on a bounded worker pool. Device allocation re-scans live VM configs
//! instead of reserving, so run one create per host at a time.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocation;
pub mod backend;
pub mod catalog;
pub mod cloud_init;
pub mod context;
pub mod devices;
pub mod error;
pub mod pipeline;
pub mod poll;
pub mod pool;
pub mod scanner;
pub mod size;
pub mod tags;
pub mod types;

pub use allocation::{Allocator, CreateOptions, new_allocation_id};
pub use backend::{FileTransfer, MockProvider, MockTransfer, Provider};
pub use catalog::{Catalog, StaticCatalog};
pub use context::{Context, DEFAULT_STORAGE, Settings};
pub use error::{Error, ErrorCategory, Result};
pub use poll::{PollOutcome, wait_until};
pub use size::parse_size;
pub use tags::{Role, TagKey, TagSet};
pub use types::{
    AddressPurpose, AllocationDescriptor, AllocationMember, AllocationReport, ClusterInventory,
    DeviceClass, InventoryHost, IpAddressInfo, MachineFailure, MachineSpec, MachineTypeProfile,
    NetworkSpec, PciDevice, PollConfig, SsdLayout, TeardownSummary, VmHandle, VmReport, VmStatus,
};
