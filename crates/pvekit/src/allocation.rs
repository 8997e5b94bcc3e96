//! Allocation create, teardown and inventory.
//!
//! An allocation has no record of its own: it is the set of VMs whose tags
//! share one `allocation` value. [`Allocator::create`] stamps those tags,
//! [`Allocator::delete`] and [`Allocator::list_allocations`] find VMs by
//! them, and [`Allocator::assign_cluster`] enriches them in place with a
//! read-modify-write that is not guarded against concurrent writers.

use crate::catalog::Catalog;
use crate::cloud_init;
use crate::context::{Context, DEFAULT_STORAGE};
use crate::devices;
use crate::error::{Error, Result};
use crate::pipeline::{self, MachinePlan, Pipeline, ProvisionFailure};
use crate::pool;
use crate::poll::{wait_for_addresses, wait_for_status};
use crate::size::parse_size_kib;
use crate::tags::{Role, TagSet};
use crate::types::{
    AddressPurpose, AllocationMember, AllocationReport, ClusterInventory, DeviceClass,
    InventoryHost, IpAddressInfo, MachineFailure, PciDevice, TeardownSummary, VmHandle, VmReport,
    VmStatus,
};
use chrono::Utc;
use ipnet::Ipv4Net;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

const ALLOCATION_ID_LEN: usize = 4;

/// Options for [`Allocator::create`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Storage for disks and cloud-init snippets
    pub storage: String,
    /// Extra tags stamped on every VM
    pub tags: TagSet,
    /// Start the VMs after creation
    pub start: bool,
    /// Wait for guest addresses after starting
    pub wait_for_ip: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            storage: DEFAULT_STORAGE.to_string(),
            tags: TagSet::new(),
            start: true,
            wait_for_ip: true,
        }
    }
}

/// Short random id shared by every member of an allocation.
pub fn new_allocation_id() -> String {
    Uuid::new_v4().simple().to_string()[..ALLOCATION_ID_LEN].to_string()
}

/// Entry point for allocation operations.
pub struct Allocator {
    ctx: Context,
    catalog: Arc<dyn Catalog>,
}

impl Allocator {
    /// Create an allocator.
    pub fn new(ctx: Context, catalog: Arc<dyn Catalog>) -> Self {
        Self { ctx, catalog }
    }

    /// The context operations run with.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// The descriptor and machine type source.
    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    /// Create every machine of a descriptor on `host`.
    ///
    /// Returns `Ok(None)` if the descriptor is unknown. Machines are created
    /// one after another in descriptor order; starting and waiting for them
    /// runs on the worker pool. A machine that fails to provision is listed
    /// in the report's `failures` and does not stop the others, except for a
    /// device conflict. That is returned as an error naming the allocation id,
    /// so the partial allocation can be torn down before the call is retried.
    pub fn create(
        &self,
        descriptor_name: &str,
        host: &str,
        options: &CreateOptions,
    ) -> Result<Option<AllocationReport>> {
        let Some(descriptor) = self.catalog.descriptor(descriptor_name) else {
            log::warn!("unknown allocation descriptor '{descriptor_name}'");
            return Ok(None);
        };

        let allocation_id = new_allocation_id();
        let created_at = Utc::now();
        log::info!(
            "creating allocation {allocation_id} from '{}' on {host} ({} machine(s))",
            descriptor.name,
            descriptor.machines.len()
        );

        let plans = descriptor
            .machines
            .iter()
            .map(|spec| {
                let profile = self.catalog.machine_type(&spec.machine_type).ok_or_else(|| {
                    Error::NotFound {
                        what: format!("machine type '{}'", spec.machine_type),
                    }
                })?;
                MachinePlan::new(host, &allocation_id, spec, profile, &options.tags)
            })
            .collect::<Result<Vec<_>>>()?;

        let pipeline = Pipeline::new(&self.ctx, host, &options.storage);
        let mut servers = Vec::new();
        let mut failures = Vec::new();

        for plan in &plans {
            match pipeline.provision(plan) {
                Ok(vmid) => servers.push(VmReport::created(vmid, &plan.vm_name)),
                Err(ProvisionFailure {
                    error: Error::Conflict { message },
                    ..
                }) => {
                    log::error!(
                        "allocation {allocation_id} left partially created; \
                         delete allocation.{allocation_id} before retrying"
                    );
                    return Err(Error::Conflict {
                        message: format!("allocation {allocation_id}: {message}"),
                    });
                }
                Err(failure) => failures.push(MachineFailure {
                    name: plan.vm_name.clone(),
                    vmid: failure.vmid,
                    error: failure.error.to_string(),
                }),
            }
        }

        if options.start && !servers.is_empty() {
            let access = if options.wait_for_ip {
                self.ctx.access_network(host)
            } else {
                None
            };
            let started = pool::run(&servers, self.ctx.settings.workers, |server| {
                Ok(self.start_and_wait(host, server, options.wait_for_ip, access.as_ref()))
            })?;
            for report in started {
                if let Some(slot) = servers.iter_mut().find(|s| s.vmid == report.vmid) {
                    *slot = report;
                }
            }
        }

        Ok(Some(AllocationReport {
            allocation_id,
            descriptor: descriptor.name,
            host: host.to_string(),
            created_at,
            servers,
            failures,
        }))
    }

    /// Start one VM and wait for it to run and, optionally, get addresses.
    /// Failures are recorded in the returned report.
    fn start_and_wait(
        &self,
        host: &str,
        server: &VmReport,
        wait_for_ip: bool,
        access: Option<&Ipv4Net>,
    ) -> VmReport {
        let started = Instant::now();
        let mut report = server.clone();

        if let Err(e) = self.start_vm(host, &mut report, wait_for_ip, access) {
            log::error!("failed to start {} ({}): {e}", server.name, server.vmid);
            report.error = Some(e.to_string());
        }
        report.elapsed_time = Some(started.elapsed().as_secs_f64());
        report
    }

    fn start_vm(
        &self,
        host: &str,
        report: &mut VmReport,
        wait_for_ip: bool,
        access: Option<&Ipv4Net>,
    ) -> Result<()> {
        let settings = &self.ctx.settings;
        let provider = self.ctx.provider.as_ref();

        provider.start_vm(host, report.vmid)?;
        let running = VmStatus::Running;
        report.status =
            wait_for_status(provider, host, report.vmid, running, &settings.status_poll)?
                .into_inner();

        if wait_for_ip {
            report.ip_address = wait_for_addresses(
                provider,
                host,
                report.vmid,
                access,
                settings.expected_addresses,
                &settings.address_poll,
            )?
            .into_inner();
        }
        Ok(())
    }

    /// Tear down every VM whose tags contain `query`, optionally only on
    /// `host`.
    ///
    /// Each VM is stopped, its raw disks and VM are deleted and its
    /// cloud-init snippets removed. One VM failing does not stop the others;
    /// failures are logged and listed in the summary.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty query, which would match
    /// every VM in the cluster.
    pub fn delete(
        &self,
        query: &TagSet,
        host: Option<&str>,
        storage: &str,
    ) -> Result<TeardownSummary> {
        if query.is_empty() {
            return Err(Error::validation("refusing to delete with an empty tag query"));
        }

        let vms: Vec<VmHandle> = self
            .ctx
            .provider
            .cluster_vms()?
            .into_iter()
            .filter(|vm| query.is_subset(&vm.tags))
            .filter(|vm| host.is_none_or(|h| vm.node == h))
            .collect();
        log::info!("tearing down {} VM(s) matching '{query}'", vms.len());

        let outcomes = pool::run(&vms, self.ctx.settings.workers, |vm| {
            Ok((vm.vmid, self.teardown(vm, storage)))
        })?;

        let mut summary = TeardownSummary::default();
        for (vmid, outcome) in outcomes {
            match outcome {
                Ok(()) => summary.removed.push(vmid),
                Err(e) => {
                    log::error!("failed to tear down VM {vmid}: {e}");
                    summary.failed.push((vmid, e.to_string()));
                }
            }
        }
        summary.removed.sort_unstable();
        summary.failed.sort_unstable();
        Ok(summary)
    }

    fn teardown(&self, vm: &VmHandle, storage: &str) -> Result<()> {
        let provider = self.ctx.provider.as_ref();
        let settings = &self.ctx.settings;

        provider.stop_vm(&vm.node, vm.vmid, settings.stop_timeout)?;
        let stopped = wait_for_status(
            provider,
            &vm.node,
            vm.vmid,
            VmStatus::Stopped,
            &settings.status_poll,
        )?;
        if !stopped.is_ready() {
            return Err(Error::Transient {
                message: format!("VM {} did not stop", vm.vmid),
            });
        }

        let disks = pipeline::delete_emulated_disks(&self.ctx, &vm.node, storage, vm.vmid)?;
        provider.delete_vm(&vm.node, vm.vmid)?;
        cloud_init::cleanup(&self.ctx, &vm.node, storage, vm.vmid);

        log::debug!("removed VM {} ({}) and {disks} disk(s)", vm.vmid, vm.name);
        Ok(())
    }

    /// Free devices of `class` on `host`.
    pub fn find_unattached(&self, host: &str, class: DeviceClass) -> Result<Vec<PciDevice>> {
        devices::find_unattached(&self.ctx, host, class)
    }

    /// Every tagged VM in the cluster, grouped by allocation id.
    pub fn list_allocations(&self) -> Result<BTreeMap<String, Vec<AllocationMember>>> {
        let mut allocations: BTreeMap<String, Vec<AllocationMember>> = BTreeMap::new();
        for vm in self.ctx.provider.cluster_vms()? {
            let Some(allocation) = vm.tags.allocation() else {
                continue;
            };
            allocations
                .entry(allocation.to_string())
                .or_default()
                .push(AllocationMember {
                    vmid: vm.vmid,
                    node: vm.node.clone(),
                    name: vm.tags.vm_name().map(str::to_string),
                    role: vm.tags.role(),
                    status: vm.status,
                    tags: vm.tags.encode(),
                });
        }
        for members in allocations.values_mut() {
            members.sort_by_key(|m| m.vmid);
        }
        Ok(allocations)
    }

    /// Stamp a cluster id (and version on targets) on every member of an
    /// allocation and collect their addresses.
    ///
    /// An existing cluster id on any target is reused; otherwise a new one is
    /// generated. Tags are only written back when they change.
    pub fn assign_cluster(
        &self,
        allocation_id: &str,
        version: Option<&str>,
    ) -> Result<ClusterInventory> {
        let query = TagSet::new().with_allocation(allocation_id);
        let members: Vec<VmHandle> = self
            .ctx
            .provider
            .cluster_vms()?
            .into_iter()
            .filter(|vm| query.is_subset(&vm.tags) && vm.tags.role().is_some())
            .collect();
        if members.is_empty() {
            return Err(Error::NotFound {
                what: format!("allocation '{allocation_id}'"),
            });
        }

        let cluster_id = members
            .iter()
            .filter(|vm| vm.tags.role() == Some(Role::Target))
            .find_map(|vm| vm.tags.cluster_id().filter(|c| !c.is_empty()).map(str::to_string))
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        log::info!("allocation {allocation_id}: cluster id {cluster_id}");

        let mut updated = Vec::with_capacity(members.len());
        for vm in members {
            let mut tags = vm.tags.clone().with_cluster_id(&cluster_id);
            if let (Some(version), Some(Role::Target)) = (version, vm.tags.role()) {
                tags = tags.with_version(version);
            }
            tags.validate()?;
            if tags != vm.tags {
                self.ctx
                    .provider
                    .update_config(&vm.node, vm.vmid, &[("tags".to_string(), tags.encode())])?;
                log::debug!("updated tags of VM {}: {tags}", vm.vmid);
            }
            updated.push(VmHandle { tags, ..vm });
        }

        let settings = &self.ctx.settings;
        let addresses = pool::run(&updated, settings.workers, |vm| {
            let access = self.ctx.access_network(&vm.node);
            let found = wait_for_addresses(
                self.ctx.provider.as_ref(),
                &vm.node,
                vm.vmid,
                access.as_ref(),
                settings.expected_addresses,
                &settings.address_poll,
            )?;
            Ok((vm.vmid, found.into_inner().unwrap_or_default()))
        })?;
        let addresses: BTreeMap<u32, Vec<IpAddressInfo>> = addresses.into_iter().collect();

        let mut inventory = ClusterInventory {
            allocation_id: allocation_id.to_string(),
            cluster_id,
            version: version.map(str::to_string),
            targets: Vec::new(),
            initiators: Vec::new(),
        };
        for vm in &updated {
            let found = addresses.get(&vm.vmid).map(Vec::as_slice).unwrap_or_default();
            let host = inventory_host(vm, found);
            match vm.tags.role() {
                Some(Role::Target) => inventory.targets.push(host),
                Some(Role::Initiator) => inventory.initiators.push(host),
                None => {}
            }
        }
        inventory.targets.sort_by(|a, b| a.name.cmp(&b.name));
        inventory.initiators.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(inventory)
    }

    /// Create `count` raw disks of `size` (e.g. `"12GB"`) for a VM.
    pub fn create_emulated_disks(
        &self,
        host: &str,
        storage: &str,
        vmid: u32,
        count: usize,
        size: &str,
    ) -> Result<Vec<String>> {
        let size_kib = parse_size_kib(size)?;
        pipeline::create_emulated_disks(&self.ctx, host, storage, vmid, count, size_kib)
    }

    /// Delete every raw disk of a VM.
    pub fn delete_emulated_disks(&self, host: &str, storage: &str, vmid: u32) -> Result<usize> {
        pipeline::delete_emulated_disks(&self.ctx, host, storage, vmid)
    }
}

fn inventory_host(vm: &VmHandle, addresses: &[IpAddressInfo]) -> InventoryHost {
    InventoryHost {
        name: vm.tags.vm_name().unwrap_or(&vm.name).to_string(),
        vmid: vm.vmid,
        node: vm.node.clone(),
        access_ip: addresses
            .iter()
            .find(|a| a.purpose == AddressPurpose::Access)
            .map(|a| a.ipv4),
        data_ips: addresses
            .iter()
            .filter(|a| a.purpose == AddressPurpose::Data)
            .map(|a| a.ipv4)
            .collect(),
        tags: vm.tags.encode(),
    }
}
