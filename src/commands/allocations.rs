//! `lbprox allocations` commands.

use anyhow::{Result, bail};
use colored::Colorize;
use pvekit::{
    AddressPurpose, AllocationMember, AllocationReport, Catalog, ClusterInventory, CreateOptions,
    InventoryHost, IpAddressInfo, NetworkSpec, SsdLayout, TagSet, VmReport,
};
use std::collections::BTreeMap;

use super::{Session, connect, load_catalog, load_config, parse_tags, print_json};
use crate::Context;
use crate::cli::{AllocationsCommand, OutputFormat};
use crate::{progress, ui};

pub fn run(ctx: &Context, cmd: AllocationsCommand) -> Result<()> {
    match cmd {
        AllocationsCommand::Create {
            host,
            name,
            storage,
            tags,
            no_start,
            no_wait_for_ip,
            output,
        } => {
            let session = connect(ctx)?;
            let options = CreateOptions {
                storage: session.storage(storage),
                tags: parse_tags(&tags)?,
                start: !no_start,
                wait_for_ip: !no_wait_for_ip,
            };
            create(ctx, &session, &host, &name, &options, output)
        }
        AllocationsCommand::Delete {
            allocation,
            tags,
            storage,
            host,
            yes,
        } => {
            let query = match (allocation, tags) {
                (Some(id), _) => TagSet::new().with_allocation(id),
                (None, Some(raw)) => parse_tags(&[raw])?,
                (None, None) => bail!("Give an allocation id (-a) or a tag query (-t)"),
            };
            let session = connect(ctx)?;
            let storage = session.storage(storage);
            delete(&session, &query, host.as_deref(), &storage, yes)
        }
        AllocationsCommand::List { output } => list(&connect(ctx)?, output),
        AllocationsCommand::Descriptors { output } => {
            let catalog = load_catalog(&load_config(ctx)?)?;
            descriptors(&catalog, output)
        }
        AllocationsCommand::Flavors { output } => {
            let catalog = load_catalog(&load_config(ctx)?)?;
            flavors(&catalog, output)
        }
        AllocationsCommand::AssignCluster {
            allocation,
            version,
            output,
        } => {
            let session = connect(ctx)?;
            let inventory = session
                .allocator
                .assign_cluster(&allocation, version.as_deref())?;
            match output {
                OutputFormat::Json => print_json(&inventory),
                OutputFormat::Table => {
                    show_inventory(&inventory);
                    Ok(())
                }
            }
        }
    }
}

// ============================================================================
// Create / Delete
// ============================================================================

fn create(
    ctx: &Context,
    session: &Session,
    host: &str,
    name: &str,
    options: &CreateOptions,
    output: OutputFormat,
) -> Result<()> {
    let pb = progress::spinner(&format!("Creating '{name}' on {host}"), ctx.quiet);
    let report = match session.allocator.create(name, host, options) {
        Ok(Some(report)) => report,
        Ok(None) => {
            progress::finish_error(&pb, &format!("Unknown descriptor '{name}'"));
            bail!(
                "Descriptor '{name}' is not in the catalog (see `lbprox allocations descriptors`)"
            );
        }
        Err(e) => {
            progress::finish_error(&pb, &format!("Failed to create '{name}'"));
            return Err(e.into());
        }
    };
    progress::finish_success(
        &pb,
        &format!("Allocation {} created on {host}", report.allocation_id),
    );

    match output {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => show_report(&report),
    }

    if !report.is_success() {
        bail!(
            "{} of {} machine(s) failed",
            report.failures.len() + report.servers.iter().filter(|s| s.error.is_some()).count(),
            report.servers.len() + report.failures.len()
        );
    }
    Ok(())
}

fn delete(
    session: &Session,
    query: &TagSet,
    host: Option<&str>,
    storage: &str,
    yes: bool,
) -> Result<()> {
    let scope = host.map_or_else(|| "all nodes".to_string(), |h| format!("node {h}"));
    if !yes {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!("Delete every VM tagged '{query}' on {scope}?"))
            .default(false)
            .interact()?;
        if !confirmed {
            ui::info("Cancelled");
            return Ok(());
        }
    }

    let summary = session.allocator.delete(query, host, storage)?;
    if summary.total() == 0 {
        ui::warn(&format!("No VMs match '{query}' on {scope}"));
        return Ok(());
    }
    for vmid in &summary.removed {
        ui::success(&format!("Removed VM {vmid}"));
    }
    for (vmid, error) in &summary.failed {
        ui::error(&format!("VM {vmid}: {error}"));
    }
    if !summary.is_success() {
        bail!("{} of {} VM(s) could not be removed", summary.failed.len(), summary.total());
    }
    Ok(())
}

fn show_report(report: &AllocationReport) {
    ui::header(&format!("Allocation {}", report.allocation_id));
    ui::kv("descriptor", &report.descriptor);
    ui::kv("host", &report.host);
    ui::kv("created", &report.created_at.to_rfc3339());
    if !report.servers.is_empty() {
        println!();
        ui::table(
            &["VMID", "NAME", "STATUS", "ADDRESSES", "ELAPSED", "ERROR"],
            &server_rows(report),
        );
    }
    for failure in &report.failures {
        ui::error(&format!(
            "{} (vmid {}): {}",
            failure.name,
            ui::or_dash(failure.vmid),
            failure.error
        ));
    }
}

fn server_rows(report: &AllocationReport) -> Vec<Vec<String>> {
    report.servers.iter().map(server_row).collect()
}

fn server_row(server: &VmReport) -> Vec<String> {
    vec![
        server.vmid.to_string(),
        server.name.clone(),
        ui::or_dash(server.status),
        server
            .ip_address
            .as_deref()
            .map_or_else(|| "-".to_string(), format_addresses),
        ui::or_dash(server.elapsed_time.map(|t| format!("{t:.1}s"))),
        server.error.clone().unwrap_or_default(),
    ]
}

fn format_addresses(addresses: &[IpAddressInfo]) -> String {
    if addresses.is_empty() {
        return "-".to_string();
    }
    addresses
        .iter()
        .map(|a| match a.purpose {
            AddressPurpose::Access => format!("{} (access)", a.ipv4),
            AddressPurpose::Data => a.ipv4.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// List / Catalog
// ============================================================================

fn list(session: &Session, output: OutputFormat) -> Result<()> {
    let allocations = session.allocator.list_allocations()?;
    if let OutputFormat::Json = output {
        return print_json(&allocations);
    }
    if allocations.is_empty() {
        ui::info("No allocations");
        return Ok(());
    }
    for (id, members) in &allocations {
        ui::section(&format!("{id} ({} VM(s))", members.len()));
        ui::table(&["VMID", "NODE", "NAME", "ROLE", "STATUS"], &member_rows(members));
    }
    Ok(())
}

fn member_rows(members: &[AllocationMember]) -> Vec<Vec<String>> {
    members
        .iter()
        .map(|m| {
            vec![
                m.vmid.to_string(),
                m.node.clone(),
                ui::or_dash(m.name.as_deref()),
                ui::or_dash(m.role),
                m.status.to_string(),
            ]
        })
        .collect()
}

fn descriptors(catalog: &dyn Catalog, output: OutputFormat) -> Result<()> {
    let descriptors = catalog.descriptors();
    if let OutputFormat::Json = output {
        return print_json(&descriptors);
    }
    if descriptors.is_empty() {
        ui::warn("No descriptors. Set `catalog` in the config file.");
        return Ok(());
    }
    for descriptor in &descriptors {
        ui::section(&descriptor.name);
        if !descriptor.description.is_empty() {
            ui::dim(&descriptor.description);
        }
        let rows: Vec<Vec<String>> = descriptor
            .machines
            .iter()
            .map(|m| vec![m.name.clone(), m.role.to_string(), m.machine_type.clone()])
            .collect();
        ui::table(&["MACHINE", "ROLE", "TYPE"], &rows);
    }
    Ok(())
}

fn flavors(catalog: &dyn Catalog, output: OutputFormat) -> Result<()> {
    let profiles = catalog.machine_types();
    if let OutputFormat::Json = output {
        let by_name: BTreeMap<&str, _> = profiles.iter().map(|p| (p.name.as_str(), p)).collect();
        return print_json(&by_name);
    }
    if profiles.is_empty() {
        ui::warn("No machine types. Set `catalog` in the config file.");
        return Ok(());
    }
    let rows: Vec<Vec<String>> = profiles
        .iter()
        .map(|p| {
            vec![
                p.name.clone(),
                p.cores.to_string(),
                p.base_memory.clone(),
                p.os_image.clone(),
                describe_networks(&p.networks),
                p.ssds.as_ref().map_or_else(|| "-".to_string(), describe_ssds),
            ]
        })
        .collect();
    ui::table(&["NAME", "CORES", "MEMORY", "IMAGE", "NETWORKS", "SSDS"], &rows);
    Ok(())
}

fn describe_networks(networks: &[NetworkSpec]) -> String {
    if networks.is_empty() {
        return "-".to_string();
    }
    networks
        .iter()
        .map(|n| match n {
            NetworkSpec::Bridge { name, bridge } => format!("{name}@{bridge}"),
            NetworkSpec::Passthrough { .. } => "vf".to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_ssds(ssds: &SsdLayout) -> String {
    match ssds {
        SsdLayout::Emulated { count, size } => format!("{count} x {size} emulated"),
        SsdLayout::Passthrough { count } => format!("{count} x passthrough"),
    }
}

// ============================================================================
// Cluster inventory
// ============================================================================

fn show_inventory(inventory: &ClusterInventory) {
    ui::header(&format!("Allocation {}", inventory.allocation_id));
    ui::kv("cluster id", &inventory.cluster_id);
    ui::kv("version", &ui::or_dash(inventory.version.as_deref()));

    for (title, hosts) in [("Targets", &inventory.targets), ("Initiators", &inventory.initiators)] {
        ui::section(title);
        if hosts.is_empty() {
            ui::dim("none");
        } else {
            ui::table(&["NAME", "VMID", "NODE", "ACCESS", "DATA"], &inventory_rows(hosts));
        }
    }
    let unreachable = inventory
        .targets
        .iter()
        .chain(&inventory.initiators)
        .filter(|h| h.access_ip.is_none())
        .count();
    if unreachable > 0 {
        println!();
        println!(
            "{} {unreachable} VM(s) reported no access address",
            "⚠".yellow()
        );
    }
}

fn inventory_rows(hosts: &[InventoryHost]) -> Vec<Vec<String>> {
    hosts
        .iter()
        .map(|h| {
            let data = if h.data_ips.is_empty() {
                "-".to_string()
            } else {
                h.data_ips.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
            };
            vec![
                h.name.clone(),
                h.vmid.to_string(),
                h.node.clone(),
                ui::or_dash(h.access_ip),
                data,
            ]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvekit::{Role, VmStatus};

    fn address(ip: &str, purpose: AddressPurpose) -> IpAddressInfo {
        IpAddressInfo {
            name: "eth0".to_string(),
            ipv4: ip.parse().unwrap(),
            purpose,
        }
    }

    #[test]
    fn test_server_row() {
        let mut server = VmReport::created(101, "h1-b178-s00");
        server.status = Some(VmStatus::Running);
        server.elapsed_time = Some(12.345);
        server.ip_address = Some(vec![
            address("10.20.0.5", AddressPurpose::Access),
            address("192.168.7.5", AddressPurpose::Data),
        ]);

        assert_eq!(
            server_row(&server),
            vec![
                "101",
                "h1-b178-s00",
                "running",
                "10.20.0.5 (access), 192.168.7.5",
                "12.3s",
                ""
            ]
        );
    }

    #[test]
    fn test_server_row_without_start() {
        let server = VmReport::created(102, "h1-b178-s01");
        let row = server_row(&server);
        assert_eq!(row[2], "-");
        assert_eq!(row[3], "-");
        assert_eq!(row[4], "-");
    }

    #[test]
    fn test_member_rows() {
        let members = vec![AllocationMember {
            vmid: 101,
            node: "h1".to_string(),
            name: Some("h1-b178-s00".to_string()),
            role: Some(Role::Target),
            status: VmStatus::Stopped,
            tags: "node.h1;vm.h1-b178-s00;role.target;allocation.b178".to_string(),
        }];
        assert_eq!(
            member_rows(&members),
            vec![vec!["101", "h1", "h1-b178-s00", "target", "stopped"]]
        );
    }

    #[test]
    fn test_inventory_rows() {
        let hosts = vec![InventoryHost {
            name: "h1-b178-c00".to_string(),
            vmid: 103,
            node: "h1".to_string(),
            access_ip: None,
            data_ips: vec!["192.168.7.9".parse().unwrap(), "192.168.8.9".parse().unwrap()],
            tags: String::new(),
        }];
        assert_eq!(
            inventory_rows(&hosts),
            vec![vec!["h1-b178-c00", "103", "h1", "-", "192.168.7.9, 192.168.8.9"]]
        );
    }

    #[test]
    fn test_describe_profile_parts() {
        let networks = vec![
            NetworkSpec::Bridge {
                name: "net0".to_string(),
                bridge: "vmbr0".to_string(),
            },
            NetworkSpec::Passthrough {
                name: "data".to_string(),
            },
        ];
        assert_eq!(describe_networks(&networks), "net0@vmbr0, vf");
        assert_eq!(describe_networks(&[]), "-");
        assert_eq!(
            describe_ssds(&SsdLayout::Emulated {
                count: 2,
                size: "12GB".to_string()
            }),
            "2 x 12GB emulated"
        );
    }
}
