//! `lbprox nodes` commands.

use anyhow::Result;
use pvekit::{PciDevice, scanner};
use std::collections::HashSet;

use super::{Session, connect, print_json};
use crate::Context;
use crate::cli::{DisksCommand, NodesCommand, OutputFormat};
use crate::ui;

pub fn run(ctx: &Context, cmd: NodesCommand) -> Result<()> {
    let session = connect(ctx)?;
    let pve = session.pve();

    match cmd {
        NodesCommand::Pci {
            host,
            class,
            output,
        } => {
            let devices = scanner::list_devices(pve, &host, class.map(Into::into))?;
            let attached: HashSet<String> = scanner::list_attached(pve, &host)?
                .into_iter()
                .map(|d| d.id)
                .collect();
            show_devices(&devices, Some(&attached), output)
        }
        NodesCommand::Vfs { host, output } => {
            show_devices(&scanner::network_vfs(pve, &host)?, None, output)
        }
        NodesCommand::Unattached {
            host,
            class,
            output,
        } => {
            let devices = session.allocator.find_unattached(&host, class.into())?;
            show_devices(&devices, None, output)
        }
        NodesCommand::Disks(cmd) => disks(&session, cmd),
    }
}

fn disks(session: &Session, cmd: DisksCommand) -> Result<()> {
    match cmd {
        DisksCommand::Create {
            host,
            vmid,
            count,
            size,
            storage,
        } => {
            let storage = session.storage(storage);
            let volumes = session
                .allocator
                .create_emulated_disks(&host, &storage, vmid, count, &size)?;
            if volumes.is_empty() {
                ui::info(&format!("VM {vmid} already has {count} disk(s)"));
            }
            for volid in &volumes {
                ui::success(&format!("Created {volid}"));
            }
            Ok(())
        }
        DisksCommand::Delete {
            host,
            vmid,
            storage,
        } => {
            let storage = session.storage(storage);
            let removed = session.allocator.delete_emulated_disks(&host, &storage, vmid)?;
            ui::success(&format!("Removed {removed} disk(s) of VM {vmid}"));
            Ok(())
        }
    }
}

fn show_devices(
    devices: &[PciDevice],
    attached: Option<&HashSet<String>>,
    output: OutputFormat,
) -> Result<()> {
    if let OutputFormat::Json = output {
        return print_json(devices);
    }
    if devices.is_empty() {
        ui::info("No devices");
        return Ok(());
    }
    let mut headers = vec!["ID", "CLASS", "VENDOR", "DEVICE"];
    if attached.is_some() {
        headers.push("ATTACHED");
    }
    ui::table(&headers, &device_rows(devices, attached));
    Ok(())
}

fn device_rows(devices: &[PciDevice], attached: Option<&HashSet<String>>) -> Vec<Vec<String>> {
    devices
        .iter()
        .map(|d| {
            let mut row = vec![
                d.id.clone(),
                d.class.clone(),
                d.vendor_name.clone(),
                d.device_name.clone(),
            ];
            if let Some(attached) = attached {
                row.push(if attached.contains(&d.id) { "yes" } else { "no" }.to_string());
            }
            row
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, name: &str) -> PciDevice {
        PciDevice {
            id: id.to_string(),
            class: "0x020000".to_string(),
            device_name: name.to_string(),
            vendor_name: "Mellanox Technologies".to_string(),
        }
    }

    #[test]
    fn test_device_rows_mark_attached() {
        let devices = vec![
            device("0000:3b:00.2", "ConnectX-5 Virtual Function"),
            device("0000:3b:00.3", "ConnectX-5 Virtual Function"),
        ];
        let attached: HashSet<String> = ["0000:3b:00.3".to_string()].into();

        let rows = device_rows(&devices, Some(&attached));
        assert_eq!(rows[0][4], "no");
        assert_eq!(rows[1][4], "yes");
        assert_eq!(rows[0][2], "Mellanox Technologies");
    }

    #[test]
    fn test_device_rows_without_attachment() {
        let rows = device_rows(&[device("0000:3b:00.2", "VF")], None);
        assert_eq!(rows, vec![vec!["0000:3b:00.2", "0x020000", "Mellanox Technologies", "VF"]]);
    }
}
