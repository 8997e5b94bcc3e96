use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lbprox")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Allocate tagged groups of VMs on Proxmox VE", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: ~/.config/lbprox/config.toml)
    #[arg(long, global = true, env = "LBPROX_CONFIG")]
    pub config: Option<PathBuf>,

    /// API user, without the `@pam` realm
    #[arg(long, global = true, env = "LBPROX_USERNAME")]
    pub username: Option<String>,

    /// API password
    #[arg(long, global = true, env = "LBPROX_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create, list and tear down allocations
    #[command(subcommand)]
    Allocations(AllocationsCommand),

    /// Inspect host PCI devices and manage emulated disks
    #[command(subcommand)]
    Nodes(NodesCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

// ============================================================================
// Allocations
// ============================================================================

#[derive(Subcommand)]
pub enum AllocationsCommand {
    /// Create every machine of a descriptor on one host
    Create {
        /// Host to create the VMs on
        host: String,

        /// Descriptor name
        #[arg(short, long)]
        name: String,

        /// Storage for disks and cloud-init snippets (default: config storage_id)
        #[arg(short, long)]
        storage: Option<String>,

        /// Extra tag as key.value (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Leave the VMs stopped
        #[arg(long)]
        no_start: bool,

        /// Do not wait for guest addresses after start
        #[arg(long)]
        no_wait_for_ip: bool,

        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },

    /// Stop and remove every VM matching an allocation or tag query
    Delete {
        /// Allocation id
        #[arg(short, long, conflicts_with = "tags", required_unless_present = "tags")]
        allocation: Option<String>,

        /// Tag query, e.g. "allocation.b178;role.target"
        #[arg(short, long)]
        tags: Option<String>,

        /// Storage holding disks and snippets (default: config storage_id)
        #[arg(short, long)]
        storage: Option<String>,

        /// Only delete VMs on this host
        #[arg(long)]
        host: Option<String>,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// List tagged VMs grouped by allocation
    List {
        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },

    /// List allocation descriptors from the catalog
    Descriptors {
        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },

    /// List machine types (flavors) from the catalog
    Flavors {
        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },

    /// Stamp a cluster id onto an allocation and print its inventory
    AssignCluster {
        /// Allocation id
        #[arg(short, long)]
        allocation: String,

        /// Software version tag for the targets
        #[arg(long = "cluster-version", id = "cluster_version")]
        version: Option<String>,

        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },
}

// ============================================================================
// Nodes
// ============================================================================

#[derive(Clone, Copy, ValueEnum)]
pub enum DeviceClassArg {
    Network,
    Storage,
}

impl From<DeviceClassArg> for pvekit::DeviceClass {
    fn from(arg: DeviceClassArg) -> Self {
        match arg {
            DeviceClassArg::Network => Self::Network,
            DeviceClassArg::Storage => Self::Storage,
        }
    }
}

#[derive(Subcommand)]
pub enum NodesCommand {
    /// List PCI devices on a host
    Pci {
        host: String,

        /// Only devices of this class
        #[arg(long, value_enum)]
        class: Option<DeviceClassArg>,

        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },

    /// List network virtual functions on a host
    Vfs {
        host: String,

        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },

    /// List devices not attached to any VM
    Unattached {
        host: String,

        #[arg(long, value_enum)]
        class: DeviceClassArg,

        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },

    /// Manage emulated NVMe disks of a VM
    #[command(subcommand)]
    Disks(DisksCommand),
}

#[derive(Subcommand)]
pub enum DisksCommand {
    /// Create raw disk images for a VM (existing ones are kept)
    Create {
        host: String,
        vmid: u32,

        /// Number of disks
        #[arg(short, long, default_value_t = 1)]
        count: usize,

        /// Size per disk, e.g. 12GB
        #[arg(long)]
        size: String,

        /// Storage for the images (default: config storage_id)
        #[arg(short, long)]
        storage: Option<String>,
    },

    /// Delete every raw disk image of a VM
    Delete {
        host: String,
        vmid: u32,

        /// Storage holding the images (default: config storage_id)
        #[arg(short, long)]
        storage: Option<String>,
    },
}
