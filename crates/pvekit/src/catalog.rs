//! Source of allocation descriptors and machine type profiles.
//!
//! [`StaticCatalog`] is loaded from a TOML file:
//!
//! ```toml
//! [machine_types.small]
//! os_image = "rocky-9"
//! cores = 4
//! base_memory = "16GB"
//! networks = [{ type = "bridge", name = "net0", bridge = "vmbr0" }]
//! ssds = { type = "emulated", count = 2, size = "12GB" }
//!
//! [[descriptors]]
//! name = "pair"
//! machines = [
//!     { name = "s00", role = "target", machine_type = "small" },
//!     { name = "s01", role = "target", machine_type = "small" },
//! ]
//! ```

use crate::error::{Error, Result};
use crate::types::{AllocationDescriptor, MachineTypeProfile};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Named descriptors and machine types.
pub trait Catalog: Send + Sync {
    /// Look up a descriptor by name.
    fn descriptor(&self, name: &str) -> Option<AllocationDescriptor>;

    /// Look up a machine type by name.
    fn machine_type(&self, name: &str) -> Option<MachineTypeProfile>;

    /// Every descriptor, sorted by name.
    fn descriptors(&self) -> Vec<AllocationDescriptor>;

    /// Every machine type, sorted by name.
    fn machine_types(&self) -> Vec<MachineTypeProfile>;
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    machine_types: BTreeMap<String, MachineTypeProfile>,
    #[serde(default)]
    descriptors: Vec<AllocationDescriptor>,
}

/// In-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    descriptors: BTreeMap<String, AllocationDescriptor>,
    machine_types: BTreeMap<String, MachineTypeProfile>,
}

impl StaticCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a catalog from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)?;
        let mut catalog = Self::new();
        for (name, mut profile) in file.machine_types {
            profile.name = name;
            catalog = catalog.with_machine_type(profile);
        }
        for descriptor in file.descriptors {
            catalog = catalog.with_descriptor(descriptor);
        }
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a catalog file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Builder: add or replace a descriptor.
    pub fn with_descriptor(mut self, descriptor: AllocationDescriptor) -> Self {
        self.descriptors.insert(descriptor.name.clone(), descriptor);
        self
    }

    /// Builder: add or replace a machine type.
    pub fn with_machine_type(mut self, profile: MachineTypeProfile) -> Self {
        self.machine_types.insert(profile.name.clone(), profile);
        self
    }

    /// Check that every descriptor names unique machines of known types.
    pub fn validate(&self) -> Result<()> {
        for descriptor in self.descriptors.values() {
            let mut seen = HashSet::new();
            for machine in &descriptor.machines {
                if !seen.insert(machine.name.as_str()) {
                    return Err(Error::validation(format!(
                        "descriptor '{}' lists machine '{}' twice",
                        descriptor.name, machine.name
                    )));
                }
                if !self.machine_types.contains_key(&machine.machine_type) {
                    return Err(Error::validation(format!(
                        "descriptor '{}' uses unknown machine type '{}'",
                        descriptor.name, machine.machine_type
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Catalog for StaticCatalog {
    fn descriptor(&self, name: &str) -> Option<AllocationDescriptor> {
        self.descriptors.get(name).cloned()
    }

    fn machine_type(&self, name: &str) -> Option<MachineTypeProfile> {
        self.machine_types.get(name).cloned()
    }

    fn descriptors(&self) -> Vec<AllocationDescriptor> {
        self.descriptors.values().cloned().collect()
    }

    fn machine_types(&self) -> Vec<MachineTypeProfile> {
        self.machine_types.values().cloned().collect()
    }
}
