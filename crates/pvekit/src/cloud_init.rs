//! Cloud-init user-data snippets.
//!
//! Each VM gets its own `user-vm-<vmid>.cfg` in the storage's `snippets`
//! directory, referenced from the VM's `cicustom` setting.

use crate::context::Context;
use crate::error::{Error, Result};
use serde::Serialize;

const HEADER: &str = "#cloud-config\n";
const SNIPPET_KINDS: [&str; 4] = ["user", "meta", "network", "vendor"];

/// The user-data document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserData {
    /// Guest hostname
    pub hostname: String,
    /// Fully qualified name; same as the hostname
    pub fqdn: String,
    /// Let cloud-init write `/etc/hosts`
    pub manage_etc_hosts: bool,
    /// Allow password login over ssh
    pub ssh_pwauth: bool,
    /// Keep root login enabled
    pub disable_root: bool,
    /// Keys for the default user
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,
}

impl UserData {
    /// User-data for a guest named `hostname`.
    pub fn new(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Self {
            fqdn: hostname.clone(),
            hostname,
            manage_etc_hosts: true,
            ssh_pwauth: true,
            disable_root: false,
            ssh_authorized_keys: Vec::new(),
        }
    }

    /// Builder: add authorized keys.
    pub fn with_keys(mut self, keys: &[String]) -> Self {
        self.ssh_authorized_keys.extend_from_slice(keys);
        self
    }

    /// Render as a `#cloud-config` YAML document.
    pub fn render(&self) -> Result<String> {
        Ok(format!("{HEADER}{}", serde_yaml::to_string(self)?))
    }
}

/// Path of a snippet on the host.
pub fn snippet_path(storage: &str, kind: &str, vmid: u32) -> String {
    format!("/mnt/pve/{storage}/snippets/{kind}-vm-{vmid}.cfg")
}

/// `cicustom` value pointing at the user-data snippet.
pub fn cicustom(storage: &str, vmid: u32) -> String {
    format!("user={storage}:snippets/user-vm-{vmid}.cfg")
}

/// Upload user-data for a VM and point its `cicustom` at it.
pub fn seed(ctx: &Context, host: &str, storage: &str, vmid: u32, hostname: &str) -> Result<()> {
    let document = UserData::new(hostname)
        .with_keys(&ctx.settings.ssh_authorized_keys)
        .render()?;
    let path = snippet_path(storage, "user", vmid);

    ctx.transfer.upload(host, &path, document.as_bytes())?;
    log::debug!("uploaded user-data for {vmid} to {host}:{path}");

    ctx.provider
        .update_config(host, vmid, &[("cicustom".to_string(), cicustom(storage, vmid))])
}

/// Remove every snippet of a VM. Missing files are fine; other failures are
/// logged and skipped.
pub fn cleanup(ctx: &Context, host: &str, storage: &str, vmid: u32) {
    for kind in SNIPPET_KINDS {
        let path = snippet_path(storage, kind, vmid);
        match ctx.transfer.remove(host, &path) {
            Ok(()) => log::debug!("removed {host}:{path}"),
            Err(Error::NotFound { .. }) => {}
            Err(e) => log::warn!("failed to remove {host}:{path}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockProvider, MockTransfer};
    use crate::context::Settings;
    use std::sync::Arc;

    #[test]
    fn test_render_user_data() {
        let rendered = UserData::new("h1-b178-s00").render().unwrap();
        assert!(rendered.starts_with("#cloud-config\n"));

        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed["hostname"].as_str(), Some("h1-b178-s00"));
        assert_eq!(parsed["fqdn"].as_str(), Some("h1-b178-s00"));
        assert_eq!(parsed["manage_etc_hosts"].as_bool(), Some(true));
        assert_eq!(parsed["disable_root"].as_bool(), Some(false));
        assert!(parsed.get("ssh_authorized_keys").is_none());
    }

    #[test]
    fn test_render_with_keys() {
        let keys = vec!["ssh-ed25519 AAAA dana@lab".to_string()];
        let rendered = UserData::new("vm").with_keys(&keys).render().unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed["ssh_authorized_keys"][0].as_str(), Some("ssh-ed25519 AAAA dana@lab"));
    }

    #[test]
    fn test_seed_uploads_and_sets_cicustom() {
        let mock = MockProvider::new();
        mock.add_vm("h1", 104, "h1-b178-s00", "");
        let transfer = MockTransfer::new();
        let ctx = Context::new(Arc::new(mock.clone()), Arc::new(transfer.clone()))
            .with_settings(Settings::default());

        seed(&ctx, "h1", "lb-local-storage", 104, "h1-b178-s00").unwrap();

        let uploaded = transfer
            .file("h1", "/mnt/pve/lb-local-storage/snippets/user-vm-104.cfg")
            .unwrap();
        assert!(uploaded.contains("hostname: h1-b178-s00"));
        assert_eq!(
            mock.config(104).unwrap().get("cicustom"),
            Some("user=lb-local-storage:snippets/user-vm-104.cfg")
        );
    }

    #[test]
    fn test_cleanup_ignores_missing_files() {
        let transfer = MockTransfer::new();
        transfer.add_file("h1", &snippet_path("s", "user", 7), "x");
        transfer.add_file("h1", &snippet_path("s", "meta", 7), "x");
        transfer.add_file("h1", &snippet_path("s", "user", 8), "x");
        let ctx = Context::new(Arc::new(MockProvider::new()), Arc::new(transfer.clone()));

        cleanup(&ctx, "h1", "s", 7);
        assert_eq!(transfer.file_count(), 1);
        assert!(transfer.file("h1", &snippet_path("s", "user", 8)).is_some());
    }
}
