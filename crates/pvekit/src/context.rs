//! Explicit context passed to every component.
//!
//! Holds the provider connection, the file session and the tunables. Build
//! one per invocation and share it by reference.

use crate::backend::{FileTransfer, Provider};
use crate::types::PollConfig;
use ipnet::Ipv4Net;
use std::sync::Arc;
use std::time::Duration;

/// Default storage for VM disks and cloud-init snippets.
pub const DEFAULT_STORAGE: &str = "lb-local-storage";

/// Tunables for allocation and teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Worker pool width for start/wait and teardown fan-out
    pub workers: usize,
    /// Wait for a VM to reach a power state after create/start/stop
    pub status_poll: PollConfig,
    /// Wait for guest-agent addresses after start
    pub address_poll: PollConfig,
    /// Retry while a VM config is locked during a scan
    pub config_lock_poll: PollConfig,
    /// Grace period the provider gives a guest to shut down
    pub stop_timeout: Duration,
    /// Addresses a VM must report before it counts as up
    pub expected_addresses: usize,
    /// Access subnet; when `None` it is read from `access_bridge`
    pub access_network: Option<Ipv4Net>,
    /// Host bridge carrying the access subnet
    pub access_bridge: String,
    /// Storage devices never handed out (the host's own boot controller)
    pub reserved_devices: Vec<String>,
    /// Keys written to `ssh_authorized_keys` in the user-data
    pub ssh_authorized_keys: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: 10,
            status_poll: PollConfig::new(Duration::from_secs(5), Duration::from_secs(60)),
            address_poll: PollConfig::new(Duration::from_secs(5), Duration::from_secs(120)),
            config_lock_poll: PollConfig::new(Duration::from_secs(2), Duration::from_secs(120)),
            stop_timeout: Duration::from_secs(60),
            expected_addresses: 2,
            access_network: None,
            access_bridge: "vmbr0".to_string(),
            reserved_devices: vec!["0000:08:00.0".to_string()],
            ssh_authorized_keys: Vec::new(),
        }
    }
}

impl Settings {
    /// Settings with every poll shortened to `interval`/`timeout`. Used by
    /// tests so waits finish instantly.
    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        let poll = PollConfig::new(interval, timeout);
        self.status_poll = poll;
        self.address_poll = poll;
        self.config_lock_poll = poll;
        self
    }
}

/// Provider connection, file session and settings for one invocation.
#[derive(Clone)]
pub struct Context {
    /// Compute-management API
    pub provider: Arc<dyn Provider>,
    /// Remote file session
    pub transfer: Arc<dyn FileTransfer>,
    /// Tunables
    pub settings: Settings,
}

impl Context {
    /// Create a context with default settings.
    pub fn new(provider: Arc<dyn Provider>, transfer: Arc<dyn FileTransfer>) -> Self {
        Self {
            provider,
            transfer,
            settings: Settings::default(),
        }
    }

    /// Builder: replace the settings.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Access subnet from the settings, or the configured bridge's address.
    ///
    /// A bridge lookup failure is logged and yields `None`; addresses are
    /// then all classified as data.
    pub fn access_network(&self, host: &str) -> Option<Ipv4Net> {
        if let Some(network) = self.settings.access_network {
            return Some(network);
        }
        match self.provider.bridge_cidr(host, &self.settings.access_bridge) {
            Ok(cidr) => cidr.map(|c| c.trunc()),
            Err(e) => {
                log::warn!(
                    "cannot read {} address on {host}: {e}",
                    self.settings.access_bridge
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockProvider, MockTransfer};

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.workers, 10);
        assert_eq!(settings.status_poll.attempts(), 12);
        assert_eq!(settings.address_poll.attempts(), 24);
        assert_eq!(settings.expected_addresses, 2);
        assert_eq!(settings.reserved_devices, vec!["0000:08:00.0"]);
    }

    #[test]
    fn test_access_network_from_bridge() {
        let mock = MockProvider::new();
        mock.set_bridge("h1", "vmbr0", "10.20.0.3/24".parse().unwrap());
        let ctx = Context::new(Arc::new(mock), Arc::new(MockTransfer::new()));

        assert_eq!(ctx.access_network("h1"), Some("10.20.0.0/24".parse().unwrap()));
        assert_eq!(ctx.access_network("h2"), None);
    }

    #[test]
    fn test_access_network_override() {
        let ctx = Context::new(Arc::new(MockProvider::new()), Arc::new(MockTransfer::new()))
            .with_settings(Settings {
                access_network: Some("192.168.0.0/16".parse().unwrap()),
                ..Settings::default()
            });
        assert_eq!(ctx.access_network("h1"), Some("192.168.0.0/16".parse().unwrap()));
    }
}
