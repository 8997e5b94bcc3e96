use anyhow::{Context, Result, bail};
use ipnet::Ipv4Net;
use pvekit::{DEFAULT_STORAGE, PollConfig, Settings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the config directory path
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("lbprox"))
}

/// Default location of `config.toml`
pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub nodes: Vec<Node>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active: Option<String>,
    pub verify_tls: bool,
    pub storage_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
    pub workers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_network: Option<Ipv4Net>,
    pub access_bridge: String,
    pub reserved_devices: Vec<String>,
    pub ssh_user: String,
    pub ssh_authorized_keys: Vec<String>,
    pub polling: Polling,
}

impl Default for Config {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            username: "root".to_string(),
            password: None,
            nodes: Vec::new(),
            last_active: None,
            verify_tls: false,
            storage_id: DEFAULT_STORAGE.to_string(),
            catalog: None,
            workers: settings.workers,
            access_network: None,
            access_bridge: settings.access_bridge,
            reserved_devices: settings.reserved_devices,
            ssh_user: "root".to_string(),
            ssh_authorized_keys: Vec::new(),
            polling: Polling::default(),
        }
    }
}

/// Poll intervals and timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Polling {
    pub status_interval: u64,
    pub status_timeout: u64,
    pub address_interval: u64,
    pub address_timeout: u64,
    pub lock_interval: u64,
    pub lock_timeout: u64,
    pub stop_timeout: u64,
}

impl Default for Polling {
    fn default() -> Self {
        Self {
            status_interval: 5,
            status_timeout: 60,
            address_interval: 5,
            address_timeout: 120,
            lock_interval: 2,
            lock_timeout: 120,
            stop_timeout: 60,
        }
    }
}

fn poll(interval: u64, timeout: u64) -> PollConfig {
    PollConfig::new(Duration::from_secs(interval), Duration::from_secs(timeout))
}

impl Config {
    /// Load the config, or defaults if the file does not exist yet
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("{} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config: {}", path.display()))
    }

    /// Save the config, creating its directory if needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).with_context(|| format!("Could not write {}", path.display()))?;
        Ok(())
    }

    /// Command-line credentials win over the file
    pub fn apply_overrides(&mut self, username: Option<&str>, password: Option<&str>) {
        if let Some(username) = username {
            self.username = username.to_string();
        }
        if let Some(password) = password {
            self.password = Some(password.to_string());
        }
    }

    /// Hosts to try, last active first, each listed once
    pub fn candidate_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        let configured = self.nodes.iter().map(|n| n.hostname.clone());
        for host in self.last_active.clone().into_iter().chain(configured) {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        hosts
    }

    /// Catalog path with `~` expanded
    pub fn catalog_path(&self) -> Option<PathBuf> {
        self.catalog
            .as_deref()
            .map(|raw| PathBuf::from(shellexpand::tilde(raw).as_ref()))
    }

    /// Library settings built from this config
    pub fn settings(&self) -> Settings {
        let p = &self.polling;
        Settings {
            workers: self.workers.max(1),
            status_poll: poll(p.status_interval, p.status_timeout),
            address_poll: poll(p.address_interval, p.address_timeout),
            config_lock_poll: poll(p.lock_interval, p.lock_timeout),
            stop_timeout: Duration::from_secs(p.stop_timeout),
            expected_addresses: Settings::default().expected_addresses,
            access_network: self.access_network,
            access_bridge: self.access_bridge.clone(),
            reserved_devices: self.reserved_devices.clone(),
            ssh_authorized_keys: self.ssh_authorized_keys.clone(),
        }
    }
}

/// Connect to the first host that answers.
///
/// Failures are logged and the next host is tried.
pub fn first_reachable<T, E: std::fmt::Display>(
    hosts: &[String],
    mut connect: impl FnMut(&str) -> std::result::Result<T, E>,
) -> Result<(String, T)> {
    if hosts.is_empty() {
        bail!("No nodes configured. Add [[nodes]] entries to the config file.");
    }
    for host in hosts {
        match connect(host) {
            Ok(conn) => {
                log::info!("connected to {host}");
                return Ok((host.clone(), conn));
            }
            Err(e) => log::warn!("cannot connect to {host}: {e}"),
        }
    }
    bail!("None of the configured nodes answered: {}", hosts.join(", "))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
        username = "admin"
        password = "secret"
        last_active = "pve02"
        catalog = "~/lbprox/catalog.toml"
        access_network = "10.20.0.0/24"
        ssh_authorized_keys = ["ssh-ed25519 AAAA user@host"]

        [[nodes]]
        hostname = "pve01"

        [[nodes]]
        hostname = "pve02"

        [polling]
        status_interval = 1
        status_timeout = 10
    "#;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.storage_id, "lb-local-storage");
        assert_eq!(config.workers, 10);
    }

    #[test]
    fn test_load_sample() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, SAMPLE).unwrap();

        let config = Config::load_or_default(&path).unwrap();
        assert_eq!(config.username, "admin");
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.access_network, Some("10.20.0.0/24".parse().unwrap()));
        // Unset keys keep their defaults
        assert_eq!(config.access_bridge, "vmbr0");
        assert_eq!(config.polling.address_timeout, 120);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "nodes = 3").unwrap();
        assert!(Config::load_or_default(&path).is_err());
    }

    #[test]
    fn test_save_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.last_active = Some("pve01".to_string());

        config.save(&path).unwrap();
        let loaded = Config::load_or_default(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_overrides() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.apply_overrides(Some("ops"), None);
        assert_eq!(config.username, "ops");
        assert_eq!(config.password.as_deref(), Some("secret"));

        config.apply_overrides(None, Some("other"));
        assert_eq!(config.password.as_deref(), Some("other"));
    }

    #[test]
    fn test_candidate_hosts_last_active_first() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.candidate_hosts(), vec!["pve02", "pve01"]);

        let config = Config {
            last_active: Some("pve09".to_string()),
            ..toml::from_str(SAMPLE).unwrap()
        };
        assert_eq!(config.candidate_hosts(), vec!["pve09", "pve01", "pve02"]);
    }

    #[test]
    fn test_catalog_path_expands_tilde() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let path = config.catalog_path().unwrap();
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with("lbprox/catalog.toml"));
    }

    #[test]
    fn test_settings_from_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let settings = config.settings();
        assert_eq!(settings.status_poll.interval, Duration::from_secs(1));
        assert_eq!(settings.status_poll.timeout, Duration::from_secs(10));
        assert_eq!(settings.address_poll.timeout, Duration::from_secs(120));
        assert_eq!(settings.stop_timeout, Duration::from_secs(60));
        assert_eq!(settings.ssh_authorized_keys.len(), 1);
        assert_eq!(settings.reserved_devices, vec!["0000:08:00.0"]);
    }

    #[test]
    fn test_first_reachable_falls_through() {
        let hosts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut tried = Vec::new();
        let (host, conn) = first_reachable(&hosts, |h| {
            tried.push(h.to_string());
            if h == "b" { Ok(42) } else { Err("refused") }
        })
        .unwrap();

        assert_eq!(host, "b");
        assert_eq!(conn, 42);
        assert_eq!(tried, vec!["a", "b"]);
    }

    #[test]
    fn test_first_reachable_none_answer() {
        let hosts = vec!["a".to_string()];
        let err = first_reachable::<(), _>(&hosts, |_| Err("refused")).unwrap_err();
        assert!(err.to_string().contains("None of the configured nodes"));

        assert!(first_reachable::<(), &str>(&[], |_| Ok(())).is_err());
    }
}
