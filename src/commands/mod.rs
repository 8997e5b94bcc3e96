pub mod allocations;
pub mod nodes;

use anyhow::{Context as _, Result, bail};
use pvekit::backend::rest::{RestOptions, RestProvider};
use pvekit::backend::ssh::SshTransfer;
use pvekit::{Allocator, StaticCatalog, TagSet};
use serde::Serialize;
use std::sync::Arc;

use crate::Context;
use crate::config::{self, Config};

/// Config plus a live connection to one node.
pub struct Session {
    pub config: Config,
    pub allocator: Allocator,
}

impl Session {
    pub fn pve(&self) -> &pvekit::Context {
        self.allocator.context()
    }

    /// Storage from the command line, else the configured one
    pub fn storage(&self, storage: Option<String>) -> String {
        storage.unwrap_or_else(|| self.config.storage_id.clone())
    }
}

/// Load the config with command-line overrides applied
pub fn load_config(ctx: &Context) -> Result<Config> {
    let mut config = Config::load_or_default(&ctx.config_path)?;
    config.apply_overrides(ctx.username.as_deref(), ctx.password.as_deref());
    Ok(config)
}

/// Load the catalog named in the config, or an empty one
pub fn load_catalog(config: &Config) -> Result<StaticCatalog> {
    match config.catalog_path() {
        Some(path) => StaticCatalog::load(&path)
            .with_context(|| format!("Failed to load catalog {}", path.display())),
        None => {
            log::debug!("no catalog configured");
            Ok(StaticCatalog::new())
        }
    }
}

/// Connect to the first answering node and remember it as `last_active`
pub fn connect(ctx: &Context) -> Result<Session> {
    let mut config = load_config(ctx)?;

    let password = match &config.password {
        Some(password) => password.clone(),
        None => dialoguer::Password::new()
            .with_prompt(format!("Password for {}@pam", config.username))
            .interact()
            .context("Failed to read password")?,
    };
    let mut options = RestOptions::new(config.username.clone(), password);
    options.verify_tls = config.verify_tls;

    let hosts = config.candidate_hosts();
    let (host, provider) = config::first_reachable(&hosts, |h| RestProvider::connect(h, &options))?;

    if config.last_active.as_deref() != Some(host.as_str()) {
        // Reloaded so command-line credentials never reach the file
        let mut saved = Config::load_or_default(&ctx.config_path)?;
        saved.last_active = Some(host);
        if let Err(e) = saved.save(&ctx.config_path) {
            log::warn!("could not record last active node: {e:#}");
        }
    }

    let catalog = load_catalog(&config)?;
    let transfer = SshTransfer::new(config.ssh_user.clone());
    let pve = pvekit::Context::new(Arc::new(provider), Arc::new(transfer))
        .with_settings(config.settings());

    Ok(Session {
        allocator: Allocator::new(pve, Arc::new(catalog)),
        config,
    })
}

/// Parse `key.value` arguments. An argument may hold several `;`-separated tags.
pub fn parse_tags<S: AsRef<str>>(values: &[S]) -> Result<TagSet> {
    let mut tags = TagSet::new();
    for value in values {
        for part in value.as_ref().split(';').filter(|p| !p.trim().is_empty()) {
            let parsed = TagSet::decode(part);
            if parsed.len() != 1 {
                bail!("Invalid tag '{part}', expected key.value");
            }
            for (key, value) in parsed.iter() {
                if tags.get(key).is_some_and(|existing| existing != value) {
                    bail!("Tag '{key}' given twice");
                }
                tags.set(key.clone(), value);
            }
        }
    }
    Ok(tags)
}

/// Print a value as pretty JSON on stdout
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvekit::TagKey;

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags(&["owner.ops", "allocation.b178;role.target"]).unwrap();
        assert_eq!(tags.len(), 3);
        assert_eq!(tags.allocation(), Some("b178"));
        assert_eq!(tags.get(&TagKey::Other("owner".into())), Some("ops"));
    }

    #[test]
    fn test_parse_tags_rejects_malformed() {
        assert!(parse_tags(&["owner"]).is_err());
        assert!(parse_tags(&["ver.3.10"]).is_err());
        assert!(parse_tags(&["role.target", "role.initiator"]).is_err());
    }

    #[test]
    fn test_parse_tags_empty() {
        assert!(parse_tags::<&str>(&[]).unwrap().is_empty());
        assert!(parse_tags(&[";"]).unwrap().is_empty());
    }
}
