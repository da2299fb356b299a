//! Configuration resolution for the canflash CLI
//!
//! The file comes from `--config`, else `<config_dir>/canflash/config.toml`
//! when it exists, else built-in defaults. Command-line flags win over file
//! values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use canflash::config::{parse_can_id, FlasherConfig};

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub interface: Option<String>,
    pub bitrate: Option<u32>,
    pub tx_id: Option<String>,
    pub rx_id: Option<String>,
    pub max_retries: Option<u32>,
}

/// Get the default config file path
pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Could not determine config directory")?
        .join("canflash");

    Ok(config_dir.join("config.toml"))
}

/// Load the configuration and apply command-line overrides
pub fn resolve(explicit: Option<&Path>, overrides: &Overrides) -> Result<FlasherConfig> {
    let mut config = match explicit {
        Some(path) => load(path)?,
        None => match config_path() {
            Ok(path) if path.exists() => load(&path)?,
            _ => FlasherConfig::default(),
        },
    };

    apply(&mut config, overrides)?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn load(path: &Path) -> Result<FlasherConfig> {
    tracing::debug!(path = %path.display(), "Loading config file");
    FlasherConfig::load(path)
        .with_context(|| format!("Failed to load config file: {}", path.display()))
}

fn apply(config: &mut FlasherConfig, overrides: &Overrides) -> Result<()> {
    if let Some(interface) = &overrides.interface {
        config.channel.interface = interface.clone();
    }
    if let Some(bitrate) = overrides.bitrate {
        config.channel.bitrate = bitrate;
    }
    if let Some(tx_id) = &overrides.tx_id {
        config.isotp.tx_id = parse_can_id(tx_id).context("Invalid --tx-id")?;
    }
    if let Some(rx_id) = &overrides.rx_id {
        config.isotp.rx_id = parse_can_id(rx_id).context("Invalid --rx-id")?;
    }
    if let Some(max_retries) = overrides.max_retries {
        config.iap.max_retries = max_retries;
    }
    Ok(())
}
