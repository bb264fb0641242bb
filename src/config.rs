//! Configuration for the tunnel client.
//!
//! The construction call only needs the local port; the relay host comes
//! from an optional config file at `~/.config/skyhook/config.toml`, falling
//! back to the public relay.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Relay used when no config file overrides it.
pub const DEFAULT_RELAY_HOST: &str = "relay.skyhook.dev";

/// Settings for one tunnel session.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Local port to forward inbound requests to. Must be nonzero.
    pub port: u16,
    /// Local host to forward to. May carry an explicit `http://` or
    /// `https://` scheme; a bare host is forwarded over plain HTTP.
    pub local_host: String,
    /// Relay host, or a full `ws://`/`wss://` URL used verbatim.
    pub relay: String,
}

impl TunnelConfig {
    pub fn new(port: u16) -> Self {
        let relay = ConfigFile::load()
            .ok()
            .and_then(|file| file.relay.host)
            .unwrap_or_else(|| DEFAULT_RELAY_HOST.to_string());

        Self {
            port,
            local_host: "localhost".to_string(),
            relay,
        }
    }

    /// Control-channel endpoint derived from the relay setting.
    pub fn relay_url(&self) -> String {
        if self.relay.contains("://") {
            self.relay.clone()
        } else {
            format!("wss://{}/register", self.relay)
        }
    }
}

/// On-disk configuration, all sections optional.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: Option<String>,
}

impl ConfigFile {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "skyhook").context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}
