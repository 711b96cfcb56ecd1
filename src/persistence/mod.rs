//! # Persistence Module
//!
//! ## Why This Module Exists
//! Two small pieces of state survive restarts: the broker profile the user
//! last connected with, and the notification toggle. Both live in a TOML
//! settings file under the platform config directory. The session event
//! log has its own file-backed sink (see `logsink`); this module only
//! resolves where that file lives.
//!
//! ## Design Philosophy
//! Missing configuration degrades to defaults rather than preventing
//! startup: a fresh install gets an empty broker profile and notifications
//! enabled, and the settings file appears on first save.

use crate::config::BrokerConfig;
use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const CONFIG_DIR: &str = "mqttdeck";
const SETTINGS_FILE: &str = "settings.toml";
const LOG_FILE: &str = "logs.json";

/// Durable user settings.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Whether inbound messages raise notifications.
    pub notifications_enabled: bool,
    /// Broker profile restored into the connect form on startup.
    pub broker: BrokerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            notifications_enabled: true,
            broker: BrokerConfig::default(),
        }
    }
}

impl Settings {
    /// Loads settings from the default location; a missing file yields
    /// defaults.
    pub async fn load() -> Result<Self> {
        Self::load_from(&settings_path()?).await
    }

    /// Saves settings to the default location, creating the config
    /// directory if needed.
    pub async fn save(&self) -> Result<()> {
        self.save_to(&settings_path()?).await
    }

    async fn load_from(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check settings file: {}", e))?;
        if !exists {
            debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read settings file: {}", e))?;
        toml::from_str(&content).map_err(|e| eyre!("Failed to parse settings file: {}", e))
    }

    async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize settings: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write settings file: {}", e))
    }
}

/// Application config directory, e.g. `~/.config/mqttdeck` on Linux.
pub fn config_dir() -> Result<PathBuf> {
    let mut dir =
        dirs::config_dir().ok_or_else(|| eyre!("Could not determine config directory"))?;
    dir.push(CONFIG_DIR);
    Ok(dir)
}

/// Where the file-backed log sink persists its records.
pub fn log_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(LOG_FILE))
}

fn settings_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(SETTINGS_FILE))
}
