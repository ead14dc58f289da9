//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use waypoint_common::Result;
use waypoint_storage::StoreConfig;
use waypoint_sync::{SchedulerConfig, SyncConfig};

/// Top-level configuration, stored as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Database file. In-memory when absent.
    pub database_path: Option<PathBuf>,
    pub sync: SyncConfig,
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    /// Configuration with the database at `path` and default settings.
    pub fn with_database(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Read a configuration file. Missing fields take their defaults.
    ///
    /// # Errors
    /// - `Io` if the file cannot be read
    /// - `Serialization` if it is not valid JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write this configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.database_path.clone(),
        }
    }
}
