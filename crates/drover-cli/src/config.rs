//! Config file handling

use anyhow::{Context, Result};
use drover::{SqliteStoreConfig, TaskManagerConfig};
use drover_sqlite::SqliteTaskStore;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_DB_PATH: &str = "./drover.db";

/// Contents of the optional JSON config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub store: Option<SqliteStoreConfig>,
    pub manager: TaskManagerConfig,
}

impl CliConfig {
    /// Read `path`, or fall back to defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config
            .manager
            .validate()
            .context("Invalid manager section in config file")?;
        Ok(config)
    }

    /// Store settings with `db_path` taking precedence over the file.
    pub fn store_config(&self, db_path: Option<PathBuf>) -> SqliteStoreConfig {
        let mut store = self
            .store
            .clone()
            .unwrap_or_else(|| SqliteStoreConfig::new(DEFAULT_DB_PATH));
        if let Some(path) = db_path {
            store.path = path;
        }
        store
    }

    pub fn open_store(&self, db_path: Option<PathBuf>) -> Result<SqliteTaskStore> {
        let cfg = self.store_config(db_path);
        tracing::debug!("Opening task store: {}", cfg.path.display());
        SqliteTaskStore::open(cfg.clone())
            .with_context(|| format!("Failed to open task store {}", cfg.path.display()))
    }
}
