//! metricvault.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default snapshot file location.
pub const DEFAULT_FILE_STORAGE_PATH: &str = "/tmp/metrics-db.json";

/// Default snapshot interval in seconds.
pub const DEFAULT_STORE_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub storage: StorageConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Snapshot file for the file backend. Empty disables it.
    pub file_storage_path: String,
    /// Seconds between snapshots. Zero writes the snapshot after every batch.
    pub store_interval_secs: u64,
    /// Load the snapshot file at startup.
    pub restore: bool,
    /// Postgres connection string. Non-empty selects the relational backend.
    pub database_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

/// Storage backend chosen by [`StorageConfig::backend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    File { path: PathBuf },
    Postgres { url: String },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            file_storage_path: DEFAULT_FILE_STORAGE_PATH.to_string(),
            store_interval_secs: DEFAULT_STORE_INTERVAL_SECS,
            restore: true,
            database_url: String::new(),
        }
    }
}

impl StorageConfig {
    /// A database URL wins over a snapshot path; with neither, memory only.
    pub fn backend(&self) -> BackendKind {
        if !self.database_url.is_empty() {
            BackendKind::Postgres {
                url: self.database_url.clone(),
            }
        } else if !self.file_storage_path.is_empty() {
            BackendKind::File {
                path: PathBuf::from(&self.file_storage_path),
            }
        } else {
            BackendKind::Memory
        }
    }

    pub fn store_interval(&self) -> Duration {
        Duration::from_secs(self.store_interval_secs)
    }
}

impl VaultConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: VaultConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
