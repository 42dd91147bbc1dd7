//! metricvault-core — shared metric types, validation, errors, and config.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BackendKind, StorageConfig, VaultConfig};
pub use error::{FailedWrite, VaultError, VaultResult};
pub use types::*;
