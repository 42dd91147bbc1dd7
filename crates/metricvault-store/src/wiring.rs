//! Storage wiring — pick a backend from config and start what it needs.
//!
//! Capabilities are inspected exactly once, here:
//! - `as_schema()`   → run the idempotent schema step before serving.
//! - `as_snapshot()` → restore (if requested), then spawn the backup loop.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use metricvault_core::{BackendKind, StorageConfig, VaultResult};

use crate::persister::{
    FilePersister, MemoryPersister, MetricPersister, SchemaCapable, SnapshotCapable,
};
use crate::postgres::PgPersister;

/// A wired storage backend plus its background tasks.
pub struct Storage {
    persister: Arc<dyn MetricPersister>,
    backup: Option<JoinHandle<()>>,
}

impl Storage {
    /// Build the backend selected by `config` and wire it.
    pub async fn open(
        config: &StorageConfig,
        shutdown: watch::Receiver<bool>,
    ) -> VaultResult<Self> {
        let persister: Arc<dyn MetricPersister> = match config.backend() {
            BackendKind::Memory => Arc::new(MemoryPersister::new()),
            BackendKind::File { path } => Arc::new(
                FilePersister::new(path, config.store_interval()).with_restore(config.restore),
            ),
            BackendKind::Postgres { url } => Arc::new(PgPersister::connect(&url).await?),
        };
        Self::wire(persister, shutdown).await
    }

    /// Run startup steps for whatever capabilities `persister` has.
    pub async fn wire(
        persister: Arc<dyn MetricPersister>,
        shutdown: watch::Receiver<bool>,
    ) -> VaultResult<Self> {
        if let Some(schema) = persister.as_schema() {
            schema.init_schema().await?;
        }

        let backup = match persister.as_snapshot() {
            Some(snapshot) => {
                let scheduler = snapshot.backup_scheduler();
                scheduler.prepare().await;
                Some(tokio::spawn(async move { scheduler.run(shutdown).await }))
            }
            None => None,
        };

        info!(
            backend = persister.name(),
            snapshots = backup.is_some(),
            "storage wired"
        );
        Ok(Self { persister, backup })
    }

    pub fn persister(&self) -> Arc<dyn MetricPersister> {
        self.persister.clone()
    }

    /// Wait for background tasks after the shutdown signal has been sent.
    pub async fn join(self) {
        if let Some(handle) = self.backup {
            let _ = handle.await;
        }
    }
}
