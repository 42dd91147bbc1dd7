//! Storage backend abstraction.
//!
//! Every backend implements [`MetricPersister`]. Optional capabilities are
//! exposed through accessor methods returning a capability trait object;
//! the wiring layer checks them once at startup:
//!
//! | backend            | snapshot | schema |
//! |--------------------|----------|--------|
//! | `MemoryPersister`  |          |        |
//! | `FilePersister`    | yes      |        |
//! | `PgPersister`      |          | yes    |

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::error;

use metricvault_core::{MetricKey, MetricKind, MetricRecord, VaultError, VaultResult};

use crate::backup::BackupScheduler;
use crate::memory::{ConcurrentStore, format_listing};
use crate::reconcile::{BatchOutcome, collapse};

/// Base capability shared by all backends.
#[async_trait]
pub trait MetricPersister: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Validate, reconcile, and apply a write batch.
    async fn write_batch(&self, batch: &[MetricRecord]) -> VaultResult<BatchOutcome>;

    /// Point lookup by `(kind, id)`.
    async fn get(&self, kind: MetricKind, id: &str) -> VaultResult<Option<MetricRecord>>;

    /// Every stored metric, sorted by id then kind.
    async fn records(&self) -> VaultResult<Vec<MetricRecord>>;

    /// Like [`get`](Self::get), but an absent key is [`VaultError::NotFound`].
    async fn get_required(&self, kind: MetricKind, id: &str) -> VaultResult<MetricRecord> {
        self.get(kind, id)
            .await?
            .ok_or_else(|| VaultError::NotFound(MetricKey::new(kind, id)))
    }

    /// `"id: value"` lines for every non-zero metric.
    async fn list(&self) -> VaultResult<Vec<String>> {
        Ok(format_listing(&self.records().await?))
    }

    /// Check that the backend is reachable.
    async fn ping(&self) -> VaultResult<()> {
        Ok(())
    }

    fn as_snapshot(&self) -> Option<&dyn SnapshotCapable> {
        None
    }

    fn as_schema(&self) -> Option<&dyn SchemaCapable> {
        None
    }
}

/// Backends whose state is kept durable by periodic file snapshots.
pub trait SnapshotCapable: Send + Sync {
    /// Scheduler bound to this backend's store and snapshot path.
    fn backup_scheduler(&self) -> BackupScheduler;
}

/// Backends that need a one-time schema setup step.
#[async_trait]
pub trait SchemaCapable: Send + Sync {
    /// Create the metrics table if it does not exist. Idempotent.
    async fn init_schema(&self) -> VaultResult<()>;
}

// ── Memory ────────────────────────────────────────────────────────

/// Volatile backend: the in-memory store and nothing else.
#[derive(Clone, Default)]
pub struct MemoryPersister {
    store: ConcurrentStore,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: ConcurrentStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ConcurrentStore {
        &self.store
    }
}

#[async_trait]
impl MetricPersister for MemoryPersister {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write_batch(&self, batch: &[MetricRecord]) -> VaultResult<BatchOutcome> {
        let pending = collapse(batch)?;
        Ok(self.store.apply(pending).await)
    }

    async fn get(&self, kind: MetricKind, id: &str) -> VaultResult<Option<MetricRecord>> {
        Ok(self.store.get(kind, id).await)
    }

    async fn records(&self) -> VaultResult<Vec<MetricRecord>> {
        Ok(self.store.records().await)
    }
}

// ── File ──────────────────────────────────────────────────────────

/// In-memory store made durable by snapshots to a JSON file.
#[derive(Clone)]
pub struct FilePersister {
    memory: MemoryPersister,
    scheduler: BackupScheduler,
}

impl FilePersister {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        let store = ConcurrentStore::new();
        Self {
            memory: MemoryPersister::with_store(store.clone()),
            scheduler: BackupScheduler::new(store, path, interval),
        }
    }

    /// Restore the snapshot file when the backup scheduler is prepared.
    pub fn with_restore(mut self, restore: bool) -> Self {
        self.scheduler = self.scheduler.with_restore(restore);
        self
    }

    pub fn store(&self) -> &ConcurrentStore {
        self.memory.store()
    }
}

#[async_trait]
impl MetricPersister for FilePersister {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn write_batch(&self, batch: &[MetricRecord]) -> VaultResult<BatchOutcome> {
        let outcome = self.memory.write_batch(batch).await?;
        if self.scheduler.is_synchronous() {
            if let Err(e) = self.scheduler.save().await {
                error!(path = ?self.scheduler.path(), error = %e, "synchronous snapshot failed");
            }
        }
        Ok(outcome)
    }

    async fn get(&self, kind: MetricKind, id: &str) -> VaultResult<Option<MetricRecord>> {
        self.memory.get(kind, id).await
    }

    async fn records(&self) -> VaultResult<Vec<MetricRecord>> {
        self.memory.records().await
    }

    fn as_snapshot(&self) -> Option<&dyn SnapshotCapable> {
        Some(self)
    }
}

impl SnapshotCapable for FilePersister {
    fn backup_scheduler(&self) -> BackupScheduler {
        self.scheduler.clone()
    }
}
