//! metricvault-store — the metrics persistence engine.
//!
//! Keeps gauges and counters in a lock-guarded in-memory map, reconciles
//! write batches against persisted state, and makes the data durable either
//! through periodic JSON snapshots or a PostgreSQL table.
//!
//! # Architecture
//!
//! ```text
//! Storage::open(config)
//!   └── Arc<dyn MetricPersister>
//!         ├── MemoryPersister   → ConcurrentStore
//!         ├── FilePersister     → ConcurrentStore + BackupScheduler (SnapshotCodec)
//!         └── PgPersister       → BatchReconciler → metrics table
//!
//! write_batch(records)
//!   validate → collapse → lookup → partition(update | insert) → apply → confirm
//! ```

pub mod backup;
pub mod memory;
pub mod persister;
pub mod postgres;
pub mod reconcile;
pub mod snapshot;
pub mod wiring;

pub use backup::BackupScheduler;
pub use memory::ConcurrentStore;
pub use persister::{
    FilePersister, MemoryPersister, MetricPersister, SchemaCapable, SnapshotCapable,
};
pub use postgres::PgPersister;
pub use reconcile::{BatchOutcome, BatchReconciler, Partition, PendingWrite, ReconcileTarget};
pub use snapshot::SnapshotCodec;
pub use wiring::Storage;
