//! BackupScheduler — periodic snapshots of the in-memory store to a file.
//!
//! ```text
//! prepare()  → restore from file if requested (missing file = start empty)
//! run()      → every `interval`: snapshot whole store, overwrite file
//!              until the shutdown signal fires (no final flush)
//! ```
//!
//! A zero interval means synchronous mode: `run` returns immediately and
//! the file persister calls `save` after every write batch instead.
//!
//! Saves are serialized: the store copy and the file write happen under one
//! lock shared by every clone, so the file never regresses to an older copy.
//!
//! The file is overwritten in place; a crash mid-write can leave a
//! truncated snapshot, which `prepare` then logs and skips.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use metricvault_core::{VaultError, VaultResult};

use crate::memory::ConcurrentStore;
use crate::snapshot::SnapshotCodec;

/// Snapshots a [`ConcurrentStore`] to `path` on a fixed interval.
#[derive(Clone)]
pub struct BackupScheduler {
    store: ConcurrentStore,
    path: PathBuf,
    interval: Duration,
    restore: bool,
    save_lock: Arc<Mutex<()>>,
}

impl BackupScheduler {
    pub fn new(store: ConcurrentStore, path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            store,
            path: path.into(),
            interval,
            restore: false,
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Load the snapshot file in [`prepare`](Self::prepare).
    pub fn with_restore(mut self, restore: bool) -> Self {
        self.restore = restore;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True when snapshots are written per batch rather than per tick.
    pub fn is_synchronous(&self) -> bool {
        self.interval.is_zero()
    }

    /// Startup step: restore if requested. Failures degrade to an empty store.
    pub async fn prepare(&self) {
        if !self.restore {
            debug!(path = ?self.path, "snapshot restore disabled");
            return;
        }
        match self.restore().await {
            Ok(count) => info!(path = ?self.path, entries = count, "store restored"),
            Err(e) => warn!(path = ?self.path, error = %e, "snapshot restore failed, starting empty"),
        }
    }

    /// Load the snapshot file into the store. A missing file loads nothing.
    pub async fn restore(&self) -> VaultResult<usize> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = ?self.path, "no snapshot file yet");
                return Ok(0);
            }
            Err(e) => return Err(VaultError::persistence("read snapshot", e)),
        };
        SnapshotCodec::restore(&self.store, &bytes).await
    }

    /// Write the entire store to the snapshot file. Returns entries written.
    pub async fn save(&self) -> VaultResult<usize> {
        let _guard = self.save_lock.lock().await;
        let records = self.store.records().await;
        let bytes = SnapshotCodec::encode(&records)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| VaultError::persistence("create snapshot directory", e))?;
        }
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| VaultError::persistence("write snapshot", e))?;

        debug!(path = ?self.path, entries = records.len(), "snapshot written");
        Ok(records.len())
    }

    /// Run the snapshot loop until shutdown signal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if self.is_synchronous() {
            debug!("backup scheduler in synchronous mode, no timer loop");
            return;
        }

        info!(
            interval_secs = self.interval.as_secs_f64(),
            path = ?self.path,
            "backup scheduler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.save().await {
                        error!(error = %e, "snapshot backup failed");
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown too.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("backup scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}
