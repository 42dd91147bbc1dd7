//! ConcurrentStore — the in-memory metric map.
//!
//! One coarse reader-writer lock guards the whole map. Every write batch
//! holds the exclusive lock from partition to the last applied key, so a
//! reader never observes half a batch. The store is `Clone` (backed by an
//! `Arc`) and is shared between the persister and the backup scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use metricvault_core::{
    MetricKey, MetricKind, MetricRecord, MetricValue, VaultError, VaultResult,
};

use crate::reconcile::{BatchOutcome, PendingWrite, collapse, partition};

/// Thread-safe in-memory metric store.
#[derive(Clone, Default)]
pub struct ConcurrentStore {
    entries: Arc<RwLock<HashMap<MetricKey, MetricValue>>>,
}

impl ConcurrentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace gauge values. Within one call the last occurrence of an id wins.
    pub async fn set_gauge(&self, batch: &[MetricRecord]) -> VaultResult<Vec<MetricRecord>> {
        ensure_kind(batch, MetricKind::Gauge)?;
        let pending = collapse(batch)?;
        Ok(self.apply(pending).await.records)
    }

    /// Add counter deltas. Repeated ids within one call are summed first.
    pub async fn set_counter(&self, batch: &[MetricRecord]) -> VaultResult<Vec<MetricRecord>> {
        ensure_kind(batch, MetricKind::Counter)?;
        let pending = collapse(batch)?;
        Ok(self.apply(pending).await.records)
    }

    /// Partition and apply collapsed writes under one exclusive lock.
    pub async fn apply(&self, pending: Vec<PendingWrite>) -> BatchOutcome {
        if pending.is_empty() {
            return BatchOutcome::default();
        }
        let order: Vec<MetricKey> = pending.iter().map(|w| w.key.clone()).collect();

        let mut entries = self.entries.write().await;
        let split = partition(pending, |key| entries.contains_key(key));

        let updated = split.update_keys();
        let inserted = split.insert_keys();
        for write in split.updates {
            if let Some(slot) = entries.get_mut(&write.key) {
                *slot = slot.merge(write.value);
            }
        }
        for write in split.inserts {
            entries.insert(write.key, write.value);
        }

        let records = order
            .iter()
            .filter_map(|key| {
                entries
                    .get(key)
                    .map(|value| MetricRecord::from_value(key.id.clone(), *value))
            })
            .collect();
        drop(entries);

        debug!(
            updated = updated.len(),
            inserted = inserted.len(),
            "memory batch applied"
        );
        BatchOutcome {
            records,
            updated,
            inserted,
        }
    }

    /// Point lookup.
    pub async fn get(&self, kind: MetricKind, id: &str) -> Option<MetricRecord> {
        let key = MetricKey::new(kind, id);
        let entries = self.entries.read().await;
        entries
            .get(&key)
            .map(|value| MetricRecord::from_value(id, *value))
    }

    /// `"id: value"` lines for every non-zero metric, sorted by id then kind.
    pub async fn get_all(&self) -> Vec<String> {
        format_listing(&self.records().await)
    }

    /// Copy of every entry, sorted by id then kind.
    pub async fn records(&self) -> Vec<MetricRecord> {
        let entries = self.entries.read().await;
        let mut keys: Vec<&MetricKey> = entries.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| MetricRecord::from_value(key.id.clone(), entries[key]))
            .collect()
    }

    /// Swap the whole map for `entries`.
    pub async fn replace_all(&self, entries: HashMap<MetricKey, MetricValue>) {
        *self.entries.write().await = entries;
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn ensure_kind(batch: &[MetricRecord], expected: MetricKind) -> VaultResult<()> {
    match batch.iter().find(|r| r.kind != expected) {
        Some(r) => Err(VaultError::Validation(format!(
            "{} {:?} submitted as {expected}",
            r.kind, r.id
        ))),
        None => Ok(()),
    }
}

/// Render non-zero records as `"id: value"`.
pub(crate) fn format_listing(records: &[MetricRecord]) -> Vec<String> {
    records
        .iter()
        .filter_map(|record| {
            let value = record.metric_value()?;
            (!value.is_zero()).then(|| format!("{}: {value}", record.id))
        })
        .collect()
}
