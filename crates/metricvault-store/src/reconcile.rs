//! Batch reconciliation — collapse duplicate writes, then route each key to
//! an update or an insert against persisted state.
//!
//! The pipeline is:
//!
//! ```text
//! validate → collapse → lookup(persisted) → partition → apply → confirm
//! ```
//!
//! `collapse` and `partition` are pure and shared by every backend. The
//! full pipeline is driven by [`BatchReconciler`] against any
//! [`ReconcileTarget`]; the in-memory store runs the partition and apply
//! steps itself under a single write lock (see `ConcurrentStore::apply`).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tracing::{debug, warn};

use metricvault_core::{FailedWrite, MetricKey, MetricRecord, MetricValue, VaultError, VaultResult};

/// One collapsed write, ready to be merged into persisted state.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub key: MetricKey,
    pub value: MetricValue,
}

/// A collapsed batch split by whether each key already exists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partition {
    pub updates: Vec<PendingWrite>,
    pub inserts: Vec<PendingWrite>,
}

impl Partition {
    pub fn update_keys(&self) -> Vec<MetricKey> {
        self.updates.iter().map(|w| w.key.clone()).collect()
    }

    pub fn insert_keys(&self) -> Vec<MetricKey> {
        self.inserts.iter().map(|w| w.key.clone()).collect()
    }
}

/// Result of a successfully applied batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    /// Canonical post-write records, one per distinct key, in order of
    /// each key's first appearance in the input.
    pub records: Vec<MetricRecord>,
    /// Keys that already existed and were merged.
    pub updated: Vec<MetricKey>,
    /// Keys that were created by this batch.
    pub inserted: Vec<MetricKey>,
}

/// Validate every record, then fold duplicates by `(id, kind)`.
///
/// Gauges keep the last occurrence in input order; counters sum their
/// deltas. Any invalid record rejects the whole batch.
pub fn collapse(batch: &[MetricRecord]) -> VaultResult<Vec<PendingWrite>> {
    let values = batch
        .iter()
        .map(MetricRecord::validate)
        .collect::<VaultResult<Vec<_>>>()?;

    let mut pending: Vec<PendingWrite> = Vec::with_capacity(batch.len());
    let mut position: HashMap<MetricKey, usize> = HashMap::with_capacity(batch.len());

    for (record, value) in batch.iter().zip(values) {
        let key = record.key();
        match position.get(&key) {
            Some(&idx) => {
                let slot = &mut pending[idx];
                slot.value = slot.value.merge(value);
            }
            None => {
                position.insert(key.clone(), pending.len());
                pending.push(PendingWrite { key, value });
            }
        }
    }

    Ok(pending)
}

/// Split collapsed writes into `K ∩ P` (updates) and `K \ P` (inserts).
pub fn partition<F>(pending: Vec<PendingWrite>, is_persisted: F) -> Partition
where
    F: Fn(&MetricKey) -> bool,
{
    let (updates, inserts): (Vec<_>, Vec<_>) =
        pending.into_iter().partition(|w| is_persisted(&w.key));
    Partition { updates, inserts }
}

/// A backend the reconciler can look up and write keys against.
#[async_trait]
pub trait ReconcileTarget: Send + Sync {
    /// Persisted values for whichever of `keys` exist.
    async fn lookup(&self, keys: &[MetricKey]) -> VaultResult<HashMap<MetricKey, MetricValue>>;

    /// Merge a write into an existing entry.
    async fn update(&self, write: &PendingWrite) -> VaultResult<()>;

    /// Create a new entry.
    async fn insert(&self, write: &PendingWrite) -> VaultResult<()>;
}

/// Drives the full reconciliation pipeline against a [`ReconcileTarget`].
pub struct BatchReconciler<'a, T: ReconcileTarget + ?Sized> {
    target: &'a T,
}

impl<'a, T: ReconcileTarget + ?Sized> BatchReconciler<'a, T> {
    pub fn new(target: &'a T) -> Self {
        Self { target }
    }

    /// Reconcile and apply a batch.
    ///
    /// Updates are applied before inserts. Individual key failures do not
    /// stop the batch; if any occur the call returns
    /// [`VaultError::PartialBatch`] and keys already applied stay applied.
    pub async fn reconcile(&self, batch: &[MetricRecord]) -> VaultResult<BatchOutcome> {
        let pending = collapse(batch)?;
        if pending.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let keys: Vec<MetricKey> = pending.iter().map(|w| w.key.clone()).collect();
        let persisted = self.target.lookup(&keys).await?;
        let partition = partition(pending, |key| persisted.contains_key(key));
        debug!(
            received = batch.len(),
            updates = partition.updates.len(),
            inserts = partition.inserts.len(),
            "batch partitioned"
        );

        let mut failed = Vec::new();
        for write in &partition.updates {
            if let Err(e) = self.target.update(write).await {
                failed.push(FailedWrite {
                    key: write.key.clone(),
                    cause: e.to_string(),
                });
            }
        }
        for write in &partition.inserts {
            if let Err(e) = self.target.insert(write).await {
                failed.push(FailedWrite {
                    key: write.key.clone(),
                    cause: e.to_string(),
                });
            }
        }

        let confirmed = match self.target.lookup(&keys).await {
            Ok(confirmed) => confirmed,
            Err(e) => return Err(unconfirmed_batch(failed, &keys, &e)),
        };
        let failed_keys: HashSet<&MetricKey> = failed.iter().map(|f| &f.key).collect();
        let records: Vec<MetricRecord> = keys
            .iter()
            .filter(|key| !failed_keys.contains(key))
            .filter_map(|key| {
                confirmed
                    .get(key)
                    .map(|value| MetricRecord::from_value(key.id.clone(), *value))
            })
            .collect();

        if !failed.is_empty() {
            warn!(
                failed = failed.len(),
                applied = records.len(),
                "batch partially persisted"
            );
            return Err(VaultError::PartialBatch {
                failed,
                applied: records,
            });
        }

        Ok(BatchOutcome {
            records,
            updated: partition
                .update_keys()
                .into_iter()
                .filter(|k| !failed_keys.contains(k))
                .collect(),
            inserted: partition.insert_keys(),
        })
    }
}

/// Writes went out but the confirming lookup failed: report every key,
/// marking the ones that were applied so callers do not replay them.
fn unconfirmed_batch(
    mut failed: Vec<FailedWrite>,
    keys: &[MetricKey],
    confirm_error: &VaultError,
) -> VaultError {
    let already_failed: HashSet<MetricKey> = failed.iter().map(|f| f.key.clone()).collect();
    let cause = format!("applied, confirmation failed: {confirm_error}");
    failed.extend(
        keys.iter()
            .filter(|key| !already_failed.contains(*key))
            .map(|key| FailedWrite {
                key: key.clone(),
                cause: cause.clone(),
            }),
    );
    warn!(
        failed = failed.len(),
        error = %confirm_error,
        "batch written but not confirmed"
    );
    VaultError::PartialBatch {
        failed,
        applied: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metricvault_core::MetricKind;
    use tokio::sync::Mutex;

    /// Map-backed target that can be told to fail specific keys.
    #[derive(Default)]
    struct FakeTarget {
        rows: Mutex<HashMap<MetricKey, MetricValue>>,
        failing: HashSet<MetricKey>,
        lookups: Mutex<u32>,
        /// Lookups beyond this many return an error.
        lookup_limit: Option<u32>,
    }

    #[async_trait]
    impl ReconcileTarget for FakeTarget {
        async fn lookup(
            &self,
            keys: &[MetricKey],
        ) -> VaultResult<HashMap<MetricKey, MetricValue>> {
            let mut lookups = self.lookups.lock().await;
            *lookups += 1;
            if self.lookup_limit.is_some_and(|limit| *lookups > limit) {
                return Err(VaultError::persistence("lookup", "connection reset"));
            }
            drop(lookups);
            let rows = self.rows.lock().await;
            Ok(keys
                .iter()
                .filter_map(|k| rows.get(k).map(|v| (k.clone(), *v)))
                .collect())
        }

        async fn update(&self, write: &PendingWrite) -> VaultResult<()> {
            if self.failing.contains(&write.key) {
                return Err(VaultError::persistence("update", "injected failure"));
            }
            let mut rows = self.rows.lock().await;
            let slot = rows
                .get_mut(&write.key)
                .ok_or_else(|| VaultError::NotFound(write.key.clone()))?;
            *slot = slot.merge(write.value);
            Ok(())
        }

        async fn insert(&self, write: &PendingWrite) -> VaultResult<()> {
            if self.failing.contains(&write.key) {
                return Err(VaultError::persistence("insert", "injected failure"));
            }
            self.rows.lock().await.insert(write.key.clone(), write.value);
            Ok(())
        }
    }

    fn gauge_key(id: &str) -> MetricKey {
        MetricKey::new(MetricKind::Gauge, id)
    }

    fn counter_key(id: &str) -> MetricKey {
        MetricKey::new(MetricKind::Counter, id)
    }

    // ── collapse ───────────────────────────────────────────────────

    #[test]
    fn collapse_keeps_last_gauge_in_input_order() {
        let batch = vec![
            MetricRecord::gauge("Alloc", 100.0),
            MetricRecord::gauge("Other", 1.0),
            MetricRecord::gauge("Alloc", 300.0),
            MetricRecord::gauge("Alloc", 200.0),
        ];
        let pending = collapse(&batch).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].key, gauge_key("Alloc"));
        assert_eq!(pending[0].value, MetricValue::Gauge(200.0));
        assert_eq!(pending[1].key, gauge_key("Other"));
    }

    #[test]
    fn collapse_sums_counter_deltas() {
        let batch = vec![
            MetricRecord::counter("PollCount", 1),
            MetricRecord::counter("PollCount", 2),
            MetricRecord::counter("PollCount", -1),
        ];
        let pending = collapse(&batch).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].value, MetricValue::Counter(2));
    }

    #[test]
    fn collapse_treats_same_id_different_kind_as_distinct() {
        let batch = vec![
            MetricRecord::gauge("X", 1.5),
            MetricRecord::counter("X", 4),
        ];
        let pending = collapse(&batch).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].key, gauge_key("X"));
        assert_eq!(pending[1].key, counter_key("X"));
    }

    #[test]
    fn collapse_rejects_whole_batch_on_invalid_record() {
        let mut bad = MetricRecord::counter("C", 1);
        bad.delta = None;
        let batch = vec![MetricRecord::gauge("Alloc", 1.0), bad];
        assert!(matches!(collapse(&batch), Err(VaultError::Validation(_))));
    }

    // ── partition ──────────────────────────────────────────────────

    #[test]
    fn partition_is_disjoint_and_exhaustive() {
        let batch = vec![
            MetricRecord::gauge("A", 1.0),
            MetricRecord::counter("B", 1),
            MetricRecord::gauge("C", 1.0),
            MetricRecord::counter("D", 1),
        ];
        let persisted: HashSet<MetricKey> = [gauge_key("A"), counter_key("D"), gauge_key("Z")]
            .into_iter()
            .collect();

        let pending = collapse(&batch).unwrap();
        let all: HashSet<MetricKey> = pending.iter().map(|w| w.key.clone()).collect();
        let split = partition(pending, |k| persisted.contains(k));

        let updates: HashSet<MetricKey> = split.update_keys().into_iter().collect();
        let inserts: HashSet<MetricKey> = split.insert_keys().into_iter().collect();

        let expected_updates: HashSet<MetricKey> = all.intersection(&persisted).cloned().collect();
        let expected_inserts: HashSet<MetricKey> = all.difference(&persisted).cloned().collect();
        assert_eq!(updates, expected_updates);
        assert_eq!(inserts, expected_inserts);
        assert!(updates.is_disjoint(&inserts));
        assert_eq!(&updates | &inserts, all);
    }

    // ── reconcile ──────────────────────────────────────────────────

    #[tokio::test]
    async fn reconcile_routes_new_then_existing_counter() {
        let target = FakeTarget::default();
        let reconciler = BatchReconciler::new(&target);

        let first = reconciler
            .reconcile(&[MetricRecord::counter("C1", 5)])
            .await
            .unwrap();
        assert_eq!(first.inserted, vec![counter_key("C1")]);
        assert!(first.updated.is_empty());

        let second = reconciler
            .reconcile(&[MetricRecord::counter("C1", 3)])
            .await
            .unwrap();
        assert_eq!(second.updated, vec![counter_key("C1")]);
        assert!(second.inserted.is_empty());
        assert_eq!(second.records, vec![MetricRecord::counter("C1", 8)]);
    }

    #[tokio::test]
    async fn reconcile_adds_batch_sum_to_prior_delta() {
        let target = FakeTarget::default();
        target
            .rows
            .lock()
            .await
            .insert(counter_key("PollCount"), MetricValue::Counter(10));

        let outcome = BatchReconciler::new(&target)
            .reconcile(&[
                MetricRecord::counter("PollCount", 1),
                MetricRecord::counter("PollCount", 4),
            ])
            .await
            .unwrap();
        assert_eq!(outcome.records, vec![MetricRecord::counter("PollCount", 15)]);
    }

    #[tokio::test]
    async fn reconcile_second_pass_routes_everything_to_update() {
        let target = FakeTarget::default();
        let reconciler = BatchReconciler::new(&target);
        let batch = vec![
            MetricRecord::gauge("Alloc", 1.0),
            MetricRecord::counter("PollCount", 1),
        ];

        let first = reconciler.reconcile(&batch).await.unwrap();
        assert_eq!(first.inserted.len(), 2);

        let second = reconciler.reconcile(&batch).await.unwrap();
        assert!(second.inserted.is_empty());
        assert_eq!(second.updated.len(), 2);
    }

    #[tokio::test]
    async fn reconcile_reports_partial_failure_and_keeps_applied_keys() {
        let target = FakeTarget {
            failing: [counter_key("Bad")].into_iter().collect(),
            ..FakeTarget::default()
        };

        let err = BatchReconciler::new(&target)
            .reconcile(&[
                MetricRecord::counter("Good", 2),
                MetricRecord::counter("Bad", 2),
            ])
            .await
            .unwrap_err();

        match err {
            VaultError::PartialBatch { failed, applied } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].key, counter_key("Bad"));
                assert_eq!(applied, vec![MetricRecord::counter("Good", 2)]);
            }
            other => panic!("expected PartialBatch, got {other:?}"),
        }
        assert_eq!(
            target.rows.lock().await.get(&counter_key("Good")),
            Some(&MetricValue::Counter(2))
        );
    }

    #[tokio::test]
    async fn failed_confirmation_still_reports_every_key() {
        let target = FakeTarget {
            failing: [counter_key("Bad")].into_iter().collect(),
            lookup_limit: Some(1),
            ..FakeTarget::default()
        };

        let err = BatchReconciler::new(&target)
            .reconcile(&[
                MetricRecord::counter("Good", 2),
                MetricRecord::counter("Bad", 2),
            ])
            .await
            .unwrap_err();

        match err {
            VaultError::PartialBatch { failed, applied } => {
                assert!(applied.is_empty());
                let keys: Vec<_> = failed.iter().map(|f| f.key.clone()).collect();
                assert_eq!(keys, vec![counter_key("Bad"), counter_key("Good")]);
                assert!(failed[0].cause.contains("injected failure"));
                assert!(failed[1].cause.starts_with("applied, confirmation failed"));
            }
            other => panic!("expected PartialBatch, got {other:?}"),
        }
        // The write itself landed and must not be replayed.
        assert_eq!(
            target.rows.lock().await.get(&counter_key("Good")),
            Some(&MetricValue::Counter(2))
        );
    }

    #[tokio::test]
    async fn invalid_batch_never_reaches_target() {
        let target = FakeTarget::default();
        let mut bad = MetricRecord::gauge("Alloc", 1.0);
        bad.value = None;

        let result = BatchReconciler::new(&target).reconcile(&[bad]).await;
        assert!(matches!(result, Err(VaultError::Validation(_))));
        assert_eq!(*target.lookups.lock().await, 0);
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let target = FakeTarget::default();
        let outcome = BatchReconciler::new(&target).reconcile(&[]).await.unwrap();
        assert_eq!(outcome, BatchOutcome::default());
        assert_eq!(*target.lookups.lock().await, 0);
    }
}
