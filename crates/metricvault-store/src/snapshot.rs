//! SnapshotCodec — whole-store JSON snapshots.
//!
//! The document is a JSON object whose values are self-describing
//! `MetricRecord`s (`{"id", "type", "delta"?, "value"?}`). Entries are keyed
//! `{id}:{type}` so a gauge and a counter sharing an id do not collide.
//! Decoding ignores the map keys and trusts the entry bodies.

use std::collections::{BTreeMap, HashMap};

use metricvault_core::{MetricKey, MetricRecord, MetricValue, VaultError, VaultResult};

use crate::memory::ConcurrentStore;

/// Encodes and decodes full-store snapshots.
pub struct SnapshotCodec;

impl SnapshotCodec {
    /// Serialize records into a snapshot document.
    pub fn encode(records: &[MetricRecord]) -> VaultResult<Vec<u8>> {
        let document: BTreeMap<String, &MetricRecord> = records
            .iter()
            .map(|record| (record.key().table_key(), record))
            .collect();
        serde_json::to_vec_pretty(&document).map_err(|e| VaultError::Snapshot(e.to_string()))
    }

    /// Parse a snapshot document, validating every entry.
    pub fn decode(bytes: &[u8]) -> VaultResult<HashMap<MetricKey, MetricValue>> {
        let document: HashMap<String, MetricRecord> =
            serde_json::from_slice(bytes).map_err(|e| VaultError::Snapshot(e.to_string()))?;

        let mut entries = HashMap::with_capacity(document.len());
        for (entry_key, record) in document {
            let value = record
                .validate()
                .map_err(|e| VaultError::Snapshot(format!("entry {entry_key:?}: {e}")))?;
            entries.insert(record.key(), value);
        }
        Ok(entries)
    }

    /// Serialize the current contents of `store`.
    ///
    /// The store's shared lock is held only while the records are copied.
    pub async fn snapshot(store: &ConcurrentStore) -> VaultResult<Vec<u8>> {
        let records = store.records().await;
        Self::encode(&records)
    }

    /// Replace the contents of `store` with a decoded snapshot.
    /// Returns the number of entries loaded.
    pub async fn restore(store: &ConcurrentStore, bytes: &[u8]) -> VaultResult<usize> {
        let entries = Self::decode(bytes)?;
        let count = entries.len();
        store.replace_all(entries).await;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metricvault_core::MetricKind;

    #[tokio::test]
    async fn restore_of_snapshot_reproduces_store() {
        let original = ConcurrentStore::new();
        original
            .set_gauge(&[
                MetricRecord::gauge("Alloc", 123.25),
                MetricRecord::gauge("Idle", 0.0),
            ])
            .await
            .unwrap();
        original
            .set_counter(&[
                MetricRecord::counter("PollCount", 42),
                MetricRecord::counter("Alloc", 7),
            ])
            .await
            .unwrap();

        let bytes = SnapshotCodec::snapshot(&original).await.unwrap();
        let restored = ConcurrentStore::new();
        let loaded = SnapshotCodec::restore(&restored, &bytes).await.unwrap();

        assert_eq!(loaded, 4);
        assert_eq!(restored.records().await, original.records().await);
    }

    #[tokio::test]
    async fn rejected_nan_gauge_keeps_snapshot_restorable() {
        let original = ConcurrentStore::new();
        original
            .set_counter(&[MetricRecord::counter("PollCount", 42)])
            .await
            .unwrap();
        assert!(matches!(
            original
                .set_gauge(&[MetricRecord::gauge("Ratio", f64::NAN)])
                .await,
            Err(VaultError::Validation(_))
        ));

        let bytes = SnapshotCodec::snapshot(&original).await.unwrap();
        let restored = ConcurrentStore::new();
        SnapshotCodec::restore(&restored, &bytes).await.unwrap();

        assert_eq!(
            restored.get(MetricKind::Counter, "PollCount").await,
            Some(MetricRecord::counter("PollCount", 42))
        );
        assert_eq!(restored.get(MetricKind::Gauge, "Ratio").await, None);
    }

    #[test]
    fn document_shape_is_keyed_and_self_describing() {
        let bytes = SnapshotCodec::encode(&[
            MetricRecord::gauge("Alloc", 1.5),
            MetricRecord::counter("Alloc", 2),
        ])
        .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["Alloc:gauge"]["type"], "gauge");
        assert_eq!(json["Alloc:gauge"]["value"], 1.5);
        assert!(json["Alloc:gauge"].get("delta").is_none());
        assert_eq!(json["Alloc:counter"]["delta"], 2);
        assert!(json["Alloc:counter"].get("value").is_none());
    }

    #[test]
    fn decode_accepts_documents_keyed_by_bare_id() {
        let doc = br#"{
            "PollCount": {"id": "PollCount", "type": "counter", "delta": 5},
            "Alloc": {"id": "Alloc", "type": "gauge", "value": 10.0}
        }"#;
        let entries = SnapshotCodec::decode(doc).unwrap();
        assert_eq!(
            entries.get(&MetricKey::new(MetricKind::Counter, "PollCount")),
            Some(&MetricValue::Counter(5))
        );
        assert_eq!(
            entries.get(&MetricKey::new(MetricKind::Gauge, "Alloc")),
            Some(&MetricValue::Gauge(10.0))
        );
    }

    #[test]
    fn decode_rejects_invalid_entries() {
        let doc = br#"{"X": {"id": "X", "type": "gauge", "value": 1.0, "delta": 1}}"#;
        assert!(matches!(
            SnapshotCodec::decode(doc),
            Err(VaultError::Snapshot(_))
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            SnapshotCodec::decode(b"not json"),
            Err(VaultError::Snapshot(_))
        ));
    }
}
