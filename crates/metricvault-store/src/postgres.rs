//! PgPersister — relational backend on PostgreSQL.
//!
//! Writes bypass the in-memory store entirely: the reconciler looks up the
//! batch's keys with one parameterized query, then issues one `UPDATE` or
//! `INSERT` per key and relies on Postgres row locking for concurrency.
//!
//! The table has no unique constraint on `(key, type)`. Inserts are guarded
//! with `WHERE NOT EXISTS` and fall back to an update when a row appeared
//! after the lookup. Two transactions inserting the same new key at the
//! same instant can still both pass the guard under `READ COMMITTED`; the
//! resulting duplicate rows are both incremented and `get` returns the
//! oldest one.
//!
//! Schema:
//!
//! ```sql
//! metrics(id serial primary key, key text, type text, delta bigint, value double precision)
//! ```

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info};

use metricvault_core::{
    MetricKey, MetricKind, MetricRecord, MetricValue, VaultError, VaultResult,
};

use crate::persister::{MetricPersister, SchemaCapable};
use crate::reconcile::{BatchOutcome, BatchReconciler, PendingWrite, ReconcileTarget};

/// Convert a sqlx error into `VaultError::Persistence` with a context label.
macro_rules! pg_err {
    ($context:literal) => {
        |e| VaultError::persistence($context, e)
    };
}

const TABLE_EXISTS: &str = "SELECT EXISTS (
    SELECT 1 FROM information_schema.tables
    WHERE table_schema = current_schema() AND table_name = 'metrics'
)";

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS metrics (
    id serial PRIMARY KEY,
    key text NOT NULL,
    type text NOT NULL,
    delta bigint,
    value double precision
)";

const INSERT_IF_ABSENT: &str = "INSERT INTO metrics (key, type, delta, value)
    SELECT $1, $2, $3::bigint, $4::double precision
    WHERE NOT EXISTS (SELECT 1 FROM metrics WHERE key = $1 AND type = $2)";

/// One `metrics` row as selected by the backend.
#[derive(Debug, sqlx::FromRow)]
struct MetricRow {
    key: String,
    #[sqlx(rename = "type")]
    kind: String,
    delta: Option<i64>,
    value: Option<f64>,
}

impl MetricRow {
    fn into_record(self) -> VaultResult<MetricRecord> {
        let record = MetricRecord {
            id: self.key,
            kind: self.kind.parse().map_err(pg_err!("decode row"))?,
            delta: self.delta,
            value: self.value,
        };
        record.validate().map_err(pg_err!("decode row"))?;
        Ok(record)
    }
}

/// PostgreSQL-backed persister.
#[derive(Clone)]
pub struct PgPersister {
    pool: PgPool,
}

impl PgPersister {
    /// Connect a pool to `url`.
    pub async fn connect(url: &str) -> VaultResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(pg_err!("connect"))?;
        debug!("postgres pool connected");
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Batch lookup by `(kind, id)` pairs.
    ///
    /// The `ANY`/`ANY` query matches the cross product of requested kinds and
    /// ids, so rows are filtered back down to the exact pairs asked for.
    pub async fn lookup_pairs(
        &self,
        keys: &[MetricKey],
    ) -> VaultResult<HashMap<MetricKey, MetricValue>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut kinds: Vec<String> = keys.iter().map(|k| k.kind.to_string()).collect();
        kinds.sort();
        kinds.dedup();
        let ids: Vec<String> = keys.iter().map(|k| k.id.clone()).collect();

        let rows = sqlx::query_as::<_, MetricRow>(
            "SELECT key, type, delta, value FROM metrics WHERE type = ANY($1) AND key = ANY($2)",
        )
        .bind(kinds)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err!("lookup metrics"))?;

        let wanted: HashSet<&MetricKey> = keys.iter().collect();
        let mut found = HashMap::with_capacity(rows.len());
        for row in rows {
            let record = row.into_record()?;
            let key = record.key();
            if !wanted.contains(&key) {
                continue;
            }
            if let Some(value) = record.metric_value() {
                found.insert(key, value);
            }
        }
        Ok(found)
    }

    /// Insert a single new row, or merge into the row if one already exists.
    pub async fn insert_row(&self, key: &MetricKey, value: MetricValue) -> VaultResult<()> {
        let (delta, gauge) = split_value(value);
        let result = sqlx::query(INSERT_IF_ABSENT)
            .bind(&key.id)
            .bind(key.kind.as_str())
            .bind(delta)
            .bind(gauge)
            .execute(&self.pool)
            .await
            .map_err(pg_err!("insert metric"))?;

        if result.rows_affected() == 0 {
            debug!(%key, "row appeared since lookup, merging");
            return self.update_row(key, value).await;
        }
        Ok(())
    }

    /// Overwrite the gauge value and add to the counter delta of one row.
    pub async fn update_row(&self, key: &MetricKey, value: MetricValue) -> VaultResult<()> {
        let (delta, gauge) = split_value(value);
        let result = sqlx::query(
            "UPDATE metrics SET value = $1, delta = delta + $2 WHERE type = $3 AND key = $4",
        )
        .bind(gauge)
        .bind(delta)
        .bind(key.kind.as_str())
        .bind(&key.id)
        .execute(&self.pool)
        .await
        .map_err(pg_err!("update metric"))?;

        if result.rows_affected() == 0 {
            return Err(VaultError::persistence(
                "update metric",
                format!("{key} no longer exists"),
            ));
        }
        Ok(())
    }
}

/// Column values for a metric: `(delta, value)`.
fn split_value(value: MetricValue) -> (Option<i64>, Option<f64>) {
    match value {
        MetricValue::Gauge(v) => (None, Some(v)),
        MetricValue::Counter(d) => (Some(d), None),
    }
}

#[async_trait]
impl ReconcileTarget for PgPersister {
    async fn lookup(&self, keys: &[MetricKey]) -> VaultResult<HashMap<MetricKey, MetricValue>> {
        self.lookup_pairs(keys).await
    }

    async fn update(&self, write: &PendingWrite) -> VaultResult<()> {
        self.update_row(&write.key, write.value).await
    }

    async fn insert(&self, write: &PendingWrite) -> VaultResult<()> {
        self.insert_row(&write.key, write.value).await
    }
}

#[async_trait]
impl MetricPersister for PgPersister {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn write_batch(&self, batch: &[MetricRecord]) -> VaultResult<BatchOutcome> {
        BatchReconciler::new(self).reconcile(batch).await
    }

    async fn get(&self, kind: MetricKind, id: &str) -> VaultResult<Option<MetricRecord>> {
        let row = sqlx::query_as::<_, MetricRow>(
            "SELECT key, type, delta, value FROM metrics WHERE type = $1 AND key = $2 ORDER BY id LIMIT 1",
        )
        .bind(kind.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err!("get metric"))?;

        row.map(MetricRow::into_record).transpose()
    }

    async fn records(&self) -> VaultResult<Vec<MetricRecord>> {
        let rows = sqlx::query_as::<_, MetricRow>(
            "SELECT key, type, delta, value FROM metrics ORDER BY key, type DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err!("list metrics"))?;

        rows.into_iter().map(MetricRow::into_record).collect()
    }

    async fn ping(&self) -> VaultResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(pg_err!("ping"))?;
        Ok(())
    }

    fn as_schema(&self) -> Option<&dyn SchemaCapable> {
        Some(self)
    }
}

#[async_trait]
impl SchemaCapable for PgPersister {
    async fn init_schema(&self) -> VaultResult<()> {
        let exists: bool = sqlx::query_scalar(TABLE_EXISTS)
            .fetch_one(&self.pool)
            .await
            .map_err(pg_err!("check schema"))?;
        if exists {
            debug!("metrics table present");
            return Ok(());
        }

        sqlx::query(CREATE_TABLE)
            .execute(&self.pool)
            .await
            .map_err(pg_err!("create schema"))?;
        info!("metrics table created");
        Ok(())
    }
}
