//! Metric domain types shared across metricvault crates.
//!
//! A metric is identified by the pair `(id, kind)`: a gauge and a counter
//! with the same id are different entities. `MetricRecord` is the
//! serializable form used on every boundary (snapshot files, CLI, backend
//! rows); `MetricValue` is the validated in-memory form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

// ── Kind ──────────────────────────────────────────────────────────

/// The two supported metric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Point-in-time value; every write overwrites the previous one.
    Gauge,
    /// Cumulative value; every write adds its delta.
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = VaultError;

    fn from_str(s: &str) -> VaultResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(VaultError::Validation(format!(
                "unknown metric type {other:?}"
            ))),
        }
    }
}

// ── Key ───────────────────────────────────────────────────────────

/// Unique identity of a stored metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub id: String,
    pub kind: MetricKind,
}

impl MetricKey {
    pub fn new(kind: MetricKind, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    /// Composite `{id}:{kind}` key used for snapshot entries.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.id, self.kind)
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.kind, self.id)
    }
}

// ── Value ─────────────────────────────────────────────────────────

/// A validated metric value. The variant determines the kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }

    /// True for a gauge at exactly `0.0` or a counter at `0`.
    pub fn is_zero(&self) -> bool {
        match *self {
            MetricValue::Gauge(v) => v == 0.0,
            MetricValue::Counter(d) => d == 0,
        }
    }

    /// Merge an incoming value into this one: gauges are replaced,
    /// counters accumulate. Counter addition saturates at the `i64` bounds.
    ///
    /// Both values must be of the same kind; a mismatched incoming value
    /// replaces the current one.
    pub fn merge(self, incoming: MetricValue) -> MetricValue {
        match (self, incoming) {
            (MetricValue::Counter(prior), MetricValue::Counter(delta)) => {
                MetricValue::Counter(prior.saturating_add(delta))
            }
            (_, incoming) => incoming,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(v) => write!(f, "{v}"),
            MetricValue::Counter(d) => write!(f, "{d}"),
        }
    }
}

// ── Record ────────────────────────────────────────────────────────

/// Wire/storage form of a metric: exactly one of `value` (gauge) or
/// `delta` (counter) is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl MetricRecord {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Gauge,
            delta: None,
            value: Some(value),
        }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Counter,
            delta: Some(delta),
            value: None,
        }
    }

    /// Build a well-formed record from a key and validated value.
    pub fn from_value(id: impl Into<String>, value: MetricValue) -> Self {
        match value {
            MetricValue::Gauge(v) => Self::gauge(id, v),
            MetricValue::Counter(d) => Self::counter(id, d),
        }
    }

    pub fn key(&self) -> MetricKey {
        MetricKey::new(self.kind, self.id.clone())
    }

    /// Check the record invariant and return its typed value.
    pub fn validate(&self) -> VaultResult<MetricValue> {
        if self.id.is_empty() {
            return Err(VaultError::Validation("metric id is empty".to_string()));
        }
        match (self.kind, self.value, self.delta) {
            // JSON has no encoding for NaN or infinities.
            (MetricKind::Gauge, Some(v), None) if !v.is_finite() => Err(VaultError::Validation(
                format!("gauge {:?} has non-finite value {v}", self.id),
            )),
            (MetricKind::Gauge, Some(v), None) => Ok(MetricValue::Gauge(v)),
            (MetricKind::Counter, None, Some(d)) => Ok(MetricValue::Counter(d)),
            (_, Some(_), Some(_)) => Err(VaultError::Validation(format!(
                "{} {:?} has both value and delta set",
                self.kind, self.id
            ))),
            (_, None, None) => Err(VaultError::Validation(format!(
                "{} {:?} has neither value nor delta set",
                self.kind, self.id
            ))),
            (MetricKind::Gauge, None, Some(_)) => Err(VaultError::Validation(format!(
                "gauge {:?} carries a delta instead of a value",
                self.id
            ))),
            (MetricKind::Counter, Some(_), None) => Err(VaultError::Validation(format!(
                "counter {:?} carries a value instead of a delta",
                self.id
            ))),
        }
    }

    /// Typed value of a record already known to be valid.
    ///
    /// Returns `None` if the record violates the invariant.
    pub fn metric_value(&self) -> Option<MetricValue> {
        self.validate().ok()
    }
}
