//! Error types for metricvault storage operations.

use thiserror::Error;

use crate::types::{MetricKey, MetricRecord};

/// Result type alias for metricvault operations.
pub type VaultResult<T> = Result<T, VaultError>;

/// Errors that can occur while validating or persisting metrics.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid metric: {0}")]
    Validation(String),

    #[error("metric not found: {0}")]
    NotFound(MetricKey),

    #[error("persistence error ({context}): {cause}")]
    Persistence { context: String, cause: String },

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error(
        "batch partially persisted: {} key(s) failed, {} applied",
        .failed.len(),
        .applied.len()
    )]
    PartialBatch {
        failed: Vec<FailedWrite>,
        applied: Vec<MetricRecord>,
    },
}

impl VaultError {
    /// Wrap a backend failure with a short label of what was being done.
    pub fn persistence(context: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        VaultError::Persistence {
            context: context.into(),
            cause: cause.to_string(),
        }
    }
}

/// A single key that failed to persist within a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedWrite {
    pub key: MetricKey,
    pub cause: String,
}
