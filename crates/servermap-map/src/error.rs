use servermap_core::error::{FilterParseError, InvalidRangeError, StorageError};
use servermap_core::range::Range;
use servermap_core::trace::TransactionId;
use thiserror::Error;

use crate::timeseries::WindowMismatch;

#[derive(Debug, Error)]
pub enum MapError {
    #[error(transparent)]
    InvalidRange(#[from] InvalidRangeError),
    #[error(transparent)]
    FilterParse(#[from] FilterParseError),
    #[error("failed to scan trace index of '{application}' over {range}: {source}")]
    Scan {
        application: String,
        range: Range,
        #[source]
        source: StorageError,
    },
    #[error("query cancelled")]
    Cancelled,
    #[error("query exceeded its {timeout_ms}ms deadline")]
    DeadlineExceeded { timeout_ms: u64 },
    #[error(transparent)]
    WindowMismatch(#[from] WindowMismatch),
    #[error("map worker failed: {0}")]
    Worker(String),
}

impl MapError {
    /// Validation errors are raised before any storage access.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidRange(_) | Self::FilterParse(_))
    }

    /// The query was abandoned before a complete map existed.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded { .. })
    }
}

/// A transaction listed by the index that could not be loaded.
///
/// Recorded per transaction; it excludes that transaction from the map but
/// never fails the build.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transaction {0} not found")]
    NotFound(TransactionId),
    #[error("failed to fetch transaction {id}: {source}")]
    Storage {
        id: TransactionId,
        #[source]
        source: StorageError,
    },
}

impl FetchError {
    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            Self::NotFound(id) => id,
            Self::Storage { id, .. } => id,
        }
    }
}
