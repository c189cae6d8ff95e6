use crate::error::StorageError;
use crate::range::Range;
use crate::scan::LimitedScanResult;
use crate::trace::{Transaction, TransactionId};

/// Time-ordered index from application to the transactions it recorded.
pub trait TraceIndex: Send + Sync {
    /// List the transactions `application` recorded within `range`, newest
    /// first, returning at most `limit` ids plus the resumption watermark.
    ///
    /// Implementations apply [`crate::scan::limit_scan`] to their candidates.
    fn scan(
        &self,
        application: &str,
        range: &Range,
        limit: usize,
    ) -> Result<LimitedScanResult<Vec<TransactionId>>, StorageError>;
}

/// Storage of complete transactions, keyed by id.
pub trait TransactionStore: Send + Sync {
    /// Store a transaction and index it under every application that
    /// recorded it.
    fn insert(&self, transaction: &Transaction) -> Result<(), StorageError>;

    /// Retrieve a transaction by id.
    fn get(&self, id: &TransactionId) -> Result<Option<Transaction>, StorageError>;

    /// Number of stored transactions. Backends may approximate.
    fn count(&self) -> Result<u64, StorageError>;
}
