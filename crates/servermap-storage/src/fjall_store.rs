use std::ops::Bound;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use servermap_core::error::StorageError;
use servermap_core::range::Range;
use servermap_core::scan::{LimitedScanResult, limit_scan};
use servermap_core::storage::{TraceIndex, TransactionStore};
use servermap_core::trace::{Transaction, TransactionId};
use tracing::debug;

pub struct FjallTraceStore {
    keyspace: Keyspace,
    transactions: PartitionHandle,
    by_application: PartitionHandle,
}

impl FjallTraceStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        let keyspace = Config::new(path)
            .open()
            .map_err(|e| StorageError::Open(e.to_string()))?;

        let kv_sep_opts = PartitionCreateOptions::default()
            .with_kv_separation(fjall::KvSeparationOptions::default());

        let transactions = keyspace
            .open_partition("transactions", kv_sep_opts)
            .map_err(|e| StorageError::Open(e.to_string()))?;

        let by_application = keyspace
            .open_partition("by_application", PartitionCreateOptions::default())
            .map_err(|e| StorageError::Open(e.to_string()))?;

        Ok(Self {
            keyspace,
            transactions,
            by_application,
        })
    }

    /// Flush the journal to disk. Call after a bulk load.
    pub fn persist(&self) -> Result<(), StorageError> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(|e| StorageError::Write(e.to_string()))
    }
}

/// Encode epoch milliseconds so that byte order matches numeric order,
/// negative values included.
fn encode_timestamp(ts: i64) -> [u8; 8] {
    ((ts as u64) ^ (1 << 63)).to_be_bytes()
}

fn decode_timestamp(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ (1 << 63)) as i64
}

/// `{application_len (2B)}{application}`. The length prefix keeps one
/// application's keys from sharing a prefix with another's.
fn application_prefix(application: &str) -> Result<Vec<u8>, StorageError> {
    let len = u16::try_from(application.len())
        .map_err(|_| StorageError::Write(format!("application name too long: {application}")))?;
    let mut key = Vec::with_capacity(2 + application.len() + 8 + 32);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(application.as_bytes());
    Ok(key)
}

/// Build the `by_application` key:
/// `{application_len (2B)}{application}{timestamp_be (8B)}{transaction_id}`.
fn index_key(
    application: &str,
    ts: i64,
    id: &TransactionId,
) -> Result<Vec<u8>, StorageError> {
    let mut key = application_prefix(application)?;
    key.extend_from_slice(&encode_timestamp(ts));
    key.extend_from_slice(id.to_string().as_bytes());
    Ok(key)
}

impl TraceIndex for FjallTraceStore {
    fn scan(
        &self,
        application: &str,
        range: &Range,
        limit: usize,
    ) -> Result<LimitedScanResult<Vec<TransactionId>>, StorageError> {
        // A name too long to be written can have no index entries.
        let Ok(prefix) = application_prefix(application) else {
            return Ok(LimitedScanResult::new(Vec::new(), range.from()));
        };
        let ts_offset = prefix.len();

        let mut lower = prefix.clone();
        lower.extend_from_slice(&encode_timestamp(range.from()));
        // Transaction ids are UTF-8 and never contain 0xFF, so this sorts
        // after every key stamped with `range.to`.
        let mut upper = prefix;
        upper.extend_from_slice(&encode_timestamp(range.to()));
        upper.push(0xFF);

        let candidates = self
            .by_application
            .range((Bound::Included(lower), Bound::Excluded(upper)))
            .rev()
            .map(|entry| {
                let (key, value) = entry.map_err(|e| StorageError::Read(e.to_string()))?;
                let ts_bytes: [u8; 8] = key
                    .get(ts_offset..ts_offset + 8)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| StorageError::Read("invalid timestamp in index".into()))?;
                let id = std::str::from_utf8(&value)
                    .map_err(|e| StorageError::Read(e.to_string()))?
                    .parse::<TransactionId>()
                    .map_err(|e| StorageError::Read(e.to_string()))?;
                Ok((decode_timestamp(ts_bytes), id))
            });

        let result = limit_scan(range, limit, candidates)?;
        debug!(
            application,
            %range,
            limit,
            found = result.data.len(),
            watermark = result.watermark,
            truncated = result.truncated,
            "scanned application index"
        );
        Ok(result)
    }
}

impl TransactionStore for FjallTraceStore {
    fn insert(&self, transaction: &Transaction) -> Result<(), StorageError> {
        let serialized = serde_json::to_vec(transaction)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let id = &transaction.transaction_id;
        let id_key = id.to_string();

        let mut batch = self.keyspace.batch();
        batch.insert(&self.transactions, id_key.as_bytes(), &serialized);
        for application in transaction.recording_applications() {
            let key = index_key(application, transaction.start_time, id)?;
            batch.insert(&self.by_application, key, id_key.as_bytes());
        }
        batch
            .commit()
            .map_err(|e| StorageError::Write(e.to_string()))?;

        Ok(())
    }

    fn get(&self, id: &TransactionId) -> Result<Option<Transaction>, StorageError> {
        let Some(value) = self
            .transactions
            .get(id.to_string().as_bytes())
            .map_err(|e| StorageError::Read(e.to_string()))?
        else {
            return Ok(None);
        };
        let transaction: Transaction = serde_json::from_slice(&value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(transaction))
    }

    fn count(&self) -> Result<u64, StorageError> {
        Ok(self.transactions.approximate_len() as u64)
    }
}
