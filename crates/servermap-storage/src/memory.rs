use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use servermap_core::error::StorageError;
use servermap_core::range::Range;
use servermap_core::scan::{LimitedScanResult, limit_scan};
use servermap_core::storage::{TraceIndex, TransactionStore};
use servermap_core::trace::{Transaction, TransactionId};

/// In-process trace store. Holds everything in memory; nothing survives the
/// process.
#[derive(Default)]
pub struct MemoryTraceStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    transactions: HashMap<TransactionId, Transaction>,
    /// application -> start time -> ids in insertion order
    by_application: HashMap<String, BTreeMap<i64, Vec<TransactionId>>>,
}

impl MemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from `transactions`. A repeated id keeps its first copy.
    pub fn with_transactions(transactions: impl IntoIterator<Item = Transaction>) -> Self {
        let mut inner = Inner::default();
        for transaction in transactions {
            inner.insert(transaction);
        }
        Self {
            inner: RwLock::new(inner),
        }
    }
}

impl Inner {
    /// Returns `false`, leaving the store untouched, if the id is present.
    fn insert(&mut self, transaction: Transaction) -> bool {
        let id = &transaction.transaction_id;
        if self.transactions.contains_key(id) {
            return false;
        }
        for application in transaction.recording_applications() {
            self.by_application
                .entry(application.to_string())
                .or_default()
                .entry(transaction.start_time)
                .or_default()
                .push(id.clone());
        }
        self.transactions.insert(id.clone(), transaction);
        true
    }
}

fn poisoned() -> StorageError {
    StorageError::Read("memory store lock poisoned".into())
}

impl TraceIndex for MemoryTraceStore {
    fn scan(
        &self,
        application: &str,
        range: &Range,
        limit: usize,
    ) -> Result<LimitedScanResult<Vec<TransactionId>>, StorageError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let Some(index) = inner.by_application.get(application) else {
            return Ok(LimitedScanResult::new(Vec::new(), range.from()));
        };

        let candidates = index
            .range(range.from()..=range.to())
            .rev()
            .flat_map(|(ts, ids)| ids.iter().rev().map(move |id| Ok((*ts, id.clone()))));
        limit_scan(range, limit, candidates)
    }
}

impl TransactionStore for MemoryTraceStore {
    fn insert(&self, transaction: &Transaction) -> Result<(), StorageError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| StorageError::Write("memory store lock poisoned".into()))?;

        if !inner.insert(transaction.clone()) {
            return Err(StorageError::Write(format!(
                "transaction {} already stored",
                transaction.transaction_id
            )));
        }
        Ok(())
    }

    fn get(&self, id: &TransactionId) -> Result<Option<Transaction>, StorageError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.transactions.get(id).cloned())
    }

    fn count(&self) -> Result<u64, StorageError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.transactions.len() as u64)
    }
}
