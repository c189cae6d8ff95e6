use std::sync::Arc;

use servermap_core::range::Range;
use servermap_core::scan::LimitedScanResult;
use servermap_core::storage::TraceIndex;
use servermap_core::trace::TransactionId;
use tracing::debug;

use crate::config::LimitConfig;
use crate::error::MapError;

/// Limit-aware access to an application's trace index.
#[derive(Clone)]
pub struct TransactionIndexScanner {
    index: Arc<dyn TraceIndex>,
    limits: LimitConfig,
    clock_skew_ms: i64,
}

impl TransactionIndexScanner {
    pub fn new(index: Arc<dyn TraceIndex>, limits: LimitConfig, clock_skew_ms: i64) -> Self {
        Self {
            index,
            limits,
            clock_skew_ms,
        }
    }

    pub fn clamp_limit(&self, requested: i64) -> usize {
        let limit = self.limits.clamp(requested);
        if limit as i64 != requested {
            debug!(requested, limit, "scan limit clamped");
        }
        limit
    }

    /// Newest-first ids `application` recorded in `range`, at most the
    /// clamped `limit` of them.
    pub async fn scan(
        &self,
        application: &str,
        range: Range,
        limit: i64,
    ) -> Result<LimitedScanResult<Vec<TransactionId>>, MapError> {
        let limit = self.clamp_limit(limit);
        let index = Arc::clone(&self.index);
        let app = application.to_string();

        let result = tokio::task::spawn_blocking(move || index.scan(&app, &range, limit))
            .await
            .map_err(|e| MapError::Worker(e.to_string()))?
            .map_err(|source| MapError::Scan {
                application: application.to_string(),
                range,
                source,
            })?;

        debug!(
            application,
            %range,
            limit,
            found = result.data.len(),
            watermark = result.watermark,
            truncated = result.truncated,
            "scanned trace index"
        );
        Ok(result)
    }

    /// Scan the `period` milliseconds ending `clock_skew_ms` before `now`.
    pub async fn scan_last(
        &self,
        application: &str,
        period: i64,
        limit: i64,
        now: i64,
    ) -> Result<(Range, LimitedScanResult<Vec<TransactionId>>), MapError> {
        let range = Range::last(period, now, self.clock_skew_ms)?;
        let result = self.scan(application, range, limit).await?;
        Ok((range, result))
    }

    pub fn clock_skew_ms(&self) -> i64 {
        self.clock_skew_ms
    }
}

#[cfg(test)]
mod tests {
    use servermap_core::error::StorageError;
    use servermap_core::trace::{CallSpan, ServiceRef, Transaction};
    use servermap_storage::MemoryTraceStore;

    use super::*;

    fn transaction(seq: i64, start_time: i64) -> Transaction {
        Transaction {
            transaction_id: TransactionId::new("agent", 0, seq),
            start_time,
            spans: vec![CallSpan {
                caller: ServiceRef::new("USER", "USER"),
                callee: ServiceRef::new("A", "TOMCAT"),
                timestamp: start_time,
                elapsed_ms: 10,
                error: false,
                rpc: None,
                endpoint: None,
            }],
        }
    }

    fn scanner(max: usize) -> TransactionIndexScanner {
        let store = MemoryTraceStore::with_transactions((0..5).map(|i| transaction(i, 1_000 + i * 1_000)));
        TransactionIndexScanner::new(Arc::new(store), LimitConfig { min: 1, max }, 3_000)
    }

    #[tokio::test]
    async fn test_scan_clamps_limit() {
        let scanner = scanner(2);
        let range = Range::new(0, 10_000).unwrap();
        let result = scanner.scan("A", range, 1_000_000).await.unwrap();
        assert_eq!(result.data.len(), 2);
        assert_eq!(result.data[0], TransactionId::new("agent", 0, 4));
        assert_eq!(result.watermark, 4_000);
    }

    #[tokio::test]
    async fn test_scan_last_holds_back_clock_skew() {
        let scanner = scanner(100);
        // now - skew = 5_000, so the newest transaction at 5_000 is included
        // and the window starts at 3_000.
        let (range, result) = scanner.scan_last("A", 2_000, 100, 8_000).await.unwrap();
        assert_eq!(range, Range::new(3_000, 5_000).unwrap());
        assert_eq!(result.data.len(), 3);
        assert_eq!(result.watermark, 3_000);
    }

    struct BrokenIndex;

    impl TraceIndex for BrokenIndex {
        fn scan(
            &self,
            _application: &str,
            _range: &Range,
            _limit: usize,
        ) -> Result<LimitedScanResult<Vec<TransactionId>>, StorageError> {
            Err(StorageError::Read("disk on fire".into()))
        }
    }

    #[tokio::test]
    async fn test_scan_failure_names_application_and_range() {
        let scanner = TransactionIndexScanner::new(Arc::new(BrokenIndex), LimitConfig::default(), 0);
        let range = Range::new(0, 10).unwrap();
        let err = scanner.scan("A", range, 10).await.unwrap_err();
        match err {
            MapError::Scan {
                application,
                range: failed,
                ..
            } => {
                assert_eq!(application, "A");
                assert_eq!(failed, range);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
