use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use servermap_core::filter::{Filter, FilterBuilder};
use servermap_core::range::{Range, now_millis};
use servermap_core::scan::LimitedScanResult;
use servermap_core::storage::{TraceIndex, TransactionStore};
use servermap_core::trace::{ServiceRef, ServiceType};
use tokio::time::Instant;
use tracing::debug;

use crate::builder::{MapBuildResult, MapBuilder};
use crate::cancel::CancelSignal;
use crate::config::MapConfig;
use crate::error::MapError;
use crate::scanner::TransactionIndexScanner;

const DEFAULT_LIMIT: i64 = 10_000;
const DEFAULT_LAST_LIMIT: i64 = 1_000_000;

fn default_limit() -> i64 {
    DEFAULT_LIMIT
}

fn default_last_limit() -> i64 {
    DEFAULT_LAST_LIMIT
}

/// Map of an application over an explicit time range.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteredMapQuery {
    pub application: String,
    pub service_type: ServiceType,
    pub from: i64,
    pub to: i64,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

impl FilteredMapQuery {
    pub fn new(application: impl Into<String>, service_type: impl AsRef<str>, from: i64, to: i64) -> Self {
        Self {
            application: application.into(),
            service_type: ServiceType::new(service_type),
            from,
            to,
            filter: None,
            limit: DEFAULT_LIMIT,
        }
    }
}

/// Map of an application over the last `period` milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastFilteredMapQuery {
    pub application: String,
    pub service_type: ServiceType,
    pub period: i64,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default = "default_last_limit")]
    pub limit: i64,
}

impl LastFilteredMapQuery {
    pub fn new(application: impl Into<String>, service_type: impl AsRef<str>, period: i64) -> Self {
        Self {
            application: application.into(),
            service_type: ServiceType::new(service_type),
            period,
            filter: None,
            limit: DEFAULT_LAST_LIMIT,
        }
    }
}

/// A built map together with the query parameters that produced it.
#[derive(Debug)]
pub struct FilteredServerMap {
    pub application: ServiceRef,
    pub range: Range,
    /// The filter text as given.
    pub filter_text: Option<String>,
    /// Number of transaction ids the scan returned, with its watermark and
    /// truncation flag.
    pub scan: LimitedScanResult<usize>,
    /// Effective scan limit after clamping.
    pub limit: usize,
    pub build: MapBuildResult,
}

impl FilteredServerMap {
    /// The range still to be scanned to complete this map, if any.
    pub fn remainder(&self) -> Option<Range> {
        self.scan.remainder(&self.range)
    }
}

/// Entry point for filtered map queries: validates, scans, then builds under
/// one deadline.
pub struct FilteredMapService {
    scanner: TransactionIndexScanner,
    builder: MapBuilder,
    filters: FilterBuilder,
    query_timeout: Duration,
}

impl FilteredMapService {
    pub fn new(index: Arc<dyn TraceIndex>, store: Arc<dyn TransactionStore>, config: &MapConfig) -> Self {
        Self {
            scanner: TransactionIndexScanner::new(index, config.limit, config.clock_skew_ms),
            builder: MapBuilder::new(store, config.workers, config.time_series),
            filters: FilterBuilder::new(),
            query_timeout: config.query_timeout,
        }
    }

    pub async fn get_filtered_server_map(
        &self,
        query: &FilteredMapQuery,
        cancel: &CancelSignal,
    ) -> Result<FilteredServerMap, MapError> {
        let limit = self.scanner.clamp_limit(query.limit);
        let filter = self.filters.build(query.filter.as_deref())?;
        let range = Range::new(query.from, query.to)?;

        let application = ServiceRef {
            application: query.application.clone(),
            service_type: query.service_type.clone(),
        };
        self.run(application, range, filter, query.filter.clone(), limit, cancel)
            .await
    }

    pub async fn get_last_filtered_server_map(
        &self,
        query: &LastFilteredMapQuery,
        cancel: &CancelSignal,
    ) -> Result<FilteredServerMap, MapError> {
        self.get_last_filtered_server_map_at(query, now_millis(), cancel)
            .await
    }

    /// [`Self::get_last_filtered_server_map`] with an explicit `now`.
    pub async fn get_last_filtered_server_map_at(
        &self,
        query: &LastFilteredMapQuery,
        now: i64,
        cancel: &CancelSignal,
    ) -> Result<FilteredServerMap, MapError> {
        let limit = self.scanner.clamp_limit(query.limit);
        let filter = self.filters.build(query.filter.as_deref())?;
        let range = Range::last(query.period, now, self.scanner.clock_skew_ms())?;

        let application = ServiceRef {
            application: query.application.clone(),
            service_type: query.service_type.clone(),
        };
        self.run(application, range, filter, query.filter.clone(), limit, cancel)
            .await
    }

    async fn run(
        &self,
        application: ServiceRef,
        range: Range,
        filter: Filter,
        filter_text: Option<String>,
        limit: usize,
        cancel: &CancelSignal,
    ) -> Result<FilteredServerMap, MapError> {
        debug!(%application, %range, %filter, limit, "filtered map query");

        let deadline = Instant::now() + self.query_timeout;
        let filter = Arc::new(filter);
        let pipeline = async {
            let scan = self
                .scanner
                .scan(&application.application, range, limit as i64)
                .await?;
            let build = self.builder.build(&scan.data, range, filter, cancel).await?;
            Ok::<_, MapError>((scan.map(|ids| ids.len()), build))
        };

        let (scan, build) = tokio::select! {
            outcome = tokio::time::timeout_at(deadline, pipeline) => {
                outcome.map_err(|_| MapError::DeadlineExceeded {
                    timeout_ms: u64::try_from(self.query_timeout.as_millis()).unwrap_or(u64::MAX),
                })??
            }
            _ = cancel.cancelled() => return Err(MapError::Cancelled),
        };

        Ok(FilteredServerMap {
            application,
            range,
            filter_text,
            scan,
            limit,
            build,
        })
    }
}

#[cfg(test)]
mod tests {
    use servermap_core::error::StorageError;
    use servermap_core::trace::{CallSpan, Transaction, TransactionId};
    use servermap_storage::MemoryTraceStore;

    use super::*;
    use crate::cancel::cancellation;
    use crate::config::LimitConfig;

    fn node(name: &str) -> ServiceRef {
        ServiceRef::new(name, "TOMCAT")
    }

    fn transaction(seq: i64, start_time: i64, to: &str, error: bool) -> Transaction {
        Transaction {
            transaction_id: TransactionId::new("agent", 0, seq),
            start_time,
            spans: vec![
                CallSpan {
                    caller: ServiceRef::new("USER", "USER"),
                    callee: node("A"),
                    timestamp: start_time,
                    elapsed_ms: 250,
                    error: false,
                    rpc: Some("/order".into()),
                    endpoint: None,
                },
                CallSpan {
                    caller: node("A"),
                    callee: node(to),
                    timestamp: start_time + 1,
                    elapsed_ms: 200,
                    error,
                    rpc: None,
                    endpoint: None,
                },
            ],
        }
    }

    fn service(store: MemoryTraceStore, config: MapConfig) -> FilteredMapService {
        let store = Arc::new(store);
        FilteredMapService::new(store.clone(), store, &config)
    }

    fn scenario_service() -> FilteredMapService {
        let store = MemoryTraceStore::with_transactions([
            transaction(1, 1_000, "B", false),
            transaction(2, 2_000, "C", true),
        ]);
        service(store, MapConfig::default())
    }

    #[tokio::test]
    async fn test_unfiltered_map() {
        let query = FilteredMapQuery::new("A", "TOMCAT", 0, 10_000);
        let result = scenario_service()
            .get_filtered_server_map(&query, &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(result.scan, LimitedScanResult::new(2, 0));
        assert_eq!(result.limit, 10_000);
        assert!(result.remainder().is_none());
        assert_eq!(result.build.map.nodes().len(), 4);
        assert!(result.build.map.link(&node("A"), &node("B")).is_some());
        assert!(result.build.map.link(&node("A"), &node("C")).is_some());
    }

    #[tokio::test]
    async fn test_error_only_filter() {
        let mut query = FilteredMapQuery::new("A", "TOMCAT", 0, 10_000);
        query.filter = Some("errorOnly".into());
        let result = scenario_service()
            .get_filtered_server_map(&query, &CancelSignal::never())
            .await
            .unwrap();

        assert!(result.build.map.link(&node("A"), &node("B")).is_none());
        assert!(result.build.map.link(&node("A"), &node("C")).is_some());
        assert_eq!(result.filter_text.as_deref(), Some("errorOnly"));
    }

    #[tokio::test]
    async fn test_truncated_scan_reports_watermark() {
        let store = MemoryTraceStore::with_transactions(
            (0..5).map(|seq| transaction(seq, 1_000 * (seq + 1), "B", false)),
        );
        let config = MapConfig {
            limit: LimitConfig { min: 1, max: 2 },
            ..MapConfig::default()
        };
        let query = FilteredMapQuery::new("A", "TOMCAT", 0, 10_000);
        let result = service(store, config)
            .get_filtered_server_map(&query, &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(result.limit, 2);
        assert_eq!(result.scan, LimitedScanResult::truncated(2, 4_000));
        assert_eq!(result.remainder(), Some(Range::new(0, 3_999).unwrap()));
        assert_eq!(result.build.accepted, 2);
    }

    #[tokio::test]
    async fn test_tied_scan_at_range_start_reports_truncation() {
        let store = MemoryTraceStore::with_transactions(
            (0..3).map(|seq| transaction(seq, 0, "B", false)),
        );
        let config = MapConfig {
            limit: LimitConfig { min: 1, max: 2 },
            ..MapConfig::default()
        };
        let query = FilteredMapQuery::new("A", "TOMCAT", 0, 10_000);
        let result = service(store, config)
            .get_filtered_server_map(&query, &CancelSignal::never())
            .await
            .unwrap();

        assert!(result.remainder().is_none());
        assert_eq!(result.scan, LimitedScanResult::truncated(2, 0));
        assert_eq!(result.build.accepted, 2);
    }

    #[tokio::test]
    async fn test_last_query_window() {
        let query = LastFilteredMapQuery::new("A", "TOMCAT", 1_500);
        // now - skew = 2_500, window [1_000, 2_500]
        let result = scenario_service()
            .get_last_filtered_server_map_at(&query, 5_500, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(result.range, Range::new(1_000, 2_500).unwrap());
        assert_eq!(result.build.accepted, 2);
    }

    struct UnreachableIndex;

    impl TraceIndex for UnreachableIndex {
        fn scan(
            &self,
            _application: &str,
            _range: &Range,
            _limit: usize,
        ) -> Result<LimitedScanResult<Vec<TransactionId>>, StorageError> {
            Err(StorageError::Read("index must not be touched".into()))
        }
    }

    fn unreachable_service() -> FilteredMapService {
        FilteredMapService::new(
            Arc::new(UnreachableIndex),
            Arc::new(MemoryTraceStore::new()),
            &MapConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_invalid_range_rejected_before_scan() {
        let query = FilteredMapQuery::new("A", "TOMCAT", 10, 5);
        let err = unreachable_service()
            .get_filtered_server_map(&query, &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::InvalidRange(_)));
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_filter_parse_error_rejected_before_scan() {
        let mut query = FilteredMapQuery::new("A", "TOMCAT", 0, 10);
        query.filter = Some("elapsed>=fast".into());
        let err = unreachable_service()
            .get_filtered_server_map(&query, &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::FilterParse(_)));
    }

    #[tokio::test]
    async fn test_scan_failure_surfaces() {
        let query = FilteredMapQuery::new("A", "TOMCAT", 0, 10);
        let err = unreachable_service()
            .get_filtered_server_map(&query, &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::Scan { .. }));
    }

    struct SlowStore(MemoryTraceStore);

    impl TransactionStore for SlowStore {
        fn insert(&self, transaction: &Transaction) -> Result<(), StorageError> {
            self.0.insert(transaction)
        }

        fn get(&self, id: &TransactionId) -> Result<Option<Transaction>, StorageError> {
            std::thread::sleep(Duration::from_millis(20));
            self.0.get(id)
        }

        fn count(&self) -> Result<u64, StorageError> {
            self.0.count()
        }
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let index = Arc::new(MemoryTraceStore::with_transactions(
            (0..50).map(|seq| transaction(seq, 1_000 + seq, "B", false)),
        ));
        let store = SlowStore(MemoryTraceStore::with_transactions(
            (0..50).map(|seq| transaction(seq, 1_000 + seq, "B", false)),
        ));
        let config = MapConfig {
            workers: 1,
            query_timeout: Duration::from_millis(50),
            ..MapConfig::default()
        };
        let service = FilteredMapService::new(index, Arc::new(store), &config);

        let query = FilteredMapQuery::new("A", "TOMCAT", 0, 10_000);
        let err = service
            .get_filtered_server_map(&query, &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::DeadlineExceeded { timeout_ms: 50 }));
        assert!(err.is_aborted());
    }

    #[tokio::test]
    async fn test_cancelled_query() {
        let (handle, signal) = cancellation();
        handle.cancel();
        let query = FilteredMapQuery::new("A", "TOMCAT", 0, 10_000);
        let err = scenario_service()
            .get_filtered_server_map(&query, &signal)
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::Cancelled));
    }

    #[test]
    fn test_query_deserializes_with_defaults() {
        let query: FilteredMapQuery = serde_json::from_str(
            r#"{"application":"A","serviceType":"tomcat","from":0,"to":10}"#,
        )
        .unwrap();
        assert_eq!(query.limit, 10_000);
        assert_eq!(query.service_type.as_str(), "TOMCAT");
        assert!(query.filter.is_none());

        let last: LastFilteredMapQuery =
            serde_json::from_str(r#"{"application":"A","serviceType":"TOMCAT","period":300000,"filter":"errorOnly"}"#)
                .unwrap();
        assert_eq!(last.limit, 1_000_000);
        assert_eq!(last.filter.as_deref(), Some("errorOnly"));
    }
}
