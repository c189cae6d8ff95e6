use serde::Serialize;
use servermap_core::trace::ServiceRef;

use crate::histogram::ResponseHistogram;
use crate::service::FilteredServerMap;
use crate::timeseries::{BucketStats, EntityId};

/// Serializable view of a [`FilteredServerMap`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteredMapResponse {
    pub application: ServiceRef,
    pub from: i64,
    pub to: i64,
    pub filter: Option<String>,
    /// The scan watermark. Equal to `from` when the range was fully scanned.
    pub last_fetched_timestamp: i64,
    /// Whether the scan limit dropped any ids. Can be set even when
    /// `lastFetchedTimestamp` equals `from`.
    pub truncated: bool,
    pub limit: usize,
    pub nodes: Vec<NodeView>,
    pub links: Vec<LinkView>,
    pub time_series_responses: Vec<TimeSeriesView>,
    pub fetch_failures: Vec<FetchFailureView>,
    pub accepted: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    #[serde(flatten)]
    pub node: ServiceRef,
    pub histogram: ResponseHistogram,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkView {
    pub from: ServiceRef,
    pub to: ServiceRef,
    pub histogram: ResponseHistogram,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesView {
    pub entity: EntityId,
    pub resolution_ms: u64,
    pub points: Vec<TimeSeriesPoint>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesPoint {
    pub timestamp: i64,
    #[serde(flatten)]
    pub stats: BucketStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFailureView {
    pub transaction_id: String,
    pub reason: String,
}

impl From<&FilteredServerMap> for FilteredMapResponse {
    fn from(result: &FilteredServerMap) -> Self {
        let map = &result.build.map;

        let nodes = map
            .nodes()
            .iter()
            .map(|(node, histogram)| NodeView {
                node: node.clone(),
                histogram: *histogram,
            })
            .collect();

        let links = map
            .links()
            .iter()
            .map(|(link, histogram)| LinkView {
                from: link.from.clone(),
                to: link.to.clone(),
                histogram: *histogram,
            })
            .collect();

        let store = map.time_series();
        let resolution_ms = store.window().resolution_ms();
        let time_series_responses = store
            .entities()
            .into_iter()
            .map(|entity| TimeSeriesView {
                entity: entity.clone(),
                resolution_ms,
                points: store
                    .series(entity)
                    .map(|(timestamp, stats)| TimeSeriesPoint {
                        timestamp,
                        stats: *stats,
                    })
                    .collect(),
            })
            .collect();

        let fetch_failures = result
            .build
            .fetch_failures
            .iter()
            .map(|failure| FetchFailureView {
                transaction_id: failure.transaction_id().to_string(),
                reason: failure.to_string(),
            })
            .collect();

        Self {
            application: result.application.clone(),
            from: result.range.from(),
            to: result.range.to(),
            filter: result.filter_text.clone(),
            last_fetched_timestamp: result.scan.watermark,
            truncated: result.scan.truncated,
            limit: result.limit,
            nodes,
            links,
            time_series_responses,
            fetch_failures,
            accepted: result.build.accepted,
            rejected: result.build.rejected,
        }
    }
}
