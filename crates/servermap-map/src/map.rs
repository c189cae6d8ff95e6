use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use servermap_core::trace::{CallSpan, ServiceRef, Transaction};

use crate::histogram::{CallOutcome, ResponseHistogram};
use crate::timeseries::{EntityId, TimeSeriesStore, TimeWindow, WindowMismatch};

/// Identity of a link: the caller node and the callee node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkKey {
    pub from: ServiceRef,
    pub to: ServiceRef,
}

impl LinkKey {
    pub fn new(from: ServiceRef, to: ServiceRef) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Nodes, links and time series under construction.
///
/// Each worker folds its share of transactions into a private accumulator;
/// accumulators are then combined with [`MapAccumulator::merge`], which is
/// associative and commutative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapAccumulator {
    nodes: BTreeMap<ServiceRef, ResponseHistogram>,
    links: BTreeMap<LinkKey, ResponseHistogram>,
    time_series: TimeSeriesStore,
}

impl MapAccumulator {
    pub fn new(window: TimeWindow) -> Self {
        Self {
            nodes: BTreeMap::new(),
            links: BTreeMap::new(),
            time_series: TimeSeriesStore::new(window),
        }
    }

    /// Fold every edge of `transaction`. Repeats of one edge inside a trace
    /// are separate calls and each is counted.
    pub fn add_transaction(&mut self, transaction: &Transaction) {
        for span in &transaction.spans {
            self.add_call(span);
        }
    }

    pub fn add_call(&mut self, span: &CallSpan) {
        let outcome = CallOutcome::from(span);

        self.nodes.entry(span.caller.clone()).or_default();
        self.nodes
            .entry(span.callee.clone())
            .or_default()
            .record(outcome);

        let link = LinkKey::new(span.caller.clone(), span.callee.clone());
        self.links.entry(link.clone()).or_default().record(outcome);

        self.time_series
            .record(&EntityId::Node(span.callee.clone()), span.timestamp, outcome);
        self.time_series
            .record(&EntityId::Link(link), span.timestamp, outcome);
    }

    pub fn merge(mut self, other: MapAccumulator) -> Result<MapAccumulator, WindowMismatch> {
        self.time_series.merge_from(other.time_series)?;
        for (node, histogram) in other.nodes {
            self.nodes.entry(node).or_default().merge(&histogram);
        }
        for (link, histogram) in other.links {
            self.links.entry(link).or_default().merge(&histogram);
        }
        Ok(self)
    }

    pub fn window(&self) -> &TimeWindow {
        self.time_series.window()
    }

    pub fn finish(self) -> ApplicationMap {
        ApplicationMap {
            nodes: self.nodes,
            links: self.links,
            time_series: self.time_series,
        }
    }
}

/// The finished graph of services and calls for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationMap {
    nodes: BTreeMap<ServiceRef, ResponseHistogram>,
    links: BTreeMap<LinkKey, ResponseHistogram>,
    time_series: TimeSeriesStore,
}

impl ApplicationMap {
    /// Nodes with the histogram of calls that terminated at each.
    pub fn nodes(&self) -> &BTreeMap<ServiceRef, ResponseHistogram> {
        &self.nodes
    }

    pub fn links(&self) -> &BTreeMap<LinkKey, ResponseHistogram> {
        &self.links
    }

    pub fn time_series(&self) -> &TimeSeriesStore {
        &self.time_series
    }

    pub fn node(&self, node: &ServiceRef) -> Option<&ResponseHistogram> {
        self.nodes.get(node)
    }

    pub fn link(&self, from: &ServiceRef, to: &ServiceRef) -> Option<&ResponseHistogram> {
        self.links.get(&LinkKey::new(from.clone(), to.clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use servermap_core::range::Range;
    use servermap_core::trace::TransactionId;

    use super::*;
    use crate::config::TimeSeriesConfig;

    fn window() -> TimeWindow {
        TimeWindow::new(Range::new(0, 1000).unwrap(), &TimeSeriesConfig::default())
    }

    fn call(from: &str, to: &str, elapsed_ms: u64, error: bool) -> CallSpan {
        CallSpan {
            caller: ServiceRef::new(from, "TOMCAT"),
            callee: ServiceRef::new(to, "TOMCAT"),
            timestamp: 100,
            elapsed_ms,
            error,
            rpc: None,
            endpoint: None,
        }
    }

    fn transaction(seq: i64, spans: Vec<CallSpan>) -> Transaction {
        Transaction {
            transaction_id: TransactionId::new("agent", 0, seq),
            start_time: 100,
            spans,
        }
    }

    fn node(name: &str) -> ServiceRef {
        ServiceRef::new(name, "TOMCAT")
    }

    #[test]
    fn test_two_transactions_build_three_nodes_two_links() {
        let mut acc = MapAccumulator::new(window());
        acc.add_transaction(&transaction(1, vec![call("A", "B", 200, false)]));
        acc.add_transaction(&transaction(2, vec![call("A", "C", 300, true)]));
        let map = acc.finish();

        let nodes: Vec<&str> = map.nodes().keys().map(|n| n.application.as_str()).collect();
        assert_eq!(nodes, vec!["A", "B", "C"]);
        assert_eq!(map.links().len(), 2);

        let ab = map.link(&node("A"), &node("B")).unwrap();
        assert_eq!((ab.success_count(), ab.error_count()), (1, 0));
        let ac = map.link(&node("A"), &node("C")).unwrap();
        assert_eq!((ac.success_count(), ac.error_count()), (0, 1));

        // The caller has no calls terminating at it.
        assert_eq!(map.node(&node("A")).unwrap().total_count(), 0);
        assert_eq!(map.node(&node("C")).unwrap().error_count(), 1);
    }

    #[test]
    fn test_repeated_edge_in_one_trace_counts_each_call() {
        let mut acc = MapAccumulator::new(window());
        acc.add_transaction(&transaction(
            1,
            vec![call("A", "B", 10, false), call("A", "B", 20, false)],
        ));
        let map = acc.finish();
        assert_eq!(map.link(&node("A"), &node("B")).unwrap().total_count(), 2);
        assert_eq!(map.nodes().len(), 2);
    }

    #[test]
    fn test_time_series_tracks_callee_and_link() {
        let mut acc = MapAccumulator::new(window());
        acc.add_call(&call("A", "B", 10, true));
        let map = acc.finish();

        let node_series = EntityId::Node(node("B"));
        let link_series = EntityId::Link(LinkKey::new(node("A"), node("B")));
        assert_eq!(map.time_series().get(&node_series, 0).unwrap().error_count, 1);
        assert_eq!(map.time_series().get(&link_series, 0).unwrap().count, 1);
        assert!(map.time_series().get(&EntityId::Node(node("A")), 0).is_none());
    }

    #[test]
    fn test_merge_equals_single_pass() {
        let t1 = transaction(1, vec![call("A", "B", 10, false), call("B", "C", 5, false)]);
        let t2 = transaction(2, vec![call("A", "B", 4_000, true)]);

        let mut single = MapAccumulator::new(window());
        single.add_transaction(&t1);
        single.add_transaction(&t2);

        let mut left = MapAccumulator::new(window());
        left.add_transaction(&t2);
        let mut right = MapAccumulator::new(window());
        right.add_transaction(&t1);

        assert_eq!(left.merge(right).unwrap(), single);
    }
}
