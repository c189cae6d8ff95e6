use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use servermap_core::filter::Filter;
use servermap_core::range::Range;
use servermap_core::storage::TransactionStore;
use servermap_core::trace::TransactionId;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::config::TimeSeriesConfig;
use crate::error::{FetchError, MapError};
use crate::map::{ApplicationMap, MapAccumulator};
use crate::timeseries::TimeWindow;

/// Outcome of one build: the map plus the bookkeeping a caller reports.
#[derive(Debug)]
pub struct MapBuildResult {
    pub map: ApplicationMap,
    /// Sorted by transaction id.
    pub fetch_failures: Vec<FetchError>,
    /// Transactions the filter let through.
    pub accepted: usize,
    pub rejected: usize,
}

/// Fetches transactions, filters them and aggregates the survivors into an
/// [`ApplicationMap`] using a pool of blocking workers.
#[derive(Clone)]
pub struct MapBuilder {
    store: Arc<dyn TransactionStore>,
    workers: usize,
    time_series: TimeSeriesConfig,
}

impl MapBuilder {
    pub fn new(store: Arc<dyn TransactionStore>, workers: usize, time_series: TimeSeriesConfig) -> Self {
        Self {
            store,
            workers: workers.max(1),
            time_series,
        }
    }

    /// Build the map of `ids` over `range`, keeping only transactions
    /// `filter` includes.
    ///
    /// A transaction that cannot be fetched is recorded in
    /// [`MapBuildResult::fetch_failures`] and left out; it never fails the
    /// build. Firing `cancel`, or dropping the returned future, stops the
    /// workers between fetches.
    pub async fn build(
        &self,
        ids: &[TransactionId],
        range: Range,
        filter: Arc<Filter>,
        cancel: &CancelSignal,
    ) -> Result<MapBuildResult, MapError> {
        let window = TimeWindow::new(range, &self.time_series);
        let ids = dedup(ids);

        if cancel.is_cancelled() {
            return Err(MapError::Cancelled);
        }

        let stop = StopFlag::default();
        let _guard = stop.raise_on_drop();

        let workers = self.workers.min(ids.len()).max(1);
        let chunk_size = ids.len().div_ceil(workers).max(1);
        let mut tasks = JoinSet::new();
        for chunk in ids.chunks(chunk_size) {
            let chunk = chunk.to_vec();
            let store = Arc::clone(&self.store);
            let filter = Arc::clone(&filter);
            let stop = stop.clone();
            tasks.spawn_blocking(move || fetch_and_fold(store.as_ref(), &chunk, &filter, window, &stop));
        }
        debug!(transactions = ids.len(), workers = tasks.len(), %range, "map build started");

        let mut combined = Partial::new(window);
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    let partial = joined
                        .map_err(|e| MapError::Worker(e.to_string()))?
                        .ok_or(MapError::Cancelled)?;
                    combined = combined.merge(partial)?;
                }
                _ = cancel.cancelled() => {
                    stop.raise();
                    tasks.abort_all();
                    return Err(MapError::Cancelled);
                }
            }
        }

        let mut fetch_failures = combined.failures;
        fetch_failures.sort_by(|a, b| a.transaction_id().cmp(b.transaction_id()));
        let map = combined.accumulator.finish();

        info!(
            nodes = map.nodes().len(),
            links = map.links().len(),
            accepted = combined.accepted,
            rejected = combined.rejected,
            failures = fetch_failures.len(),
            "map built"
        );

        Ok(MapBuildResult {
            map,
            fetch_failures,
            accepted: combined.accepted,
            rejected: combined.rejected,
        })
    }
}

/// First occurrence of each id, in input order.
fn dedup(ids: &[TransactionId]) -> Vec<TransactionId> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().filter(|id| seen.insert(*id)).cloned().collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Workers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    fn raise(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn raise_on_drop(&self) -> RaiseOnDrop {
        RaiseOnDrop(self.clone())
    }
}

struct RaiseOnDrop(StopFlag);

impl Drop for RaiseOnDrop {
    fn drop(&mut self) {
        self.0.raise();
    }
}

/// One worker's share of the build.
struct Partial {
    accumulator: MapAccumulator,
    failures: Vec<FetchError>,
    accepted: usize,
    rejected: usize,
}

impl Partial {
    fn new(window: TimeWindow) -> Self {
        Self {
            accumulator: MapAccumulator::new(window),
            failures: Vec::new(),
            accepted: 0,
            rejected: 0,
        }
    }

    fn merge(mut self, other: Partial) -> Result<Partial, MapError> {
        self.accumulator = self.accumulator.merge(other.accumulator)?;
        self.failures.extend(other.failures);
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        Ok(self)
    }
}

/// Returns `None` when stopped before the chunk was finished.
fn fetch_and_fold(
    store: &dyn TransactionStore,
    ids: &[TransactionId],
    filter: &Filter,
    window: TimeWindow,
    stop: &StopFlag,
) -> Option<Partial> {
    let mut partial = Partial::new(window);
    for id in ids {
        if stop.is_raised() {
            return None;
        }
        let transaction = match store.get(id) {
            Ok(Some(transaction)) => transaction,
            Ok(None) => {
                warn!(transaction = %id, "transaction listed in index but not stored");
                partial.failures.push(FetchError::NotFound(id.clone()));
                continue;
            }
            Err(source) => {
                warn!(transaction = %id, error = %source, "failed to fetch transaction");
                partial.failures.push(FetchError::Storage {
                    id: id.clone(),
                    source,
                });
                continue;
            }
        };

        if filter.include(&transaction) {
            partial.accumulator.add_transaction(&transaction);
            partial.accepted += 1;
        } else {
            partial.rejected += 1;
        }
    }
    Some(partial)
}
