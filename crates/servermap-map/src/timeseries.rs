use std::collections::BTreeMap;

use serde::Serialize;
use servermap_core::range::Range;
use servermap_core::trace::ServiceRef;
use thiserror::Error;

use crate::config::TimeSeriesConfig;
use crate::histogram::{CallOutcome, ResponseHistogram};
use crate::map::LinkKey;

/// Division of a [`Range`] into equal-width buckets.
///
/// The resolution grows with the range width so an entity never has more
/// than `max_buckets` buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    range: Range,
    resolution_ms: u64,
}

impl TimeWindow {
    pub fn new(range: Range, config: &TimeSeriesConfig) -> Self {
        let max_buckets = config.max_buckets.max(1) as u64;
        let min_resolution = config.min_resolution_ms.max(1);
        let span = range.width().saturating_add(1);
        let resolution = span
            .div_ceil(max_buckets)
            .div_ceil(min_resolution)
            .saturating_mul(min_resolution)
            .max(min_resolution);
        Self {
            range,
            resolution_ms: resolution,
        }
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn resolution_ms(&self) -> u64 {
        self.resolution_ms
    }

    pub fn bucket_count(&self) -> usize {
        self.range
            .width()
            .saturating_add(1)
            .div_ceil(self.resolution_ms) as usize
    }

    /// Bucket holding `timestamp`. Timestamps outside the range land in the
    /// first or last bucket.
    pub fn bucket_index(&self, timestamp: i64) -> u32 {
        let offset = self.range.clamp(timestamp).abs_diff(self.range.from());
        (offset / self.resolution_ms) as u32
    }

    /// Start timestamp of bucket `index`.
    pub fn bucket_start(&self, index: u32) -> i64 {
        let offset = u64::from(index).saturating_mul(self.resolution_ms);
        self.range.from().saturating_add_unsigned(offset)
    }
}

/// What a time series is about: a node or a link of the map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EntityId {
    Node(ServiceRef),
    Link(LinkKey),
}

/// Statistics of the calls that fell in one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketStats {
    pub count: u64,
    pub error_count: u64,
    pub histogram: ResponseHistogram,
}

impl BucketStats {
    fn record(&mut self, outcome: CallOutcome) {
        self.count += 1;
        if outcome.error {
            self.error_count += 1;
        }
        self.histogram.record(outcome);
    }

    fn merge(&mut self, other: &BucketStats) {
        self.count += other.count;
        self.error_count += other.error_count;
        self.histogram.merge(&other.histogram);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot merge time series over {left:?} with one over {right:?}")]
pub struct WindowMismatch {
    pub left: TimeWindow,
    pub right: TimeWindow,
}

/// Per-entity, per-bucket call statistics over one [`TimeWindow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSeriesStore {
    window: TimeWindow,
    buckets: BTreeMap<(EntityId, u32), BucketStats>,
}

impl TimeSeriesStore {
    pub fn new(window: TimeWindow) -> Self {
        Self {
            window,
            buckets: BTreeMap::new(),
        }
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    pub fn record(&mut self, entity: &EntityId, timestamp: i64, outcome: CallOutcome) {
        let index = self.window.bucket_index(timestamp);
        self.buckets
            .entry((entity.clone(), index))
            .or_default()
            .record(outcome);
    }

    /// Pointwise sum of two stores over the same window.
    pub fn merge(mut self, other: TimeSeriesStore) -> Result<TimeSeriesStore, WindowMismatch> {
        self.merge_from(other)?;
        Ok(self)
    }

    pub fn merge_from(&mut self, other: TimeSeriesStore) -> Result<(), WindowMismatch> {
        if self.window != other.window {
            return Err(WindowMismatch {
                left: self.window,
                right: other.window,
            });
        }
        for (key, stats) in other.buckets {
            self.buckets.entry(key).or_default().merge(&stats);
        }
        Ok(())
    }

    pub fn get(&self, entity: &EntityId, index: u32) -> Option<&BucketStats> {
        self.buckets.get(&(entity.clone(), index))
    }

    /// Non-empty buckets of `entity` in time order, with their start
    /// timestamps.
    pub fn series<'a>(
        &'a self,
        entity: &EntityId,
    ) -> impl Iterator<Item = (i64, &'a BucketStats)> + use<'a> {
        let window = self.window;
        self.buckets
            .range((entity.clone(), 0)..=(entity.clone(), u32::MAX))
            .map(move |((_, index), stats)| (window.bucket_start(*index), stats))
    }

    /// Entities with at least one bucket, in order.
    pub fn entities(&self) -> Vec<&EntityId> {
        let mut entities: Vec<&EntityId> = Vec::new();
        for (entity, _) in self.buckets.keys() {
            if entities.last() != Some(&entity) {
                entities.push(entity);
            }
        }
        entities
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
