use serde::Serialize;
use tracing::warn;

use crate::range::Range;
use crate::trace::TransactionId;

/// The result of a scan that was allowed to return at most `limit` items.
///
/// `watermark` is the earliest timestamp this scan fully covered. When the
/// scan exhausted its range it equals `range.from`; otherwise the remainder
/// is obtained by scanning `[range.from, watermark - 1]`.
///
/// Truncation is signalled by `truncated` and the watermark, never by the
/// length of `data`: a withheld tie group can leave fewer than `limit` ids in
/// a truncated result, and exactly `limit` ids may be a complete one.
/// `truncated` with no [`remainder`](Self::remainder) means ids sharing
/// `range.from` were dropped and cannot be recovered by resuming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitedScanResult<T> {
    pub data: T,
    pub watermark: i64,
    pub truncated: bool,
}

impl<T> LimitedScanResult<T> {
    /// A scan that covered its whole range.
    pub fn new(data: T, watermark: i64) -> Self {
        Self {
            data,
            watermark,
            truncated: false,
        }
    }

    /// A scan cut short by its limit.
    pub fn truncated(data: T, watermark: i64) -> Self {
        Self {
            data,
            watermark,
            truncated: true,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> LimitedScanResult<U> {
        LimitedScanResult {
            data: f(self.data),
            watermark: self.watermark,
            truncated: self.truncated,
        }
    }

    /// The range left unscanned, or `None` when nothing before the watermark
    /// remains.
    pub fn remainder(&self, range: &Range) -> Option<Range> {
        if self.watermark <= range.from() {
            return None;
        }
        Range::new(range.from(), self.watermark - 1).ok()
    }
}

/// Apply the bounded-scan protocol to a stream of index candidates.
///
/// `candidates` must yield `(timestamp, id)` pairs newest first, the order a
/// time-keyed index is read in reverse. Candidates outside `range` are
/// skipped. At most `limit` ids are returned (a `limit` of zero is treated as
/// one), so truncation always drops the oldest candidates.
///
/// A cut never splits a group of candidates sharing one millisecond: such a
/// group is withheld as a whole and the watermark is placed just after it, so
/// resuming from the watermark neither loses nor repeats an id. Only when the
/// group alone exceeds `limit` is it cut, since withholding it would make no
/// progress at all.
pub fn limit_scan<I, E>(
    range: &Range,
    limit: usize,
    candidates: I,
) -> Result<LimitedScanResult<Vec<TransactionId>>, E>
where
    I: IntoIterator<Item = Result<(i64, TransactionId), E>>,
{
    let limit = limit.max(1);
    let mut taken: Vec<(i64, TransactionId)> = Vec::with_capacity(limit.min(4096));

    for candidate in candidates {
        let (timestamp, id) = candidate?;
        if !range.contains(timestamp) {
            continue;
        }
        if taken.len() < limit {
            taken.push((timestamp, id));
            continue;
        }

        // One candidate past the limit exists: the scan is truncated.
        let oldest = taken.last().map(|(ts, _)| *ts).unwrap_or(range.to());
        if timestamp < oldest {
            return Ok(LimitedScanResult::truncated(ids_of(taken), oldest));
        }

        let group_start = taken
            .iter()
            .position(|(ts, _)| *ts == oldest)
            .unwrap_or(0);
        if group_start == 0 {
            warn!(
                timestamp = oldest,
                limit, "more index entries share one millisecond than the scan limit allows"
            );
            return Ok(LimitedScanResult::truncated(ids_of(taken), oldest));
        }
        taken.truncate(group_start);
        return Ok(LimitedScanResult::truncated(ids_of(taken), oldest + 1));
    }

    Ok(LimitedScanResult::new(ids_of(taken), range.from()))
}

fn ids_of(entries: Vec<(i64, TransactionId)>) -> Vec<TransactionId> {
    entries.into_iter().map(|(_, id)| id).collect()
}
