use serde::Serialize;
use servermap_core::trace::CallSpan;

/// Outcome of one call: how long it took and whether it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOutcome {
    pub elapsed_ms: u64,
    pub error: bool,
}

impl From<&CallSpan> for CallOutcome {
    fn from(span: &CallSpan) -> Self {
        Self {
            elapsed_ms: span.elapsed_ms,
            error: span.error,
        }
    }
}

/// Response-time histogram with fixed slots.
///
/// Failed calls are counted in `error` only, never in a time slot. Every
/// field merges by addition except `max_elapsed_ms`, which merges by max, so
/// merging is commutative and associative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResponseHistogram {
    #[serde(rename = "1s")]
    pub fast: u64,
    #[serde(rename = "3s")]
    pub normal: u64,
    #[serde(rename = "5s")]
    pub slow: u64,
    #[serde(rename = "Slow")]
    pub very_slow: u64,
    #[serde(rename = "Error")]
    pub error: u64,
    #[serde(rename = "totalElapsed")]
    pub total_elapsed_ms: u64,
    #[serde(rename = "maxElapsed")]
    pub max_elapsed_ms: u64,
}

impl ResponseHistogram {
    pub const FAST_MS: u64 = 1_000;
    pub const NORMAL_MS: u64 = 3_000;
    pub const SLOW_MS: u64 = 5_000;

    pub fn record(&mut self, outcome: CallOutcome) {
        if outcome.error {
            self.error += 1;
        } else if outcome.elapsed_ms <= Self::FAST_MS {
            self.fast += 1;
        } else if outcome.elapsed_ms <= Self::NORMAL_MS {
            self.normal += 1;
        } else if outcome.elapsed_ms <= Self::SLOW_MS {
            self.slow += 1;
        } else {
            self.very_slow += 1;
        }
        self.total_elapsed_ms = self.total_elapsed_ms.saturating_add(outcome.elapsed_ms);
        self.max_elapsed_ms = self.max_elapsed_ms.max(outcome.elapsed_ms);
    }

    pub fn merge(&mut self, other: &ResponseHistogram) {
        self.fast += other.fast;
        self.normal += other.normal;
        self.slow += other.slow;
        self.very_slow += other.very_slow;
        self.error += other.error;
        self.total_elapsed_ms = self.total_elapsed_ms.saturating_add(other.total_elapsed_ms);
        self.max_elapsed_ms = self.max_elapsed_ms.max(other.max_elapsed_ms);
    }

    pub fn total_count(&self) -> u64 {
        self.fast + self.normal + self.slow + self.very_slow + self.error
    }

    pub fn error_count(&self) -> u64 {
        self.error
    }

    pub fn success_count(&self) -> u64 {
        self.total_count() - self.error
    }

    pub fn mean_elapsed_ms(&self) -> Option<u64> {
        self.total_elapsed_ms.checked_div(self.total_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(elapsed_ms: u64) -> CallOutcome {
        CallOutcome {
            elapsed_ms,
            error: false,
        }
    }

    #[test]
    fn test_slots() {
        let mut histogram = ResponseHistogram::default();
        for elapsed in [0, 1_000, 1_001, 3_000, 5_000, 5_001] {
            histogram.record(ok(elapsed));
        }
        histogram.record(CallOutcome {
            elapsed_ms: 10,
            error: true,
        });

        assert_eq!(histogram.fast, 2);
        assert_eq!(histogram.normal, 2);
        assert_eq!(histogram.slow, 1);
        assert_eq!(histogram.very_slow, 1);
        assert_eq!(histogram.error, 1);
        assert_eq!(histogram.total_count(), 7);
        assert_eq!(histogram.success_count(), 6);
        assert_eq!(histogram.max_elapsed_ms, 5_001);
    }

    #[test]
    fn test_merge_is_commutative() {
        let mut a = ResponseHistogram::default();
        a.record(ok(200));
        a.record(ok(7_000));
        let mut b = ResponseHistogram::default();
        b.record(CallOutcome {
            elapsed_ms: 300,
            error: true,
        });

        let mut ab = a;
        ab.merge(&b);
        let mut ba = b;
        ba.merge(&a);
        assert_eq!(ab, ba);
        assert_eq!(ab.total_count(), 3);
        assert_eq!(ab.mean_elapsed_ms(), Some(2_500));
    }

    #[test]
    fn test_empty_has_no_mean() {
        assert_eq!(ResponseHistogram::default().mean_elapsed_ms(), None);
    }

    #[test]
    fn test_serializes_slot_names() {
        let mut histogram = ResponseHistogram::default();
        histogram.record(ok(10));
        let json = serde_json::to_value(histogram).unwrap();
        assert_eq!(json["1s"], 1);
        assert_eq!(json["Error"], 0);
        assert_eq!(json["maxElapsed"], 10);
    }
}
