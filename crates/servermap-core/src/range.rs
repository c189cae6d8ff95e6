use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::InvalidRangeError;

/// An inclusive time window in epoch milliseconds.
///
/// `from <= to` always holds; the only way to obtain a `Range` is through a
/// validating constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Range {
    from: i64,
    to: i64,
}

impl Range {
    pub fn new(from: i64, to: i64) -> Result<Self, InvalidRangeError> {
        if from > to {
            return Err(InvalidRangeError { from, to });
        }
        Ok(Self { from, to })
    }

    /// The window covering the `period` milliseconds that end `clock_skew_ms`
    /// before `now`.
    ///
    /// Recent index entries may still be in flight from agents whose clocks
    /// run slightly ahead, so the newest edge of the window is held back.
    pub fn last(period: i64, now: i64, clock_skew_ms: i64) -> Result<Self, InvalidRangeError> {
        let to = now.saturating_sub(clock_skew_ms);
        let from = to.saturating_sub(period);
        Self::new(from, to)
    }

    pub fn from(&self) -> i64 {
        self.from
    }

    pub fn to(&self) -> i64 {
        self.to
    }

    /// Width of the window in milliseconds (`to - from`).
    pub fn width(&self) -> u64 {
        self.to.abs_diff(self.from)
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.from <= timestamp && timestamp <= self.to
    }

    /// Pin `timestamp` into the window.
    pub fn clamp(&self, timestamp: i64) -> i64 {
        timestamp.clamp(self.from, self.to)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} ~ {}]", self.from, self.to)
    }
}

impl<'de> Deserialize<'de> for Range {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            from: i64,
            to: i64,
        }

        let raw = Raw::deserialize(deserializer)?;
        Range::new(raw.from, raw.to).map_err(serde::de::Error::custom)
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_inverted_window() {
        let err = Range::new(1000, 500).unwrap_err();
        assert_eq!(err, InvalidRangeError { from: 1000, to: 500 });
    }

    #[test]
    fn test_single_instant_window_is_valid() {
        let range = Range::new(42, 42).unwrap();
        assert_eq!(range.width(), 0);
        assert!(range.contains(42));
    }

    #[test]
    fn test_contains_is_inclusive() {
        let range = Range::new(0, 1000).unwrap();
        assert!(range.contains(0));
        assert!(range.contains(1000));
        assert!(!range.contains(-1));
        assert!(!range.contains(1001));
    }

    #[test]
    fn test_last_holds_back_clock_skew() {
        let range = Range::last(60_000, 1_000_000, 3_000).unwrap();
        assert_eq!(range.to(), 997_000);
        assert_eq!(range.from(), 937_000);
    }

    #[test]
    fn test_last_with_negative_period_fails() {
        assert!(Range::last(-10, 1_000_000, 0).is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Range = serde_json::from_str(r#"{"from":1,"to":2}"#).unwrap();
        assert_eq!(ok, Range::new(1, 2).unwrap());
        assert!(serde_json::from_str::<Range>(r#"{"from":3,"to":2}"#).is_err());
    }
}
