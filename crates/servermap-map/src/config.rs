use std::time::Duration;

/// Bounds applied to a requested scan limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    pub min: usize,
    pub max: usize,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 10_000,
        }
    }
}

impl LimitConfig {
    /// Pin `requested` into `[min, max]`. Out-of-bounds requests are not an
    /// error; callers report the effective limit instead.
    pub fn clamp(&self, requested: i64) -> usize {
        let min = self.min.max(1);
        let max = self.max.max(min);
        if requested <= min as i64 {
            min
        } else {
            usize::try_from(requested).map_or(max, |limit| limit.min(max))
        }
    }
}

/// Time-series bucket sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSeriesConfig {
    /// Upper bound on buckets per entity, whatever the range width.
    pub max_buckets: usize,
    /// Bucket widths are multiples of this.
    pub min_resolution_ms: u64,
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        Self {
            max_buckets: 200,
            min_resolution_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MapConfig {
    pub limit: LimitConfig,
    /// How far behind `now` "last N milliseconds" queries end.
    pub clock_skew_ms: i64,
    pub time_series: TimeSeriesConfig,
    /// Parallel fetch/aggregate workers per query.
    pub workers: usize,
    /// Deadline for the whole scan → build pipeline.
    pub query_timeout: Duration,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            limit: LimitConfig::default(),
            clock_skew_ms: 3_000,
            time_series: TimeSeriesConfig::default(),
            workers: default_workers(),
            query_timeout: Duration::from_secs(30),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_clamp() {
        let limits = LimitConfig { min: 1, max: 100 };
        assert_eq!(limits.clamp(50), 50);
        assert_eq!(limits.clamp(1_000_000), 100);
        assert_eq!(limits.clamp(0), 1);
        assert_eq!(limits.clamp(-5), 1);
        assert_eq!(limits.clamp(i64::MAX), 100);
    }

    #[test]
    fn test_limit_clamp_with_degenerate_bounds() {
        let limits = LimitConfig { min: 0, max: 0 };
        assert_eq!(limits.clamp(10), 1);
    }
}
