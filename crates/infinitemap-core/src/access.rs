//! Per-path access accounting.
//!
//! Read paths bump a counter here; the migration planner and the
//! performance tuner sample the counters to decide which files deserve
//! hotter real estate. The map is concurrent so the hot read path never
//! takes an exclusive lock.

use dashmap::DashMap;

/// Concurrent per-path access counters.
#[derive(Debug, Default)]
pub struct AccessTracker {
    counts: DashMap<String, u64>,
}

impl AccessTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one access to `path` and returns the new count.
    pub fn record(&self, path: &str) -> u64 {
        let mut entry = self.counts.entry(path.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Records `n` accesses to `path` at once.
    pub fn record_many(&self, path: &str, n: u64) -> u64 {
        let mut entry = self.counts.entry(path.to_string()).or_insert(0);
        *entry += n;
        *entry
    }

    /// Current count for `path`.
    #[must_use]
    pub fn count(&self, path: &str) -> u64 {
        self.counts.get(path).map(|e| *e).unwrap_or(0)
    }

    /// Snapshot of all counters, sorted by count descending then path.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut out: Vec<(String, u64)> = self
            .counts
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    /// Paths with at least `threshold` accesses, hottest first.
    #[must_use]
    pub fn hot_paths(&self, threshold: u64) -> Vec<(String, u64)> {
        self.snapshot()
            .into_iter()
            .filter(|(_, count)| *count >= threshold)
            .collect()
    }

    /// Number of tracked paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// True when no accesses have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Clears all counters.
    pub fn clear(&self) {
        self.counts.clear();
    }
}
