//! Cache tuning advisor.
//!
//! Watches access events, identifies the working set, and recommends a
//! cache size and eviction policy. The tuner applies recommendations
//! through [`CacheOptimizer::auto_tune`] and warms the cache with the
//! current hot set.

use crate::cache::{CacheStats, ClusterCache, EvictionPolicy};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

/// Default target hit rate.
pub const DEFAULT_TARGET_HIT_RATE: f64 = 0.85;

/// Safety margin applied to the working-set size recommendation.
const WORKING_SET_SAFETY_MARGIN: f64 = 1.5;

/// Above this share of temporally-regular traffic, LRU wins; below its
/// complement, LFU; in between, ARC.
const TEMPORAL_PATTERN_THRESHOLD: f64 = 0.6;

/// Minimum accesses for working-set membership.
const WORKING_SET_MIN_ACCESSES: u64 = 3;

/// Analyzed access pattern for one key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPattern {
    /// Cache key.
    pub key: String,
    /// Accesses observed.
    pub access_count: u64,
    /// Seconds since the last access.
    pub idle_seconds: f64,
    /// Mean seconds between accesses; 0 with fewer than two accesses.
    pub avg_interval: f64,
    /// Recency-decayed log-frequency priority; higher is hotter.
    pub priority: f64,
}

/// Changes applied by an auto-tune pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuneChanges {
    /// New capacity in bytes, when resized.
    pub resized_to: Option<u64>,
    /// New eviction policy, when switched.
    pub policy: Option<EvictionPolicy>,
    /// Keys warmed into the cache.
    pub warmed_keys: usize,
}

#[derive(Debug, Default)]
struct KeyHistory {
    count: u64,
    timestamps: Vec<f64>,
}

/// Access-pattern analyzer and cache tuner.
#[derive(Debug)]
pub struct CacheOptimizer {
    target_hit_rate: f64,
    /// Average bytes per cached entry, used to convert working-set entries
    /// into a byte capacity.
    entry_size_hint: u64,
    epoch: Instant,
    history: FxHashMap<String, KeyHistory>,
}

impl CacheOptimizer {
    /// Creates an optimizer aiming for `target_hit_rate`, sizing capacity
    /// with `entry_size_hint` bytes per entry.
    #[must_use]
    pub fn new(target_hit_rate: f64, entry_size_hint: u64) -> Self {
        Self {
            target_hit_rate: target_hit_rate.clamp(0.0, 1.0),
            entry_size_hint: entry_size_hint.max(1),
            epoch: Instant::now(),
            history: FxHashMap::default(),
        }
    }

    /// The configured hit-rate target.
    #[must_use]
    pub fn target_hit_rate(&self) -> f64 {
        self.target_hit_rate
    }

    /// Records an access event for analysis.
    pub fn record_access(&mut self, key: &str) {
        let now = self.epoch.elapsed().as_secs_f64();
        self.record_access_at(key, now);
    }

    /// Records an access with an explicit timestamp (seconds since the
    /// optimizer's epoch). Lets replayed traces carry their own clock.
    pub fn record_access_at(&mut self, key: &str, at_seconds: f64) {
        let entry = self.history.entry(key.to_string()).or_default();
        entry.count += 1;
        entry.timestamps.push(at_seconds);
    }

    /// Analyzes all recorded access patterns, hottest first.
    #[must_use]
    pub fn analyze_access_patterns(&self) -> Vec<AccessPattern> {
        let now = self.epoch.elapsed().as_secs_f64();
        let mut out: Vec<AccessPattern> = self
            .history
            .iter()
            .map(|(key, history)| {
                let last = history.timestamps.last().copied().unwrap_or(0.0);
                let idle = (now - last).max(0.0);
                let avg_interval = if history.timestamps.len() > 1 {
                    let span = last - history.timestamps[0];
                    span / (history.timestamps.len() - 1) as f64
                } else {
                    0.0
                };
                // Log-scaled frequency decayed by idle time (minutes).
                #[allow(clippy::cast_precision_loss)]
                let priority = (history.count as f64).ln_1p() / (1.0 + idle / 60.0);
                AccessPattern {
                    key: key.clone(),
                    access_count: history.count,
                    idle_seconds: idle,
                    avg_interval,
                    priority,
                }
            })
            .collect();
        out.sort_by(|a, b| b.priority.total_cmp(&a.priority).then_with(|| a.key.cmp(&b.key)));
        out
    }

    /// Keys accessed at least three times: the working set.
    #[must_use]
    pub fn working_set(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .history
            .iter()
            .filter(|(_, h)| h.count >= WORKING_SET_MIN_ACCESSES)
            .map(|(k, _)| k.clone())
            .collect();
        out.sort();
        out
    }

    /// Recommended capacity in bytes: working set × safety margin ×
    /// per-entry hint, never below one entry.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn recommend_cache_size(&self) -> u64 {
        let working = self.working_set().len().max(1);
        let entries = (working as f64 * WORKING_SET_SAFETY_MARGIN).ceil() as u64;
        entries * self.entry_size_hint
    }

    /// Recommends an eviction policy from the temporal/frequency balance
    /// of the recorded traffic.
    #[must_use]
    pub fn recommend_eviction_policy(&self) -> EvictionPolicy {
        let patterns = self.analyze_access_patterns();
        if patterns.is_empty() {
            return EvictionPolicy::Lru;
        }
        let mut temporal = 0.0f64;
        let mut frequency = 0.0f64;
        for pattern in &patterns {
            #[allow(clippy::cast_precision_loss)]
            let weight = pattern.access_count as f64;
            if pattern.avg_interval > 0.0 {
                let variance = self.interval_variance(&pattern.key);
                if variance < pattern.avg_interval * 0.5 {
                    temporal += weight;
                }
            }
            if pattern.access_count > 5 {
                frequency += weight;
            }
        }
        let total = temporal + frequency;
        if total <= f64::EPSILON {
            return EvictionPolicy::Lru;
        }
        let temporal_ratio = temporal / total;
        if temporal_ratio > TEMPORAL_PATTERN_THRESHOLD {
            EvictionPolicy::Lru
        } else if temporal_ratio < 1.0 - TEMPORAL_PATTERN_THRESHOLD {
            EvictionPolicy::Lfu
        } else {
            EvictionPolicy::Arc
        }
    }

    /// Mean absolute deviation of a key's access intervals.
    fn interval_variance(&self, key: &str) -> f64 {
        let Some(history) = self.history.get(key) else {
            return f64::INFINITY;
        };
        if history.timestamps.len() < 3 {
            return f64::INFINITY;
        }
        let intervals: Vec<f64> = history
            .timestamps
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect();
        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        intervals.iter().map(|i| (i - mean).abs()).sum::<f64>() / intervals.len() as f64
    }

    /// Applies recommendations when the cache underperforms its target:
    /// resize toward the working set and switch the eviction policy.
    pub fn auto_tune(&self, cache: &ClusterCache) -> TuneChanges {
        let stats = cache.stats();
        let mut changes = TuneChanges::default();
        if stats.hit_rate >= self.target_hit_rate && stats.hits + stats.misses > 0 {
            return changes;
        }
        let recommended = self.recommend_cache_size();
        if recommended > stats.max_size {
            cache.resize(recommended);
            changes.resized_to = Some(recommended);
        }
        let policy = self.recommend_eviction_policy();
        if policy != cache.policy() {
            cache.set_policy(policy);
            changes.policy = Some(policy);
        }
        debug!(?changes, "cache auto-tune applied");
        changes
    }

    /// Warms the cache with the hottest working-set keys through the
    /// supplied loader. Returns the number of keys actually cached.
    pub fn warm_cache<F>(&self, cache: &ClusterCache, limit: usize, mut loader: F) -> usize
    where
        F: FnMut(&str) -> Option<Vec<u8>>,
    {
        let mut warmed = 0usize;
        for pattern in self.analyze_access_patterns().into_iter().take(limit) {
            if cache.get(&pattern.key).is_some() {
                continue;
            }
            if let Some(data) = loader(&pattern.key) {
                if cache.set(&pattern.key, data) {
                    warmed += 1;
                }
            }
        }
        warmed
    }

    /// Point-in-time view of the cache the optimizer would report on.
    #[must_use]
    pub fn observed_stats(cache: &ClusterCache) -> CacheStats {
        cache.stats()
    }

    /// Forgets all recorded accesses.
    pub fn reset(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer() -> CacheOptimizer {
        CacheOptimizer::new(DEFAULT_TARGET_HIT_RATE, 4096)
    }

    #[test]
    fn test_working_set_threshold() {
        let mut opt = optimizer();
        for _ in 0..3 {
            opt.record_access("hot");
        }
        opt.record_access("cold");
        assert_eq!(opt.working_set(), vec!["hot".to_string()]);
    }

    #[test]
    fn test_size_recommendation_scales_with_working_set() {
        let mut opt = optimizer();
        // Empty history still recommends at least one entry.
        assert_eq!(opt.recommend_cache_size(), 2 * 4096);
        for key in ["a", "b", "c", "d"] {
            for _ in 0..5 {
                opt.record_access(key);
            }
        }
        // 4 entries × 1.5 margin = 6 entries.
        assert_eq!(opt.recommend_cache_size(), 6 * 4096);
    }

    #[test]
    fn test_patterns_sorted_by_priority() {
        let mut opt = optimizer();
        for _ in 0..20 {
            opt.record_access("busy");
        }
        opt.record_access("quiet");
        let patterns = opt.analyze_access_patterns();
        assert_eq!(patterns[0].key, "busy");
        assert!(patterns[0].priority > patterns[1].priority);
        assert_eq!(patterns[0].access_count, 20);
    }

    #[test]
    fn test_policy_defaults_to_lru() {
        let opt = optimizer();
        assert_eq!(opt.recommend_eviction_policy(), EvictionPolicy::Lru);
    }

    #[test]
    fn test_frequency_heavy_traffic_prefers_lfu() {
        let mut opt = optimizer();
        // Bursty, frequency-dominated traffic: irregular rhythm, high
        // volume. Intervals 1, 9, 0.5, 20, ... defeat the temporal test.
        let bursts = [0.0, 1.0, 10.0, 10.5, 30.5, 31.0, 55.0, 80.0];
        for &at in &bursts {
            opt.record_access_at("popular", at);
        }
        let policy = opt.recommend_eviction_policy();
        assert_eq!(policy, EvictionPolicy::Lfu);
    }

    #[test]
    fn test_metronome_traffic_prefers_lru() {
        let mut opt = optimizer();
        // Perfectly regular low-volume traffic is temporal, not
        // frequency-driven.
        for i in 0..5 {
            opt.record_access_at("steady", f64::from(i) * 10.0);
        }
        assert_eq!(opt.recommend_eviction_policy(), EvictionPolicy::Lru);
    }

    #[test]
    fn test_auto_tune_resizes_underperforming_cache() {
        let mut opt = optimizer();
        let cache = ClusterCache::new(4096);
        // Misses only → hit rate 0 < target.
        for key in ["a", "b", "c", "d", "e"] {
            for _ in 0..4 {
                opt.record_access(key);
            }
            let _ = cache.get(key);
        }
        let changes = opt.auto_tune(&cache);
        let resized = changes.resized_to.expect("cache should grow");
        assert!(resized > 4096);
        assert_eq!(cache.max_size(), resized);
    }

    #[test]
    fn test_auto_tune_leaves_healthy_cache_alone() {
        let opt = optimizer();
        let cache = ClusterCache::new(1 << 20);
        cache.set("k", vec![1, 2, 3]);
        for _ in 0..100 {
            let _ = cache.get("k");
        }
        let changes = opt.auto_tune(&cache);
        assert!(changes.resized_to.is_none());
        assert!(changes.policy.is_none());
    }

    #[test]
    fn test_warm_cache_loads_hot_keys() {
        let mut opt = optimizer();
        for _ in 0..10 {
            opt.record_access("lib/libc.so:0:4096");
        }
        for _ in 0..5 {
            opt.record_access("boot/vmlinuz:0:4096");
        }
        let cache = ClusterCache::new(1 << 20);
        let warmed = opt.warm_cache(&cache, 10, |key| Some(key.as_bytes().to_vec()));
        assert_eq!(warmed, 2);
        assert!(cache.get("lib/libc.so:0:4096").is_some());
        // Already-cached keys are not re-warmed.
        let warmed_again = opt.warm_cache(&cache, 10, |_| Some(vec![0u8]));
        assert_eq!(warmed_again, 0);
    }
}
