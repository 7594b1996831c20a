//! Cluster cache with access-pattern tracking and sequential prefetch.
//!
//! A mutex-guarded recency-ordered map fronts all cluster reads. Keys are
//! strings uniquely identifying a cluster range (`"<path>:<offset>:<len>"`).
//! Eviction follows the configured [`EvictionPolicy`]; LRU is the default
//! and the one the optimizer falls back to.
//!
//! The [`AccessPatternTracker`] watches per-file offsets: three or more
//! strictly-increasing accesses with a uniform stride (±10%) mark a file
//! sequential, at which point the owner may stage the predicted next range
//! in the prefetch queue.

use crate::error::Result;

use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::trace;

/// Default cache capacity: 10 MiB.
pub const DEFAULT_CACHE_BYTES: u64 = 10 * 1024 * 1024;

/// Default window of remembered offsets per file.
pub const DEFAULT_PATTERN_WINDOW: usize = 10;

/// Stride tolerance for sequential detection (±10%).
const STRIDE_TOLERANCE: f64 = 0.1;

/// Eviction policies the optimizer can select between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently used (default).
    Lru,
    /// Least frequently used.
    Lfu,
    /// Adaptive: single-use entries go first, then recency order.
    Arc,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Lru
    }
}

impl EvictionPolicy {
    /// Policy name as serialized ("lru", "lfu", "arc").
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "lru",
            EvictionPolicy::Lfu => "lfu",
            EvictionPolicy::Arc => "arc",
        }
    }
}

/// A cached cluster range.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Key identifying the range.
    pub key: String,
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Payload length, counted against the capacity.
    pub size: u64,
    /// Hits on this entry since insertion.
    pub access_count: u64,
    /// Insertion time.
    pub created_at: Instant,
    /// Last hit time.
    pub last_accessed: Instant,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookup hits.
    pub hits: u64,
    /// Lookup misses.
    pub misses: u64,
    /// Entries evicted to make room.
    pub evictions: u64,
    /// `hits / (hits + misses)`, 0 when nothing was looked up.
    pub hit_rate: f64,
    /// Live entries.
    pub count: usize,
    /// Live bytes.
    pub size: u64,
    /// Capacity in bytes.
    pub max_size: u64,
    /// Prefetched ranges that were actually consumed.
    pub prefetch_hits: u64,
}

#[derive(Debug)]
struct CacheInner {
    /// Insertion/recency-ordered entries; front is coldest.
    map: IndexMap<String, CacheEntry>,
    current_size: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    prefetch_hits: u64,
    prefetch_queue: Vec<(String, Vec<u8>)>,
    tracker: AccessPatternTracker,
    policy: EvictionPolicy,
}

/// Thread-safe cluster cache.
#[derive(Debug)]
pub struct ClusterCache {
    inner: Mutex<CacheInner>,
    max_size: Mutex<u64>,
}

impl ClusterCache {
    /// Creates a cache holding at most `max_size` bytes.
    #[must_use]
    pub fn new(max_size: u64) -> Self {
        Self::with_policy(max_size, EvictionPolicy::default())
    }

    /// Creates a cache with an explicit eviction policy.
    #[must_use]
    pub fn with_policy(max_size: u64, policy: EvictionPolicy) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: IndexMap::new(),
                current_size: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                prefetch_hits: 0,
                prefetch_queue: Vec::new(),
                tracker: AccessPatternTracker::new(DEFAULT_PATTERN_WINDOW),
                policy,
            }),
            max_size: Mutex::new(max_size),
        }
    }

    /// Current capacity in bytes.
    #[must_use]
    pub fn max_size(&self) -> u64 {
        *self.max_size.lock()
    }

    /// Resizes the capacity, evicting until the new bound holds.
    pub fn resize(&self, new_max: u64) {
        {
            let mut max = self.max_size.lock();
            *max = new_max;
        }
        let mut inner = self.inner.lock();
        while inner.current_size > new_max {
            if Self::evict_one(&mut inner).is_none() {
                break;
            }
        }
    }

    /// Switches the eviction policy.
    pub fn set_policy(&self, policy: EvictionPolicy) {
        self.inner.lock().policy = policy;
    }

    /// Active eviction policy.
    #[must_use]
    pub fn policy(&self) -> EvictionPolicy {
        self.inner.lock().policy
    }

    /// Fetches a cached range, refreshing its recency.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        if !inner.map.contains_key(key) {
            inner.misses += 1;
            return None;
        }
        // Move to the back of the recency order.
        let mut entry = inner.map.shift_remove(key)?;
        entry.access_count += 1;
        entry.last_accessed = Instant::now();
        let data = entry.data.clone();
        inner.map.insert(key.to_string(), entry);
        inner.hits += 1;
        Some(data)
    }

    /// Stores a range, evicting colder entries until it fits. Items larger
    /// than the capacity are rejected.
    pub fn set(&self, key: &str, data: Vec<u8>) -> bool {
        let size = data.len() as u64;
        let max = self.max_size();
        if max == 0 || size > max {
            return false;
        }
        let mut inner = self.inner.lock();
        if let Some(old) = inner.map.shift_remove(key) {
            inner.current_size -= old.size;
        }
        while inner.current_size + size > max {
            if Self::evict_one(&mut inner).is_none() {
                break;
            }
        }
        let now = Instant::now();
        inner.map.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                data,
                size,
                access_count: 1,
                created_at: now,
                last_accessed: now,
            },
        );
        inner.current_size += size;
        true
    }

    /// Frees at least `needed` bytes, or empties the cache trying. Returns
    /// the bytes freed.
    pub fn evict(&self, needed: u64) -> u64 {
        let mut inner = self.inner.lock();
        if needed == 0 {
            let freed = inner.current_size;
            let count = inner.map.len() as u64;
            inner.map.clear();
            inner.current_size = 0;
            inner.evictions += count;
            return freed;
        }
        let mut freed = 0u64;
        while freed < needed {
            match Self::evict_one(&mut inner) {
                Some(bytes) => freed += bytes,
                None => break,
            }
        }
        freed
    }

    /// Evicts one entry per the active policy; returns its size.
    fn evict_one(inner: &mut CacheInner) -> Option<u64> {
        if inner.map.is_empty() {
            return None;
        }
        let index = match inner.policy {
            EvictionPolicy::Lru => 0,
            EvictionPolicy::Lfu => inner
                .map
                .values()
                .enumerate()
                .min_by_key(|(_, e)| e.access_count)
                .map(|(i, _)| i)?,
            EvictionPolicy::Arc => inner
                .map
                .values()
                .position(|e| e.access_count <= 1)
                .unwrap_or(0),
        };
        let (_, entry) = inner.map.shift_remove_index(index)?;
        inner.current_size -= entry.size;
        inner.evictions += 1;
        trace!(key = %entry.key, size = entry.size, "evicted");
        Some(entry.size)
    }

    /// Removes one entry; returns whether it existed. Not counted as an
    /// eviction.
    pub fn remove(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.map.shift_remove(key) {
            Some(entry) => {
                inner.current_size -= entry.size;
                true
            }
            None => false,
        }
    }

    /// Empties the cache without counting evictions. Returns bytes freed.
    pub fn clear(&self) -> u64 {
        let mut inner = self.inner.lock();
        let freed = inner.current_size;
        inner.map.clear();
        inner.current_size = 0;
        inner.prefetch_queue.clear();
        freed
    }

    /// Point-in-time statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if lookups > 0 {
            inner.hits as f64 / lookups as f64
        } else {
            0.0
        };
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate,
            count: inner.map.len(),
            size: inner.current_size,
            max_size: self.max_size(),
            prefetch_hits: inner.prefetch_hits,
        }
    }

    /// Records an access for pattern detection and reports whether the file
    /// now looks sequential (prefetch worthwhile).
    pub fn should_prefetch(&self, path: &str, offset: u64) -> bool {
        let mut inner = self.inner.lock();
        inner.tracker.record_access(path, offset);
        inner.tracker.is_sequential(path)
    }

    /// Stages a prefetched payload. Duplicate keys are ignored; prefetches
    /// never evict live entries.
    pub fn queue_prefetch(&self, key: &str, data: Vec<u8>) {
        let mut inner = self.inner.lock();
        if inner.prefetch_queue.iter().any(|(k, _)| k == key) {
            return;
        }
        inner.prefetch_queue.push((key.to_string(), data));
    }

    /// Consumes a staged prefetch, if present.
    #[must_use]
    pub fn get_prefetched(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let index = inner.prefetch_queue.iter().position(|(k, _)| k == key)?;
        let (_, data) = inner.prefetch_queue.remove(index);
        inner.prefetch_hits += 1;
        Some(data)
    }

    /// Predicted next offset for a sequentially-read file.
    #[must_use]
    pub fn predicted_next_offset(&self, path: &str) -> Option<u64> {
        self.inner.lock().tracker.predict_next_offset(path)
    }

    /// Detected stride for a sequentially-read file.
    #[must_use]
    pub fn detected_stride(&self, path: &str) -> Option<u64> {
        self.inner.lock().tracker.detected_stride(path)
    }

    /// Drops all staged prefetches; returns how many were dropped.
    pub fn clear_prefetch_queue(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.prefetch_queue.len();
        inner.prefetch_queue.clear();
        count
    }

    /// Keys currently cached, coldest first.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().map.keys().cloned().collect()
    }
}

/// Composes the canonical cache key for a cluster range of a file.
#[must_use]
pub fn range_key(path: &str, offset: u64, len: usize) -> String {
    format!("{path}:{offset}:{len}")
}

/// Tracks per-file access offsets to detect sequential reads.
#[derive(Debug, Default)]
pub struct AccessPatternTracker {
    window: usize,
    history: FxHashMap<String, VecDeque<u64>>,
}

impl AccessPatternTracker {
    /// Creates a tracker remembering the last `window` offsets per file.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(3),
            history: FxHashMap::default(),
        }
    }

    /// Records an access offset for a file.
    pub fn record_access(&mut self, path: &str, offset: u64) {
        let history = self.history.entry(path.to_string()).or_default();
        history.push_back(offset);
        while history.len() > self.window {
            history.pop_front();
        }
    }

    /// True when the last three or more offsets are strictly increasing
    /// with a stride uniform to ±10%.
    #[must_use]
    pub fn is_sequential(&self, path: &str) -> bool {
        let Some(history) = self.history.get(path) else {
            return false;
        };
        if history.len() < 3 {
            return false;
        }
        let offsets: Vec<u64> = history.iter().copied().collect();
        let first_stride = match offsets[1].checked_sub(offsets[0]) {
            Some(s) if s > 0 => s,
            _ => return false,
        };
        #[allow(clippy::cast_precision_loss)]
        let tolerance = first_stride as f64 * STRIDE_TOLERANCE;
        for pair in offsets.windows(2) {
            let stride = match pair[1].checked_sub(pair[0]) {
                Some(s) if s > 0 => s,
                _ => return false,
            };
            #[allow(clippy::cast_precision_loss)]
            let delta = (stride as f64 - first_stride as f64).abs();
            if delta > tolerance {
                return false;
            }
        }
        true
    }

    /// Predicted next offset: `last + stride`, when sequential.
    #[must_use]
    pub fn predict_next_offset(&self, path: &str) -> Option<u64> {
        let stride = self.detected_stride(path)?;
        let history = self.history.get(path)?;
        history.back().map(|last| last + stride)
    }

    /// The most recent stride, when the file reads sequentially.
    #[must_use]
    pub fn detected_stride(&self, path: &str) -> Option<u64> {
        if !self.is_sequential(path) {
            return None;
        }
        let history = self.history.get(path)?;
        if history.len() < 2 {
            return None;
        }
        let last = *history.back()?;
        let prev = *history.get(history.len() - 2)?;
        Some(last - prev)
    }

    /// Forgets one file's history, or all histories.
    pub fn clear(&mut self, path: Option<&str>) {
        match path {
            Some(p) => {
                self.history.remove(p);
            }
            None => self.history.clear(),
        }
    }
}

/// Reads a cluster range through the cache, loading on miss. The loader is
/// only invoked when both the cache and the prefetch queue miss.
///
/// # Errors
///
/// Propagates loader failures.
pub fn read_through<F>(cache: &ClusterCache, key: &str, loader: F) -> Result<Vec<u8>>
where
    F: FnOnce() -> Result<Vec<u8>>,
{
    if let Some(data) = cache.get(key) {
        return Ok(data);
    }
    if let Some(data) = cache.get_prefetched(key) {
        cache.set(key, data.clone());
        return Ok(data);
    }
    let data = loader()?;
    cache.set(key, data.clone());
    Ok(data)
}
