//! Performance tuning.
//!
//! The tuner samples access counters and cache statistics, then drives the
//! enabled subsystem tuners: cache resize/policy/warm-up, zone rebalancing
//! through the migration planner and physical relocator, and cluster
//! fragmentation reporting. `tune_all` brackets the pass with before/after
//! metrics and records the outcome in its history.

use crate::access::AccessTracker;
use crate::cache::{range_key, ClusterCache};
use crate::cache_optimizer::{CacheOptimizer, TuneChanges};
use crate::cluster::ClusterLocation;
use crate::cluster::CLUSTER_BYTES;
use crate::error::{Error, Result};
use crate::integrity::IntegrityManager;
use crate::migration::{BatchLimits, MigrationBatch, MigrationPlanner};
use crate::relocation::{ClusterRelocator, RelocationBatch, VatUpdate};
use crate::zone::Zone;
use crate::{SharedImage, SharedVat};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Latency target, microseconds; informs recommendations.
    pub target_latency_us: f64,
    /// Throughput target, operations per second.
    pub target_throughput_ops: f64,
    /// Memory ceiling for cache growth, bytes.
    pub max_memory_bytes: u64,
    /// Run the cache tuner.
    pub tune_cache: bool,
    /// Run zone rebalancing.
    pub tune_zones: bool,
    /// Run cluster fragmentation analysis.
    pub tune_clusters: bool,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            target_latency_us: 100_000.0,
            target_throughput_ops: 1000.0,
            max_memory_bytes: 512 * 1024 * 1024,
            tune_cache: true,
            tune_zones: true,
            tune_clusters: true,
        }
    }
}

impl TuningConfig {
    /// Validates the targets.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] listing every invalid field. A config
    /// with all tuners disabled is valid: `tune_all` then only reports
    /// metrics.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.target_latency_us <= 0.0 {
            problems.push("target_latency_us must be positive");
        }
        if self.target_throughput_ops <= 0.0 {
            problems.push("target_throughput_ops must be positive");
        }
        if self.max_memory_bytes == 0 {
            problems.push("max_memory_bytes must be positive");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Corrupt(problems.join("; ")))
        }
    }
}

/// Metrics sampled before and after a tuning pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningMetrics {
    /// Mean VAT lookup latency, microseconds.
    pub read_latency_us: f64,
    /// Mean cache store latency, microseconds.
    pub write_latency_us: f64,
    /// Probe operations per second.
    pub throughput_ops: f64,
    /// Cache memory in use, bytes.
    pub memory_bytes: u64,
    /// Cache hit rate.
    pub cache_hit_rate: f64,
}

/// Benchmark output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    /// Mean read-path latency, microseconds.
    pub read_latency_us: f64,
    /// Mean write-path latency, microseconds.
    pub write_latency_us: f64,
    /// Operations per second across the run.
    pub throughput_ops: f64,
    /// Cache hit rate at the end of the run.
    pub cache_hit_rate: f64,
    /// Cache memory in use, bytes.
    pub memory_bytes: u64,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Iterations executed.
    pub iterations: usize,
}

/// Zone-rebalancing changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneChanges {
    /// Files whose anchors moved.
    pub files_migrated: usize,
    /// Zones the moved files came from.
    pub zones_rebalanced: Vec<String>,
    /// Mean |distance-to-center change| across moves.
    pub avg_distance_change: f64,
}

/// Cluster-layout report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FragmentationReport {
    /// Fraction of multi-cluster files fragmented before the pass.
    pub fragmentation_before: f64,
    /// Fraction after (defragmentation is a relocation pass, reported
    /// only).
    pub fragmentation_after: f64,
    /// Files rewritten contiguously this pass.
    pub defragmented_files: usize,
}

/// Changes applied by one `tune_all` pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuningChanges {
    /// Cache tuner output.
    pub cache: Option<TuneChanges>,
    /// Zone rebalancing output.
    pub zones: Option<ZoneChanges>,
    /// Fragmentation analysis output.
    pub clusters: Option<FragmentationReport>,
}

/// Outcome of a tuning pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningResult {
    /// Whether the pass ran (config valid).
    pub success: bool,
    /// Applied changes.
    pub changes: TuningChanges,
    /// Metrics before.
    pub before: Option<TuningMetrics>,
    /// Metrics after.
    pub after: Option<TuningMetrics>,
    /// Mean of non-negative per-metric improvements, percent.
    pub improvement_percent: f64,
    /// Human-readable follow-ups.
    pub recommendations: Vec<String>,
}

/// The performance tuner.
pub struct PerformanceTuner {
    config: TuningConfig,
    vat: SharedVat,
    image: SharedImage,
    cache: Arc<ClusterCache>,
    access: Arc<AccessTracker>,
    relocator: Arc<ClusterRelocator>,
    planner: MigrationPlanner,
    integrity: Option<Arc<IntegrityManager>>,
    optimizer: Mutex<CacheOptimizer>,
    history: Mutex<Vec<TuningResult>>,
}

impl std::fmt::Debug for PerformanceTuner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceTuner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PerformanceTuner {
    /// Creates a tuner over the engine's shared pieces. `integrity`, when
    /// given, keeps the checksum store consistent across relocations.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TuningConfig,
        vat: SharedVat,
        image: SharedImage,
        cache: Arc<ClusterCache>,
        access: Arc<AccessTracker>,
        relocator: Arc<ClusterRelocator>,
        planner: MigrationPlanner,
        integrity: Option<Arc<IntegrityManager>>,
    ) -> Self {
        let optimizer = CacheOptimizer::new(
            crate::cache_optimizer::DEFAULT_TARGET_HIT_RATE,
            CLUSTER_BYTES as u64,
        );
        Self {
            config,
            vat,
            image,
            cache,
            access,
            relocator,
            planner,
            integrity,
            optimizer: Mutex::new(optimizer),
            history: Mutex::new(Vec::new()),
        }
    }

    /// The tuner's configuration.
    #[must_use]
    pub fn config(&self) -> &TuningConfig {
        &self.config
    }

    /// Records a file access for tuning decisions (counters plus the cache
    /// optimizer's pattern history).
    pub fn record_access(&self, path: &str) {
        self.access.record(path);
        self.optimizer.lock().record_access(path);
    }

    /// Benchmarks the read and write paths with `iterations` probe rounds
    /// over the currently placed files.
    #[must_use]
    pub fn benchmark(&self, iterations: usize) -> BenchmarkReport {
        let start = Instant::now();
        let paths: Vec<String> = {
            let vat = self.vat.read();
            vat.iter_entries()
                .take(10)
                .map(|(path, _)| path.to_string())
                .collect()
        };

        let mut read_total = Duration::ZERO;
        let mut write_total = Duration::ZERO;
        let mut operations = 0usize;

        for i in 0..iterations.max(1) {
            let probe_key = format!("bench:{i}");
            if paths.is_empty() {
                // Nothing placed yet: probe the cache alone.
                let t = Instant::now();
                let _ = self.cache.get(&probe_key);
                read_total += t.elapsed();
                let t = Instant::now();
                let _ = self.cache.set(&probe_key, vec![0u8; 64]);
                write_total += t.elapsed();
                operations += 2;
                continue;
            }
            let path = &paths[i % paths.len()];
            let t = Instant::now();
            let _ = self.vat.read().lookup(path);
            read_total += t.elapsed();

            let key = range_key(path, 0, CLUSTER_BYTES);
            let t = Instant::now();
            if self.cache.get(&key).is_none() {
                let loaded = {
                    let vat = self.vat.read();
                    vat.lookup(path)
                        .and_then(|anchor| self.image.read().read_cluster(anchor).ok())
                };
                if let Some(data) = loaded {
                    self.cache.set(&key, data);
                }
            }
            write_total += t.elapsed();
            operations += 2;

            self.optimizer.lock().record_access(path);
        }

        let duration = start.elapsed();
        let stats = self.cache.stats();
        #[allow(clippy::cast_precision_loss)]
        let report = BenchmarkReport {
            read_latency_us: read_total.as_secs_f64() * 1e6 / iterations.max(1) as f64,
            write_latency_us: write_total.as_secs_f64() * 1e6 / iterations.max(1) as f64,
            throughput_ops: if duration.as_secs_f64() > 0.0 {
                operations as f64 / duration.as_secs_f64()
            } else {
                0.0
            },
            cache_hit_rate: stats.hit_rate,
            memory_bytes: stats.size,
            duration,
            iterations,
        };
        debug!(
            read_latency_us = report.read_latency_us,
            throughput_ops = report.throughput_ops,
            "benchmark finished"
        );
        report
    }

    /// Samples current metrics with a small probe round.
    #[must_use]
    pub fn current_metrics(&self) -> TuningMetrics {
        let report = self.benchmark(16);
        TuningMetrics {
            read_latency_us: report.read_latency_us,
            write_latency_us: report.write_latency_us,
            throughput_ops: report.throughput_ops,
            memory_bytes: report.memory_bytes,
            cache_hit_rate: report.cache_hit_rate,
        }
    }

    /// Tunes the cache: auto-resize/policy when under target, then warm
    /// the HOT-zone anchors.
    #[must_use]
    pub fn tune_cache(&self) -> TuneChanges {
        if !self.config.tune_cache {
            return TuneChanges::default();
        }
        let optimizer = self.optimizer.lock();
        let mut changes = optimizer.auto_tune(&self.cache);
        // Never grow past the configured memory ceiling.
        if self.cache.max_size() > self.config.max_memory_bytes {
            self.cache.resize(self.config.max_memory_bytes);
            changes.resized_to = Some(self.config.max_memory_bytes);
        }

        // Warm with anchors currently sitting in the HOT zone.
        let hot_keys: Vec<(String, ClusterLocation)> = {
            let vat = self.vat.read();
            let zones = self.planner.zones();
            vat.iter_entries()
                .filter_map(|(path, chain)| {
                    let anchor = *chain.first()?;
                    (zones.classify(anchor) == Zone::Hot)
                        .then(|| (path.to_string(), anchor))
                })
                .take(20)
                .collect()
        };
        let mut warmed = 0usize;
        for (path, anchor) in hot_keys {
            let key = range_key(&path, 0, CLUSTER_BYTES);
            if self.cache.get(&key).is_some() {
                continue;
            }
            let data = { self.image.read().read_cluster(anchor) };
            if let Ok(data) = data {
                if self.cache.set(&key, data) {
                    warmed += 1;
                }
            }
        }
        changes.warmed_keys += warmed;
        changes
    }

    /// Rebalances zones: plans a capped batch from the access counters and
    /// applies it through the relocator.
    ///
    /// # Errors
    ///
    /// Propagates planning failures; per-move relocation failures are
    /// reflected in the counts, not raised.
    pub fn tune_zone_distribution(&self) -> Result<ZoneChanges> {
        if !self.config.tune_zones {
            return Ok(ZoneChanges::default());
        }
        let counts = self.access.snapshot();
        let batch = {
            let vat = self.vat.read();
            let candidates = self.planner.candidates(&vat, &counts, |path| {
                vat.chain(path).map_or(0, |c| (c.len() * CLUSTER_BYTES) as u64)
            });
            let limits = BatchLimits {
                max_count: 50,
                max_bytes: 10 * 1024 * 1024,
                ..BatchLimits::default()
            };
            self.planner.select_batch(&vat, candidates, limits)?
        };
        if batch.is_empty() {
            return Ok(ZoneChanges::default());
        }

        let center = { self.vat.read().center() };
        let mut zones_rebalanced: Vec<String> = batch
            .moves
            .iter()
            .map(|m| m.candidate.zone.name().to_string())
            .collect();
        zones_rebalanced.sort();
        zones_rebalanced.dedup();

        let distance_change: f64 = batch
            .moves
            .iter()
            .map(|m| {
                (m.candidate.location.distance_to(center) - m.target.distance_to(center)).abs()
            })
            .sum();

        let outcome = apply_migration_batch(
            &self.vat,
            &self.image,
            &self.relocator,
            self.integrity.as_deref(),
            &batch,
        );
        info!(
            migrated = outcome.successful_count,
            failed = outcome.failed_count,
            "zone rebalance applied"
        );
        #[allow(clippy::cast_precision_loss)]
        let avg_distance_change = if batch.moves.is_empty() {
            0.0
        } else {
            distance_change / batch.moves.len() as f64
        };
        Ok(ZoneChanges {
            files_migrated: outcome.successful_count,
            zones_rebalanced,
            avg_distance_change,
        })
    }

    /// Reports cluster fragmentation. Actual defragmentation is a
    /// relocation pass and is left to explicit maintenance.
    #[must_use]
    pub fn tune_cluster_size(&self) -> FragmentationReport {
        if !self.config.tune_clusters {
            return FragmentationReport::default();
        }
        let fragmentation = {
            let vat = self.vat.read();
            self.planner.fragmentation(&vat)
        };
        FragmentationReport {
            fragmentation_before: fragmentation,
            fragmentation_after: fragmentation,
            defragmented_files: 0,
        }
    }

    /// Runs every enabled tuner between before/after metric captures.
    ///
    /// # Errors
    ///
    /// Returns the validation error for an invalid config; tuner-stage
    /// failures surface as recommendations, not errors.
    pub fn tune_all(&self) -> Result<TuningResult> {
        if let Err(e) = self.config.validate() {
            let result = TuningResult {
                success: false,
                changes: TuningChanges::default(),
                before: None,
                after: None,
                improvement_percent: 0.0,
                recommendations: vec![format!("configuration error: {e}")],
            };
            self.history.lock().push(result.clone());
            return Ok(result);
        }

        let before = self.current_metrics();
        let mut changes = TuningChanges::default();
        let mut recommendations = Vec::new();

        if self.config.tune_cache {
            let cache_changes = self.tune_cache();
            if cache_changes.warmed_keys > 0 {
                recommendations.push(format!(
                    "warmed {} hot anchors into the cache",
                    cache_changes.warmed_keys
                ));
            }
            changes.cache = Some(cache_changes);
        }
        if self.config.tune_zones {
            match self.tune_zone_distribution() {
                Ok(zone_changes) => {
                    if zone_changes.files_migrated > 0 {
                        recommendations.push(format!(
                            "migrated {} files toward their traffic zones",
                            zone_changes.files_migrated
                        ));
                    }
                    changes.zones = Some(zone_changes);
                }
                Err(e) => recommendations.push(format!("zone rebalance skipped: {e}")),
            }
        }
        if self.config.tune_clusters {
            let report = self.tune_cluster_size();
            if report.fragmentation_before > self.planner.config().fragmentation_threshold {
                recommendations.push(format!(
                    "fragmentation at {:.0}%, consider a defragmentation pass",
                    report.fragmentation_before * 100.0
                ));
            }
            changes.clusters = Some(report);
        }

        let after = self.current_metrics();
        let improvement = improvement_percent(&before, &after);
        if after.cache_hit_rate < 0.8 {
            recommendations.push("cache hit rate below 80%, consider a larger cache".to_string());
        }
        if recommendations.is_empty() {
            recommendations.push("system is well optimized".to_string());
        }

        let result = TuningResult {
            success: true,
            changes,
            before: Some(before),
            after: Some(after),
            improvement_percent: improvement,
            recommendations,
        };
        self.history.lock().push(result.clone());
        Ok(result)
    }

    /// Past tuning results, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<TuningResult> {
        self.history.lock().clone()
    }

    /// Clears the tuning history.
    pub fn reset_history(&self) {
        self.history.lock().clear();
    }
}

/// Mean of the non-negative per-metric improvements, with latency
/// inverted (lower is better).
#[must_use]
pub fn improvement_percent(before: &TuningMetrics, after: &TuningMetrics) -> f64 {
    let mut improvements = Vec::new();
    if before.read_latency_us > 0.0 {
        improvements.push(
            ((before.read_latency_us - after.read_latency_us) / before.read_latency_us * 100.0)
                .max(0.0),
        );
    }
    if before.throughput_ops > 0.0 {
        improvements.push(
            ((after.throughput_ops - before.throughput_ops) / before.throughput_ops * 100.0)
                .max(0.0),
        );
    }
    if before.cache_hit_rate > 0.0 {
        improvements.push(
            ((after.cache_hit_rate - before.cache_hit_rate) / before.cache_hit_rate * 100.0)
                .max(0.0),
        );
    }
    if improvements.is_empty() {
        0.0
    } else {
        improvements.iter().sum::<f64>() / improvements.len() as f64
    }
}

/// Applies a planned migration batch: reads each anchor's cluster, moves
/// it through the relocator, and — inside the per-move callback, under the
/// VAT write lock — swaps the chain entry, rewrites the image, and carries
/// the checksum entry to the cluster's new id.
#[must_use]
pub fn apply_migration_batch(
    vat: &SharedVat,
    image: &SharedImage,
    relocator: &ClusterRelocator,
    integrity: Option<&IntegrityManager>,
    batch: &MigrationBatch,
) -> RelocationBatch {
    let moves: Vec<_> = batch
        .moves
        .iter()
        .filter_map(|m| {
            let data = { image.read().read_cluster(m.candidate.location).ok()? };
            Some((m.candidate.location, m.target, data))
        })
        .collect();

    let update: VatUpdate<'_> = &|old, new| {
        let (path, old_id, new_id) = {
            let mut vat_w = vat.write();
            let path = vat_w
                .owner_of(old)
                .map(|o| o.path.clone())
                .ok_or_else(|| Error::NotFound(format!("no owner for cluster {old}")))?;
            vat_w.relocate(&path, old, new)?;
            (path, vat_w.linear_of(old)?, vat_w.linear_of(new)?)
        };
        let data = { image.read().read_cluster(old)? };
        {
            let mut image_w = image.write();
            image_w.write_cluster(new, &data)?;
            image_w.write_cluster(old, &[])?;
        }
        if let Some(manager) = integrity {
            if let Some(mut entry) = manager.store().get(old_id) {
                manager.store().remove(old_id);
                entry.cluster_id = new_id;
                manager.store().set(entry);
            }
        }
        debug!(path = %path, %old, %new, "migrated");
        Ok(())
    };

    relocator.relocate_batch(moves, Some(update))
}
