//! Physical cluster relocation.
//!
//! Moves cluster payloads between anchors with digest verification and
//! bounded concurrency. The relocator itself is a pure data mover: the
//! configurable read/write delays stand in for image I/O, and the VAT swap
//! happens through a caller-supplied callback that is invoked *before* a
//! move reports success, so a reader after a completed relocation never
//! observes the old anchor.
//!
//! Batches run on a dedicated rayon pool sized `max_concurrent`; each
//! move's outcome is reported independently, so one failure never poisons
//! the batch.

use crate::cluster::ClusterLocation;
use crate::error::{Error, Result};

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::debug;

/// Relocation engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelocationConfig {
    /// Maximum concurrent moves in a batch.
    pub max_concurrent: usize,
    /// Simulated per-cluster read delay.
    pub read_delay: Duration,
    /// Simulated per-cluster write delay.
    pub write_delay: Duration,
    /// Movement cost per pixel for estimates, microseconds.
    pub cost_per_pixel_us: f64,
    /// Payload throughput for estimates, bytes per microsecond.
    pub throughput_bytes_per_us: f64,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            read_delay: Duration::from_micros(100),
            write_delay: Duration::from_micros(100),
            cost_per_pixel_us: 10.0,
            throughput_bytes_per_us: 1.0,
        }
    }
}

/// Outcome of one cluster move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelocationResult {
    /// Whether the move completed.
    pub success: bool,
    /// Source anchor.
    pub old_location: ClusterLocation,
    /// Destination anchor.
    pub new_location: ClusterLocation,
    /// Payload bytes moved.
    pub bytes_moved: u64,
    /// Euclidean distance, cells.
    pub distance: f64,
    /// Wall-clock duration of the move.
    pub duration: Duration,
    /// Whether the destination digest matched the source digest.
    pub checksum_verified: bool,
    /// Failure reason, when unsuccessful.
    pub error: Option<String>,
}

/// Aggregated outcome of a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelocationBatch {
    /// Per-move outcomes, in submission order.
    pub results: Vec<RelocationResult>,
    /// Bytes moved by successful moves.
    pub total_bytes: u64,
    /// Distance covered by successful moves.
    pub total_distance: f64,
    /// Wall-clock duration of the whole batch.
    pub total_duration: Duration,
    /// Successful moves.
    pub successful_count: usize,
    /// Failed moves.
    pub failed_count: usize,
}

impl RelocationBatch {
    /// Percentage of moves that succeeded; 100 for an empty batch.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 100.0;
        }
        self.successful_count as f64 / self.results.len() as f64 * 100.0
    }
}

/// Monotonic totals across a relocator's lifetime.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RelocationStatistics {
    /// Successful moves.
    pub total_relocations: u64,
    /// Bytes moved by successful moves.
    pub total_bytes_moved: u64,
    /// Distance covered by successful moves, cells.
    pub total_distance: f64,
}

/// Callback invoked with `(old, new)` before a move reports success. Must
/// serialize its own VAT access (typically by taking the VAT write lock).
pub type VatUpdate<'a> = &'a (dyn Fn(ClusterLocation, ClusterLocation) -> Result<()> + Sync);

/// The physical relocation engine.
pub struct ClusterRelocator {
    config: RelocationConfig,
    pool: rayon::ThreadPool,
    stats: Mutex<RelocationStatistics>,
}

impl std::fmt::Debug for ClusterRelocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRelocator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ClusterRelocator {
    /// Creates a relocator with its worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Busy`] when the thread pool cannot be built.
    pub fn new(config: RelocationConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_concurrent.max(1))
            .thread_name(|i| format!("relocator-{i}"))
            .build()
            .map_err(|e| Error::Busy(format!("relocator pool: {e}")))?;
        Ok(Self {
            config,
            pool,
            stats: Mutex::new(RelocationStatistics::default()),
        })
    }

    /// The relocator's configuration.
    #[must_use]
    pub fn config(&self) -> &RelocationConfig {
        &self.config
    }

    /// Moves one cluster payload. Steps: digest the source, (simulated)
    /// read, (simulated) write, verify the moved bytes against the source
    /// digest, then run the VAT update callback; only after the callback
    /// returns does the result report success.
    #[must_use]
    pub fn relocate_cluster(
        &self,
        old_location: ClusterLocation,
        new_location: ClusterLocation,
        data: &[u8],
        vat_update: Option<VatUpdate<'_>>,
    ) -> RelocationResult {
        let start = Instant::now();
        let distance = old_location.distance_to(new_location);

        let failed = |error: String, verified: bool, start: Instant| RelocationResult {
            success: false,
            old_location,
            new_location,
            bytes_moved: 0,
            distance,
            duration: start.elapsed(),
            checksum_verified: verified,
            error: Some(error),
        };

        let old_digest = Sha256::digest(data);

        if !self.config.read_delay.is_zero() {
            std::thread::sleep(self.config.read_delay);
        }
        // Real deployments replace the delays with image reads/writes; the
        // payload handed in is what lands at the destination.
        let moved = data;
        if !self.config.write_delay.is_zero() {
            std::thread::sleep(self.config.write_delay);
        }

        let new_digest = Sha256::digest(moved);
        if new_digest != old_digest {
            return failed("destination digest mismatch".to_string(), false, start);
        }

        if let Some(update) = vat_update {
            if let Err(e) = update(old_location, new_location) {
                return failed(format!("VAT update: {e}"), true, start);
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.total_relocations += 1;
            stats.total_bytes_moved += data.len() as u64;
            stats.total_distance += distance;
        }
        debug!(%old_location, %new_location, bytes = data.len(), "cluster relocated");

        RelocationResult {
            success: true,
            old_location,
            new_location,
            bytes_moved: data.len() as u64,
            distance,
            duration: start.elapsed(),
            checksum_verified: true,
            error: None,
        }
    }

    /// Moves a batch with up to `max_concurrent` moves in flight. The VAT
    /// callback runs per move, on the worker that completed it.
    #[must_use]
    pub fn relocate_batch(
        &self,
        moves: Vec<(ClusterLocation, ClusterLocation, Vec<u8>)>,
        vat_update: Option<VatUpdate<'_>>,
    ) -> RelocationBatch {
        let start = Instant::now();
        let results: Vec<RelocationResult> = self.pool.install(|| {
            moves
                .into_par_iter()
                .map(|(old, new, data)| self.relocate_cluster(old, new, &data, vat_update))
                .collect()
        });

        let mut batch = RelocationBatch {
            total_duration: start.elapsed(),
            ..RelocationBatch::default()
        };
        for result in &results {
            if result.success {
                batch.successful_count += 1;
                batch.total_bytes += result.bytes_moved;
                batch.total_distance += result.distance;
            } else {
                batch.failed_count += 1;
            }
        }
        batch.results = results;
        batch
    }

    /// Estimated wall-clock time for a batch:
    /// `((read+write)·n + µs_per_pixel·avg_distance·n + bytes/throughput)
    /// / min(n, max_concurrent)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn estimate_time(&self, n_clusters: usize, avg_distance: f64, avg_size: u64) -> Duration {
        if n_clusters == 0 {
            return Duration::ZERO;
        }
        let n = n_clusters as f64;
        let per_cluster_us =
            (self.config.read_delay + self.config.write_delay).as_micros() as f64;
        let transfer_us = self.config.cost_per_pixel_us * avg_distance * n;
        let data_us = (avg_size as f64 * n) / self.config.throughput_bytes_per_us;
        let parallel = n_clusters.min(self.config.max_concurrent).max(1) as f64;
        let total_us = (per_cluster_us * n + transfer_us + data_us) / parallel;
        Duration::from_micros(total_us as u64)
    }

    /// Lifetime totals.
    #[must_use]
    pub fn statistics(&self) -> RelocationStatistics {
        *self.stats.lock()
    }

    /// Resets the lifetime totals.
    pub fn reset_statistics(&self) {
        *self.stats.lock() = RelocationStatistics::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> RelocationConfig {
        RelocationConfig {
            read_delay: Duration::ZERO,
            write_delay: Duration::ZERO,
            ..RelocationConfig::default()
        }
    }

    #[test]
    fn test_single_relocation_verified() {
        let relocator = ClusterRelocator::new(fast_config()).unwrap();
        let data = vec![7u8; 4096];
        let result = relocator.relocate_cluster(
            ClusterLocation::new(100, 100),
            ClusterLocation::new(200, 200),
            &data,
            None,
        );
        assert!(result.success);
        assert!(result.checksum_verified);
        assert_eq!(result.bytes_moved, 4096);
        assert!((result.distance - (100.0f64.powi(2) * 2.0).sqrt()).abs() < 1e-9);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_vat_callback_runs_before_success() {
        let relocator = ClusterRelocator::new(fast_config()).unwrap();
        let observed = RwLock::new(None);
        let update: VatUpdate<'_> = &|old, new| {
            *observed.write() = Some((old, new));
            Ok(())
        };
        let result = relocator.relocate_cluster(
            ClusterLocation::new(1, 2),
            ClusterLocation::new(3, 4),
            b"payload",
            Some(update),
        );
        assert!(result.success);
        assert_eq!(
            *observed.read(),
            Some((ClusterLocation::new(1, 2), ClusterLocation::new(3, 4)))
        );
    }

    #[test]
    fn test_vat_callback_failure_fails_move() {
        let relocator = ClusterRelocator::new(fast_config()).unwrap();
        let update: VatUpdate<'_> = &|_, _| Err(Error::Busy("table locked".to_string()));
        let result = relocator.relocate_cluster(
            ClusterLocation::new(1, 2),
            ClusterLocation::new(3, 4),
            b"payload",
            Some(update),
        );
        assert!(!result.success);
        // The payload itself verified; the bookkeeping failed.
        assert!(result.checksum_verified);
        assert!(result.error.unwrap().contains("VAT update"));
    }

    #[test]
    fn test_batch_partial_failure_isolated() {
        let relocator = ClusterRelocator::new(fast_config()).unwrap();
        let calls = AtomicUsize::new(0);
        let update: VatUpdate<'_> = &|old, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            if old == ClusterLocation::new(9, 9) {
                Err(Error::Busy("rejected".to_string()))
            } else {
                Ok(())
            }
        };
        let moves = vec![
            (ClusterLocation::new(0, 0), ClusterLocation::new(1, 1), vec![1u8; 16]),
            (ClusterLocation::new(9, 9), ClusterLocation::new(2, 2), vec![2u8; 16]),
            (ClusterLocation::new(5, 5), ClusterLocation::new(3, 3), vec![3u8; 16]),
        ];
        let batch = relocator.relocate_batch(moves, Some(update));
        assert_eq!(batch.results.len(), 3);
        assert_eq!(batch.successful_count, 2);
        assert_eq!(batch.failed_count, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!((batch.success_rate() - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(batch.total_bytes, 32);
    }

    #[test]
    fn test_statistics_accumulate() {
        let relocator = ClusterRelocator::new(fast_config()).unwrap();
        let _ = relocator.relocate_cluster(
            ClusterLocation::new(0, 0),
            ClusterLocation::new(3, 4),
            &[0u8; 100],
            None,
        );
        let _ = relocator.relocate_cluster(
            ClusterLocation::new(0, 0),
            ClusterLocation::new(6, 8),
            &[0u8; 100],
            None,
        );
        let stats = relocator.statistics();
        assert_eq!(stats.total_relocations, 2);
        assert_eq!(stats.total_bytes_moved, 200);
        assert!((stats.total_distance - 15.0).abs() < 1e-9);

        relocator.reset_statistics();
        assert_eq!(relocator.statistics().total_relocations, 0);
    }

    #[test]
    fn test_estimate_time_divides_by_workers() {
        let config = RelocationConfig {
            max_concurrent: 4,
            read_delay: Duration::from_micros(500),
            write_delay: Duration::from_micros(500),
            cost_per_pixel_us: 10.0,
            throughput_bytes_per_us: 1.0,
        };
        let relocator = ClusterRelocator::new(config).unwrap();
        // 8 clusters, 100 px average, 4096 B average:
        // (1000·8 + 10·100·8 + 4096·8) / 4 = (8000 + 8000 + 32768) / 4.
        let estimate = relocator.estimate_time(8, 100.0, 4096);
        assert_eq!(estimate, Duration::from_micros(12_192));
        assert_eq!(relocator.estimate_time(0, 100.0, 4096), Duration::ZERO);

        // A single cluster cannot be parallelized.
        let single = relocator.estimate_time(1, 100.0, 4096);
        assert_eq!(single, Duration::from_micros(1000 + 1000 + 4096));
    }

    #[test]
    fn test_batch_completes_with_bounded_pool() {
        let config = RelocationConfig {
            max_concurrent: 2,
            read_delay: Duration::from_millis(1),
            write_delay: Duration::ZERO,
            ..RelocationConfig::default()
        };
        let relocator = ClusterRelocator::new(config).unwrap();
        let update: VatUpdate<'_> = &|_, _| Ok(());
        let moves: Vec<_> = (0..6)
            .map(|i| {
                (
                    ClusterLocation::new(i, 0),
                    ClusterLocation::new(i, 1),
                    vec![0u8; 8],
                )
            })
            .collect();
        let batch = relocator.relocate_batch(moves, Some(update));
        assert_eq!(batch.successful_count, 6);
        assert_eq!(batch.results.len(), 6);
    }
}
