//! Integrity scanning.
//!
//! Walks every owned cluster, reads it from the backing image and compares
//! it with the stored digest. A cluster with no stored digest is UNKNOWN,
//! never corrupt. Verification never mutates the image.

use super::checksum::ChecksumAlgorithm;
use super::store::ChecksumStore;
use crate::cluster::ClusterLocation;
use crate::error::Result;
use crate::{SharedImage, SharedVat};

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Classification of a scanned cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityStatus {
    /// Digest matches.
    Valid,
    /// Digest mismatch.
    Corrupted,
    /// The cluster could not be read.
    Missing,
    /// No stored digest to compare against.
    Unknown,
}

/// One corrupted or unreadable cluster in a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionDetail {
    /// Stable cluster id.
    pub cluster_id: u64,
    /// Anchor coordinate.
    pub location: ClusterLocation,
    /// Owning path.
    pub path: String,
    /// Classification.
    pub status: IntegrityStatus,
    /// Stored digest, when one exists.
    pub expected: Option<String>,
    /// Digest of the bytes actually read, for corrupted clusters.
    pub actual: Option<String>,
}

/// Result of an integrity scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Clusters examined.
    pub total_clusters: usize,
    /// Digest matches.
    pub valid_clusters: usize,
    /// Digest mismatches.
    pub corrupted_clusters: usize,
    /// Unreadable clusters.
    pub missing_clusters: usize,
    /// Clusters without a stored digest.
    pub unknown_clusters: usize,
    /// Per-cluster details for everything that was not valid.
    pub corruption_details: Vec<CorruptionDetail>,
    /// Wall-clock scan duration.
    pub scan_duration: Duration,
    /// True when a progress callback aborted the scan early.
    pub aborted: bool,
}

impl IntegrityReport {
    /// Percentage of examined clusters that are valid or unknown.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn integrity_rate(&self) -> f64 {
        if self.total_clusters == 0 {
            return 100.0;
        }
        (self.valid_clusters + self.unknown_clusters) as f64 / self.total_clusters as f64 * 100.0
    }

    /// True when nothing is corrupted or missing.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.corrupted_clusters == 0 && self.missing_clusters == 0
    }

    /// Cluster ids classified corrupted, in scan order.
    #[must_use]
    pub fn corrupted_ids(&self) -> Vec<u64> {
        self.corruption_details
            .iter()
            .filter(|d| d.status == IntegrityStatus::Corrupted)
            .map(|d| d.cluster_id)
            .collect()
    }
}

/// Scans clusters against the checksum store.
#[derive(Debug)]
pub struct IntegrityScanner {
    vat: SharedVat,
    image: SharedImage,
    algorithm: ChecksumAlgorithm,
}

impl IntegrityScanner {
    /// Creates a scanner over the shared table and image.
    #[must_use]
    pub fn new(vat: SharedVat, image: SharedImage, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            vat,
            image,
            algorithm,
        }
    }

    /// Classifies a single cluster's bytes against the store.
    #[must_use]
    pub fn scan_cluster(&self, store: &ChecksumStore, cluster_id: u64, data: &[u8]) -> IntegrityStatus {
        match store.get(cluster_id) {
            None => IntegrityStatus::Unknown,
            Some(entry) => {
                if entry.matches(data) {
                    IntegrityStatus::Valid
                } else {
                    IntegrityStatus::Corrupted
                }
            }
        }
    }

    /// Scans every owned cluster. The progress callback receives
    /// `(current, total)` and may return `false` to abort; the report then
    /// covers the clusters scanned so far with `aborted` set.
    ///
    /// # Errors
    ///
    /// Individual cluster read failures are classified MISSING, not
    /// raised; only lock-free bookkeeping errors surface.
    pub fn scan_all(
        &self,
        store: &ChecksumStore,
        mut progress: Option<&mut dyn FnMut(usize, usize) -> bool>,
    ) -> Result<IntegrityReport> {
        let start = Instant::now();

        // Snapshot the cluster set under a short read lock, then release it
        // before touching the image so writers are not starved.
        let clusters: Vec<(u64, ClusterLocation, String)> = {
            let vat = self.vat.read();
            vat.owned_clusters()
                .into_iter()
                .map(|(t, loc)| {
                    let path = vat
                        .owner_of(loc)
                        .map_or_else(String::new, |o| o.path.clone());
                    (t, loc, path)
                })
                .collect()
        };

        let total = clusters.len();
        let mut report = IntegrityReport {
            total_clusters: total,
            valid_clusters: 0,
            corrupted_clusters: 0,
            missing_clusters: 0,
            unknown_clusters: 0,
            corruption_details: Vec::new(),
            scan_duration: Duration::ZERO,
            aborted: false,
        };

        for (index, (cluster_id, location, path)) in clusters.into_iter().enumerate() {
            if let Some(cb) = progress.as_deref_mut() {
                if !cb(index + 1, total) {
                    report.aborted = true;
                    report.total_clusters = index;
                    break;
                }
            }
            let data = { self.image.read().read_cluster(location) };
            match data {
                Err(_) => {
                    report.missing_clusters += 1;
                    report.corruption_details.push(CorruptionDetail {
                        cluster_id,
                        location,
                        path,
                        status: IntegrityStatus::Missing,
                        expected: store.get(cluster_id).map(|e| e.checksum),
                        actual: None,
                    });
                }
                Ok(bytes) => match self.scan_cluster(store, cluster_id, &bytes) {
                    IntegrityStatus::Valid => report.valid_clusters += 1,
                    IntegrityStatus::Unknown => report.unknown_clusters += 1,
                    IntegrityStatus::Missing => report.missing_clusters += 1,
                    IntegrityStatus::Corrupted => {
                        report.corrupted_clusters += 1;
                        report.corruption_details.push(CorruptionDetail {
                            cluster_id,
                            location,
                            path,
                            status: IntegrityStatus::Corrupted,
                            expected: store.get(cluster_id).map(|e| e.checksum),
                            actual: Some(self.algorithm.digest(&bytes)),
                        });
                    }
                },
            }
        }

        report.scan_duration = start.elapsed();
        debug!(
            total = report.total_clusters,
            corrupted = report.corrupted_clusters,
            missing = report.missing_clusters,
            "scan finished"
        );
        Ok(report)
    }

    /// Integrity status of one file: the worst status across its chain.
    ///
    /// # Errors
    ///
    /// Never fails today; kept fallible for parity with `scan_all`.
    pub fn scan_path(&self, store: &ChecksumStore, path: &str) -> Result<IntegrityStatus> {
        let chain: Option<Vec<(u64, ClusterLocation)>> = {
            let vat = self.vat.read();
            vat.chain(path).map(|chain| {
                chain
                    .iter()
                    .filter_map(|&loc| vat.linear_of(loc).ok().map(|t| (t, loc)))
                    .collect()
            })
        };
        let Some(chain) = chain else {
            return Ok(IntegrityStatus::Missing);
        };
        let mut saw_unknown = false;
        for (cluster_id, location) in chain {
            let data = { self.image.read().read_cluster(location) };
            match data {
                Err(_) => return Ok(IntegrityStatus::Missing),
                Ok(bytes) => match self.scan_cluster(store, cluster_id, &bytes) {
                    IntegrityStatus::Corrupted => return Ok(IntegrityStatus::Corrupted),
                    IntegrityStatus::Missing => return Ok(IntegrityStatus::Missing),
                    IntegrityStatus::Unknown => saw_unknown = true,
                    IntegrityStatus::Valid => {}
                },
            }
        }
        Ok(if saw_unknown {
            IntegrityStatus::Unknown
        } else {
            IntegrityStatus::Valid
        })
    }
}
