//! Cluster repair.
//!
//! Restores corrupted clusters from, in order, the cluster journal and the
//! backup directory (`cluster_<id>.bin` files). Recovered bytes must match
//! the stored digest when one exists; a source that fails verification is
//! skipped rather than trusted.

use super::journal::ClusterJournal;
use super::store::ChecksumStore;
use crate::error::{Error, Result};
use crate::{SharedImage, SharedVat};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Result of a repair pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepairResult {
    /// Cluster ids restored.
    pub repaired_clusters: Vec<u64>,
    /// Cluster ids that could not be restored, with the reason.
    pub failed_clusters: Vec<(u64, String)>,
    /// Payload bytes written back.
    pub total_bytes_repaired: u64,
    /// Wall-clock duration of the pass.
    pub repair_duration: Duration,
}

impl RepairResult {
    /// Percentage of attempted repairs that succeeded; 100 when nothing
    /// was attempted.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let total = self.repaired_clusters.len() + self.failed_clusters.len();
        if total == 0 {
            return 100.0;
        }
        self.repaired_clusters.len() as f64 / total as f64 * 100.0
    }
}

/// Restores corrupted clusters from recovery sources.
#[derive(Debug)]
pub struct IntegrityRepairer {
    vat: SharedVat,
    image: SharedImage,
    journal: Option<ClusterJournal>,
    backup_dir: Option<PathBuf>,
}

impl IntegrityRepairer {
    /// Creates a repairer with optional recovery sources.
    #[must_use]
    pub fn new(
        vat: SharedVat,
        image: SharedImage,
        journal: Option<ClusterJournal>,
        backup_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            vat,
            image,
            journal,
            backup_dir,
        }
    }

    /// The journal, when configured.
    #[must_use]
    pub fn journal(&self) -> Option<&ClusterJournal> {
        self.journal.as_ref()
    }

    /// True when some recovery source could supply `cluster_id`.
    #[must_use]
    pub fn can_repair(&self, store: &ChecksumStore, cluster_id: u64) -> bool {
        self.recover(store, cluster_id).is_some()
    }

    /// Fetches verified recovery bytes for a cluster from the first source
    /// that has them.
    fn recover(&self, store: &ChecksumStore, cluster_id: u64) -> Option<Vec<u8>> {
        let entry = store.get(cluster_id);
        let verified = |data: Vec<u8>| -> Option<Vec<u8>> {
            match &entry {
                Some(e) if !e.matches(&data) => None,
                _ => Some(data),
            }
        };

        if let Some(journal) = &self.journal {
            if let Ok(Some(data)) = journal.last_valid(cluster_id) {
                if let Some(data) = verified(data) {
                    debug!(cluster_id, "recovered from journal");
                    return Some(data);
                }
            }
        }
        if let Some(dir) = &self.backup_dir {
            let file = backup_file(dir, cluster_id);
            if let Ok(data) = std::fs::read(&file) {
                if let Some(data) = verified(data) {
                    debug!(cluster_id, file = %file.display(), "recovered from backup");
                    return Some(data);
                }
            }
        }
        None
    }

    /// Repairs a single cluster: recover, write back, done.
    ///
    /// # Errors
    ///
    /// - [`Error::IntegrityUnrepairable`] when no source can supply
    ///   verified bytes.
    /// - [`Error::NotFound`] when the cluster id is not a valid start on
    ///   this grid.
    pub fn repair_cluster(&self, store: &ChecksumStore, cluster_id: u64) -> Result<u64> {
        let data = self
            .recover(store, cluster_id)
            .ok_or(Error::IntegrityUnrepairable(cluster_id))?;
        let location = {
            let vat = self.vat.read();
            vat.location_of(cluster_id)
                .map_err(|_| Error::NotFound(format!("cluster id {cluster_id}")))?
        };
        let payload_len = data.len().min(crate::cluster::CLUSTER_BYTES);
        {
            let mut image = self.image.write();
            image.write_cluster(location, &data[..payload_len])?;
        }
        let bytes = store
            .get(cluster_id)
            .map_or(payload_len as u64, |e| e.size);
        Ok(bytes)
    }

    /// Repairs the listed clusters. The progress callback receives
    /// `(current, total, cluster_id)`.
    ///
    /// Partial failures do not abort the pass: each cluster's outcome is
    /// reported independently.
    #[must_use]
    pub fn repair_all(
        &self,
        store: &ChecksumStore,
        cluster_ids: &[u64],
        mut progress: Option<&mut dyn FnMut(usize, usize, u64)>,
    ) -> RepairResult {
        let start = Instant::now();
        let mut result = RepairResult::default();
        for (index, &cluster_id) in cluster_ids.iter().enumerate() {
            if let Some(cb) = progress.as_deref_mut() {
                cb(index + 1, cluster_ids.len(), cluster_id);
            }
            match self.repair_cluster(store, cluster_id) {
                Ok(bytes) => {
                    result.repaired_clusters.push(cluster_id);
                    result.total_bytes_repaired += bytes;
                }
                Err(e) => {
                    result.failed_clusters.push((cluster_id, e.to_string()));
                }
            }
        }
        result.repair_duration = start.elapsed();
        info!(
            repaired = result.repaired_clusters.len(),
            failed = result.failed_clusters.len(),
            bytes = result.total_bytes_repaired,
            "repair pass finished"
        );
        result
    }
}

/// Backup file path for a cluster: `<dir>/cluster_<id>.bin`.
#[must_use]
pub fn backup_file(dir: &Path, cluster_id: u64) -> PathBuf {
    dir.join(format!("cluster_{cluster_id}.bin"))
}
