//! Checksum-based integrity protection.
//!
//! [`IntegrityManager`] is the facade the rest of the engine talks to:
//! digests on write, verification on read, full scans, pattern
//! fingerprinting and repair from the journal or a backup directory.
//!
//! The manager holds shared handles to the VAT and the grid image; it never
//! owns them, so the daemon, the builder and the tuner can drive integrity
//! work without reference cycles.

pub mod checksum;
pub mod detector;
pub mod journal;
pub mod repair;
pub mod scanner;
pub mod store;


pub use checksum::{ChecksumAlgorithm, ChecksumEntry};
pub use detector::{detect_bit_rot, detect_patterns, detect_truncation, CorruptionPattern};
pub use journal::ClusterJournal;
pub use repair::{backup_file, IntegrityRepairer, RepairResult};
pub use scanner::{CorruptionDetail, IntegrityReport, IntegrityScanner, IntegrityStatus};
pub use store::ChecksumStore;

use crate::error::{Error, Result};
use crate::{SharedImage, SharedVat};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Summary counters for the integrity subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityStatistics {
    /// Entries in the checksum store.
    pub total_checksums: usize,
    /// Algorithm used for new digests.
    pub algorithm: ChecksumAlgorithm,
    /// Checksum store path.
    pub store_path: PathBuf,
    /// Whether a journal is attached.
    pub journal_attached: bool,
    /// Whether a backup directory is attached.
    pub backup_attached: bool,
}

/// Unified integrity management interface.
#[derive(Debug)]
pub struct IntegrityManager {
    vat: SharedVat,
    image: SharedImage,
    store: ChecksumStore,
    scanner: IntegrityScanner,
    repairer: IntegrityRepairer,
    algorithm: ChecksumAlgorithm,
    backup_dir: Option<PathBuf>,
}

impl IntegrityManager {
    /// Creates a manager over the shared table and image.
    ///
    /// `store_path` holds the sidecar digests; `journal_path` and
    /// `backup_dir`, when given, become the repair sources in that order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the journal cannot be opened.
    pub fn new(
        vat: SharedVat,
        image: SharedImage,
        store_path: &Path,
        algorithm: ChecksumAlgorithm,
        journal_path: Option<&Path>,
        backup_dir: Option<&Path>,
    ) -> Result<Self> {
        let store = ChecksumStore::open(store_path);
        let journal = match journal_path {
            Some(path) => Some(ClusterJournal::open(path)?),
            None => None,
        };
        let scanner = IntegrityScanner::new(vat.clone(), image.clone(), algorithm);
        let repairer = IntegrityRepairer::new(
            vat.clone(),
            image.clone(),
            journal,
            backup_dir.map(Path::to_path_buf),
        );
        Ok(Self {
            vat,
            image,
            store,
            scanner,
            repairer,
            algorithm,
            backup_dir: backup_dir.map(Path::to_path_buf),
        })
    }

    /// The sidecar checksum store.
    #[must_use]
    pub fn store(&self) -> &ChecksumStore {
        &self.store
    }

    /// The cluster journal, when attached.
    #[must_use]
    pub fn journal(&self) -> Option<&ClusterJournal> {
        self.repairer.journal()
    }

    /// Computes and stores the digest for a cluster's payload.
    #[must_use]
    pub fn compute_checksum(&self, data: &[u8], cluster_id: u64) -> ChecksumEntry {
        let entry = ChecksumEntry::compute(cluster_id, self.algorithm, data);
        self.store.set(entry.clone());
        entry
    }

    /// Verifies data against the stored digest. A cluster with no stored
    /// entry verifies true: unknown is not corrupt.
    #[must_use]
    pub fn verify_checksum(&self, data: &[u8], cluster_id: u64) -> bool {
        match self.store.get(cluster_id) {
            None => true,
            Some(entry) => entry.matches(data),
        }
    }

    /// Verifies and errors on mismatch, for read paths that must refuse
    /// bad bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChecksumMismatch`] with both digests.
    pub fn verify_or_fail(&self, data: &[u8], cluster_id: u64) -> Result<()> {
        if let Some(entry) = self.store.get(cluster_id) {
            if !entry.matches(data) {
                return Err(Error::ChecksumMismatch {
                    cluster_id,
                    expected: entry.checksum,
                    actual: entry.algorithm.digest(data),
                });
            }
        }
        Ok(())
    }

    /// Scans every owned cluster. See [`IntegrityScanner::scan_all`].
    ///
    /// # Errors
    ///
    /// See [`IntegrityScanner::scan_all`].
    pub fn scan(
        &self,
        progress: Option<&mut dyn FnMut(usize, usize) -> bool>,
    ) -> Result<IntegrityReport> {
        self.scanner.scan_all(&self.store, progress)
    }

    /// Integrity status of one file path.
    ///
    /// # Errors
    ///
    /// See [`IntegrityScanner::scan_path`].
    pub fn scan_path(&self, path: &str) -> Result<IntegrityStatus> {
        self.scanner.scan_path(&self.store, path)
    }

    /// Corrupted cluster ids from a fresh scan.
    ///
    /// # Errors
    ///
    /// See [`IntegrityScanner::scan_all`].
    pub fn corrupted_clusters(&self) -> Result<Vec<u64>> {
        Ok(self.scan(None)?.corrupted_ids())
    }

    /// Repairs the listed clusters, or everything a fresh scan flags when
    /// `cluster_ids` is `None`.
    ///
    /// # Errors
    ///
    /// Returns scan failures; per-cluster repair failures are reported in
    /// the result, not raised.
    pub fn repair(
        &self,
        cluster_ids: Option<Vec<u64>>,
        progress: Option<&mut dyn FnMut(usize, usize, u64)>,
    ) -> Result<RepairResult> {
        let ids = match cluster_ids {
            Some(ids) => ids,
            None => self.corrupted_clusters()?,
        };
        Ok(self.repairer.repair_all(&self.store, &ids, progress))
    }

    /// True when some recovery source could supply `cluster_id`.
    #[must_use]
    pub fn can_repair(&self, cluster_id: u64) -> bool {
        self.repairer.can_repair(&self.store, cluster_id)
    }

    /// Records a cluster payload in the journal so later corruption can be
    /// rolled back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when no journal is attached, or the
    /// journal's write failure.
    pub fn journal_write(&self, cluster_id: u64, data: &[u8]) -> Result<()> {
        match self.repairer.journal() {
            Some(journal) => journal.append(cluster_id, data),
            None => Err(Error::NotFound("no cluster journal attached".to_string())),
        }
    }

    /// Persists the checksum store atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on file failures.
    pub fn persist_checksums(&self) -> Result<()> {
        self.store.save()
    }

    /// Dumps every checksummed cluster's current image bytes into
    /// `backup_dir/cluster_<id>.bin`. Returns the number backed up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on file failures.
    pub fn create_backup(&self, backup_dir: &Path) -> Result<usize> {
        std::fs::create_dir_all(backup_dir)?;
        let mut count = 0usize;
        for entry in self.store.all() {
            let location = {
                let vat = self.vat.read();
                match vat.location_of(entry.cluster_id) {
                    Ok(loc) => loc,
                    Err(_) => continue,
                }
            };
            let data = { self.image.read().read_cluster(location) };
            let Ok(data) = data else { continue };
            let take = usize::try_from(entry.size).unwrap_or(data.len()).min(data.len());
            std::fs::write(backup_file(backup_dir, entry.cluster_id), &data[..take])?;
            count += 1;
        }
        info!(count, dir = %backup_dir.display(), "cluster backup written");
        Ok(count)
    }

    /// Current subsystem statistics.
    #[must_use]
    pub fn statistics(&self) -> IntegrityStatistics {
        IntegrityStatistics {
            total_checksums: self.store.len(),
            algorithm: self.algorithm,
            store_path: self.store.path().to_path_buf(),
            journal_attached: self.repairer.journal().is_some(),
            backup_attached: self.backup_dir.is_some(),
        }
    }
}
