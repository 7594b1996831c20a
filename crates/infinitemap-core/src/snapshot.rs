//! Point-in-time VAT snapshots.
//!
//! A snapshot is `metadata.json` plus `vat.json` under
//! `<storage_dir>/<snapshot_id>/`. Both files are written into a hidden
//! temp directory and published with one atomic directory rename, so after
//! any crash a snapshot id is either fully present and self-consistent or
//! absent from [`SnapshotManager::list`].

use crate::error::{Error, Result};
use crate::vat::{VatDocument, VisualAllocationTable};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Metadata describing one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Unique id, `snap-<unix_seconds>-<8 hex chars>`.
    pub snapshot_id: String,
    /// Creation time, unix seconds.
    pub timestamp: u64,
    /// Grid side of the captured VAT.
    pub grid_size: u32,
    /// File entries captured.
    pub total_files: usize,
    /// Clusters across all chains.
    pub total_clusters: usize,
    /// SHA-256 digest of the canonical VAT document.
    pub vat_checksum: String,
    /// Free-form description.
    pub description: String,
    /// Total bytes of the snapshot directory.
    pub snapshot_size_bytes: u64,
}

/// The single-file export bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotBundle {
    /// Snapshot metadata.
    pub metadata: SnapshotMetadata,
    /// The captured VAT document.
    pub vat: VatDocument,
}

/// Manages the snapshot store under one directory.
#[derive(Debug)]
pub struct SnapshotManager {
    storage_dir: PathBuf,
}

impl SnapshotManager {
    /// Opens (creating if needed) a snapshot store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the directory cannot be created.
    pub fn new(storage_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(storage_dir)?;
        Ok(Self {
            storage_dir: storage_dir.to_path_buf(),
        })
    }

    /// The store directory.
    #[must_use]
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Captures the VAT. The snapshot id is unique and monotonic with wall
    /// time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on file failures.
    pub fn create(&self, vat: &VisualAllocationTable, description: &str) -> Result<SnapshotMetadata> {
        let timestamp = unix_now();
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
        let snapshot_id = format!("snap-{timestamp}-{suffix}");

        let doc = vat.to_document().canonical();
        let vat_checksum = vat.digest();
        let vat_body = serde_json::to_vec_pretty(&doc)
            .map_err(|e| Error::Corrupt(format!("VAT serialization: {e}")))?;

        let mut metadata = SnapshotMetadata {
            snapshot_id: snapshot_id.clone(),
            timestamp,
            grid_size: vat.grid_size(),
            total_files: vat.entry_count(),
            total_clusters: vat.total_clusters(),
            vat_checksum,
            description: if description.is_empty() {
                format!("Snapshot {snapshot_id}")
            } else {
                description.to_string()
            },
            snapshot_size_bytes: 0,
        };

        // Stage in a hidden directory, publish with one rename.
        let staging = self.storage_dir.join(format!(".tmp-{snapshot_id}"));
        std::fs::create_dir_all(&staging)?;
        std::fs::write(staging.join("vat.json"), &vat_body)?;
        let meta_probe = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| Error::Corrupt(format!("snapshot metadata: {e}")))?;
        metadata.snapshot_size_bytes = (vat_body.len() + meta_probe.len()) as u64;
        let meta_body = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| Error::Corrupt(format!("snapshot metadata: {e}")))?;
        std::fs::write(staging.join("metadata.json"), &meta_body)?;
        std::fs::rename(&staging, self.storage_dir.join(&snapshot_id))?;

        info!(
            snapshot_id = %snapshot_id,
            files = metadata.total_files,
            clusters = metadata.total_clusters,
            "snapshot created"
        );
        Ok(metadata)
    }

    /// Restores the VAT captured by `snapshot_id`, verifying its digest.
    /// Callers are responsible for invalidating dependent caches.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] for an unknown id.
    /// - [`Error::Corrupt`] for an unreadable document or digest mismatch.
    pub fn restore(&self, snapshot_id: &str) -> Result<VisualAllocationTable> {
        let dir = self.snapshot_dir(snapshot_id)?;
        let vat_body = std::fs::read(dir.join("vat.json"))?;
        let doc: VatDocument = serde_json::from_slice(&vat_body)
            .map_err(|e| Error::Corrupt(format!("snapshot {snapshot_id} VAT: {e}")))?;
        let vat = VisualAllocationTable::from_document(&doc)?;

        if let Some(metadata) = self.metadata(snapshot_id) {
            if metadata.vat_checksum != vat.digest() {
                return Err(Error::Corrupt(format!(
                    "snapshot {snapshot_id} digest mismatch"
                )));
            }
        }
        Ok(vat)
    }

    /// Metadata for one snapshot, when readable.
    #[must_use]
    pub fn metadata(&self, snapshot_id: &str) -> Option<SnapshotMetadata> {
        let dir = self.snapshot_dir(snapshot_id).ok()?;
        let body = std::fs::read(dir.join("metadata.json")).ok()?;
        serde_json::from_slice(&body).ok()
    }

    /// All snapshots, newest first by timestamp. Unreadable entries are
    /// skipped with a warning.
    #[must_use]
    pub fn list(&self) -> Vec<SnapshotMetadata> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.storage_dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            match self.metadata(name) {
                Some(metadata) => out.push(metadata),
                None => warn!(snapshot = name, "skipping snapshot with unreadable metadata"),
            }
        }
        out.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.snapshot_id.cmp(&a.snapshot_id))
        });
        out
    }

    /// Deletes a snapshot; returns whether it existed.
    #[must_use]
    pub fn delete(&self, snapshot_id: &str) -> bool {
        match self.snapshot_dir(snapshot_id) {
            Ok(dir) => std::fs::remove_dir_all(dir).is_ok(),
            Err(_) => false,
        }
    }

    /// Exports a snapshot as a portable single-file JSON bundle.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] for an unknown id.
    /// - [`Error::Io`] on file failures.
    pub fn export(&self, snapshot_id: &str, output: &Path) -> Result<()> {
        let dir = self.snapshot_dir(snapshot_id)?;
        let metadata: SnapshotMetadata =
            serde_json::from_slice(&std::fs::read(dir.join("metadata.json"))?)
                .map_err(|e| Error::Corrupt(format!("snapshot {snapshot_id} metadata: {e}")))?;
        let vat: VatDocument = serde_json::from_slice(&std::fs::read(dir.join("vat.json"))?)
            .map_err(|e| Error::Corrupt(format!("snapshot {snapshot_id} VAT: {e}")))?;
        let bundle = SnapshotBundle { metadata, vat };
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(&bundle)
            .map_err(|e| Error::Corrupt(format!("snapshot bundle: {e}")))?;
        crate::image::write_atomic(output, &body)?;
        Ok(())
    }

    /// Imports a bundle produced by [`Self::export`], keeping its id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] for an unreadable bundle, [`Error::Io`]
    /// on file failures.
    pub fn import(&self, input: &Path) -> Result<SnapshotMetadata> {
        let bundle: SnapshotBundle = serde_json::from_slice(&std::fs::read(input)?)
            .map_err(|e| Error::Corrupt(format!("snapshot bundle {}: {e}", input.display())))?;
        let snapshot_id = bundle.metadata.snapshot_id.clone();

        let staging = self.storage_dir.join(format!(".tmp-import-{snapshot_id}"));
        std::fs::create_dir_all(&staging)?;
        let meta_body = serde_json::to_vec_pretty(&bundle.metadata)
            .map_err(|e| Error::Corrupt(format!("snapshot metadata: {e}")))?;
        let vat_body = serde_json::to_vec_pretty(&bundle.vat)
            .map_err(|e| Error::Corrupt(format!("snapshot VAT: {e}")))?;
        std::fs::write(staging.join("metadata.json"), &meta_body)?;
        std::fs::write(staging.join("vat.json"), &vat_body)?;
        let target = self.storage_dir.join(&snapshot_id);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(&staging, &target)?;
        Ok(bundle.metadata)
    }

    fn snapshot_dir(&self, snapshot_id: &str) -> Result<PathBuf> {
        // Ids never contain separators; reject anything that would escape
        // the store.
        if snapshot_id.contains(['/', '\\']) || snapshot_id.starts_with('.') {
            return Err(Error::NotFound(format!("snapshot {snapshot_id}")));
        }
        let dir = self.storage_dir.join(snapshot_id);
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("snapshot {snapshot_id}")));
        }
        Ok(dir)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_vat() -> VisualAllocationTable {
        let mut vat = VisualAllocationTable::new(256).unwrap();
        vat.allocate("boot/vmlinuz", 600, None).unwrap();
        vat.allocate("readme.txt", 50, None).unwrap();
        vat.add_directory("boot").unwrap();
        vat.set_rs_protected("boot/vmlinuz", true);
        vat
    }

    #[test]
    fn test_create_restore_fidelity() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path()).unwrap();
        let vat = sample_vat();

        let metadata = manager.create(&vat, "before upgrade").unwrap();
        assert!(metadata.snapshot_id.starts_with("snap-"));
        assert_eq!(metadata.total_files, 2);
        assert_eq!(metadata.total_clusters, 2);
        assert_eq!(metadata.description, "before upgrade");
        assert!(metadata.snapshot_size_bytes > 0);

        let restored = manager.restore(&metadata.snapshot_id).unwrap();
        assert_eq!(restored.lookup("boot/vmlinuz"), vat.lookup("boot/vmlinuz"));
        assert_eq!(restored.lookup("readme.txt"), vat.lookup("readme.txt"));
        assert!(restored.is_directory("boot"));
        assert!(restored.is_rs_protected("boot/vmlinuz"));
        assert_eq!(restored.digest(), vat.digest());
        restored.check_invariants().unwrap();
    }

    #[test]
    fn test_id_shape() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path()).unwrap();
        let metadata = manager.create(&sample_vat(), "").unwrap();
        let parts: Vec<&str> = metadata.snapshot_id.splitn(3, '-').collect();
        assert_eq!(parts[0], "snap");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_list_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path()).unwrap();
        let vat = sample_vat();
        let a = manager.create(&vat, "first").unwrap();
        let b = manager.create(&vat, "second").unwrap();

        let listed = manager.list();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].timestamp >= listed[1].timestamp);
        let ids: Vec<&str> = listed.iter().map(|m| m.snapshot_id.as_str()).collect();
        assert!(ids.contains(&a.snapshot_id.as_str()));
        assert!(ids.contains(&b.snapshot_id.as_str()));
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path()).unwrap();
        let metadata = manager.create(&sample_vat(), "").unwrap();
        assert!(manager.delete(&metadata.snapshot_id));
        assert!(!manager.delete(&metadata.snapshot_id));
        assert!(manager.list().is_empty());
        assert!(matches!(
            manager.restore(&metadata.snapshot_id),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(&dir.path().join("a")).unwrap();
        let other = SnapshotManager::new(&dir.path().join("b")).unwrap();
        let vat = sample_vat();
        let metadata = manager.create(&vat, "portable").unwrap();

        let bundle_path = dir.path().join("bundle.json");
        manager.export(&metadata.snapshot_id, &bundle_path).unwrap();
        let imported = other.import(&bundle_path).unwrap();
        assert_eq!(imported.snapshot_id, metadata.snapshot_id);

        let restored = other.restore(&imported.snapshot_id).unwrap();
        assert_eq!(restored.digest(), vat.digest());
    }

    #[test]
    fn test_tampered_snapshot_refused() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path()).unwrap();
        let metadata = manager.create(&sample_vat(), "").unwrap();

        // Rewrite vat.json with a different (still valid) table.
        let other = VisualAllocationTable::new(256).unwrap();
        let body = serde_json::to_vec_pretty(&other.to_document().canonical()).unwrap();
        std::fs::write(
            dir.path().join(&metadata.snapshot_id).join("vat.json"),
            body,
        )
        .unwrap();

        assert!(matches!(
            manager.restore(&metadata.snapshot_id),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_staging_dirs_hidden_from_list() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path()).unwrap();
        std::fs::create_dir_all(dir.path().join(".tmp-snap-1-deadbeef")).unwrap();
        assert!(manager.list().is_empty());
    }
}
