//! Persistent sidecar store of per-cluster checksums.
//!
//! One JSON document per image, keyed by the stable cluster id. Loads
//! leniently (a damaged store is logged and treated as empty — digests are
//! recomputable), saves strictly via write-to-temp + atomic rename.

use super::checksum::ChecksumEntry;
use crate::error::{Error, Result};
use crate::image::write_atomic;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Store document version.
const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    /// Cluster id (as a decimal string key) → entry.
    checksums: BTreeMap<String, ChecksumEntry>,
}

/// Thread-safe persistent checksum store.
#[derive(Debug)]
pub struct ChecksumStore {
    path: PathBuf,
    entries: RwLock<FxHashMap<u64, ChecksumEntry>>,
}

impl ChecksumStore {
    /// Opens (or initializes) the store at `path`. A missing file yields an
    /// empty store; an unreadable document is logged and discarded.
    #[must_use]
    pub fn open(path: &Path) -> Self {
        let entries = match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<StoreDocument>(&bytes) {
                Ok(doc) => {
                    let mut map = FxHashMap::default();
                    for (key, mut entry) in doc.checksums {
                        match key.parse::<u64>() {
                            Ok(id) => {
                                entry.cluster_id = id;
                                map.insert(id, entry);
                            }
                            Err(_) => {
                                warn!(key = %key, "dropping checksum entry with non-numeric id");
                            }
                        }
                    }
                    map
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "checksum store unreadable, starting empty");
                    FxHashMap::default()
                }
            },
            Err(_) => FxHashMap::default(),
        };
        Self {
            path: path.to_path_buf(),
            entries: RwLock::new(entries),
        }
    }

    /// Store location on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entry for a cluster id.
    #[must_use]
    pub fn get(&self, cluster_id: u64) -> Option<ChecksumEntry> {
        self.entries.read().get(&cluster_id).cloned()
    }

    /// Inserts or overwrites an entry.
    pub fn set(&self, entry: ChecksumEntry) {
        self.entries.write().insert(entry.cluster_id, entry);
    }

    /// Removes an entry; returns whether it existed.
    pub fn remove(&self, cluster_id: u64) -> bool {
        self.entries.write().remove(&cluster_id).is_some()
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of all entries, sorted by cluster id.
    #[must_use]
    pub fn all(&self) -> Vec<ChecksumEntry> {
        let mut out: Vec<ChecksumEntry> = self.entries.read().values().cloned().collect();
        out.sort_unstable_by_key(|e| e.cluster_id);
        out
    }

    /// Persists the store atomically. Holds the write lock for the
    /// duration so a concurrent `set` cannot be half-captured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on file failures.
    pub fn save(&self) -> Result<()> {
        let entries = self.entries.write();
        let doc = StoreDocument {
            version: STORE_VERSION,
            checksums: entries
                .iter()
                .map(|(id, entry)| (id.to_string(), entry.clone()))
                .collect(),
        };
        let body = serde_json::to_vec_pretty(&doc)
            .map_err(|e| Error::Corrupt(format!("checksum store serialization: {e}")))?;
        write_atomic(&self.path, &body)
    }
}
