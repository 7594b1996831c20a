//! Visual Allocation Table (VAT).
//!
//! Maps each logical path to its ordered cluster chain, tracks the free set
//! of cluster starts and the directory entries, and maintains a reverse
//! index `cluster → path` so spatial reads never scan the table linearly.
//!
//! Invariants enforced here:
//! - a cluster is either free, reserved, or owned by exactly one path;
//! - every chain coordinate is a valid, aligned cluster start on the grid;
//! - a name is a file xor a directory.

use crate::cluster::{clusters_for_size, ClusterLocation, CELLS_PER_CLUSTER};
use crate::error::{Error, Result};
use crate::hilbert::HilbertCurve;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A file's cluster chain. Most files fit a handful of clusters.
pub type ClusterChain = SmallVec<[ClusterLocation; 4]>;

/// Weight of one nearby owned cluster in the allocation score.
const LOCALITY_BONUS: f64 = 0.1;

/// Record in the reverse index.
#[derive(Debug, Clone)]
pub struct OwnedCluster {
    /// Path that owns the cluster.
    pub path: String,
    /// Anchor coordinate of the cluster.
    pub location: ClusterLocation,
}

/// The Visual Allocation Table.
#[derive(Debug, Clone)]
pub struct VisualAllocationTable {
    grid_size: u32,
    center: ClusterLocation,
    curve: HilbertCurve,
    /// Path → ordered cluster chain. Insertion-ordered for deterministic
    /// iteration and serialization.
    entries: IndexMap<String, ClusterChain>,
    directory_entries: BTreeSet<String>,
    rs_protected: FxHashMap<String, bool>,
    /// Free cluster starts by linear offset; ascending iteration gives the
    /// lower-offset tie-break for free.
    free: BTreeSet<u64>,
    /// Cluster starts withheld from allocation (superblock, FAT and VAT
    /// regions, metadata tail).
    reserved: BTreeSet<u64>,
    /// Reverse index: linear offset of an owned cluster → owner.
    owners: FxHashMap<u64, OwnedCluster>,
}

impl VisualAllocationTable {
    /// Creates an empty table for a grid of side `grid_size` with every
    /// aligned cluster start free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] for unsupported grid sizes.
    pub fn new(grid_size: u32) -> Result<Self> {
        Self::with_reserved(grid_size, std::iter::empty())
    }

    /// Creates an empty table with the given linear cluster starts reserved
    /// (never handed out by the allocator).
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] for unsupported grid sizes or a
    /// reservation outside the grid.
    pub fn with_reserved(grid_size: u32, reserved: impl IntoIterator<Item = u64>) -> Result<Self> {
        let curve = HilbertCurve::for_grid(grid_size)?;
        let cell_count = curve.cell_count();
        let mut reserved_set = BTreeSet::new();
        for t in reserved {
            if t % CELLS_PER_CLUSTER != 0 || t >= cell_count {
                return Err(Error::OutOfBounds(format!(
                    "reserved offset {t} is not a cluster start on this grid"
                )));
            }
            reserved_set.insert(t);
        }
        let mut free = BTreeSet::new();
        let mut t = 0u64;
        while t < cell_count {
            if !reserved_set.contains(&t) {
                free.insert(t);
            }
            t += CELLS_PER_CLUSTER;
        }
        #[allow(clippy::cast_possible_truncation)] // grid_size <= 4096
        let center = ClusterLocation::new((grid_size / 2) as u16, (grid_size / 2) as u16);
        Ok(Self {
            grid_size,
            center,
            curve,
            entries: IndexMap::new(),
            directory_entries: BTreeSet::new(),
            rs_protected: FxHashMap::default(),
            free,
            reserved: reserved_set,
            owners: FxHashMap::default(),
        })
    }

    /// Grid side length `N`.
    #[must_use]
    pub fn grid_size(&self) -> u32 {
        self.grid_size
    }

    /// The grid center `(N/2, N/2)`.
    #[must_use]
    pub fn center(&self) -> ClusterLocation {
        self.center
    }

    /// The curve linearizing this grid.
    #[must_use]
    pub fn curve(&self) -> &HilbertCurve {
        &self.curve
    }

    /// Number of file entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Total owned clusters across all chains.
    #[must_use]
    pub fn total_clusters(&self) -> usize {
        self.owners.len()
    }

    /// Number of free cluster starts.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Linear offset of a coordinate, verifying it is an aligned cluster
    /// start.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] when off-grid or misaligned.
    pub fn linear_of(&self, location: ClusterLocation) -> Result<u64> {
        let t = self
            .curve
            .to_linear(u32::from(location.x), u32::from(location.y))?;
        if t % CELLS_PER_CLUSTER != 0 {
            return Err(Error::OutOfBounds(format!(
                "{location} (linear {t}) is not a cluster start"
            )));
        }
        Ok(t)
    }

    /// Coordinate of a linear cluster start.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] when `t` is misaligned or off-grid.
    #[allow(clippy::cast_possible_truncation)] // grid_size <= 4096
    pub fn location_of(&self, t: u64) -> Result<ClusterLocation> {
        if t % CELLS_PER_CLUSTER != 0 {
            return Err(Error::OutOfBounds(format!(
                "linear offset {t} is not a cluster start"
            )));
        }
        let (x, y) = self.curve.to_xy(t)?;
        Ok(ClusterLocation::new(x as u16, y as u16))
    }

    /// Allocates `⌈size/4096⌉` clusters (at least one) for `path`.
    ///
    /// When `preferred` is given, the first cluster uses it if it is a free
    /// cluster start, otherwise the nearest free start to it; subsequent
    /// clusters are chosen by the locality heuristic. Re-allocating an
    /// existing file path replaces its chain.
    ///
    /// # Errors
    ///
    /// - [`Error::PathConflict`] when `path` exists as a directory.
    /// - [`Error::OutOfSpace`] when the free set cannot satisfy the request.
    pub fn allocate(
        &mut self,
        path: &str,
        size: u64,
        preferred: Option<ClusterLocation>,
    ) -> Result<ClusterChain> {
        if self.directory_entries.contains(path) {
            return Err(Error::PathConflict(format!(
                "{path} already exists as a directory"
            )));
        }
        if self.entries.contains_key(path) {
            debug!(path, "replacing existing chain");
            self.free_path(path)?;
        }
        let needed = clusters_for_size(size);
        if (self.free.len() as u64) < needed {
            return Err(Error::OutOfSpace(format!(
                "{path} needs {needed} clusters, {} free",
                self.free.len()
            )));
        }

        let mut chain = ClusterChain::new();
        for i in 0..needed {
            let t = if i == 0 {
                match preferred {
                    Some(pref) => self.claim_preferred(pref)?,
                    None => self.best_free()?,
                }
            } else {
                self.best_free()?
            };
            let location = self.location_of(t)?;
            self.free.remove(&t);
            self.owners.insert(
                t,
                OwnedCluster {
                    path: path.to_string(),
                    location,
                },
            );
            chain.push(location);
        }
        self.entries.insert(path.to_string(), chain.clone());
        Ok(chain)
    }

    /// Picks the preferred coordinate when it is a free cluster start,
    /// otherwise the nearest free start to it.
    fn claim_preferred(&self, preferred: ClusterLocation) -> Result<u64> {
        if u32::from(preferred.x) >= self.grid_size || u32::from(preferred.y) >= self.grid_size {
            return Err(Error::OutOfBounds(format!(
                "preferred coordinate {preferred} outside {0}x{0} grid",
                self.grid_size
            )));
        }
        if let Ok(t) = self.linear_of(preferred) {
            if self.free.contains(&t) {
                return Ok(t);
            }
        }
        self.nearest_free_to(preferred)
            .ok_or_else(|| Error::OutOfSpace("no free clusters".to_string()))
    }

    /// Nearest free cluster start to a point, ties broken by lower linear
    /// offset.
    #[must_use]
    pub fn nearest_free_to(&self, point: ClusterLocation) -> Option<u64> {
        let mut best: Option<(f64, u64)> = None;
        for &t in &self.free {
            let Ok(loc) = self.location_of(t) else {
                continue;
            };
            let dist = loc.distance_to(point);
            let better = match best {
                None => true,
                Some((best_dist, _)) => dist < best_dist,
            };
            if better {
                best = Some((dist, t));
            }
        }
        best.map(|(_, t)| t)
    }

    /// Scores a free cluster for allocation preference:
    /// `(1 − dist_to_center / (N/2)) + 0.1 · |owned clusters within N/8|`.
    #[must_use]
    pub fn score_location(&self, location: ClusterLocation) -> f64 {
        let half = f64::from(self.grid_size) / 2.0;
        let center_score = 1.0 - location.distance_to(self.center) / half;
        let radius = f64::from(self.grid_size) / 8.0;
        let mut neighbors = 0u32;
        for owned in self.owners.values() {
            if owned.location.distance_to(location) < radius {
                neighbors += 1;
            }
        }
        center_score + LOCALITY_BONUS * f64::from(neighbors)
    }

    /// Best free cluster start by the locality heuristic.
    fn best_free(&self) -> Result<u64> {
        let mut best: Option<(f64, u64)> = None;
        for &t in &self.free {
            let loc = self.location_of(t)?;
            let score = self.score_location(loc);
            // Ascending linear iteration: strict > keeps the lower offset
            // on ties.
            let better = match best {
                None => true,
                Some((best_score, _)) => score > best_score,
            };
            if better {
                best = Some((score, t));
            }
        }
        best.map(|(_, t)| t)
            .ok_or_else(|| Error::OutOfSpace("no free clusters".to_string()))
    }

    /// Anchor (first cluster) of `path`, or `None`.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<ClusterLocation> {
        self.entries.get(path).and_then(|chain| chain.first().copied())
    }

    /// Full cluster chain of `path`.
    #[must_use]
    pub fn chain(&self, path: &str) -> Option<&[ClusterLocation]> {
        self.entries.get(path).map(SmallVec::as_slice)
    }

    /// Returns all clusters of `path` to the free set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the path has no entry.
    pub fn free_path(&mut self, path: &str) -> Result<()> {
        let chain = self
            .entries
            .shift_remove(path)
            .ok_or_else(|| Error::NotFound(format!("no VAT entry for {path}")))?;
        for location in chain {
            let t = self.linear_of(location)?;
            self.owners.remove(&t);
            self.free.insert(t);
        }
        self.rs_protected.remove(path);
        Ok(())
    }

    /// True when `path` is a directory entry.
    #[must_use]
    pub fn is_directory(&self, path: &str) -> bool {
        self.directory_entries.contains(path)
    }

    /// Registers a directory entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PathConflict`] when the name already names a file.
    pub fn add_directory(&mut self, path: &str) -> Result<()> {
        if self.entries.contains_key(path) {
            return Err(Error::PathConflict(format!(
                "{path} already exists as a file"
            )));
        }
        self.directory_entries.insert(path.to_string());
        Ok(())
    }

    /// Directory entries, sorted.
    #[must_use]
    pub fn directories(&self) -> Vec<String> {
        self.directory_entries.iter().cloned().collect()
    }

    /// Owner of the cluster anchored at `location`, via the reverse index.
    #[must_use]
    pub fn owner_of(&self, location: ClusterLocation) -> Option<&OwnedCluster> {
        let t = self.linear_of(location).ok()?;
        self.owners.get(&t)
    }

    /// Marks or clears the erasure-coding flag for a file.
    pub fn set_rs_protected(&mut self, path: &str, protected: bool) {
        self.rs_protected.insert(path.to_string(), protected);
    }

    /// True when `path` is flagged as erasure coded.
    #[must_use]
    pub fn is_rs_protected(&self, path: &str) -> bool {
        self.rs_protected.get(path).copied().unwrap_or(false)
    }

    /// Iterates `(path, chain)` pairs in insertion order.
    pub fn iter_entries(&self) -> impl Iterator<Item = (&str, &[ClusterLocation])> {
        self.entries
            .iter()
            .map(|(path, chain)| (path.as_str(), chain.as_slice()))
    }

    /// Free cluster starts with their coordinates, ascending by linear
    /// offset.
    #[must_use]
    pub fn free_clusters(&self) -> Vec<(u64, ClusterLocation)> {
        self.free
            .iter()
            .filter_map(|&t| self.location_of(t).ok().map(|loc| (t, loc)))
            .collect()
    }

    /// Deduplicated owned cluster coordinates with their linear offsets.
    #[must_use]
    pub fn owned_clusters(&self) -> Vec<(u64, ClusterLocation)> {
        let mut out: Vec<(u64, ClusterLocation)> = self
            .owners
            .iter()
            .map(|(&t, owned)| (t, owned.location))
            .collect();
        out.sort_unstable_by_key(|&(t, _)| t);
        out
    }

    /// Swaps one cluster of `path` from `old` to `new` and updates the free
    /// set and reverse index. Used by the physical relocator under the VAT
    /// write lock.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when `path` has no entry or does not own `old`.
    /// - [`Error::OutOfSpace`] when `new` is not a free cluster start.
    pub fn relocate(&mut self, path: &str, old: ClusterLocation, new: ClusterLocation) -> Result<()> {
        let old_t = self.linear_of(old)?;
        let new_t = self.linear_of(new)?;
        if !self.free.contains(&new_t) {
            return Err(Error::OutOfSpace(format!(
                "target {new} is not free for relocation"
            )));
        }
        let chain = self
            .entries
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(format!("no VAT entry for {path}")))?;
        let slot = chain
            .iter_mut()
            .find(|loc| **loc == old)
            .ok_or_else(|| Error::NotFound(format!("{path} does not own cluster {old}")))?;
        *slot = new;
        self.free.remove(&new_t);
        self.free.insert(old_t);
        self.owners.remove(&old_t);
        self.owners.insert(
            new_t,
            OwnedCluster {
                path: path.to_string(),
                location: new,
            },
        );
        Ok(())
    }

    /// Verifies the table invariants: chains disjoint and aligned, free and
    /// owned sets disjoint, their union (plus reservations) covering every
    /// valid cluster start, names a file xor a directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolated`] describing the first violation.
    pub fn check_invariants(&self) -> Result<()> {
        let mut seen: FxHashMap<u64, &str> = FxHashMap::default();
        for (path, chain) in &self.entries {
            if chain.is_empty() {
                return Err(Error::InvariantViolated(format!("{path} has an empty chain")));
            }
            if self.directory_entries.contains(path) {
                return Err(Error::InvariantViolated(format!(
                    "{path} is both a file and a directory"
                )));
            }
            for &location in chain {
                let t = self.linear_of(location).map_err(|_| {
                    Error::InvariantViolated(format!("{path} chain member {location} misaligned"))
                })?;
                if let Some(other) = seen.insert(t, path.as_str()) {
                    return Err(Error::InvariantViolated(format!(
                        "cluster {location} owned by both {other} and {path}"
                    )));
                }
                if self.free.contains(&t) {
                    return Err(Error::InvariantViolated(format!(
                        "cluster {location} is both owned and free"
                    )));
                }
                match self.owners.get(&t) {
                    Some(owned) if owned.path == *path => {}
                    _ => {
                        return Err(Error::InvariantViolated(format!(
                            "reverse index missing cluster {location} of {path}"
                        )))
                    }
                }
            }
        }
        let expected = self.curve.cell_count() / CELLS_PER_CLUSTER;
        let covered = seen.len() as u64 + self.free.len() as u64 + self.reserved.len() as u64;
        if covered != expected {
            return Err(Error::InvariantViolated(format!(
                "cluster starts covered {covered} != {expected}"
            )));
        }
        if self.owners.len() != seen.len() {
            return Err(Error::InvariantViolated(format!(
                "reverse index holds {} clusters, chains hold {}",
                self.owners.len(),
                seen.len()
            )));
        }
        Ok(())
    }

    /// Serializes to the self-describing VAT document.
    #[must_use]
    pub fn to_document(&self) -> VatDocument {
        let entries = self
            .entries
            .iter()
            .map(|(path, chain)| {
                (
                    path.clone(),
                    chain.iter().map(|loc| [loc.x, loc.y]).collect(),
                )
            })
            .collect();
        let rs_protected = self
            .rs_protected
            .iter()
            .map(|(path, &flag)| (path.clone(), flag))
            .collect();
        VatDocument {
            format: VAT_FORMAT.to_string(),
            version: VAT_VERSION.to_string(),
            grid_size: self.grid_size,
            center: [self.center.x, self.center.y],
            entries,
            directory_entries: self.directory_entries.iter().cloned().collect(),
            rs_protected,
        }
    }

    /// Rebuilds a table from a document, reconstructing the free set and
    /// reverse index.
    ///
    /// # Errors
    ///
    /// - [`Error::Corrupt`] for a wrong format tag, version or grid size.
    /// - [`Error::InvariantViolated`] for overlapping or misaligned chains.
    pub fn from_document(doc: &VatDocument) -> Result<Self> {
        Self::from_document_with_reserved(doc, std::iter::empty())
    }

    /// [`Self::from_document`] with reserved regions carried over.
    ///
    /// # Errors
    ///
    /// See [`Self::from_document`].
    pub fn from_document_with_reserved(
        doc: &VatDocument,
        reserved: impl IntoIterator<Item = u64>,
    ) -> Result<Self> {
        if doc.format != VAT_FORMAT {
            return Err(Error::Corrupt(format!(
                "unexpected VAT format tag {:?}",
                doc.format
            )));
        }
        if doc.version != VAT_VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported VAT version {:?}",
                doc.version
            )));
        }
        let mut vat = Self::with_reserved(doc.grid_size, reserved)?;
        vat.center = ClusterLocation::new(doc.center[0], doc.center[1]);
        for (path, coords) in &doc.entries {
            let mut chain = ClusterChain::new();
            for &[x, y] in coords {
                let location = ClusterLocation::new(x, y);
                let t = vat.linear_of(location).map_err(|_| {
                    Error::Corrupt(format!("VAT entry {path} has invalid coordinate {location}"))
                })?;
                if vat.owners.contains_key(&t) {
                    return Err(Error::InvariantViolated(format!(
                        "VAT document assigns cluster {location} twice"
                    )));
                }
                vat.free.remove(&t);
                vat.owners.insert(
                    t,
                    OwnedCluster {
                        path: path.clone(),
                        location,
                    },
                );
                chain.push(location);
            }
            if chain.is_empty() {
                return Err(Error::Corrupt(format!("VAT entry {path} has no clusters")));
            }
            vat.entries.insert(path.clone(), chain);
        }
        for dir in &doc.directory_entries {
            if vat.entries.contains_key(dir) {
                return Err(Error::Corrupt(format!(
                    "{dir} is both a file and a directory in the document"
                )));
            }
            vat.directory_entries.insert(dir.clone());
        }
        for (path, &flag) in &doc.rs_protected {
            vat.rs_protected.insert(path.clone(), flag);
        }
        Ok(vat)
    }

    /// SHA-256 digest of the canonical (sorted-key) document serialization.
    #[must_use]
    pub fn digest(&self) -> String {
        let doc = self.to_document();
        let canonical = serde_json::to_string(&doc.canonical()).unwrap_or_default();
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// Format tag of the serialized VAT document.
pub const VAT_FORMAT: &str = "visual-allocation-table-v2";

/// Version of the serialized VAT document.
pub const VAT_VERSION: &str = "2.0";

/// The self-describing serialized form of the VAT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatDocument {
    /// Always [`VAT_FORMAT`].
    pub format: String,
    /// Always [`VAT_VERSION`].
    pub version: String,
    /// Grid side length.
    pub grid_size: u32,
    /// Grid center `[x, y]`.
    pub center: [u16; 2],
    /// Path → list of `[x, y]` cluster coordinates.
    pub entries: BTreeMap<String, Vec<[u16; 2]>>,
    /// Directory names, disjoint from file paths.
    pub directory_entries: Vec<String>,
    /// Per-file erasure-coding flags.
    pub rs_protected: BTreeMap<String, bool>,
}

impl VatDocument {
    /// A copy with sorted directory entries, for stable digests.
    #[must_use]
    pub fn canonical(&self) -> Self {
        let mut doc = self.clone();
        doc.directory_entries.sort();
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vat() -> VisualAllocationTable {
        VisualAllocationTable::new(64).unwrap()
    }

    #[test]
    fn test_allocate_and_lookup() {
        let mut vat = vat();
        let chain = vat.allocate("etc/passwd", 600, None).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(vat.lookup("etc/passwd"), Some(chain[0]));
        assert_eq!(vat.owner_of(chain[0]).unwrap().path, "etc/passwd");
        vat.check_invariants().unwrap();
    }

    #[test]
    fn test_allocate_multi_cluster() {
        let mut vat = vat();
        let chain = vat.allocate("big.bin", 4096 * 3 + 1, None).unwrap();
        assert_eq!(chain.len(), 4);
        vat.check_invariants().unwrap();
    }

    #[test]
    fn test_first_allocation_gravitates_to_center() {
        let mut vat = vat();
        let chain = vat.allocate("hot", 100, None).unwrap();
        let dist = chain[0].distance_to(vat.center());
        // 64x64 grid has 4 cluster starts; the best-scoring one is the
        // closest to center among them.
        let best = vat
            .owned_clusters()
            .iter()
            .map(|&(_, loc)| loc.distance_to(vat.center()))
            .fold(f64::INFINITY, f64::min);
        assert!((dist - best).abs() < f64::EPSILON);
    }

    #[test]
    fn test_free_returns_clusters() {
        let mut vat = vat();
        let before = vat.free_count();
        vat.allocate("tmp/file", 10, None).unwrap();
        assert_eq!(vat.free_count(), before - 1);
        vat.free_path("tmp/file").unwrap();
        assert_eq!(vat.free_count(), before);
        assert!(vat.lookup("tmp/file").is_none());
        vat.check_invariants().unwrap();
    }

    #[test]
    fn test_out_of_space() {
        let mut vat = vat();
        // 64x64 = 4096 cells = 4 clusters.
        assert!(matches!(
            vat.allocate("huge", 4096 * 5, None),
            Err(Error::OutOfSpace(_))
        ));
    }

    #[test]
    fn test_directory_conflict() {
        let mut vat = vat();
        vat.add_directory("etc").unwrap();
        assert!(matches!(
            vat.allocate("etc", 10, None),
            Err(Error::PathConflict(_))
        ));
        vat.allocate("etc/hosts", 10, None).unwrap();
        assert!(matches!(
            vat.add_directory("etc/hosts"),
            Err(Error::PathConflict(_))
        ));
        assert!(vat.is_directory("etc"));
        assert!(!vat.is_directory("etc/hosts"));
    }

    #[test]
    fn test_reallocation_replaces_chain() {
        let mut vat = vat();
        let first = vat.allocate("f", 10, None).unwrap();
        let second = vat.allocate("f", 4096 * 2, None).unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(vat.entry_count(), 1);
        // The old anchor was recycled into the new allocation or freed.
        vat.check_invariants().unwrap();
        let _ = first;
    }

    #[test]
    fn test_preferred_location_honored_when_free() {
        let mut vat = vat();
        let t = 2 * CELLS_PER_CLUSTER;
        let preferred = vat.location_of(t).unwrap();
        let chain = vat.allocate("pinned", 10, Some(preferred)).unwrap();
        assert_eq!(chain[0], preferred);
    }

    #[test]
    fn test_preferred_location_falls_back_to_nearest() {
        let mut vat = vat();
        let t = 2 * CELLS_PER_CLUSTER;
        let preferred = vat.location_of(t).unwrap();
        vat.allocate("squatter", 10, Some(preferred)).unwrap();
        let chain = vat.allocate("evicted", 10, Some(preferred)).unwrap();
        assert_ne!(chain[0], preferred);
        vat.check_invariants().unwrap();
    }

    #[test]
    fn test_relocate_updates_reverse_index() {
        let mut vat = vat();
        let chain = vat.allocate("mover", 10, None).unwrap();
        let old = chain[0];
        let new_t = *vat.free.iter().next().unwrap();
        let new = vat.location_of(new_t).unwrap();
        vat.relocate("mover", old, new).unwrap();
        assert_eq!(vat.lookup("mover"), Some(new));
        assert!(vat.owner_of(old).is_none());
        assert_eq!(vat.owner_of(new).unwrap().path, "mover");
        vat.check_invariants().unwrap();
    }

    #[test]
    fn test_relocate_to_occupied_target_fails() {
        let mut vat = vat();
        let a = vat.allocate("a", 10, None).unwrap()[0];
        let b = vat.allocate("b", 10, None).unwrap()[0];
        assert!(matches!(
            vat.relocate("a", a, b),
            Err(Error::OutOfSpace(_))
        ));
    }

    #[test]
    fn test_document_round_trip() {
        let mut vat = VisualAllocationTable::new(256).unwrap();
        vat.allocate("boot/vmlinuz", 600, None).unwrap();
        vat.allocate("lib/libc.so", 400, None).unwrap();
        vat.add_directory("boot").unwrap();
        vat.set_rs_protected("lib/libc.so", true);

        let doc = vat.to_document();
        assert_eq!(doc.format, VAT_FORMAT);
        let restored = VisualAllocationTable::from_document(&doc).unwrap();
        assert_eq!(restored.lookup("boot/vmlinuz"), vat.lookup("boot/vmlinuz"));
        assert_eq!(restored.lookup("lib/libc.so"), vat.lookup("lib/libc.so"));
        assert!(restored.is_directory("boot"));
        assert!(restored.is_rs_protected("lib/libc.so"));
        assert_eq!(restored.digest(), vat.digest());
        restored.check_invariants().unwrap();
    }

    #[test]
    fn test_document_rejects_overlap() {
        let mut vat = VisualAllocationTable::new(256).unwrap();
        let loc = vat.allocate("a", 10, None).unwrap()[0];
        let mut doc = vat.to_document();
        doc.entries.insert("b".to_string(), vec![[loc.x, loc.y]]);
        assert!(matches!(
            VisualAllocationTable::from_document(&doc),
            Err(Error::InvariantViolated(_))
        ));
    }

    #[test]
    fn test_document_rejects_bad_format() {
        let vat = vat();
        let mut doc = vat.to_document();
        doc.format = "fat32".to_string();
        assert!(matches!(
            VisualAllocationTable::from_document(&doc),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_reserved_clusters_never_allocated() {
        let mut vat = VisualAllocationTable::with_reserved(64, [0u64]).unwrap();
        for _ in 0..3 {
            let name = format!("f{}", vat.entry_count());
            let chain = vat.allocate(&name, 10, None).unwrap();
            assert_ne!(vat.linear_of(chain[0]).unwrap(), 0);
        }
        assert!(matches!(
            vat.allocate("one-too-many", 10, None),
            Err(Error::OutOfSpace(_))
        ));
        vat.check_invariants().unwrap();
    }
}
