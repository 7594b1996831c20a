//! End-to-end image construction and the engine facade.
//!
//! [`ImageBuilder`] walks a source tree, classifies and places every file,
//! materializes the on-image layout (superblock cluster, FAT region, data
//! clusters, VAT document, metadata record), computes per-cluster digests
//! and persists the result as a PNG with its sidecar.
//!
//! The batch build is the canonical write path. The single-file
//! [`ImageBuilder::write_protected`] path allocates, frames (optionally
//! with Reed–Solomon) and updates the in-memory grid synchronously;
//! container persistence happens on [`ImageBuilder::save`] or the next
//! build.

use crate::access::AccessTracker;
use crate::cache::{range_key, read_through, ClusterCache};
use crate::cluster::{clusters_for_size, ClusterLocation, CELLS_PER_CLUSTER, CLUSTER_BYTES};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::format::{FatEntry, FileType, RsFrameHeader, Superblock, SUPERBLOCK_SIZE};
use crate::image::GridImage;
use crate::integrity::{checksum::iso8601, IntegrityManager};
use crate::placer::{importance_order, Placer};
use crate::rs_codec::{encode_raw_frame, ReedSolomonCodec};
use crate::snapshot::{SnapshotManager, SnapshotMetadata};
use crate::vat::{VatDocument, VisualAllocationTable};
use crate::{SharedImage, SharedVat};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Image-format tag embedded in the container records.
pub const IMAGE_TYPE: &str = "infinite-map-v2";

/// Image-format version embedded in the container records.
pub const IMAGE_VERSION: &str = "2.0.0";

/// Container record key holding the serialized VAT.
pub const VAT_RECORD_KEY: &str = "InfiniteMap-VAT";

/// Reserved metadata tail: 64 KiB, clamped to a quarter of small grids.
const METADATA_TAIL_BYTES: u64 = 64 * 1024;

/// Source-tree analysis summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceAnalysis {
    /// Regular files read.
    pub file_count: usize,
    /// Total payload bytes.
    pub total_size: u64,
    /// Directories recorded.
    pub directory_count: usize,
    /// Entries skipped (symlinks, unreadable).
    pub skipped: usize,
}

/// Result of a completed build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    /// Output image path.
    pub path: PathBuf,
    /// Final grid side.
    pub grid_size: u32,
    /// Files placed.
    pub files: usize,
    /// Clusters owned after placement.
    pub total_clusters: usize,
    /// Payload bytes written.
    pub data_bytes: u64,
    /// Bytes of the written container file.
    pub image_bytes: u64,
}

#[derive(Debug, Clone)]
struct SourceFile {
    data: Vec<u8>,
    mtime: u32,
}

/// Builds and serves an Infinite Map image.
pub struct ImageBuilder {
    config: EngineConfig,
    source_dir: PathBuf,
    output_path: PathBuf,
    grid_size: u32,
    vat: SharedVat,
    image: SharedImage,
    placer: Placer,
    cache: Arc<ClusterCache>,
    access: Arc<AccessTracker>,
    integrity: Arc<IntegrityManager>,
    snapshots: SnapshotManager,
    rs_codec: Option<ReedSolomonCodec>,
    files: IndexMap<String, SourceFile>,
    directories: BTreeSet<String>,
    rs_files: BTreeSet<String>,
    /// Paths written through `write_protected` without erasure coding:
    /// their on-image payload carries the raw frame header.
    raw_framed_files: BTreeSet<String>,
}

impl std::fmt::Debug for ImageBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBuilder")
            .field("source_dir", &self.source_dir)
            .field("output_path", &self.output_path)
            .field("grid_size", &self.grid_size)
            .field("files", &self.files.len())
            .finish_non_exhaustive()
    }
}

impl ImageBuilder {
    /// Creates a builder for `source_dir` → `output_path` under `config`.
    ///
    /// # Errors
    ///
    /// Returns configuration validation failures, [`Error::Io`] for
    /// snapshot/journal setup failures.
    pub fn new(source_dir: &Path, output_path: &Path, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let grid_size = if config.grid_size == 0 { 64 } else { config.grid_size };
        let reserved = reserved_region(grid_size, u64::from(config.builder.max_files));
        let vat: SharedVat = Arc::new(RwLock::new(VisualAllocationTable::with_reserved(
            grid_size,
            reserved,
        )?));
        let image: SharedImage = Arc::new(RwLock::new(GridImage::new(grid_size)?));

        let store_path = checksum_store_path(output_path);
        let integrity = Arc::new(IntegrityManager::new(
            vat.clone(),
            image.clone(),
            &store_path,
            config.integrity.algorithm,
            config.integrity.journal_path.as_deref(),
            config.integrity.backup_dir.as_deref(),
        )?);

        let rs_codec = if config.erasure.enabled {
            Some(ReedSolomonCodec::new(config.erasure.shards)?)
        } else {
            None
        };
        let snapshots = SnapshotManager::new(&config.builder.snapshot_dir)?;
        let cache = Arc::new(ClusterCache::new(config.cache.max_size_bytes));
        let placer = Placer::new(grid_size);

        Ok(Self {
            config,
            source_dir: source_dir.to_path_buf(),
            output_path: output_path.to_path_buf(),
            grid_size,
            vat,
            image,
            placer,
            cache,
            access: Arc::new(AccessTracker::new()),
            integrity,
            snapshots,
            rs_codec,
            files: IndexMap::new(),
            directories: BTreeSet::new(),
            rs_files: BTreeSet::new(),
            raw_framed_files: BTreeSet::new(),
        })
    }

    /// Current grid side.
    #[must_use]
    pub fn grid_size(&self) -> u32 {
        self.grid_size
    }

    /// Shared VAT handle.
    #[must_use]
    pub fn vat(&self) -> SharedVat {
        self.vat.clone()
    }

    /// Shared image handle.
    #[must_use]
    pub fn image(&self) -> SharedImage {
        self.image.clone()
    }

    /// The cluster cache fronting reads.
    #[must_use]
    pub fn cache(&self) -> Arc<ClusterCache> {
        self.cache.clone()
    }

    /// Per-path access counters.
    #[must_use]
    pub fn access_tracker(&self) -> Arc<AccessTracker> {
        self.access.clone()
    }

    /// The integrity manager over this builder's table and image.
    #[must_use]
    pub fn integrity(&self) -> Arc<IntegrityManager> {
        self.integrity.clone()
    }

    /// The snapshot store.
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// The builder's importance classifier.
    #[must_use]
    pub fn placer(&self) -> &Placer {
        &self.placer
    }

    /// Size in bytes of a loaded file.
    #[must_use]
    pub fn file_size(&self, path: &str) -> Option<u64> {
        self.files.get(path).map(|f| f.data.len() as u64)
    }

    /// Walks the source tree into memory, skipping symlinks and unreadable
    /// entries, recording directories.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the source root itself cannot be read.
    pub fn analyze_source(&mut self) -> Result<SourceAnalysis> {
        let mut analysis = SourceAnalysis::default();
        let root = self.source_dir.clone();
        self.walk(&root, &mut analysis)?;
        info!(
            files = analysis.file_count,
            bytes = analysis.total_size,
            directories = analysis.directory_count,
            skipped = analysis.skipped,
            "source analyzed"
        );
        Ok(analysis)
    }

    fn walk(&mut self, dir: &Path, analysis: &mut SourceAnalysis) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    analysis.skipped += 1;
                    continue;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping entry");
                    analysis.skipped += 1;
                    continue;
                }
            };
            if file_type.is_symlink() {
                analysis.skipped += 1;
                continue;
            }
            if file_type.is_dir() {
                if let Some(rel) = self.relative_name(&path) {
                    self.directories.insert(rel);
                    analysis.directory_count += 1;
                }
                self.walk(&path, analysis)?;
                continue;
            }
            let Some(rel) = self.relative_name(&path) else {
                analysis.skipped += 1;
                continue;
            };
            match std::fs::read(&path) {
                Ok(data) => {
                    analysis.file_count += 1;
                    analysis.total_size += data.len() as u64;
                    let mtime = std::fs::metadata(&path)
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                        .map_or(0u32, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX));
                    self.files.insert(rel, SourceFile { data, mtime });
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable file");
                    analysis.skipped += 1;
                }
            }
        }
        Ok(())
    }

    fn relative_name(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.source_dir).ok()?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        (!name.is_empty()).then_some(name)
    }

    /// Framed length of a payload under the current protection settings.
    fn framed_len(&self, path: &str, raw_len: usize) -> u64 {
        if self.rs_files.contains(path) {
            if let Some(codec) = &self.rs_codec {
                let geometry = codec.config();
                let shard_size = (4 + raw_len).div_ceil(geometry.data_shards).max(1);
                return (RsFrameHeader::PROTECTED_LEN
                    + shard_size * (geometry.data_shards + geometry.parity_shards))
                    as u64;
            }
        }
        raw_len as u64
    }

    /// Builds the image end to end: grow the grid to fit, place files by
    /// importance, materialize the layout and persist the container.
    ///
    /// # Errors
    ///
    /// - [`Error::OutOfSpace`] when even the largest grid cannot hold the
    ///   tree.
    /// - [`Error::Io`] / [`Error::Corrupt`] from persistence.
    pub fn build(&mut self) -> Result<BuildReport> {
        if self.files.is_empty() {
            self.analyze_source()?;
        }

        // Layout sizing.
        let fat_len = (self.files.len() * crate::format::FAT_ENTRY_SIZE) as u64;
        let vat_capacity = self.estimate_vat_bytes();
        let data_bytes: u64 = self
            .files
            .iter()
            .map(|(path, file)| {
                clusters_for_size(self.framed_len(path, file.data.len())) * CLUSTER_BYTES as u64
            })
            .sum();

        // The only component allowed to grow the grid.
        loop {
            let capacity = u64::from(self.grid_size) * u64::from(self.grid_size) * 4;
            let head = SUPERBLOCK_SIZE as u64 + fat_len + vat_capacity;
            let tail = metadata_tail(self.grid_size);
            if head + data_bytes + tail <= capacity {
                break;
            }
            let next = self.grid_size * 2;
            if next > 1 << crate::hilbert::MAX_ORDER {
                return Err(Error::OutOfSpace(format!(
                    "source tree needs {} bytes, largest grid holds {}",
                    head + data_bytes + tail,
                    capacity
                )));
            }
            info!(from = self.grid_size, to = next, "growing grid");
            self.grid_size = next;
        }

        // Fresh table, image and placer at the final grid size.
        let head_bytes = SUPERBLOCK_SIZE as u64 + fat_len + vat_capacity;
        let head_clusters = head_bytes.div_ceil(CLUSTER_BYTES as u64);
        let tail_clusters = metadata_tail(self.grid_size) / CLUSTER_BYTES as u64;
        let reserved = explicit_reserved_region(self.grid_size, head_clusters, tail_clusters);
        {
            let mut vat = self.vat.write();
            *vat = VisualAllocationTable::with_reserved(self.grid_size, reserved)?;
            for dir in &self.directories {
                vat.add_directory(dir)?;
            }
        }
        {
            let mut image = self.image.write();
            *image = GridImage::new(self.grid_size)?;
        }
        self.placer = Placer::new(self.grid_size);
        self.cache.clear();
        // Batch placement rewrites every payload either unframed or
        // RS-framed; raw frames exist only on the single-file path.
        self.raw_framed_files.clear();

        // Place files, most important first, and write their clusters.
        let listing: Vec<(String, u64)> = self
            .files
            .iter()
            .map(|(path, file)| (path.clone(), file.data.len() as u64))
            .collect();
        let ordered = importance_order(&self.placer, &listing);
        let mut placed = 0usize;
        let mut payload_bytes = 0u64;
        for (path, _) in &ordered {
            let file = self.files.get(path).cloned().ok_or_else(|| {
                Error::InvariantViolated(format!("listing references unknown file {path}"))
            })?;
            match self.place_and_write(path, &file.data) {
                Ok(bytes) => {
                    placed += 1;
                    payload_bytes += bytes;
                }
                Err(e) if matches!(e, Error::Io(_) | Error::Corrupt(_)) => {
                    // Batch boundary: log and continue with remaining files.
                    warn!(path = %path, error = %e, "skipping file");
                }
                Err(e) => return Err(e),
            }
        }

        // Superblock, FAT region, VAT document, metadata record.
        let vat_offset = (SUPERBLOCK_SIZE as u64 + fat_len) as u32;
        let vat_json = {
            let vat = self.vat.read();
            serde_json::to_string(&vat.to_document().canonical())
                .map_err(|e| Error::Corrupt(format!("VAT serialization: {e}")))?
        };
        if vat_json.len() as u64 > vat_capacity {
            return Err(Error::OutOfSpace(format!(
                "VAT document of {} bytes exceeds its reserved {vat_capacity}",
                vat_json.len()
            )));
        }
        let fat_bytes = self.encode_fat();
        let superblock = Superblock::new(
            u16::try_from(self.grid_size).unwrap_or(u16::MAX),
            vat_offset,
            u32::try_from(vat_json.len()).unwrap_or(u32::MAX),
            u32::try_from(fat_bytes.len() / crate::format::FAT_ENTRY_SIZE).unwrap_or(u32::MAX),
        );
        let metadata_record = self.metadata_record()?;
        {
            let mut image = self.image.write();
            image.write_linear(0, &superblock.to_bytes())?;
            image.write_linear((SUPERBLOCK_SIZE / 4) as u64, &fat_bytes)?;
            image.write_linear(u64::from(vat_offset) / 4, vat_json.as_bytes())?;
            let tail_start_cell =
                image.curve().cell_count() - metadata_tail(self.grid_size) / 4;
            let record = &metadata_record[..metadata_record
                .len()
                .min(metadata_tail(self.grid_size) as usize)];
            image.write_linear(tail_start_cell, record)?;
        }

        self.save()?;
        self.integrity.persist_checksums()?;

        let report = BuildReport {
            path: self.output_path.clone(),
            grid_size: self.grid_size,
            files: placed,
            total_clusters: self.vat.read().total_clusters(),
            data_bytes: payload_bytes,
            image_bytes: std::fs::metadata(&self.output_path)
                .map(|m| m.len())
                .unwrap_or(0),
        };
        info!(
            files = report.files,
            grid = report.grid_size,
            image_bytes = report.image_bytes,
            "image built"
        );
        Ok(report)
    }

    /// Places one file and writes its payload clusters. Returns the
    /// payload bytes written.
    fn place_and_write(&mut self, path: &str, data: &[u8]) -> Result<u64> {
        let protected = self.rs_files.contains(path);
        let payload: Vec<u8> = if protected {
            let codec = self
                .rs_codec
                .as_ref()
                .ok_or_else(|| Error::Corrupt("RS flagged without a codec".to_string()))?;
            codec.encode_frame(data)?
        } else {
            data.to_vec()
        };

        let importance = self.placer.classify(path, data.len() as u64);
        let preferred = self.placer.preferred_location(path, importance);
        let chain = {
            let mut vat = self.vat.write();
            let chain = vat.allocate(path, payload.len() as u64, Some(preferred))?;
            if protected {
                vat.set_rs_protected(path, true);
            }
            chain
        };

        let realized = self.placer.zones().classify(chain[0]);
        let target = self.placer.target_zone(importance);
        if realized != target {
            debug!(path, target = %target, realized = %realized, "zone drift");
        }

        self.write_chain(path, &chain, &payload)?;
        Ok(data.len() as u64)
    }

    /// Writes a framed payload across a chain, recording digests and
    /// journal entries per cluster.
    fn write_chain(&self, path: &str, chain: &[ClusterLocation], payload: &[u8]) -> Result<()> {
        for (index, &location) in chain.iter().enumerate() {
            let start = index * CLUSTER_BYTES;
            if start >= payload.len() && index > 0 {
                break;
            }
            let end = (start + CLUSTER_BYTES).min(payload.len());
            let chunk = payload.get(start..end).unwrap_or(&[]);
            let cluster_id = { self.vat.read().linear_of(location)? };
            {
                let mut image = self.image.write();
                image.write_cluster(location, chunk)?;
            }
            self.integrity.compute_checksum(chunk, cluster_id);
            if self.integrity.journal().is_some() {
                self.integrity.journal_write(cluster_id, chunk)?;
            }
        }
        debug!(path, clusters = chain.len(), "chain written");
        Ok(())
    }

    /// Single-file write path: allocate, frame (Reed–Solomon when
    /// enabled), update the VAT and write the framed payload into the
    /// in-memory grid synchronously. The container on disk is refreshed by
    /// [`Self::save`] or the next [`Self::build`].
    ///
    /// # Errors
    ///
    /// Propagates allocation, encoding and image-write failures.
    pub fn write_protected(&mut self, path: &str, data: &[u8]) -> Result<ClusterLocation> {
        let use_rs = self.rs_codec.is_some();
        if use_rs {
            self.rs_files.insert(path.to_string());
            self.raw_framed_files.remove(path);
        } else {
            self.raw_framed_files.insert(path.to_string());
        }
        let payload: Vec<u8> = match &self.rs_codec {
            Some(codec) => codec.encode_frame(data)?,
            None => encode_raw_frame(data),
        };

        let importance = self.placer.classify(path, data.len() as u64);
        let preferred = self.placer.preferred_location(path, importance);
        let chain = {
            let mut vat = self.vat.write();
            let chain = vat.allocate(path, payload.len() as u64, Some(preferred))?;
            vat.set_rs_protected(path, use_rs);
            chain
        };
        self.write_chain(path, &chain, &payload)?;
        self.files.insert(
            path.to_string(),
            SourceFile {
                data: data.to_vec(),
                mtime: 0,
            },
        );
        // Stale cached ranges for a replaced path must not survive.
        self.invalidate_path_cache(path);
        Ok(chain[0])
    }

    /// Reads the file anchored at `location`, decoding its frame. Cluster
    /// ranges go through the cache; the per-path access counter is bumped.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] when no file is anchored there.
    /// - [`Error::ChecksumMismatch`] when a cluster fails verification.
    pub fn read_protected(&self, location: ClusterLocation) -> Result<Vec<u8>> {
        let (path, chain) = {
            let vat = self.vat.read();
            let owned = vat
                .owner_of(location)
                .ok_or_else(|| Error::NotFound(format!("no file anchored at {location}")))?;
            let path = owned.path.clone();
            let chain: Vec<ClusterLocation> = vat
                .chain(&path)
                .map(<[ClusterLocation]>::to_vec)
                .ok_or_else(|| Error::NotFound(format!("no VAT entry for {path}")))?;
            (path, chain)
        };
        if chain.first() != Some(&location) {
            return Err(Error::NotFound(format!(
                "{location} is not the anchor of {path}"
            )));
        }

        self.access.record(&path);
        let mut framed = Vec::with_capacity(chain.len() * CLUSTER_BYTES);
        for (index, &cluster) in chain.iter().enumerate() {
            let offset = (index * CLUSTER_BYTES) as u64;
            let key = range_key(&path, offset, CLUSTER_BYTES);
            let cluster_id = { self.vat.read().linear_of(cluster)? };
            let data = read_through(&self.cache, &key, || {
                let bytes = { self.image.read().read_cluster(cluster)? };
                self.integrity.verify_or_fail(&bytes, cluster_id)?;
                Ok(bytes)
            })?;
            // Sequential prefetch: stage the next cluster when the access
            // pattern says this file is being streamed.
            if self.config.cache.prefetch_enabled
                && self.cache.should_prefetch(&path, offset)
                && index + 1 < chain.len()
            {
                let next_key = range_key(&path, offset + CLUSTER_BYTES as u64, CLUSTER_BYTES);
                if let Ok(next) = self.image.read().read_cluster(chain[index + 1]) {
                    self.cache.queue_prefetch(&next_key, next);
                }
            }
            framed.extend_from_slice(&data);
        }

        self.decode_payload(&path, framed)
    }

    /// Convenience read by path.
    ///
    /// # Errors
    ///
    /// See [`Self::read_protected`].
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let anchor = {
            self.vat
                .read()
                .lookup(path)
                .ok_or_else(|| Error::NotFound(format!("no VAT entry for {path}")))?
        };
        self.read_protected(anchor)
    }

    /// Decodes an accumulated chain payload according to how the path was
    /// written: RS-framed, raw-framed, or unframed batch data. The VAT
    /// flag and the builder's write records decide; payload bytes are
    /// never sniffed for magic values.
    fn decode_payload(&self, path: &str, framed: Vec<u8>) -> Result<Vec<u8>> {
        if self.vat.read().is_rs_protected(path) {
            let codec = self.rs_codec.as_ref().ok_or_else(|| {
                Error::Corrupt(format!(
                    "{path} is RS protected but erasure coding is disabled"
                ))
            })?;
            return codec.decode_frame(&framed);
        }
        if self.raw_framed_files.contains(path) {
            let header = RsFrameHeader::from_bytes(&framed)?;
            if header.is_protected() {
                return Err(Error::Corrupt(format!(
                    "{path} recorded raw-framed but carries an RS frame"
                )));
            }
            let decoded = &framed[RsFrameHeader::RAW_LEN..];
            let size = self
                .file_size(path)
                .and_then(|s| usize::try_from(s).ok())
                .unwrap_or(decoded.len());
            return Ok(decoded[..size.min(decoded.len())].to_vec());
        }
        // Batch-built files are stored raw and unframed; trim the cluster
        // padding to the recorded size.
        let size = self
            .file_size(path)
            .and_then(|s| usize::try_from(s).ok())
            .unwrap_or(framed.len());
        Ok(framed[..size.min(framed.len())].to_vec())
    }

    /// Drops cached ranges belonging to `path`.
    fn invalidate_path_cache(&self, path: &str) {
        let prefix = format!("{path}:");
        for key in self.cache.keys() {
            if key.starts_with(&prefix) {
                self.cache.remove(&key);
            }
        }
    }

    /// Persists the current grid as the container image plus sidecar.
    ///
    /// # Errors
    ///
    /// Returns persistence failures.
    pub fn save(&self) -> Result<()> {
        let records = self.container_records()?;
        let image = self.image.read();
        image.save(&self.output_path, &records)
    }

    fn container_records(&self) -> Result<Vec<(String, String)>> {
        let vat = self.vat.read();
        let vat_json = serde_json::to_string(&vat.to_document().canonical())
            .map_err(|e| Error::Corrupt(format!("VAT serialization: {e}")))?;
        Ok(vec![
            ("type".to_string(), IMAGE_TYPE.to_string()),
            ("version".to_string(), IMAGE_VERSION.to_string()),
            ("grid_size".to_string(), self.grid_size.to_string()),
            ("spatial_storage".to_string(), "true".to_string()),
            ("vat_entries".to_string(), vat.entry_count().to_string()),
            (VAT_RECORD_KEY.to_string(), vat_json),
        ])
    }

    fn encode_fat(&self) -> Vec<u8> {
        let vat = self.vat.read();
        let mut out = Vec::with_capacity(self.files.len() * crate::format::FAT_ENTRY_SIZE);
        for (path, file) in &self.files {
            let Some(anchor) = vat.lookup(path) else { continue };
            let entry = FatEntry {
                name: path.clone(),
                first_cluster: anchor,
                size: u32::try_from(file.data.len()).unwrap_or(u32::MAX),
                mode: 0o644,
                mtime: file.mtime,
                file_type: FileType::File,
                importance: self.placer.classify(path, file.data.len() as u64),
                flags: u16::from(vat.is_rs_protected(path)),
            };
            out.extend_from_slice(&entry.to_bytes());
        }
        out
    }

    fn metadata_record(&self) -> Result<Vec<u8>> {
        let vat = self.vat.read();
        let files: Vec<serde_json::Value> = self
            .files
            .iter()
            .filter_map(|(path, file)| {
                let anchor = vat.lookup(path)?;
                Some(serde_json::json!({
                    "name": path,
                    "size": file.data.len(),
                    "importance": self.placer.classify(path, file.data.len() as u64),
                    "location": [anchor.x, anchor.y],
                }))
            })
            .collect();
        let record = serde_json::json!({
            "format": IMAGE_TYPE,
            "version": IMAGE_VERSION,
            "created_at": iso8601(SystemTime::now()),
            "superblock": {
                "grid_size": self.grid_size,
                "center": [vat.center().x, vat.center().y],
                "vat_entries": vat.entry_count(),
            },
            "files": files,
        });
        serde_json::to_vec(&record).map_err(|e| Error::Corrupt(format!("metadata record: {e}")))
    }

    /// Estimated serialized VAT size with margin.
    fn estimate_vat_bytes(&self) -> u64 {
        let per_entry: u64 = self
            .files
            .iter()
            .map(|(path, file)| {
                let chain = clusters_for_size(self.framed_len(path, file.data.len()));
                path.len() as u64 + 24 + chain * 16
            })
            .sum();
        let dirs: u64 = self.directories.iter().map(|d| d.len() as u64 + 8).sum();
        (per_entry + dirs) * 2 + 1024
    }

    /// Deletes a file: frees its chain and drops its cached ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown path.
    pub fn delete_file(&mut self, path: &str) -> Result<()> {
        {
            let mut vat = self.vat.write();
            vat.free_path(path)?;
        }
        self.files.shift_remove(path);
        self.rs_files.remove(path);
        self.raw_framed_files.remove(path);
        self.invalidate_path_cache(path);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshot integration
    // ------------------------------------------------------------------

    /// Captures the current VAT state.
    ///
    /// # Errors
    ///
    /// See [`SnapshotManager::create`].
    pub fn create_snapshot(&self, description: &str) -> Result<SnapshotMetadata> {
        let vat = self.vat.read();
        self.snapshots.create(&vat, description)
    }

    /// Restores a snapshot, replacing the in-memory VAT and invalidating
    /// the cluster cache (cache invalidation happens-after the restore).
    ///
    /// # Errors
    ///
    /// See [`SnapshotManager::restore`].
    pub fn restore_snapshot(&mut self, snapshot_id: &str) -> Result<()> {
        let restored = self.snapshots.restore(snapshot_id)?;
        if restored.grid_size() != self.grid_size {
            return Err(Error::Corrupt(format!(
                "snapshot {snapshot_id} captured a {}-cell grid, engine runs {}",
                restored.grid_size(),
                self.grid_size
            )));
        }
        {
            let mut vat = self.vat.write();
            *vat = restored;
        }
        self.cache.clear();
        let _ = self.cache.clear_prefetch_queue();
        info!(snapshot_id, "snapshot restored");
        Ok(())
    }

    /// Lists snapshots, newest first.
    #[must_use]
    pub fn list_snapshots(&self) -> Vec<SnapshotMetadata> {
        self.snapshots.list()
    }
}

/// Checksum-store sidecar path for an image: `<image>.checksums.json`.
#[must_use]
pub fn checksum_store_path(image_path: &Path) -> PathBuf {
    let mut name = image_path.as_os_str().to_os_string();
    name.push(".checksums.json");
    PathBuf::from(name)
}

/// Opens an existing container: the grid plus the VAT parsed from its
/// embedded record.
///
/// # Errors
///
/// Returns [`Error::Corrupt`] when the record is missing or unparsable.
pub fn open_image(path: &Path) -> Result<(GridImage, VisualAllocationTable, Vec<(String, String)>)> {
    let (image, records) = GridImage::open(path)?;
    let vat_json = records
        .iter()
        .find(|(key, _)| key == VAT_RECORD_KEY)
        .map(|(_, value)| value.clone())
        .ok_or_else(|| Error::Corrupt(format!("{} record missing", VAT_RECORD_KEY)))?;
    let doc: VatDocument = serde_json::from_str(&vat_json)
        .map_err(|e| Error::Corrupt(format!("embedded VAT document: {e}")))?;
    let vat = VisualAllocationTable::from_document(&doc)?;
    Ok((image, vat, records))
}

/// Head-plus-tail reservation for a grid sized by `max_files`, clamped so
/// small grids keep at least half their clusters allocatable.
fn reserved_region(grid_size: u32, max_files: u64) -> Vec<u64> {
    let total = u64::from(grid_size) * u64::from(grid_size) / CELLS_PER_CLUSTER;
    let head_bytes = SUPERBLOCK_SIZE as u64 + max_files * 96 + max_files * 68;
    let head = head_bytes
        .div_ceil(CLUSTER_BYTES as u64)
        .clamp(1, total / 4);
    let tail = (metadata_tail(grid_size) / CLUSTER_BYTES as u64).min(total / 4);
    explicit_reserved_region(grid_size, head, tail)
}

/// Reservation with explicit head and tail cluster counts.
fn explicit_reserved_region(grid_size: u32, head: u64, tail: u64) -> Vec<u64> {
    let total = u64::from(grid_size) * u64::from(grid_size) / CELLS_PER_CLUSTER;
    let mut out = Vec::new();
    for i in 0..head.min(total) {
        out.push(i * CELLS_PER_CLUSTER);
    }
    for i in 0..tail.min(total.saturating_sub(head)) {
        out.push((total - 1 - i) * CELLS_PER_CLUSTER);
    }
    out
}

/// Metadata tail bytes for a grid: 64 KiB, at most a quarter of capacity.
fn metadata_tail(grid_size: u32) -> u64 {
    let capacity = u64::from(grid_size) * u64::from(grid_size) * 4;
    METADATA_TAIL_BYTES.min(capacity / 4).max(CLUSTER_BYTES as u64)
}
