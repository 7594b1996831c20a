//! # Infinite Map Core
//!
//! A spatially-addressed, content-protected block-storage engine.
//!
//! The engine packs a directory tree into a single fixed-size
//! two-dimensional grid of 4-byte cells linearized by a Hilbert
//! space-filling curve. Placement is importance-aware (critical files sit
//! at the grid center), every cluster is checksum-protected with optional
//! Reed–Solomon erasure coding, the Visual Allocation Table can be
//! snapshotted and restored atomically, a background daemon scans and
//! repairs corruption, and a migration pipeline moves clusters between
//! concentric zones as their access frequency changes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use infinitemap_core::builder::ImageBuilder;
//! use infinitemap_core::config::EngineConfig;
//! use std::path::Path;
//!
//! fn main() -> infinitemap_core::Result<()> {
//!     let mut config = EngineConfig::load(None)?;
//!     config.grid_size = 256;
//!     let mut builder = ImageBuilder::new(
//!         Path::new("./rootfs"),
//!         Path::new("./system.rts.png"),
//!         config,
//!     )?;
//!     let report = builder.build()?;
//!     println!("built {} files on a {}² grid", report.files, report.grid_size);
//!
//!     // Reads go through the cluster cache and integrity verification.
//!     let kernel = builder.read_file("boot/vmlinuz")?;
//!     assert!(!kernel.is_empty());
//!     Ok(())
//! }
//! ```
//!
//! ## Layering
//!
//! Each layer depends only on those below it: [`hilbert`] → [`image`] →
//! [`vat`] → [`placer`] → [`integrity`] → [`snapshot`] / [`cache`] →
//! [`migration`] → [`relocation`] → [`healing`] / [`tuner`] → [`builder`].

#![warn(missing_docs)]

pub mod access;
pub mod builder;
#[cfg(test)]
mod builder_tests;
pub mod cache;
pub mod cache_optimizer;
pub mod cluster;
pub mod config;
pub mod error;
pub mod format;
pub mod healing;
pub mod hilbert;
pub mod image;
pub mod integrity;
pub mod migration;
pub mod placer;
pub mod relocation;
pub mod rs_codec;
pub mod snapshot;
pub mod tuner;
pub mod vat;
#[cfg(test)]
mod vat_property_tests;
pub mod zone;

pub use access::AccessTracker;
pub use builder::{open_image, BuildReport, ImageBuilder};
pub use cache::{AccessPatternTracker, CacheStats, ClusterCache, EvictionPolicy};
pub use cache_optimizer::CacheOptimizer;
pub use cluster::{ClusterLocation, CELL_BYTES, CLUSTER_BYTES};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use healing::{HealingStatistics, HealingTask, SelfHealingDaemon, TaskStatus};
pub use hilbert::{linear_to_xy, xy_to_linear, HilbertCurve};
pub use image::GridImage;
pub use integrity::{
    ChecksumAlgorithm, IntegrityManager, IntegrityReport, IntegrityStatus, RepairResult,
};
pub use migration::{MigrationBatch, MigrationConfig, MigrationPlanner};
pub use placer::Placer;
pub use relocation::{ClusterRelocator, RelocationBatch, RelocationResult};
pub use rs_codec::{ReedSolomonCodec, ReedSolomonConfig};
pub use snapshot::{SnapshotManager, SnapshotMetadata};
pub use tuner::{PerformanceTuner, TuningConfig, TuningResult};
pub use vat::{VatDocument, VisualAllocationTable};
pub use zone::{Zone, ZoneMap};

use std::sync::Arc;

/// Shared handle to the Visual Allocation Table. Readers (lookups,
/// migration planning) run in parallel; writers (allocation, relocation
/// updates) are serialized.
pub type SharedVat = Arc<parking_lot::RwLock<VisualAllocationTable>>;

/// Shared handle to the backing grid image.
pub type SharedImage = Arc<parking_lot::RwLock<GridImage>>;
