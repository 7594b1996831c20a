//! Importance-aware placement.
//!
//! Classifies a file path into an importance score in `[0, 255]` via a
//! deterministic rule table, maps the score to a target radius from the
//! grid center, picks a pseudo-random cell on that circle with an RNG
//! seeded from the path (identical inputs yield identical images), and
//! delegates the actual claim to [`VisualAllocationTable::allocate`].

use crate::cluster::ClusterLocation;
use crate::error::Result;
use crate::vat::{ClusterChain, VisualAllocationTable};
use crate::zone::{Zone, ZoneMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tracing::warn;

/// Maximum importance score, placed at the exact center.
pub const MAX_IMPORTANCE: u8 = 255;

/// Default score for unclassified paths.
pub const DEFAULT_IMPORTANCE: u8 = 100;

/// Importance classifier and placement driver.
#[derive(Debug, Clone)]
pub struct Placer {
    zones: ZoneMap,
    /// Per-path score overrides, consulted before the rule table.
    overrides: FxHashMap<String, u8>,
}

impl Placer {
    /// Creates a placer for a grid of side `grid_size`.
    #[must_use]
    pub fn new(grid_size: u32) -> Self {
        Self {
            zones: ZoneMap::for_grid(grid_size),
            overrides: FxHashMap::default(),
        }
    }

    /// Creates a placer with per-path importance overrides (hot-data
    /// pinning).
    #[must_use]
    pub fn with_overrides(grid_size: u32, overrides: FxHashMap<String, u8>) -> Self {
        Self {
            zones: ZoneMap::for_grid(grid_size),
            overrides,
        }
    }

    /// Zone map used for placement verification.
    #[must_use]
    pub fn zones(&self) -> &ZoneMap {
        &self.zones
    }

    /// Importance score for a path, `0..=255`. Higher scores place closer
    /// to the center. The rule table is deterministic; `size` currently
    /// participates only through the model/archive rules.
    #[must_use]
    #[allow(unused_variables)]
    pub fn classify(&self, path: &str, size: u64) -> u8 {
        if let Some(&score) = self.overrides.get(path) {
            return score;
        }
        let lower = path.to_lowercase();

        // Critical boot files go to the exact center.
        if lower.starts_with("boot/") || lower == "boot" {
            if lower.contains("vmlinuz") || lower.contains("kernel") {
                return 255;
            }
            if lower.contains("initramfs") || lower.contains("initrd") {
                return 253;
            }
            return 240;
        }

        // Core libraries.
        if lower.contains("lib/libc.so") || lower.contains("lib/ld-linux") {
            return 245;
        }
        if lower.contains("lib/libm.so") || lower.contains("lib/libdl.so") {
            return 243;
        }

        // Core runtime.
        if lower.starts_with("system/") && (lower.contains("runtime") || lower.contains("daemon")) {
            return 235;
        }

        // Essential tools.
        if ["/bin/sh", "/bin/bash", "/bin/busybox"]
            .iter()
            .any(|t| lower.contains(t))
        {
            return 230;
        }

        // Configuration.
        if lower.starts_with("etc/") || lower.contains("config") {
            return 200;
        }

        // Shared libraries.
        if lower.starts_with("lib/") || lower.starts_with("usr/lib/") {
            return 190;
        }

        // User binaries.
        if lower.starts_with("bin/") || lower.starts_with("usr/bin/") {
            return 180;
        }

        // Models: large but important.
        if lower.starts_with("models/") || lower.contains(".gguf") {
            return 160;
        }

        // Documentation.
        if ["/doc/", "/man/", "readme"].iter().any(|t| lower.contains(t)) {
            return DEFAULT_IMPORTANCE;
        }

        // Home directories.
        if lower.starts_with("home/") {
            return 120;
        }

        // Cache and temp.
        if ["/cache", "/tmp", "/var/cache"].iter().any(|t| lower.contains(t)) {
            return 50;
        }

        // Archive and backup.
        if ["/backup", "/old", "/archive"].iter().any(|t| lower.contains(t)) {
            return 30;
        }

        DEFAULT_IMPORTANCE
    }

    /// Target radius from center for an importance score:
    /// `(1 − importance/255) · N/2`.
    #[must_use]
    pub fn target_radius(&self, importance: u8) -> f64 {
        (1.0 - f64::from(importance) / f64::from(MAX_IMPORTANCE))
            * (f64::from(self.zones.grid_size) / 2.0)
    }

    /// Target zone for an importance score.
    #[must_use]
    pub fn target_zone(&self, importance: u8) -> Zone {
        self.zones.classify_distance(self.target_radius(importance))
    }

    /// Preferred cell for a path: a pseudo-random point on the circle of
    /// its target radius, seeded from the path so placement is reproducible
    /// across runs.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // clamped to grid
    pub fn preferred_location(&self, path: &str, importance: u8) -> ClusterLocation {
        let radius = self.target_radius(importance);
        let mut rng = StdRng::seed_from_u64(path_seed(path));
        let angle = rng.gen::<f64>() * std::f64::consts::TAU;
        let center = self.zones.center();
        let max = f64::from(self.zones.grid_size - 1);
        let x = (f64::from(center.x) + radius * angle.cos()).clamp(0.0, max);
        let y = (f64::from(center.y) + radius * angle.sin()).clamp(0.0, max);
        ClusterLocation::new(x as u16, y as u16)
    }

    /// Places a file: classify, pick the preferred cell, allocate through
    /// the VAT, and verify the realized zone. A zone mismatch is logged,
    /// never failed, since a crowded band can push the allocation outward.
    ///
    /// # Errors
    ///
    /// Propagates [`VisualAllocationTable::allocate`] failures.
    pub fn place_file(
        &self,
        vat: &mut VisualAllocationTable,
        path: &str,
        size: u64,
    ) -> Result<ClusterChain> {
        let importance = self.classify(path, size);
        let preferred = self.preferred_location(path, importance);
        let chain = vat.allocate(path, size.max(1), Some(preferred))?;

        let anchor = chain[0];
        let realized = self.zones.classify(anchor);
        let target = self.target_zone(importance);
        if realized != target {
            warn!(
                path,
                importance,
                target = %target,
                realized = %realized,
                anchor = %anchor,
                "placement landed outside its target zone"
            );
        }
        Ok(chain)
    }

}

/// Deterministic 64-bit seed from a path: the first 8 bytes of its SHA-256.
fn path_seed(path: &str) -> u64 {
    let digest = Sha256::digest(path.as_bytes());
    u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

/// Sorts `(path, size)` pairs by importance descending, then path, so the
/// most important files claim the best cells first. Used by the builder.
#[must_use]
pub fn importance_order(placer: &Placer, files: &[(String, u64)]) -> Vec<(String, u64)> {
    let mut sorted: Vec<(String, u64)> = files.to_vec();
    sorted.sort_by(|a, b| {
        placer
            .classify(&b.0, b.1)
            .cmp(&placer.classify(&a.0, a.1))
            .then_with(|| a.0.cmp(&b.0))
    });
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_table() {
        let placer = Placer::new(256);
        assert_eq!(placer.classify("boot/vmlinuz-6.1", 600), 255);
        assert_eq!(placer.classify("boot/initramfs.img", 100), 253);
        assert_eq!(placer.classify("boot/grub.cfg", 100), 240);
        assert_eq!(placer.classify("lib/libc.so.6", 400), 245);
        assert_eq!(placer.classify("etc/fstab", 50), 200);
        assert_eq!(placer.classify("usr/bin/vi", 50), 180);
        assert_eq!(placer.classify("models/llama.gguf", 50), 160);
        assert_eq!(placer.classify("readme.txt", 50), 100);
        assert_eq!(placer.classify("home/user/notes", 50), 120);
        assert_eq!(placer.classify("var/cache/apt", 50), 50);
        assert_eq!(placer.classify("data/backup/2020", 50), 30);
        assert_eq!(placer.classify("srv/data.bin", 50), DEFAULT_IMPORTANCE);
    }

    #[test]
    fn test_overrides_win() {
        let mut overrides = FxHashMap::default();
        overrides.insert("readme.txt".to_string(), 250);
        let placer = Placer::with_overrides(256, overrides);
        assert_eq!(placer.classify("readme.txt", 50), 250);
    }

    #[test]
    fn test_target_radius_monotonic() {
        let placer = Placer::new(2048);
        assert!(placer.target_radius(255) < f64::EPSILON);
        assert!((placer.target_radius(0) - 1024.0).abs() < f64::EPSILON);
        assert!(placer.target_radius(200) < placer.target_radius(100));
    }

    #[test]
    fn test_preferred_location_deterministic() {
        let placer = Placer::new(256);
        let a = placer.preferred_location("lib/libc.so", 245);
        let b = placer.preferred_location("lib/libc.so", 245);
        assert_eq!(a, b);
        let other = placer.preferred_location("lib/libm.so", 245);
        // Different paths draw different angles (astronomically unlikely to
        // collide on a 256-cell circle).
        assert!(a != other || a.distance_to(other) < 2.0);
    }

    #[test]
    fn test_place_file_kernel_lands_hot() {
        let placer = Placer::new(256);
        let mut vat = VisualAllocationTable::new(256).unwrap();
        let chain = placer.place_file(&mut vat, "boot/vmlinuz", 600).unwrap();
        let dist = chain[0].distance_to(vat.center());
        assert!(dist < 4.0, "kernel anchor at distance {dist}");
    }

    #[test]
    fn test_place_file_readme_lands_outside_temperate() {
        let placer = Placer::new(256);
        let mut vat = VisualAllocationTable::new(256).unwrap();
        let chain = placer.place_file(&mut vat, "readme.txt", 50).unwrap();
        let dist = chain[0].distance_to(vat.center());
        assert!(dist >= 16.0, "readme anchor at distance {dist}");
    }

    #[test]
    fn test_importance_order() {
        let placer = Placer::new(256);
        let files = vec![
            ("readme.txt".to_string(), 50u64),
            ("boot/vmlinuz".to_string(), 600),
            ("lib/libc.so".to_string(), 400),
        ];
        let sorted = importance_order(&placer, &files);
        assert_eq!(sorted[0].0, "boot/vmlinuz");
        assert_eq!(sorted[1].0, "lib/libc.so");
        assert_eq!(sorted[2].0, "readme.txt");
    }
}
