//! Builder tests: source analysis, layout, the protected write/read path
//! and snapshot integration.

use crate::builder::{checksum_store_path, open_image, ImageBuilder, VAT_RECORD_KEY};
use crate::cluster::CLUSTER_BYTES;
use crate::config::EngineConfig;
use crate::error::Error;
use crate::format::Superblock;
use crate::zone::Zone;

use std::path::Path;
use tempfile::TempDir;

fn test_config(grid_size: u32) -> EngineConfig {
    let mut config = EngineConfig::load(None).unwrap();
    config.grid_size = grid_size;
    config
}

/// The S1 source tree: a kernel, a libc and a readme.
fn seed_tree(root: &Path) {
    std::fs::create_dir_all(root.join("boot")).unwrap();
    std::fs::create_dir_all(root.join("lib")).unwrap();
    std::fs::write(root.join("boot/vmlinuz"), vec![0xE9u8; 600]).unwrap();
    std::fs::write(root.join("lib/libc.so"), vec![0x7Fu8; 400]).unwrap();
    std::fs::write(root.join("readme.txt"), vec![b'r'; 50]).unwrap();
}

fn builder_for(dir: &TempDir, grid_size: u32) -> ImageBuilder {
    let source = dir.path().join("rootfs");
    seed_tree(&source);
    let mut config = test_config(grid_size);
    config.builder.snapshot_dir = dir.path().join("snapshots");
    ImageBuilder::new(&source, &dir.path().join("map.rts.png"), config).unwrap()
}

#[test]
fn test_analyze_source() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder_for(&dir, 256);
    let analysis = builder.analyze_source().unwrap();
    assert_eq!(analysis.file_count, 3);
    assert_eq!(analysis.total_size, 1050);
    assert_eq!(analysis.directory_count, 2);
}

#[test]
fn test_build_places_by_importance() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder_for(&dir, 256);
    let report = builder.build().unwrap();
    assert_eq!(report.files, 3);
    assert_eq!(report.grid_size, 256);
    assert!(report.image_bytes > 0);

    let vat = builder.vat();
    let vat = vat.read();
    let center = vat.center();
    let kernel = vat.lookup("boot/vmlinuz").unwrap();
    let readme = vat.lookup("readme.txt").unwrap();
    assert!(kernel.distance_to(center) < 4.0, "kernel in HOT");
    assert!(readme.distance_to(center) >= 16.0, "readme outside TEMPERATE");
    assert!(vat.is_directory("boot"));
    vat.check_invariants().unwrap();
}

#[test]
fn test_built_image_reopens_with_vat() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder_for(&dir, 256);
    builder.build().unwrap();

    let image_path = dir.path().join("map.rts.png");
    let (image, vat, records) = open_image(&image_path).unwrap();
    assert_eq!(image.grid_size(), 256);
    assert_eq!(vat.entry_count(), 3);
    assert!(records
        .iter()
        .any(|(k, v)| k == "type" && v == "infinite-map-v2"));
    assert!(records.iter().any(|(k, v)| k == "vat_entries" && v == "3"));
    assert!(records.iter().any(|(k, _)| k == VAT_RECORD_KEY));
    assert!(crate::image::sidecar_path(&image_path).exists());
    assert!(checksum_store_path(&image_path).exists());

    // The superblock parses back from linear offset 0.
    let sb_bytes = image.read_linear(0, crate::format::SUPERBLOCK_SIZE).unwrap();
    let superblock = Superblock::from_bytes(&sb_bytes).unwrap();
    assert_eq!(superblock.grid_size, 256);
    assert_eq!(superblock.fat_entries, 3);
    assert_eq!(superblock.center.x, 128);
}

#[test]
fn test_read_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder_for(&dir, 256);
    builder.build().unwrap();

    assert_eq!(builder.read_file("lib/libc.so").unwrap(), vec![0x7Fu8; 400]);
    assert_eq!(builder.read_file("readme.txt").unwrap(), vec![b'r'; 50]);
    assert!(matches!(
        builder.read_file("no/such/file"),
        Err(Error::NotFound(_))
    ));
    // Reads were counted.
    assert_eq!(builder.access_tracker().count("lib/libc.so"), 1);
}

#[test]
fn test_write_protected_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder_for(&dir, 256);
    builder.build().unwrap();

    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
    let anchor = builder.write_protected("var/data.bin", &payload).unwrap();

    let vat = builder.vat();
    assert!(vat.read().is_rs_protected("var/data.bin"));
    assert_eq!(vat.read().lookup("var/data.bin"), Some(anchor));

    let back = builder.read_protected(anchor).unwrap();
    assert_eq!(back, payload);
    assert_eq!(builder.read_file("var/data.bin").unwrap(), payload);
}

#[test]
fn test_write_protected_without_erasure() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("rootfs");
    seed_tree(&source);
    let mut config = test_config(256);
    config.erasure.enabled = false;
    config.builder.snapshot_dir = dir.path().join("snapshots");
    let mut builder =
        ImageBuilder::new(&source, &dir.path().join("map.rts.png"), config).unwrap();
    builder.build().unwrap();

    let anchor = builder.write_protected("plain.bin", b"plain payload").unwrap();
    assert!(!builder.vat().read().is_rs_protected("plain.bin"));
    assert_eq!(builder.read_protected(anchor).unwrap(), b"plain payload");
}

#[test]
fn test_corrupted_cluster_refused_on_read() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder_for(&dir, 256);
    builder.build().unwrap();

    let anchor = builder.vat().read().lookup("lib/libc.so").unwrap();
    {
        let image = builder.image();
        let mut image = image.write();
        image.write_cluster(anchor, b"tampered").unwrap();
    }
    assert!(matches!(
        builder.read_file("lib/libc.so"),
        Err(Error::ChecksumMismatch { .. })
    ));
}

#[test]
fn test_grid_grows_to_fit() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("rootfs");
    std::fs::create_dir_all(&source).unwrap();
    // 96 KiB of payload cannot fit a 64-cell grid (16 KiB capacity).
    for i in 0..24 {
        std::fs::write(source.join(format!("blob{i}.bin")), vec![0xAB; 4096]).unwrap();
    }
    let mut config = test_config(64);
    config.builder.snapshot_dir = dir.path().join("snapshots");
    let mut builder =
        ImageBuilder::new(&source, &dir.path().join("map.rts.png"), config).unwrap();
    let report = builder.build().unwrap();
    assert!(report.grid_size > 64, "grid grew to {}", report.grid_size);
    assert_eq!(report.files, 24);
    builder.vat().read().check_invariants().unwrap();
}

#[test]
fn test_delete_file_returns_clusters() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder_for(&dir, 256);
    builder.build().unwrap();

    let free_before = builder.vat().read().free_count();
    builder.delete_file("readme.txt").unwrap();
    assert_eq!(builder.vat().read().free_count(), free_before + 1);
    assert!(builder.read_file("readme.txt").is_err());
    assert!(matches!(
        builder.delete_file("readme.txt"),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_snapshot_restore_revives_deleted_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = builder_for(&dir, 256);
    builder.build().unwrap();

    let original_anchor = builder.vat().read().lookup("readme.txt").unwrap();
    let snapshot = builder.create_snapshot("before delete").unwrap();
    builder.delete_file("readme.txt").unwrap();
    assert!(builder.vat().read().lookup("readme.txt").is_none());

    builder.restore_snapshot(&snapshot.snapshot_id).unwrap();
    assert_eq!(
        builder.vat().read().lookup("readme.txt"),
        Some(original_anchor)
    );
    // Cache invalidation happens-after restore.
    assert_eq!(builder.cache().stats().count, 0);
    builder.vat().read().check_invariants().unwrap();
}

#[test]
fn test_zone_targets_match_importance() {
    let dir = tempfile::tempdir().unwrap();
    let builder = builder_for(&dir, 256);
    let placer = builder.placer();
    assert_eq!(placer.target_zone(255), Zone::Hot);
    assert_eq!(placer.target_zone(100), Zone::Cold);
}

#[test]
fn test_multi_cluster_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("rootfs");
    std::fs::create_dir_all(&source).unwrap();
    let big: Vec<u8> = (0..(CLUSTER_BYTES * 2 + 777))
        .map(|i| (i % 253) as u8)
        .collect();
    std::fs::write(source.join("big.bin"), &big).unwrap();
    let mut config = test_config(256);
    config.builder.snapshot_dir = dir.path().join("snapshots");
    let mut builder =
        ImageBuilder::new(&source, &dir.path().join("map.rts.png"), config).unwrap();
    builder.build().unwrap();

    assert_eq!(builder.vat().read().chain("big.bin").unwrap().len(), 3);
    assert_eq!(builder.read_file("big.bin").unwrap(), big);
}

#[test]
fn test_symlinks_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("rootfs");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("real.txt"), b"real").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink(source.join("real.txt"), source.join("link.txt")).unwrap();

    let mut config = test_config(256);
    config.builder.snapshot_dir = dir.path().join("snapshots");
    let mut builder =
        ImageBuilder::new(&source, &dir.path().join("map.rts.png"), config).unwrap();
    let analysis = builder.analyze_source().unwrap();
    assert_eq!(analysis.file_count, 1);
    #[cfg(unix)]
    assert_eq!(analysis.skipped, 1);
}
