//! Engine configuration.
//!
//! Defaults carry the engine's documented constants; deployments override
//! them with a TOML file and `INFINITEMAP_*` environment variables, merged
//! through figment in that order (environment wins).
//!
//! ```toml
//! grid_size = 2048
//!
//! [cache]
//! max_size_bytes = 10485760
//!
//! [healing]
//! scan_interval_secs = 300
//! ```

use crate::cache::DEFAULT_CACHE_BYTES;
use crate::error::{Error, Result};
use crate::hilbert::MAX_ORDER;
use crate::integrity::ChecksumAlgorithm;
use crate::migration::MigrationConfig;
use crate::rs_codec::ReedSolomonConfig;
use crate::tuner::TuningConfig;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Cache section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Capacity in bytes.
    pub max_size_bytes: u64,
    /// Whether sequential-read prefetching is active.
    pub prefetch_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_CACHE_BYTES,
            prefetch_enabled: true,
        }
    }
}

/// Integrity section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Digest algorithm for new checksums.
    pub algorithm: ChecksumAlgorithm,
    /// Optional cluster journal path; `None` disables journaling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal_path: Option<PathBuf>,
    /// Optional backup directory used as a repair source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            algorithm: ChecksumAlgorithm::Sha256,
            journal_path: None,
            backup_dir: None,
        }
    }
}

/// Erasure-coding section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Whether `write_protected` frames payloads with Reed–Solomon.
    pub enabled: bool,
    /// Shard geometry.
    #[serde(flatten)]
    pub shards: ReedSolomonConfig,
}

impl Default for ErasureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shards: ReedSolomonConfig::default(),
        }
    }
}

/// Relocation section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelocationSection {
    /// Maximum concurrent moves.
    pub max_concurrent: usize,
    /// Simulated read delay, microseconds.
    pub read_delay_us: u64,
    /// Simulated write delay, microseconds.
    pub write_delay_us: u64,
}

impl Default for RelocationSection {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            read_delay_us: 100,
            write_delay_us: 100,
        }
    }
}

/// Healing section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingSection {
    /// Seconds between scan cycles.
    pub scan_interval_secs: u64,
}

impl Default for HealingSection {
    fn default() -> Self {
        Self {
            scan_interval_secs: 300,
        }
    }
}

/// Builder section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Capacity planned for directory-table and VAT regions, in entries.
    pub max_files: u32,
    /// Snapshot store directory.
    pub snapshot_dir: PathBuf,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            max_files: 10_000,
            snapshot_dir: PathBuf::from(".snapshots"),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Grid side length `N`; a power of two. 0 lets the builder pick the
    /// smallest grid that fits.
    #[serde(default = "default_grid_size")]
    pub grid_size: u32,
    /// Cache section.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Integrity section.
    #[serde(default)]
    pub integrity: IntegrityConfig,
    /// Erasure-coding section.
    #[serde(default)]
    pub erasure: ErasureConfig,
    /// Migration section.
    #[serde(default)]
    pub migration: MigrationConfig,
    /// Relocation section.
    #[serde(default)]
    pub relocation: RelocationSection,
    /// Healing section.
    #[serde(default)]
    pub healing: HealingSection,
    /// Tuning section.
    #[serde(default)]
    pub tuning: TuningConfig,
    /// Builder section.
    #[serde(default)]
    pub builder: BuilderConfig,
}

fn default_grid_size() -> u32 {
    2048
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grid_size: default_grid_size(),
            cache: CacheConfig::default(),
            integrity: IntegrityConfig::default(),
            erasure: ErasureConfig::default(),
            migration: MigrationConfig::default(),
            relocation: RelocationSection::default(),
            healing: HealingSection::default(),
            tuning: TuningConfig::default(),
            builder: BuilderConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration: defaults, then `config_path` (when present),
    /// then `INFINITEMAP_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] for unparsable sources or invalid values.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("INFINITEMAP_").split("__"));
        let config: EngineConfig = figment
            .extract()
            .map_err(|e| Error::Corrupt(format!("configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.grid_size != 0 {
            if !self.grid_size.is_power_of_two() {
                return Err(Error::Corrupt(format!(
                    "grid_size {} is not a power of two",
                    self.grid_size
                )));
            }
            if self.grid_size > (1 << MAX_ORDER) {
                return Err(Error::Corrupt(format!(
                    "grid_size {} exceeds the maximum of {}",
                    self.grid_size,
                    1u32 << MAX_ORDER
                )));
            }
            if self.grid_size < 64 {
                return Err(Error::Corrupt(format!(
                    "grid_size {} is below the 64-cell minimum",
                    self.grid_size
                )));
            }
        }
        if self.erasure.shards.data_shards == 0 {
            return Err(Error::Corrupt("erasure data_shards must be positive".to_string()));
        }
        if self.relocation.max_concurrent == 0 {
            return Err(Error::Corrupt(
                "relocation max_concurrent must be positive".to_string(),
            ));
        }
        if self.healing.scan_interval_secs == 0 {
            return Err(Error::Corrupt(
                "healing scan_interval_secs must be positive".to_string(),
            ));
        }
        self.tuning.validate()
    }

    /// Renders the effective configuration as TOML, e.g. to seed a config
    /// file with the current defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] when serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Corrupt(format!("configuration: {e}")))
    }

    /// Relocation config in the relocator's own terms.
    #[must_use]
    pub fn relocation_config(&self) -> crate::relocation::RelocationConfig {
        crate::relocation::RelocationConfig {
            max_concurrent: self.relocation.max_concurrent,
            read_delay: std::time::Duration::from_micros(self.relocation.read_delay_us),
            write_delay: std::time::Duration::from_micros(self.relocation.write_delay_us),
            cost_per_pixel_us: self.migration.cost_per_pixel_us,
            throughput_bytes_per_us: self.migration.throughput_bytes_per_us,
        }
    }

    /// Healing config in the daemon's own terms.
    #[must_use]
    pub fn healing_config(&self) -> crate::healing::HealingConfig {
        crate::healing::HealingConfig {
            scan_interval: std::time::Duration::from_secs(self.healing.scan_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let loaded = EngineConfig::load(None).unwrap();
        assert_eq!(loaded.grid_size, 2048);
        assert_eq!(loaded.cache.max_size_bytes, DEFAULT_CACHE_BYTES);
        assert!(loaded.erasure.enabled);
        loaded.validate().unwrap();
    }

    #[test]
    fn test_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.toml");
        std::fs::write(
            &path,
            r#"
grid_size = 256

[cache]
max_size_bytes = 4096
prefetch_enabled = false

[healing]
scan_interval_secs = 10

[erasure]
enabled = false
data_shards = 6
parity_shards = 3
"#,
        )
        .unwrap();
        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.grid_size, 256);
        assert_eq!(config.cache.max_size_bytes, 4096);
        assert!(!config.cache.prefetch_enabled);
        assert_eq!(config.healing.scan_interval_secs, 10);
        assert!(!config.erasure.enabled);
        assert_eq!(config.erasure.shards.data_shards, 6);
        assert_eq!(config.erasure.shards.parity_shards, 3);
    }

    #[test]
    fn test_invalid_grid_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.toml");
        std::fs::write(&path, "grid_size = 1000\n").unwrap();
        assert!(matches!(
            EngineConfig::load(Some(&path)),
            Err(Error::Corrupt(_))
        ));

        std::fs::write(&path, "grid_size = 8192\n").unwrap();
        assert!(EngineConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_validate_catches_zero_fields() {
        let mut config = EngineConfig::load(None).unwrap();
        config.relocation.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::load(None).unwrap();
        config.healing.scan_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_toml_round_trips() {
        let config = EngineConfig::load(None).unwrap();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("grid_size = 2048"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rendered.toml");
        std::fs::write(&path, rendered).unwrap();
        let reloaded = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(reloaded.grid_size, config.grid_size);
        assert_eq!(reloaded.cache.max_size_bytes, config.cache.max_size_bytes);
    }

    #[test]
    fn test_section_conversions() {
        let config = EngineConfig::load(None).unwrap();
        let relocation = config.relocation_config();
        assert_eq!(relocation.max_concurrent, 4);
        assert_eq!(
            relocation.read_delay,
            std::time::Duration::from_micros(100)
        );
        let healing = config.healing_config();
        assert_eq!(healing.scan_interval, std::time::Duration::from_secs(300));
    }
}
