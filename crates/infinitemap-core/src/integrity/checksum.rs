//! Checksum algorithms and entries.
//!
//! Algorithm choice is a tagged variant with a small dispatch table:
//! SHA-256 is the default for stored digests, CRC-32 the fast pre-filter,
//! MD5 kept for compatibility with older sidecar stores.

use crate::format::crc32;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Supported checksum algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// CRC-32 (IEEE), fast pre-filter.
    Crc32,
    /// MD5, legacy compatibility.
    Md5,
    /// SHA-256, the default for stored digests.
    Sha256,
}

impl Default for ChecksumAlgorithm {
    fn default() -> Self {
        ChecksumAlgorithm::Sha256
    }
}

impl ChecksumAlgorithm {
    /// Lower-case name as serialized ("crc32", "md5", "sha256").
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Crc32 => "crc32",
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    /// Hex digest of `data` under this algorithm.
    #[must_use]
    pub fn digest(self, data: &[u8]) -> String {
        match self {
            ChecksumAlgorithm::Crc32 => format!("{:08x}", crc32(data)),
            ChecksumAlgorithm::Md5 => hex::encode(Md5::digest(data)),
            ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }

    /// Verifies `data` against an expected hex digest.
    #[must_use]
    pub fn verify(self, data: &[u8], expected: &str) -> bool {
        self.digest(data) == expected
    }
}

/// Checksum record for a single cluster, keyed in the store by the
/// cluster's stable id (its anchor's linear offset).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumEntry {
    /// Stable cluster id; carried by the store key, not the document body.
    #[serde(skip)]
    pub cluster_id: u64,
    /// Algorithm the digest was computed with.
    pub algorithm: ChecksumAlgorithm,
    /// Hex digest.
    pub checksum: String,
    /// ISO-8601 timestamp of computation.
    pub computed_at: String,
    /// Original data size in bytes.
    pub size: u64,
}

impl ChecksumEntry {
    /// Computes an entry for `data` now.
    #[must_use]
    pub fn compute(cluster_id: u64, algorithm: ChecksumAlgorithm, data: &[u8]) -> Self {
        Self {
            cluster_id,
            algorithm,
            checksum: algorithm.digest(data),
            computed_at: iso8601(SystemTime::now()),
            size: data.len() as u64,
        }
    }

    /// True when `data` still matches the recorded digest. Data read back
    /// from the image is cluster-padded, so only the recorded payload
    /// length participates in verification.
    #[must_use]
    pub fn matches(&self, data: &[u8]) -> bool {
        let take = usize::try_from(self.size)
            .unwrap_or(data.len())
            .min(data.len());
        self.algorithm.verify(&data[..take], &self.checksum)
    }
}

/// Formats a timestamp as `YYYY-MM-DDThh:mm:ssZ` without pulling in a
/// calendar crate; uses the standard civil-from-days conversion.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn iso8601(t: SystemTime) -> String {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe + era * 400 + i64::from(m <= 2);
    format!(
        "{y:04}-{m:02}-{d:02}T{:02}:{:02}:{:02}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_digest() {
        let digest = ChecksumAlgorithm::Sha256.digest(b"");
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_crc32_digest_is_hex() {
        assert_eq!(ChecksumAlgorithm::Crc32.digest(b"123456789"), "cbf43926");
    }

    #[test]
    fn test_md5_digest() {
        assert_eq!(
            ChecksumAlgorithm::Md5.digest(b"abc"),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_verify_round_trip() {
        for algorithm in [
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::Md5,
            ChecksumAlgorithm::Sha256,
        ] {
            let digest = algorithm.digest(b"payload");
            assert!(algorithm.verify(b"payload", &digest));
            assert!(!algorithm.verify(b"payloae", &digest));
        }
    }

    #[test]
    fn test_entry_matches_and_mutation_detected() {
        let data = vec![5u8; 4096];
        let entry = ChecksumEntry::compute(7, ChecksumAlgorithm::Sha256, &data);
        assert!(entry.matches(&data));
        let mut mutated = data;
        mutated[100] ^= 0x01;
        assert!(!entry.matches(&mutated));
    }

    #[test]
    fn test_iso8601_epoch() {
        assert_eq!(iso8601(UNIX_EPOCH), "1970-01-01T00:00:00Z");
        let later = UNIX_EPOCH + std::time::Duration::from_secs(1_000_000_000);
        assert_eq!(iso8601(later), "2001-09-09T01:46:40Z");
    }
}
