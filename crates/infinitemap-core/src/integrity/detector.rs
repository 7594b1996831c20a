//! Corruption fingerprinting.
//!
//! Heuristics that characterize *how* a cluster went bad: zeroed pages,
//! erased flash (all ones), repeating stamps, binary noise in text, and
//! the near-miss digest distance that suggests bit rot rather than bulk
//! damage.

use super::checksum::ChecksumAlgorithm;
use serde::{Deserialize, Serialize};

/// Recognized corruption fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionPattern {
    /// Zero-length payload.
    Empty,
    /// Every byte zero.
    AllZeros,
    /// Every byte 0xFF.
    AllOnes,
    /// The first 4 bytes repeat across the payload.
    RepeatingPattern,
    /// More than half the bytes are non-printable control characters.
    BinaryCorruption,
}

/// Fraction of control bytes above which text data is considered noise.
const NON_PRINTABLE_THRESHOLD: f64 = 0.5;

/// Maximum hex-character digest distance still attributed to bit rot.
const BIT_ROT_MAX_DIFF: usize = 2;

/// Fingerprints the corruption patterns present in `data`.
#[must_use]
pub fn detect_patterns(data: &[u8]) -> Vec<CorruptionPattern> {
    if data.is_empty() {
        return vec![CorruptionPattern::Empty];
    }
    let mut patterns = Vec::new();

    if data.iter().all(|&b| b == 0) {
        patterns.push(CorruptionPattern::AllZeros);
    }
    if data.iter().all(|&b| b == 0xFF) {
        patterns.push(CorruptionPattern::AllOnes);
    }
    if data.len() >= 8 && data.len() % 4 == 0 {
        let stamp = &data[..4];
        if data.chunks_exact(4).all(|chunk| chunk == stamp) {
            patterns.push(CorruptionPattern::RepeatingPattern);
        }
    }
    let non_printable = data
        .iter()
        .filter(|&&b| b < 32 && !matches!(b, 9 | 10 | 13))
        .count();
    #[allow(clippy::cast_precision_loss)]
    if non_printable as f64 > data.len() as f64 * NON_PRINTABLE_THRESHOLD {
        patterns.push(CorruptionPattern::BinaryCorruption);
    }
    patterns
}

/// True when `data`'s digest differs from `expected_digest` by one or two
/// hex characters: plausible single-bit rot rather than bulk corruption.
#[must_use]
pub fn detect_bit_rot(data: &[u8], expected_digest: &str) -> bool {
    let actual = ChecksumAlgorithm::Sha256.digest(data);
    if actual == expected_digest {
        return false;
    }
    if actual.len() != expected_digest.len() {
        return false;
    }
    let differences = actual
        .chars()
        .zip(expected_digest.chars())
        .filter(|(a, b)| a != b)
        .count();
    (1..=BIT_ROT_MAX_DIFF).contains(&differences)
}

/// Detects truncation; returns `(is_truncated, bytes_missing)`.
#[must_use]
pub fn detect_truncation(data: &[u8], expected_size: usize) -> (bool, usize) {
    if data.len() < expected_size {
        (true, expected_size - data.len())
    } else {
        (false, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        assert_eq!(detect_patterns(b""), vec![CorruptionPattern::Empty]);
    }

    #[test]
    fn test_all_zeros() {
        let patterns = detect_patterns(&[0u8; 4096]);
        assert!(patterns.contains(&CorruptionPattern::AllZeros));
        // Zeroed data also trips the repeating-stamp and control-byte
        // fingerprints; the point is AllZeros is among them.
        assert!(!patterns.contains(&CorruptionPattern::AllOnes));
    }

    #[test]
    fn test_all_ones() {
        let patterns = detect_patterns(&[0xFFu8; 1024]);
        assert!(patterns.contains(&CorruptionPattern::AllOnes));
        assert!(!patterns.contains(&CorruptionPattern::AllZeros));
    }

    #[test]
    fn test_repeating_stamp() {
        let data: Vec<u8> = [0xDE, 0xAD, 0xBE, 0xEF].repeat(256);
        assert!(detect_patterns(&data).contains(&CorruptionPattern::RepeatingPattern));
    }

    #[test]
    fn test_clean_text_has_no_patterns() {
        let data = b"This is perfectly ordinary file content.\n".repeat(10);
        assert!(detect_patterns(&data).is_empty());
    }

    #[test]
    fn test_binary_noise_in_text() {
        let mut data = vec![0x01u8; 600];
        data.extend_from_slice(&[b'a'; 400]);
        assert!(detect_patterns(&data).contains(&CorruptionPattern::BinaryCorruption));
    }

    #[test]
    fn test_bit_rot_distance() {
        let digest = ChecksumAlgorithm::Sha256.digest(b"data");
        // Identical digest: no rot.
        assert!(!detect_bit_rot(b"data", &digest));
        // Two hex characters nudged: plausible rot.
        let mut nudged: Vec<char> = digest.chars().collect();
        nudged[0] = if nudged[0] == '0' { '1' } else { '0' };
        nudged[10] = if nudged[10] == '0' { '1' } else { '0' };
        let nudged: String = nudged.into_iter().collect();
        assert!(detect_bit_rot(b"data", &nudged));
        // A different payload's digest differs broadly: not rot.
        let other = ChecksumAlgorithm::Sha256.digest(b"completely different");
        assert!(!detect_bit_rot(b"data", &other));
    }

    #[test]
    fn test_truncation() {
        assert_eq!(detect_truncation(&[0u8; 100], 400), (true, 300));
        assert_eq!(detect_truncation(&[0u8; 400], 400), (false, 0));
    }
}
