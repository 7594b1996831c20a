//! Reed–Solomon cluster protection.
//!
//! A cluster payload is split into `D` data shards plus `P` parity shards
//! of equal size and framed with the self-describing header from
//! [`crate::format::RsFrameHeader`]. Decoding tolerates up to `P` missing
//! shards: a truncated frame marks the absent shards as erasures, and a
//! caller that has identified corrupt shards (e.g. by checksum) can erase
//! them explicitly before reconstruction.
//!
//! The payload is prefixed with its `u32` length before sharding so the
//! original byte count survives the zero-padding to a shard multiple.

use crate::error::{Error, Result};
use crate::format::RsFrameHeader;

use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};

/// Reed–Solomon configuration: shard counts per cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReedSolomonConfig {
    /// Data shards per cluster.
    pub data_shards: usize,
    /// Parity shards per cluster; up to this many shards may be lost.
    pub parity_shards: usize,
}

impl Default for ReedSolomonConfig {
    fn default() -> Self {
        Self {
            data_shards: 4,
            parity_shards: 2,
        }
    }
}

/// An encoded cluster: the shard set plus its geometry.
#[derive(Debug, Clone)]
pub struct EncodedCluster {
    /// Data shards followed by parity shards, all `shard_size` long.
    pub shards: Vec<Vec<u8>>,
    /// Per-shard length in bytes.
    pub shard_size: usize,
    /// Number of data shards.
    pub data_shards: usize,
    /// Number of parity shards.
    pub parity_shards: usize,
}

/// Cluster-level Reed–Solomon codec.
pub struct ReedSolomonCodec {
    config: ReedSolomonConfig,
    codec: ReedSolomon,
}

impl std::fmt::Debug for ReedSolomonCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReedSolomonCodec")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReedSolomonCodec {
    /// Builds a codec for the given shard geometry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] for a zero or oversized shard count.
    pub fn new(config: ReedSolomonConfig) -> Result<Self> {
        let codec = ReedSolomon::new(config.data_shards, config.parity_shards)
            .map_err(|e| Error::Corrupt(format!("reed-solomon geometry: {e:?}")))?;
        Ok(Self { config, codec })
    }

    /// Shard geometry of this codec.
    #[must_use]
    pub fn config(&self) -> ReedSolomonConfig {
        self.config
    }

    /// Splits and encodes a payload into data + parity shards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] when the underlying codec rejects the
    /// shard set.
    pub fn encode_cluster(&self, data: &[u8]) -> Result<EncodedCluster> {
        let d = self.config.data_shards;
        let p = self.config.parity_shards;

        // Length prefix so decode can strip the padding.
        let len = u32::try_from(data.len())
            .map_err(|_| Error::Corrupt(format!("payload of {} bytes too large", data.len())))?;
        let mut framed = Vec::with_capacity(4 + data.len());
        framed.extend_from_slice(&len.to_le_bytes());
        framed.extend_from_slice(data);

        let shard_size = framed.len().div_ceil(d).max(1);
        framed.resize(shard_size * d, 0);

        let mut shards: Vec<Vec<u8>> = framed.chunks(shard_size).map(<[u8]>::to_vec).collect();
        shards.resize(d + p, vec![0u8; shard_size]);
        self.codec
            .encode(&mut shards)
            .map_err(|e| Error::Corrupt(format!("reed-solomon encode: {e:?}")))?;

        Ok(EncodedCluster {
            shards,
            shard_size,
            data_shards: d,
            parity_shards: p,
        })
    }

    /// Reconstructs a payload from shards; `None` marks an erased shard.
    ///
    /// # Errors
    ///
    /// - [`Error::Corrupt`] when the shard count does not match the
    ///   geometry.
    /// - [`Error::IntegrityUnrepairable`] when more than `P` shards are
    ///   missing.
    pub fn decode_cluster(&self, mut shards: Vec<Option<Vec<u8>>>) -> Result<Vec<u8>> {
        let d = self.config.data_shards;
        let p = self.config.parity_shards;
        if shards.len() != d + p {
            return Err(Error::Corrupt(format!(
                "expected {} shards, got {}",
                d + p,
                shards.len()
            )));
        }
        let missing = shards.iter().filter(|s| s.is_none()).count();
        if missing > p {
            return Err(Error::IntegrityUnrepairable(missing as u64));
        }
        if missing > 0 {
            self.codec
                .reconstruct(&mut shards)
                .map_err(|e| Error::Corrupt(format!("reed-solomon reconstruct: {e:?}")))?;
        }
        let mut framed = Vec::new();
        for shard in shards.iter().take(d) {
            let shard = shard
                .as_ref()
                .ok_or_else(|| Error::Corrupt("shard missing after reconstruction".to_string()))?;
            framed.extend_from_slice(shard);
        }
        if framed.len() < 4 {
            return Err(Error::Corrupt("decoded payload shorter than its length prefix".to_string()));
        }
        let len = u32::from_le_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        if 4 + len > framed.len() {
            return Err(Error::Corrupt(format!(
                "length prefix {len} exceeds decoded payload of {} bytes",
                framed.len() - 4
            )));
        }
        Ok(framed[4..4 + len].to_vec())
    }

    /// Encodes a payload into a framed byte string ready for cluster
    /// writes: header + concatenated shards.
    ///
    /// # Errors
    ///
    /// See [`Self::encode_cluster`].
    pub fn encode_frame(&self, data: &[u8]) -> Result<Vec<u8>> {
        let encoded = self.encode_cluster(data)?;
        let header = RsFrameHeader::protected(
            u16::try_from(encoded.shards.len())
                .map_err(|_| Error::Corrupt("shard count exceeds u16".to_string()))?,
            u32::try_from(encoded.shard_size)
                .map_err(|_| Error::Corrupt("shard size exceeds u32".to_string()))?,
        );
        let mut out = header.to_bytes();
        for shard in &encoded.shards {
            out.extend_from_slice(shard);
        }
        Ok(out)
    }

    /// Decodes a framed byte string. Raw frames pass through; protected
    /// frames reconstruct, treating truncated trailing shards as erasures.
    ///
    /// # Errors
    ///
    /// - [`Error::Corrupt`] for an unknown magic or mismatched geometry.
    /// - [`Error::IntegrityUnrepairable`] when too many shards are gone.
    pub fn decode_frame(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let header = RsFrameHeader::from_bytes(frame)?;
        if !header.is_protected() {
            return Ok(frame[RsFrameHeader::RAW_LEN..].to_vec());
        }
        let expected = self.config.data_shards + self.config.parity_shards;
        if usize::from(header.num_shards) != expected {
            return Err(Error::Corrupt(format!(
                "frame carries {} shards, codec expects {expected}",
                header.num_shards
            )));
        }
        let shard_size = header.shard_size as usize;
        let body = &frame[RsFrameHeader::PROTECTED_LEN..];
        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(expected);
        for i in 0..expected {
            let start = i * shard_size;
            let end = start + shard_size;
            if end <= body.len() {
                shards.push(Some(body[start..end].to_vec()));
            } else {
                shards.push(None);
            }
        }
        self.decode_cluster(shards)
    }

    /// Decodes a frame with externally identified bad shards erased first.
    ///
    /// # Errors
    ///
    /// See [`Self::decode_frame`].
    pub fn decode_frame_with_erasures(&self, frame: &[u8], erased: &[usize]) -> Result<Vec<u8>> {
        let header = RsFrameHeader::from_bytes(frame)?;
        if !header.is_protected() {
            return Ok(frame[RsFrameHeader::RAW_LEN..].to_vec());
        }
        let expected = self.config.data_shards + self.config.parity_shards;
        let shard_size = header.shard_size as usize;
        let body = &frame[RsFrameHeader::PROTECTED_LEN..];
        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(expected);
        for i in 0..expected {
            let start = i * shard_size;
            let end = start + shard_size;
            if erased.contains(&i) || end > body.len() {
                shards.push(None);
            } else {
                shards.push(Some(body[start..end].to_vec()));
            }
        }
        self.decode_cluster(shards)
    }
}

/// Frames a payload without protection (raw header + bytes), the inverse of
/// [`ReedSolomonCodec::decode_frame`] on unprotected input.
#[must_use]
pub fn encode_raw_frame(data: &[u8]) -> Vec<u8> {
    let mut out = RsFrameHeader::raw().to_bytes();
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> ReedSolomonCodec {
        ReedSolomonCodec::new(ReedSolomonConfig::default()).unwrap()
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let codec = codec();
        let data = b"the quick brown fox jumps over the lazy dog".to_vec();
        let frame = codec.encode_frame(&data).unwrap();
        assert_eq!(codec.decode_frame(&frame).unwrap(), data);
    }

    #[test]
    fn test_raw_frame_round_trip() {
        let codec = codec();
        let frame = encode_raw_frame(b"plain bytes");
        assert_eq!(codec.decode_frame(&frame).unwrap(), b"plain bytes");
    }

    #[test]
    fn test_survives_parity_shard_loss() {
        let codec = codec();
        let data = vec![42u8; 4096];
        let frame = codec.encode_frame(&data).unwrap();
        // Drop the last two shards (the parity count) by truncating.
        let header = RsFrameHeader::from_bytes(&frame).unwrap();
        let shard_size = header.shard_size as usize;
        let truncated = &frame[..frame.len() - 2 * shard_size];
        assert_eq!(codec.decode_frame(truncated).unwrap(), data);
    }

    #[test]
    fn test_too_many_losses_unrepairable() {
        let codec = codec();
        let data = vec![7u8; 1024];
        let frame = codec.encode_frame(&data).unwrap();
        let header = RsFrameHeader::from_bytes(&frame).unwrap();
        let shard_size = header.shard_size as usize;
        let truncated = &frame[..frame.len() - 3 * shard_size];
        assert!(matches!(
            codec.decode_frame(truncated),
            Err(Error::IntegrityUnrepairable(_))
        ));
    }

    #[test]
    fn test_erased_data_shard_reconstructed() {
        let codec = codec();
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 256) as u8).collect();
        let frame = codec.encode_frame(&data).unwrap();
        assert_eq!(
            codec.decode_frame_with_erasures(&frame, &[0, 2]).unwrap(),
            data
        );
    }

    #[test]
    fn test_empty_payload() {
        let codec = codec();
        let frame = codec.encode_frame(b"").unwrap();
        assert_eq!(codec.decode_frame(&frame).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let codec4_2 = codec();
        let other = ReedSolomonCodec::new(ReedSolomonConfig {
            data_shards: 6,
            parity_shards: 3,
        })
        .unwrap();
        let frame = codec4_2.encode_frame(b"abc").unwrap();
        assert!(matches!(other.decode_frame(&frame), Err(Error::Corrupt(_))));
    }
}
