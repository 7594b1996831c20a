//! On-image binary formats.
//!
//! All multi-byte fields are little-endian.
//!
//! # Superblock (4096 bytes, Hilbert-linear offsets 0..4096)
//!
//! ```text
//! offset  size  field
//!   0      7   magic = "INFIN2\0"
//!   7      2   version (u16) = 2
//!   9      2   grid_size (u16)
//!  11      4   cluster_size (u32) = 4096
//!  15      4   vat_offset (u32)
//!  19      4   vat_size   (u32)
//!  23      4   center_x, center_y (u16, u16)
//!  27      4   fat_entries (u32)
//!  31    ...   reserved, zeroed
//! ```
//!
//! # Directory (FAT) entry (96 bytes)
//!
//! ```text
//!  0..63   name (UTF-8, NUL-padded)
//! 64..67   first_cluster (x:u16, y:u16)
//! 68..71   size (u32 bytes)
//! 72..75   mode (u32)
//! 76..79   mtime (u32)
//! 80       file_type (1=file, 2=dir, 3=symlink, 4=component)
//! 81       importance (u8)
//! 82..83   flags (u16)
//! 84..87   reserved
//! 88..91   checksum (u32, CRC-32 of the entry's first 88 bytes)
//! 92..95   reserved
//! ```

use crate::cluster::{ClusterLocation, CLUSTER_BYTES};
use crate::error::{Error, Result};

/// Superblock magic bytes.
pub const SUPERBLOCK_MAGIC: &[u8; 7] = b"INFIN2\0";

/// On-image format version.
pub const FORMAT_VERSION: u16 = 2;

/// Superblock size in bytes (one full cluster).
pub const SUPERBLOCK_SIZE: usize = CLUSTER_BYTES;

/// FAT entry size in bytes.
pub const FAT_ENTRY_SIZE: usize = 96;

/// RS-frame magic for an erasure-coded cluster payload ("RSRS").
pub const RS_MAGIC_PROTECTED: u32 = 0x5253_5253;

/// RS-frame magic for an unprotected payload ("RSP\0").
pub const RS_MAGIC_RAW: u32 = 0x5253_5000;

/// Simple CRC-32 implementation (IEEE 802.3 polynomial).
///
/// Used for FAT entry checksums and cluster journal records.
#[inline]
#[allow(clippy::cast_possible_truncation)] // Table index always 0-255
pub fn crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let idx = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[idx];
    }
    !crc
}

/// File kind stored in a FAT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Symbolic link.
    Symlink,
    /// System component blob.
    Component,
}

impl FileType {
    /// Wire value of this kind.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            FileType::File => 1,
            FileType::Dir => 2,
            FileType::Symlink => 3,
            FileType::Component => 4,
        }
    }

    /// Parses a wire value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] for unknown values.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FileType::File),
            2 => Ok(FileType::Dir),
            3 => Ok(FileType::Symlink),
            4 => Ok(FileType::Component),
            other => Err(Error::Corrupt(format!("unknown file type {other}"))),
        }
    }
}

/// Parsed superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Format version, currently 2.
    pub version: u16,
    /// Grid side length `N`.
    pub grid_size: u16,
    /// Cluster size in bytes, always 4096.
    pub cluster_size: u32,
    /// Hilbert-linear byte offset of the serialized VAT document.
    pub vat_offset: u32,
    /// Length of the serialized VAT document in bytes.
    pub vat_size: u32,
    /// Grid center.
    pub center: ClusterLocation,
    /// Number of FAT entries following the superblock.
    pub fat_entries: u32,
}

impl Superblock {
    /// Builds a superblock for a grid.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // grid center fits u16
    pub fn new(grid_size: u16, vat_offset: u32, vat_size: u32, fat_entries: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            grid_size,
            cluster_size: CLUSTER_BYTES as u32,
            vat_offset,
            vat_size,
            center: ClusterLocation::new(grid_size / 2, grid_size / 2),
            fat_entries,
        }
    }

    /// Serializes to the fixed 4096-byte layout.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SUPERBLOCK_SIZE);
        out.extend_from_slice(SUPERBLOCK_MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.grid_size.to_le_bytes());
        out.extend_from_slice(&self.cluster_size.to_le_bytes());
        out.extend_from_slice(&self.vat_offset.to_le_bytes());
        out.extend_from_slice(&self.vat_size.to_le_bytes());
        out.extend_from_slice(&self.center.x.to_le_bytes());
        out.extend_from_slice(&self.center.y.to_le_bytes());
        out.extend_from_slice(&self.fat_entries.to_le_bytes());
        out.resize(SUPERBLOCK_SIZE, 0);
        out
    }

    /// Parses the fixed layout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] on bad magic, short input or an
    /// unsupported version.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 31 {
            return Err(Error::Corrupt(format!(
                "superblock too short: {} bytes",
                data.len()
            )));
        }
        if &data[0..7] != SUPERBLOCK_MAGIC {
            return Err(Error::Corrupt("bad superblock magic".to_string()));
        }
        let version = u16::from_le_bytes([data[7], data[8]]);
        if version != FORMAT_VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported superblock version {version}"
            )));
        }
        let grid_size = u16::from_le_bytes([data[9], data[10]]);
        let cluster_size = u32::from_le_bytes([data[11], data[12], data[13], data[14]]);
        if cluster_size as usize != CLUSTER_BYTES {
            return Err(Error::Corrupt(format!(
                "unexpected cluster size {cluster_size}"
            )));
        }
        Ok(Self {
            version,
            grid_size,
            cluster_size,
            vat_offset: u32::from_le_bytes([data[15], data[16], data[17], data[18]]),
            vat_size: u32::from_le_bytes([data[19], data[20], data[21], data[22]]),
            center: ClusterLocation::new(
                u16::from_le_bytes([data[23], data[24]]),
                u16::from_le_bytes([data[25], data[26]]),
            ),
            fat_entries: u32::from_le_bytes([data[27], data[28], data[29], data[30]]),
        })
    }
}

/// A 96-byte directory (FAT) entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatEntry {
    /// Entry name, truncated to 64 UTF-8 bytes on the wire.
    pub name: String,
    /// Anchor coordinate of the entry's first cluster.
    pub first_cluster: ClusterLocation,
    /// Payload size in bytes.
    pub size: u32,
    /// Unix mode bits.
    pub mode: u32,
    /// Modification time, unix seconds.
    pub mtime: u32,
    /// Entry kind.
    pub file_type: FileType,
    /// Placement importance, 0-255.
    pub importance: u8,
    /// Reserved flag bits.
    pub flags: u16,
}

impl FatEntry {
    /// Creates a regular-file entry with default mode.
    #[must_use]
    pub fn file(name: &str, first_cluster: ClusterLocation, size: u32, importance: u8) -> Self {
        Self {
            name: name.to_string(),
            first_cluster,
            size,
            mode: 0o644,
            mtime: 0,
            file_type: FileType::File,
            importance,
            flags: 0,
        }
    }

    /// Serializes to the fixed 96-byte layout, computing the trailing
    /// CRC-32 over the first 88 bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; FAT_ENTRY_SIZE] {
        let mut out = [0u8; FAT_ENTRY_SIZE];
        let name_bytes = self.name.as_bytes();
        let name_len = truncated_name_len(name_bytes, 64);
        out[..name_len].copy_from_slice(&name_bytes[..name_len]);
        out[64..68].copy_from_slice(&self.first_cluster.to_le_bytes());
        out[68..72].copy_from_slice(&self.size.to_le_bytes());
        out[72..76].copy_from_slice(&self.mode.to_le_bytes());
        out[76..80].copy_from_slice(&self.mtime.to_le_bytes());
        out[80] = self.file_type.as_u8();
        out[81] = self.importance;
        out[82..84].copy_from_slice(&self.flags.to_le_bytes());
        let checksum = crc32(&out[..88]);
        out[88..92].copy_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Parses the fixed layout and verifies the entry checksum.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] on short input, a checksum mismatch,
    /// non-UTF-8 name bytes or an unknown file type.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < FAT_ENTRY_SIZE {
            return Err(Error::Corrupt(format!(
                "FAT entry too short: {} bytes",
                data.len()
            )));
        }
        let stored = u32::from_le_bytes([data[88], data[89], data[90], data[91]]);
        let computed = crc32(&data[..88]);
        if stored != computed {
            return Err(Error::Corrupt(format!(
                "FAT entry checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }
        let name_end = data[..64].iter().position(|&b| b == 0).unwrap_or(64);
        let name = std::str::from_utf8(&data[..name_end])
            .map_err(|e| Error::Corrupt(format!("FAT entry name not UTF-8: {e}")))?
            .to_string();
        Ok(Self {
            name,
            first_cluster: ClusterLocation::from_le_bytes([data[64], data[65], data[66], data[67]]),
            size: u32::from_le_bytes([data[68], data[69], data[70], data[71]]),
            mode: u32::from_le_bytes([data[72], data[73], data[74], data[75]]),
            mtime: u32::from_le_bytes([data[76], data[77], data[78], data[79]]),
            file_type: FileType::from_u8(data[80])?,
            importance: data[81],
            flags: u16::from_le_bytes([data[82], data[83]]),
        })
    }
}

/// Longest prefix of `name` that fits `cap` bytes without splitting a
/// UTF-8 sequence.
fn truncated_name_len(name: &[u8], cap: usize) -> usize {
    if name.len() <= cap {
        return name.len();
    }
    let mut len = cap;
    while len > 0 && (name[len] & 0xC0) == 0x80 {
        len -= 1;
    }
    len
}

/// Header of an RS-framed cluster payload: 14 bytes for the protected
/// form, 8 for the raw form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RsFrameHeader {
    /// [`RS_MAGIC_PROTECTED`] or [`RS_MAGIC_RAW`].
    pub magic: u32,
    /// Frame version, 1 for protected payloads, 0 for raw.
    pub version: u16,
    /// Flag bits; bit 0 set when erasure coding is active.
    pub flags: u16,
    /// Total shard count (data + parity). Protected frames only.
    pub num_shards: u16,
    /// Per-shard length in bytes. Protected frames only.
    pub shard_size: u32,
}

impl RsFrameHeader {
    /// Header length for a protected frame.
    pub const PROTECTED_LEN: usize = 14;
    /// Header length for a raw frame.
    pub const RAW_LEN: usize = 8;

    /// Header for an erasure-coded payload.
    #[must_use]
    pub fn protected(num_shards: u16, shard_size: u32) -> Self {
        Self {
            magic: RS_MAGIC_PROTECTED,
            version: 1,
            flags: 0x0001,
            num_shards,
            shard_size,
        }
    }

    /// Header for a raw, unprotected payload.
    #[must_use]
    pub fn raw() -> Self {
        Self {
            magic: RS_MAGIC_RAW,
            version: 0,
            flags: 0,
            num_shards: 0,
            shard_size: 0,
        }
    }

    /// True when the frame carries erasure-coded shards.
    #[must_use]
    pub fn is_protected(&self) -> bool {
        self.magic == RS_MAGIC_PROTECTED
    }

    /// Serialized header length for this frame kind.
    #[must_use]
    pub fn len(&self) -> usize {
        if self.is_protected() {
            Self::PROTECTED_LEN
        } else {
            Self::RAW_LEN
        }
    }

    /// Always false; headers are never empty. Present for clippy symmetry
    /// with [`Self::len`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Serializes the header.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        if self.is_protected() {
            out.extend_from_slice(&self.num_shards.to_le_bytes());
            out.extend_from_slice(&self.shard_size.to_le_bytes());
        }
        out
    }

    /// Parses a frame header from the start of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] on short input or an unknown magic.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::RAW_LEN {
            return Err(Error::Corrupt("RS frame header too short".to_string()));
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let version = u16::from_le_bytes([data[4], data[5]]);
        let flags = u16::from_le_bytes([data[6], data[7]]);
        match magic {
            RS_MAGIC_RAW => Ok(Self {
                magic,
                version,
                flags,
                num_shards: 0,
                shard_size: 0,
            }),
            RS_MAGIC_PROTECTED => {
                if data.len() < Self::PROTECTED_LEN {
                    return Err(Error::Corrupt(
                        "RS frame header truncated before shard fields".to_string(),
                    ));
                }
                Ok(Self {
                    magic,
                    version,
                    flags,
                    num_shards: u16::from_le_bytes([data[8], data[9]]),
                    shard_size: u32::from_le_bytes([data[10], data[11], data[12], data[13]]),
                })
            }
            other => Err(Error::Corrupt(format!(
                "unknown RS frame magic {other:#010x}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_vector() {
        // CRC-32/IEEE of "123456789".
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_superblock_round_trip() {
        let sb = Superblock::new(2048, 4096, 1234, 17);
        let bytes = sb.to_bytes();
        assert_eq!(bytes.len(), SUPERBLOCK_SIZE);
        assert_eq!(Superblock::from_bytes(&bytes).unwrap(), sb);
        assert_eq!(sb.center, ClusterLocation::new(1024, 1024));
    }

    #[test]
    fn test_superblock_bad_magic() {
        let mut bytes = Superblock::new(256, 4096, 0, 0).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            Superblock::from_bytes(&bytes),
            Err(crate::error::Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_fat_entry_round_trip() {
        let entry = FatEntry::file("boot/vmlinuz", ClusterLocation::new(128, 128), 600, 255);
        let bytes = entry.to_bytes();
        let parsed = FatEntry::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_fat_entry_checksum_detects_flip() {
        let entry = FatEntry::file("readme.txt", ClusterLocation::new(10, 20), 50, 100);
        let mut bytes = entry.to_bytes();
        bytes[68] ^= 0x01; // flip a size bit
        assert!(FatEntry::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_fat_entry_long_name_truncates_on_char_boundary() {
        let name = "d/".repeat(40) + "é"; // 82 bytes, multibyte tail
        let entry = FatEntry::file(&name, ClusterLocation::new(0, 0), 1, 1);
        let parsed = FatEntry::from_bytes(&entry.to_bytes()).unwrap();
        assert!(parsed.name.len() <= 64);
        assert!(name.starts_with(&parsed.name));
    }

    #[test]
    fn test_rs_header_round_trip() {
        let protected = RsFrameHeader::protected(6, 700);
        let parsed = RsFrameHeader::from_bytes(&protected.to_bytes()).unwrap();
        assert_eq!(parsed, protected);
        assert!(parsed.is_protected());

        let raw = RsFrameHeader::raw();
        let parsed = RsFrameHeader::from_bytes(&raw.to_bytes()).unwrap();
        assert_eq!(parsed, raw);
        assert!(!parsed.is_protected());
    }

    #[test]
    fn test_rs_header_unknown_magic() {
        let mut bytes = RsFrameHeader::raw().to_bytes();
        bytes[3] = 0xFF;
        assert!(RsFrameHeader::from_bytes(&bytes).is_err());
    }
}
