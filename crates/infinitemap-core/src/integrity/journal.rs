//! Cluster write-ahead journal.
//!
//! Append-only record of cluster writes, consulted first during repair.
//! Each record is CRC-guarded so a torn tail stops replay without
//! poisoning the records before it.
//!
//! # Record format
//!
//! ```text
//! [marker=1: 1B] [cluster_id: 8B LE] [len: 4B LE] [data: len bytes] [crc32: 4B LE]
//! ```
//!
//! The CRC covers marker through data.

use crate::error::{Error, Result};
use crate::format::crc32;

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const MARKER_PUT: u8 = 1;

/// Append-only journal of cluster payloads.
#[derive(Debug)]
pub struct ClusterJournal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl ClusterJournal {
    /// Opens (or creates) the journal at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on file failures.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Journal location on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a cluster payload record and flushes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on write failures, [`Error::Corrupt`] for a
    /// payload longer than `u32::MAX`.
    pub fn append(&self, cluster_id: u64, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| Error::Corrupt(format!("journal payload of {} bytes", data.len())))?;
        let mut record = Vec::with_capacity(1 + 8 + 4 + data.len() + 4);
        record.push(MARKER_PUT);
        record.extend_from_slice(&cluster_id.to_le_bytes());
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(data);
        let crc = crc32(&record);
        record.extend_from_slice(&crc.to_le_bytes());

        let mut writer = self.writer.lock();
        writer.write_all(&record)?;
        writer.flush()?;
        Ok(())
    }

    /// Replays the journal and returns the last valid payload recorded for
    /// `cluster_id`, if any. Replay stops at the first damaged record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the journal cannot be read.
    pub fn last_valid(&self, cluster_id: u64) -> Result<Option<Vec<u8>>> {
        // Flush buffered records so the reader sees them.
        self.writer.lock().flush()?;

        let mut bytes = Vec::new();
        File::open(&self.path)?.read_to_end(&mut bytes)?;

        let mut found: Option<Vec<u8>> = None;
        let mut pos = 0usize;
        while pos < bytes.len() {
            let Some((id, data, next)) = parse_record(&bytes, pos) else {
                warn!(
                    path = %self.path.display(),
                    pos,
                    "journal replay stopped at damaged record"
                );
                break;
            };
            if id == cluster_id {
                found = Some(data);
            }
            pos = next;
        }
        Ok(found)
    }

    /// All cluster ids with at least one valid record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the journal cannot be read.
    pub fn recorded_ids(&self) -> Result<Vec<u64>> {
        self.writer.lock().flush()?;
        let mut bytes = Vec::new();
        File::open(&self.path)?.read_to_end(&mut bytes)?;

        let mut ids = Vec::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            let Some((id, _, next)) = parse_record(&bytes, pos) else {
                break;
            };
            if !ids.contains(&id) {
                ids.push(id);
            }
            pos = next;
        }
        Ok(ids)
    }
}

/// Parses one record at `pos`; returns `(cluster_id, data, next_pos)` or
/// `None` for a short or CRC-failing record.
fn parse_record(bytes: &[u8], pos: usize) -> Option<(u64, Vec<u8>, usize)> {
    let header_end = pos.checked_add(1 + 8 + 4)?;
    if header_end > bytes.len() || bytes[pos] != MARKER_PUT {
        return None;
    }
    let id = u64::from_le_bytes(bytes[pos + 1..pos + 9].try_into().ok()?);
    let len = u32::from_le_bytes(bytes[pos + 9..pos + 13].try_into().ok()?) as usize;
    let data_end = header_end.checked_add(len)?;
    let crc_end = data_end.checked_add(4)?;
    if crc_end > bytes.len() {
        return None;
    }
    let stored = u32::from_le_bytes(bytes[data_end..crc_end].try_into().ok()?);
    if crc32(&bytes[pos..data_end]) != stored {
        return None;
    }
    Some((id, bytes[header_end..data_end].to_vec(), crc_end))
}
