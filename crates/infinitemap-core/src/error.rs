//! Error types for the Infinite Map storage engine.
//!
//! Every fallible operation in the crate returns [`Result`]. Variants map
//! one-to-one onto the failure kinds surfaced by the engine layers; callers
//! can match on the variant to distinguish recoverable conditions
//! (`NotFound`, `Busy`) from data-loss signals (`Corrupt`,
//! `IntegrityUnrepairable`).

use thiserror::Error;

/// Result type alias for Infinite Map operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Infinite Map storage engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Coordinate or linear offset outside the grid, or a cluster anchor
    /// that is not aligned to a cluster start.
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    /// The allocator cannot satisfy a request from the free set.
    #[error("out of space: {0}")]
    OutOfSpace(String),

    /// Internal inconsistency (overlapping clusters, missing free-set
    /// entry). Never recovered locally; surfaces to the caller.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    /// Verification refused a read because the digest did not match.
    #[error("checksum mismatch for cluster {cluster_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Stable id of the cluster whose verification failed.
        cluster_id: u64,
        /// Digest recorded in the checksum store.
        expected: String,
        /// Digest of the bytes actually read.
        actual: String,
    },

    /// Repair exhausted every recovery source for a cluster.
    #[error("cluster {0} is unrepairable: all recovery sources exhausted")]
    IntegrityUnrepairable(u64),

    /// Parse-time failure on a superblock, FAT entry, VAT document or
    /// snapshot document.
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// Lookup miss for a path, cluster id or snapshot.
    #[error("not found: {0}")]
    NotFound(String),

    /// Allocation against an existing path of incompatible kind.
    #[error("path conflict: {0}")]
    PathConflict(String),

    /// Underlying read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation rejected because of contention, e.g. a duplicate enqueued
    /// repair for a coordinate already pending.
    #[error("busy: {0}")]
    Busy(String),
}

impl Error {
    /// True when retrying the operation later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Busy(_) | Error::Io(_))
    }

    /// True for failures that indicate damaged on-disk or on-image state.
    #[must_use]
    pub fn is_data_loss(&self) -> bool {
        matches!(
            self,
            Error::ChecksumMismatch { .. } | Error::IntegrityUnrepairable(_) | Error::Corrupt(_)
        )
    }
}
