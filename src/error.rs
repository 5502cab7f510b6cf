//! Error types surfaced by this crate.
//!
//! Follows the teacher crate's house style: one `thiserror`-derived enum per
//! concern, chained into the public-facing [`JournalError`] at the
//! segment/journal boundary.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by [`crate::Journal`] and [`crate::JournalReader`].
#[derive(Debug, Error)]
pub enum JournalError {
    /// `append(record)` received a record whose index is not the journal's
    /// next index.
    #[error("invalid index: expected={expected} actual={actual}")]
    InvalidIndex { expected: u64, actual: u64 },

    /// `append(record)`'s supplied checksum does not match `crc32c(data)`.
    #[error("invalid checksum for record at index={index}")]
    InvalidChecksum { index: u64 },

    /// A descriptor or frame at or below `last_written_index` is invalid;
    /// the journal refuses to open.
    #[error("corrupted log: {reason} (segment {segment_id}, last-written-index={last_written_index})")]
    CorruptedLog {
        segment_id: u64,
        last_written_index: u64,
        reason: String,
    },

    /// A reader was used after its segment was reset, deleted, or closed.
    #[error("segment deleted out from under reader")]
    SegmentDeleted,

    /// A reader or journal was used in a state that forbids the requested
    /// operation (e.g. reading after `reset`).
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// Append refused because the configured `free_disk_space` floor would
    /// be crossed.
    #[error("out of disk space: {available} bytes free, need at least {required}")]
    OutOfDisk { available: u64, required: u64 },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl JournalError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
