//! A segmented, append-only, crash-safe journal mapping monotonic `u64`
//! indexes to opaque byte payloads, backed by fixed-size memory-mapped
//! segment files.
//!
//! Built for a single writer and any number of independent readers within
//! one process; replication and network transport are out of scope. See
//! [`Journal`] for the entry point.

mod descriptor;
pub mod error;
mod journal;
mod options;
mod record;
mod segment;
mod segment_index;

pub use error::JournalError;
pub use journal::{Journal, JournalReader};
pub use options::JournalOptions;
pub use record::Record;
pub use segment::reader::SegmentReader;

/// Byte length of a segment's fixed header. Useful for callers sizing
/// `max_segment_size` exactly, e.g. tests that want to force a rollover
/// after a known number of records.
pub fn descriptor_len() -> usize {
    descriptor::DESCRIPTOR_LEN
}

/// Encoded on-disk size of a record carrying a payload of `payload_len`
/// bytes, including framing overhead.
pub fn encoded_record_len(payload_len: usize) -> usize {
    record::encoded_len(payload_len)
}

#[cfg(any(test, feature = "test"))]
pub mod test_support {
    //! Helpers for exercising a [`Journal`] in tests. Mirrors the teacher's
    //! own `tests::helpers` module: a scratch directory plus a thin wrapper
    //! over repeated `append`.

    use tempfile::TempDir;

    use crate::{Journal, JournalOptions};

    /// Open a fresh journal in a throwaway temp directory, returning both so
    /// the directory outlives the journal.
    pub fn temp_journal(options: JournalOptions) -> (TempDir, Journal) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let journal = Journal::open(dir.path(), options).expect("open journal");
        (dir, journal)
    }

    /// Append `count` records of `payload_len` zero bytes each, returning
    /// their assigned indexes.
    pub fn fill(journal: &mut Journal, count: u64, payload_len: usize) -> Vec<u64> {
        let payload = vec![0u8; payload_len];
        (0..count)
            .map(|_| journal.append(0, &payload).expect("append").index)
            .collect()
    }

    /// Enable env_logger once, for tests that want to see log output.
    pub fn enable_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }
}
