use std::num::NonZeroU64;

/// [`crate::Journal`] configuration.
#[derive(Clone, Debug)]
pub struct JournalOptions {
    /// File-name prefix for segment files. Default: `"journal"`.
    pub name: String,
    /// Maximum size in bytes of a segment, including its descriptor.
    /// Default: 64 MiB.
    pub max_segment_size: u64,
    /// Records between journal-index entries. Default: 8.
    pub journal_index_density: NonZeroU64,
    /// Acknowledged-to-replication upper bound: corruption at or below this
    /// index is treated as fatal rather than a recoverable torn tail.
    /// Default: 0 (nothing acknowledged yet).
    pub last_written_index: u64,
    /// Whether to `fsync`/`flush` the touched page range after every
    /// append. Default: `false` (rely on OS writeback + torn-tail
    /// tolerance).
    pub flush_explicitly: bool,
    /// Minimum bytes that must remain free on the backing filesystem; append
    /// fails with [`crate::error::JournalError::OutOfDisk`] if writing the
    /// next frame would cross this floor. Default: 0 (unchecked).
    pub free_disk_space: u64,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            name: "journal".to_string(),
            max_segment_size: 64 * 1024 * 1024,
            journal_index_density: NonZeroU64::new(8).unwrap(),
            last_written_index: 0,
            flush_explicitly: false,
            free_disk_space: 0,
        }
    }
}
