//! Segment ownership: binds a descriptor, its backing file, and the
//! writer/reader handles onto it, and implements the deferred-deletion
//! protocol (a segment's file is only unlinked once its last reader has
//! closed).
//!
//! Grounded on the teacher's segment lifecycle (`repo::fs::Fs` rename +
//! remove dance) generalized to the explicit reference-count hook this
//! crate's recovery/compaction paths need, rather than relying on
//! `Arc::strong_count` (the journal itself, not just readers, holds strong
//! references to a sealed segment).

pub mod reader;
pub mod writer;

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use memmap2::Mmap;

pub use reader::SegmentReader;
pub use writer::{SegmentFull, SegmentWriter, SharedIndex};

use crate::descriptor::Descriptor;
use crate::error::JournalError;

/// State shared between a segment and every reader it has ever handed out.
#[derive(Debug)]
pub(crate) struct SharedState {
    /// Set once the segment's file has been renamed aside pending deletion.
    marked_for_deletion: AtomicBool,
    /// Index above which reads are no longer valid, updated on truncate.
    /// `u64::MAX` means "no truncation has applied".
    truncated_to: AtomicU64,
    reader_count: AtomicUsize,
    deleted_path: Mutex<Option<PathBuf>>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            marked_for_deletion: AtomicBool::new(false),
            truncated_to: AtomicU64::new(u64::MAX),
            reader_count: AtomicUsize::new(0),
            deleted_path: Mutex::new(None),
        }
    }

    fn is_deleted(&self) -> bool {
        self.marked_for_deletion.load(Ordering::Acquire)
    }

    fn truncated_to(&self) -> u64 {
        self.truncated_to.load(Ordering::Acquire)
    }

    fn try_finalize(&self) {
        if self.marked_for_deletion.load(Ordering::Acquire) && self.reader_count.load(Ordering::Acquire) == 0 {
            if let Some(path) = self.deleted_path.lock().unwrap().take() {
                if let Err(e) = std::fs::remove_file(&path) {
                    log::warn!("failed to remove deleted segment file {}: {e}", path.display());
                }
            }
        }
    }

    pub(crate) fn on_reader_closed(&self) {
        self.reader_count.fetch_sub(1, Ordering::AcqRel);
        self.try_finalize();
    }
}

/// A segment of the journal: a fixed-size memory-mapped file, its parsed
/// descriptor, and the shared bookkeeping that lets outstanding readers
/// outlive a `delete()`.
pub struct Segment {
    pub descriptor: Descriptor,
    path: PathBuf,
    writer: Option<SegmentWriter>,
    index: SharedIndex,
    shared: Arc<SharedState>,
    /// For a sealed segment (no writer), the index one past its last valid
    /// record, as determined by the recovery scan at open time. Unused
    /// while `writer` is `Some`, since the writer tracks this itself.
    sealed_next_index: u64,
}

impl Segment {
    /// Create a brand-new, empty segment and open it for writing.
    pub fn create(
        dir: &Path,
        file_name: &str,
        descriptor: Descriptor,
        index: SharedIndex,
        flush_explicitly: bool,
    ) -> Result<Self, JournalError> {
        let path = dir.join(file_name);
        let writer = SegmentWriter::create(&path, descriptor, index.clone(), flush_explicitly)?;
        Ok(Self {
            descriptor,
            path,
            writer: Some(writer),
            index,
            shared: Arc::new(SharedState::new()),
            sealed_next_index: descriptor.index,
        })
    }

    /// Open an existing segment file read-only, without recovering it as a
    /// writer. Used for every sealed segment but the active one at journal
    /// open.
    ///
    /// A corrupt frame found at or below `last_written_index` is fatal —
    /// sealed segments are, by construction, already-committed data, so the
    /// same fatal/recoverable distinction §4.4 applies to the active
    /// segment's tail also applies here.
    pub fn open_sealed(
        path: PathBuf,
        descriptor: Descriptor,
        density: std::num::NonZeroU64,
        last_written_index: u64,
    ) -> Result<Self, JournalError> {
        let file = File::open(&path).map_err(|e| JournalError::io(&path, e))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| JournalError::io(&path, e))?;

        let index = Arc::new(Mutex::new(crate::segment_index::SegmentIndex::new(density)));
        let sealed_next_index;
        {
            let mut guard = index.lock().unwrap();
            let outcome = writer::scan_segment(&mmap[..], descriptor.index, crate::descriptor::DESCRIPTOR_LEN, &mut guard);
            sealed_next_index = outcome.next_index;
            if let writer::ScanStop::Torn { at_index, reason, .. } = outcome.stop {
                if at_index <= last_written_index {
                    return Err(JournalError::CorruptedLog {
                        segment_id: descriptor.id,
                        last_written_index,
                        reason: format!("{reason:?} at index {at_index} in sealed segment"),
                    });
                }
                log::warn!(
                    "sealed segment {} has a corrupt frame at index={at_index} ({reason:?}) above last_written_index={last_written_index}; indexing stops there",
                    descriptor.id
                );
            }
        }

        Ok(Self {
            descriptor,
            path,
            writer: None,
            index,
            shared: Arc::new(SharedState::new()),
            sealed_next_index,
        })
    }

    /// The index one past this segment's last valid record: the writer's
    /// own cursor if it is currently open for writing, or the value learned
    /// by the recovery scan when it was opened sealed.
    pub fn resume_index(&self) -> u64 {
        match &self.writer {
            Some(w) => w.next_index(),
            None => self.sealed_next_index,
        }
    }

    /// Open the last segment on disk for writing, running the recovery
    /// scan that decides between a recoverable torn tail and a fatal
    /// corruption.
    pub fn open_active(
        path: PathBuf,
        descriptor: Descriptor,
        index: SharedIndex,
        last_written_index: u64,
        flush_explicitly: bool,
    ) -> Result<Self, JournalError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| JournalError::io(&path, e))?;
        let writer = SegmentWriter::recover(&file, &path, descriptor, index.clone(), last_written_index, flush_explicitly)?;
        Ok(Self {
            descriptor,
            path,
            writer: Some(writer),
            index,
            shared: Arc::new(SharedState::new()),
            sealed_next_index: descriptor.index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn writer(&self) -> Option<&SegmentWriter> {
        self.writer.as_ref()
    }

    pub fn writer_mut(&mut self) -> Option<&mut SegmentWriter> {
        self.writer.as_mut()
    }

    /// Promote a just-rolled-over active segment to a sealed one: drops the
    /// writer (flushing first) but keeps the segment readable.
    pub fn seal(&mut self) {
        if let Some(mut w) = self.writer.take() {
            w.close();
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.writer.is_none()
    }

    /// Mark the affected tail of this segment unreadable; called after a
    /// `truncate` that shortens it in place.
    pub fn mark_truncated(&self, index: u64) {
        self.shared.truncated_to.store(index, Ordering::Release);
    }

    pub fn reader_count(&self) -> usize {
        self.shared.reader_count.load(Ordering::Acquire)
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.shared.is_deleted()
    }

    /// Open a fresh, independent read-only view of this segment's file.
    pub fn create_reader(&self) -> io::Result<SegmentReader> {
        open_reader_for_handle(&self.handle())
    }

    /// Rename this segment's file aside and mark it for deletion. The file
    /// itself is only unlinked once every outstanding reader has closed
    /// (`SharedState::try_finalize`); if there are none right now, it is
    /// removed immediately.
    pub fn delete(&mut self, deleted_name: &str) -> io::Result<()> {
        self.seal();
        let deleted_path = self.path.with_file_name(deleted_name);
        std::fs::rename(&self.path, &deleted_path)?;
        *self.shared.deleted_path.lock().unwrap() = Some(deleted_path);
        self.shared.marked_for_deletion.store(true, Ordering::Release);
        self.shared.try_finalize();
        Ok(())
    }

    /// Reopen a sealed segment for writing, reusing its existing segment
    /// index so readers that already hold a clone of it see continuity.
    /// Used when a truncate cuts into a previously-sealed segment, making
    /// it the new active segment.
    pub fn reopen_for_writing(&mut self, last_written_index: u64, flush_explicitly: bool) -> Result<(), JournalError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| JournalError::io(&self.path, e))?;
        let writer = SegmentWriter::recover(&file, &self.path, self.descriptor, self.index.clone(), last_written_index, flush_explicitly)?;
        self.writer = Some(writer);
        Ok(())
    }

    pub(crate) fn handle(&self) -> SegmentHandle {
        SegmentHandle {
            descriptor: self.descriptor,
            path: self.path.clone(),
            index: self.index.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

/// A lightweight, cloneable snapshot of the parts of a [`Segment`] a
/// cross-segment [`crate::journal::JournalReader`] needs to open its own
/// independent reader, decoupled from the segment's writer and its place
/// in the journal's segment list.
#[derive(Clone)]
pub(crate) struct SegmentHandle {
    pub descriptor: Descriptor,
    pub path: PathBuf,
    pub index: SharedIndex,
    pub shared: Arc<SharedState>,
}

pub(crate) fn open_reader_for_handle(handle: &SegmentHandle) -> io::Result<SegmentReader> {
    let file = File::open(&handle.path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    handle.shared.reader_count.fetch_add(1, Ordering::AcqRel);
    Ok(SegmentReader::new(
        mmap,
        handle.descriptor,
        handle.index.clone(),
        Arc::clone(&handle.shared),
    ))
}
