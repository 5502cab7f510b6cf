//! A single-segment, forward-only cursor over a read-only mmap view.
//!
//! Grounded on the teacher's `segment::Reader<R>` (sequential decode loop
//! yielding `Commits`), adapted to a random-access `seek` backed by the
//! segment's sparse index, and to the deferred-deletion reader-count
//! protocol (spec §4.6) via [`super::SharedState`].

use std::sync::Arc;

use memmap2::Mmap;

use super::writer::SharedIndex;
use super::SharedState;
use crate::descriptor::{Descriptor, DESCRIPTOR_LEN};
use crate::error::JournalError;
use crate::record::{self, Decoded, Record};

pub struct SegmentReader {
    mmap: Mmap,
    descriptor: Descriptor,
    index: SharedIndex,
    shared: Arc<SharedState>,
    position: usize,
    next_index: u64,
    closed: bool,
}

impl SegmentReader {
    pub(crate) fn new(mmap: Mmap, descriptor: Descriptor, index: SharedIndex, shared: Arc<SharedState>) -> Self {
        let next_index = descriptor.index;
        Self {
            mmap,
            descriptor,
            index,
            shared,
            position: DESCRIPTOR_LEN,
            next_index,
            closed: false,
        }
    }

    pub fn segment_id(&self) -> u64 {
        self.descriptor.id
    }

    /// Whether calling `next()` would currently yield a record. Never
    /// errors: a deleted or truncated-past-this-point segment simply
    /// reports no more data, same as genuine end-of-segment.
    pub fn has_next(&self) -> bool {
        if self.closed || self.shared.is_deleted() || self.next_index > self.shared.truncated_to() {
            return false;
        }
        matches!(
            record::read_record(&self.mmap[..], self.position, None),
            Decoded::Record { .. }
        )
    }

    /// Advance and return the next record in index order.
    ///
    /// Returns `Ok(None)` on a clean, ordinary end-of-segment (the caller
    /// should move on to the next segment, if any). Returns
    /// `Err(SegmentDeleted)` if this segment was deleted since the reader
    /// was opened, and `Err(IllegalState)` if it was truncated past this
    /// reader's current position.
    pub fn next(&mut self) -> Result<Option<Record>, JournalError> {
        if self.closed {
            return Err(JournalError::IllegalState("reader is closed"));
        }
        if self.shared.is_deleted() {
            return Err(JournalError::SegmentDeleted);
        }
        if self.next_index > self.shared.truncated_to() {
            return Err(JournalError::IllegalState("segment was truncated past this reader"));
        }

        match record::read_record(&self.mmap[..], self.position, Some(self.next_index)) {
            Decoded::Record { record, frame_len } => {
                self.position += frame_len;
                self.next_index += 1;
                Ok(Some(record))
            }
            Decoded::EndOfSegment => Ok(None),
            Decoded::Corrupt(reason) => Err(JournalError::CorruptedLog {
                segment_id: self.descriptor.id,
                last_written_index: self.next_index,
                reason: format!("{reason:?}"),
            }),
        }
    }

    /// Reposition the cursor at `index`, using the segment's sparse index
    /// to skip ahead before falling back to a linear scan.
    pub fn seek(&mut self, index: u64) -> Result<(), JournalError> {
        if index < self.descriptor.index {
            return Err(JournalError::IllegalState("seek index precedes this segment"));
        }
        let (start_index, start_pos) = self
            .index
            .lock()
            .unwrap()
            .lookup(index)
            .unwrap_or((self.descriptor.index, DESCRIPTOR_LEN as u64));

        // If `index` exceeds the segment's range, per spec §4.5 we position
        // at end rather than erroring: the caller (typically the journal,
        // advancing to the next segment) discovers this via `has_next`
        // returning false, not via a seek failure.
        let mut pos = start_pos as usize;
        let mut cur = start_index;
        while cur < index {
            match record::read_record(&self.mmap[..], pos, Some(cur)) {
                Decoded::Record { frame_len, .. } => {
                    pos += frame_len;
                    cur += 1;
                }
                Decoded::EndOfSegment => break,
                Decoded::Corrupt(reason) => {
                    return Err(JournalError::CorruptedLog {
                        segment_id: self.descriptor.id,
                        last_written_index: cur,
                        reason: format!("{reason:?}"),
                    });
                }
            }
        }

        self.position = pos;
        self.next_index = cur;
        Ok(())
    }

    /// Rewind to the start of this segment.
    pub fn reset(&mut self) {
        self.position = DESCRIPTOR_LEN;
        self.next_index = self.descriptor.index;
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.on_reader_closed();
        }
    }
}

impl Drop for SegmentReader {
    fn drop(&mut self) {
        self.close();
    }
}
