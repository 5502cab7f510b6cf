//! The mutable, append-only side of a segment.
//!
//! Grounded on the teacher's `segment::Writer<W>` (buffered append cursor +
//! `FileLike::ftruncate`), reworked around a live `MmapMut` instead of a
//! buffered file handle: every append, truncate and reset mutates the
//! mapping directly and the OS writeback (or an explicit `flush_range`)
//! carries it to disk.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use memmap2::MmapMut;
use thiserror::Error;

use crate::descriptor::{Descriptor, DESCRIPTOR_LEN};
use crate::error::JournalError;
use crate::record::{self, CorruptReason, Decoded, Record};
use crate::segment_index::SegmentIndex;

pub type SharedIndex = Arc<Mutex<SegmentIndex>>;

/// Internal control-flow signal: the segment has no room for another frame
/// of this size. Caught by the journal, which rolls over to a new segment.
#[derive(Debug, Clone, Copy, Error)]
#[error("segment full")]
pub struct SegmentFull;

#[derive(Debug)]
pub(crate) struct ScanOutcome {
    pub next_index: u64,
    pub end_position: usize,
    pub stop: ScanStop,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ScanStop {
    EndOfSegment,
    Torn {
        at_position: usize,
        at_index: u64,
        reason: CorruptReason,
    },
}

/// Walk frames sequentially from `start_position`, expecting contiguous
/// indexes starting at `start_index`, indexing into `index` as it goes.
/// Stops at the first invalid-marker (clean EOF) or corrupt frame.
pub(crate) fn scan_segment(
    buf: &[u8],
    start_index: u64,
    start_position: usize,
    index: &mut SegmentIndex,
) -> ScanOutcome {
    let mut pos = start_position;
    let mut expected = start_index;

    loop {
        match record::read_record(buf, pos, Some(expected)) {
            Decoded::Record { frame_len, .. } => {
                index.index_record(expected, pos as u64);
                pos += frame_len;
                expected += 1;
            }
            Decoded::EndOfSegment => {
                return ScanOutcome {
                    next_index: expected,
                    end_position: pos,
                    stop: ScanStop::EndOfSegment,
                };
            }
            Decoded::Corrupt(reason) => {
                return ScanOutcome {
                    next_index: expected,
                    end_position: pos,
                    stop: ScanStop::Torn {
                        at_position: pos,
                        at_index: expected,
                        reason,
                    },
                };
            }
        }
    }
}

#[cfg(feature = "fallocate")]
fn preallocate(file: &File, len: u64) {
    if let Err(e) = nix::fcntl::posix_fallocate(file, 0, len as i64) {
        warn!("fallocate failed, falling back to sparse file: {e}");
    }
}

#[cfg(not(feature = "fallocate"))]
fn preallocate(_file: &File, _len: u64) {}

pub struct SegmentWriter {
    mmap: MmapMut,
    pub descriptor: Descriptor,
    next_index: u64,
    position: usize,
    index: SharedIndex,
    flush_explicitly: bool,
}

impl SegmentWriter {
    /// Create a brand-new segment file at `path`: size it to
    /// `descriptor.max_segment_size`, write the descriptor at offset 0, and
    /// map it for writing.
    pub fn create(
        path: &Path,
        descriptor: Descriptor,
        index: SharedIndex,
        flush_explicitly: bool,
    ) -> Result<Self, JournalError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| JournalError::io(path, e))?;
        file.set_len(descriptor.max_segment_size as u64)
            .map_err(|e| JournalError::io(path, e))?;
        preallocate(&file, descriptor.max_segment_size as u64);

        let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| JournalError::io(path, e))?;
        descriptor.write(&mut mmap[..DESCRIPTOR_LEN]);
        mmap.flush_range(0, DESCRIPTOR_LEN)
            .map_err(|e| JournalError::io(path, e))?;

        debug!(
            "created segment id={} index={} at {}",
            descriptor.id,
            descriptor.index,
            path.display()
        );

        Ok(Self {
            mmap,
            descriptor,
            next_index: descriptor.index,
            position: DESCRIPTOR_LEN,
            index,
            flush_explicitly,
        })
    }

    /// Open an existing segment file for writing, running the recovery scan
    /// from just after the descriptor. `last_written_index` is the
    /// acknowledged-to-replication bound: a corrupt or non-contiguous frame
    /// at or below it is fatal, above it is a recoverable torn tail.
    pub fn recover(
        file: &File,
        path: &Path,
        descriptor: Descriptor,
        index: SharedIndex,
        last_written_index: u64,
        flush_explicitly: bool,
    ) -> Result<Self, JournalError> {
        let mut mmap = unsafe { MmapMut::map_mut(file) }.map_err(|e| JournalError::io(path, e))?;

        let outcome = {
            let mut guard = index.lock().unwrap();
            scan_segment(&mmap[..], descriptor.index, DESCRIPTOR_LEN, &mut guard)
        };

        match outcome.stop {
            ScanStop::EndOfSegment => {
                debug!(
                    "segment {} recovered cleanly, next index {}",
                    descriptor.id, outcome.next_index
                );
            }
            ScanStop::Torn {
                at_index,
                reason,
                at_position,
            } => {
                if at_index <= last_written_index {
                    return Err(JournalError::CorruptedLog {
                        segment_id: descriptor.id,
                        last_written_index,
                        reason: format!("{reason:?} at index {at_index}"),
                    });
                }
                warn!(
                    "segment {} torn tail at index={at_index} ({reason:?}); truncating unwritten suffix",
                    descriptor.id
                );
                record::mark_invalid(&mut mmap[..], at_position);
            }
        }

        Ok(Self {
            mmap,
            descriptor,
            next_index: outcome.next_index,
            position: outcome.end_position,
            index,
            flush_explicitly,
        })
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn is_empty(&self) -> bool {
        self.next_index == self.descriptor.index
    }

    pub fn remaining(&self) -> usize {
        self.mmap.len().saturating_sub(self.position)
    }

    /// Append a fresh record at `self.next_index()`, assigning `asqn`.
    pub fn append(&mut self, asqn: i64, payload: &[u8]) -> Result<Record, SegmentFull> {
        let index = self.next_index;
        let n = record::write_record(&mut self.mmap[..], self.position, index, asqn, payload)
            .ok_or(SegmentFull)?;

        self.index.lock().unwrap().index_record(index, self.position as u64);
        if self.flush_explicitly {
            let _ = self.mmap.flush_range(self.position, n);
        }
        self.position += n;
        self.next_index += 1;

        Ok(Record {
            index,
            asqn,
            checksum: crc32c::crc32c(payload),
            data: payload.to_vec(),
        })
    }

    /// Append a caller-supplied, pre-validated record (the replication
    /// append path). Caller must already have checked `record.index` and
    /// `record.checksum`.
    pub fn append_record(&mut self, record: &Record) -> Result<(), SegmentFull> {
        let n = record::write_stored_record(&mut self.mmap[..], self.position, record).ok_or(SegmentFull)?;

        self.index
            .lock()
            .unwrap()
            .index_record(record.index, self.position as u64);
        if self.flush_explicitly {
            let _ = self.mmap.flush_range(self.position, n);
        }
        self.position += n;
        self.next_index += 1;
        Ok(())
    }

    /// Discard every record with index `> index`, rewinding the append
    /// cursor so the next append reuses that space.
    pub fn truncate(&mut self, index: u64) {
        if index < self.descriptor.index {
            self.position = DESCRIPTOR_LEN;
            self.next_index = self.descriptor.index;
            record::mark_invalid(&mut self.mmap[..], self.position);
            self.index.lock().unwrap().clear();
            return;
        }

        let (start_index, start_pos) = self
            .index
            .lock()
            .unwrap()
            .lookup(index)
            .unwrap_or((self.descriptor.index, DESCRIPTOR_LEN as u64));

        // Re-walk from the nearest indexed entry at or below `index`, frame
        // by frame, stopping as soon as we've consumed the frame at `index`
        // itself — not at true end-of-segment, since later frames may still
        // be intact on disk and must not leak past the cut.
        let mut pos = start_pos as usize;
        let mut cur = start_index;
        while cur <= index {
            match record::read_record(&self.mmap[..], pos, Some(cur)) {
                record::Decoded::Record { frame_len, .. } => {
                    pos += frame_len;
                    cur += 1;
                }
                record::Decoded::EndOfSegment | record::Decoded::Corrupt(_) => break,
            }
        }

        self.position = pos;
        self.next_index = cur.max(self.descriptor.index);
        record::mark_invalid(&mut self.mmap[..], self.position);
        self.index.lock().unwrap().delete_after(index);
    }

    /// Rewind the segment to empty, ready to accept appends starting at
    /// `next_index`. Used when resetting the whole journal to a new index.
    pub fn reset(&mut self, next_index: u64) {
        self.position = DESCRIPTOR_LEN;
        self.next_index = next_index;
        record::mark_invalid(&mut self.mmap[..], self.position);
        self.index.lock().unwrap().clear();
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.mmap.flush()
    }

    pub fn close(&mut self) {
        let _ = self.mmap.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU64;
    use tempfile::tempdir;

    fn shared_index() -> SharedIndex {
        Arc::new(Mutex::new(SegmentIndex::new(NonZeroU64::new(4).unwrap())))
    }

    #[test]
    fn append_and_recover_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.log");
        let descriptor = Descriptor::new(0, 1, 4096);

        {
            let mut w = SegmentWriter::create(&path, descriptor, shared_index(), true).unwrap();
            w.append(0, b"one").unwrap();
            w.append(0, b"two").unwrap();
            assert_eq!(w.next_index(), 3);
        }

        let file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let w = SegmentWriter::recover(&file, &path, descriptor, shared_index(), 0, true).unwrap();
        assert_eq!(w.next_index(), 3);
    }

    #[test]
    fn truncate_rewinds_cursor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.log");
        let descriptor = Descriptor::new(0, 1, 4096);
        let index = shared_index();
        let mut w = SegmentWriter::create(&path, descriptor, index, true).unwrap();
        w.append(0, b"one").unwrap();
        w.append(0, b"two").unwrap();
        w.append(0, b"three").unwrap();

        w.truncate(1);
        assert_eq!(w.next_index(), 2);

        let r = w.append(0, b"replacement").unwrap();
        assert_eq!(r.index, 2);

        // The old record 2 and 3 frames must be fully overwritten/shadowed:
        // re-scanning from the start should see record 1, the replacement,
        // and then a clean end — never the stale "two"/"three" bytes.
        let mut pos = DESCRIPTOR_LEN;
        match record::read_record(&w.mmap, pos, Some(1)) {
            Decoded::Record { record, frame_len } => {
                assert_eq!(record.data, b"one");
                pos += frame_len;
            }
            other => panic!("expected record 1, got {other:?}"),
        }
        match record::read_record(&w.mmap, pos, Some(2)) {
            Decoded::Record { record, frame_len } => {
                assert_eq!(record.data, b"replacement");
                pos += frame_len;
            }
            other => panic!("expected replacement record, got {other:?}"),
        }
        assert!(matches!(record::read_record(&w.mmap, pos, None), Decoded::EndOfSegment));
    }

    #[test]
    fn torn_tail_above_last_written_is_recoverable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.log");
        let descriptor = Descriptor::new(0, 1, 4096);
        let index = shared_index();
        {
            let mut w = SegmentWriter::create(&path, descriptor, index.clone(), true).unwrap();
            w.append(0, b"one").unwrap();
            w.append(0, b"two").unwrap();
        }
        // Corrupt the second frame's checksum byte to simulate a torn write.
        {
            let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            use std::io::{Seek, SeekFrom, Write};
            let pos = DESCRIPTOR_LEN + crate::record::encoded_len(3) + 1;
            f.seek(SeekFrom::Start(pos as u64)).unwrap();
            f.write_all(&[0xffu8]).unwrap();
        }

        let file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let w = SegmentWriter::recover(&file, &path, descriptor, shared_index(), 1, true).unwrap();
        assert_eq!(w.next_index(), 2);
    }

    #[test]
    fn corruption_at_or_below_last_written_index_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.log");
        let descriptor = Descriptor::new(0, 1, 4096);
        let index = shared_index();
        {
            let mut w = SegmentWriter::create(&path, descriptor, index.clone(), true).unwrap();
            w.append(0, b"one").unwrap();
            w.append(0, b"two").unwrap();
        }
        {
            let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            use std::io::{Seek, SeekFrom, Write};
            let pos = DESCRIPTOR_LEN + crate::record::encoded_len(3) + 1;
            f.seek(SeekFrom::Start(pos as u64)).unwrap();
            f.write_all(&[0xffu8]).unwrap();
        }

        let file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let err = SegmentWriter::recover(&file, &path, descriptor, shared_index(), 2, true).unwrap_err();
        assert!(matches!(err, JournalError::CorruptedLog { .. }));
    }
}
