//! The top-level journal: owns a directory of segments, decides when to
//! roll over, and serves cross-segment reads.
//!
//! Grounded on the teacher's `Generic<R, T>` orchestrator (`head` writer +
//! `tail` of sealed segment offsets, `start_new_segment` rollover,
//! `commits_from` cross-segment iteration), generalized from an
//! append-only commit log to a journal that also supports truncation,
//! compaction and reset.

use std::fs::File;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::descriptor::{Descriptor, DESCRIPTOR_LEN};
use crate::error::JournalError;
use crate::options::JournalOptions;
use crate::record::{self, Record};
use crate::segment::writer::{SegmentFull, SharedIndex};
use crate::segment::{self, Segment, SegmentHandle};
use crate::segment_index::SegmentIndex;

fn active_file_name(name: &str, id: u64) -> String {
    format!("{name}-{id}.log")
}

fn deleted_file_name(name: &str, id: u64, epoch: u64) -> String {
    if epoch == 0 {
        format!("{name}-{id}.log.deleted")
    } else {
        format!("{name}-{id}.log.deleted.{epoch}")
    }
}

fn parse_segment_id(file_name: &str, journal_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(journal_name)?
        .strip_prefix('-')?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

fn max_segment_size_u32(size: u64) -> Result<u32, JournalError> {
    u32::try_from(size).map_err(|_| JournalError::IllegalState("max_segment_size must fit in a u32"))
}

fn new_shared_index(density: NonZeroU64) -> SharedIndex {
    Arc::new(Mutex::new(SegmentIndex::new(density)))
}

fn load_descriptor(path: &Path, segment_id: u64, last_written_index: u64) -> Result<Descriptor, JournalError> {
    use std::io::Read;
    let mut buf = [0u8; DESCRIPTOR_LEN];
    let mut f = File::open(path).map_err(|e| JournalError::io(path, e))?;
    if f.read_exact(&mut buf).is_err() {
        return Err(JournalError::CorruptedLog {
            segment_id,
            last_written_index,
            reason: "segment file shorter than its descriptor".to_string(),
        });
    }
    Descriptor::read(&buf).map_err(|e| JournalError::CorruptedLog {
        segment_id,
        last_written_index,
        reason: format!("{e:?}"),
    })
}

/// A segmented, append-only, crash-safe journal mapping monotonic `u64`
/// indexes to opaque byte payloads.
pub struct Journal {
    dir: PathBuf,
    options: JournalOptions,
    next_id: u64,
    deletion_epoch: u64,
    sealed: Vec<Segment>,
    active: Segment,
    registry: Arc<Mutex<Vec<SegmentHandle>>>,
}

impl Journal {
    /// Open the journal rooted at `dir`, creating it if empty, and
    /// otherwise running the recovery scan over its last segment.
    pub fn open(dir: impl AsRef<Path>, options: JournalOptions) -> Result<Self, JournalError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| JournalError::io(&dir, e))?;

        for entry in std::fs::read_dir(&dir).map_err(|e| JournalError::io(&dir, e))? {
            let entry = entry.map_err(|e| JournalError::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&format!("{}-", options.name)) && name.contains(".log.deleted") {
                debug!("removing orphaned deferred-deletion file {name} from a prior crash");
                let _ = std::fs::remove_file(entry.path());
            }
        }

        let mut ids: Vec<u64> = std::fs::read_dir(&dir)
            .map_err(|e| JournalError::io(&dir, e))?
            .filter_map(|e| e.ok())
            .filter_map(|e| parse_segment_id(&e.file_name().to_string_lossy(), &options.name))
            .collect();
        ids.sort_unstable();

        let max_segment_size = max_segment_size_u32(options.max_segment_size)?;

        if ids.is_empty() {
            let descriptor = Descriptor::new(0, options.last_written_index + 1, max_segment_size);
            let index = new_shared_index(options.journal_index_density);
            let active = Segment::create(
                &dir,
                &active_file_name(&options.name, 0),
                descriptor,
                index,
                options.flush_explicitly,
            )?;
            let registry = Arc::new(Mutex::new(vec![active.handle()]));
            info!("initialized empty journal at {} starting at index {}", dir.display(), descriptor.index);
            return Ok(Self {
                dir,
                options,
                next_id: 1,
                deletion_epoch: 0,
                sealed: Vec::new(),
                active,
                registry,
            });
        }

        let mut sealed = Vec::with_capacity(ids.len() - 1);
        for &id in &ids[..ids.len() - 1] {
            let path = dir.join(active_file_name(&options.name, id));
            let descriptor = load_descriptor(&path, id, options.last_written_index)?;
            let segment = Segment::open_sealed(path, descriptor, options.journal_index_density, options.last_written_index)?;
            sealed.push(segment);
        }

        let last_id = *ids.last().unwrap();
        let path = dir.join(active_file_name(&options.name, last_id));
        // The index the last segment would resume at if its own descriptor
        // were trustworthy — i.e. where the previous segment's recovery
        // left off, or the very first index if there is no previous
        // segment. Used to decide, per spec §4.7 step 4, whether an
        // unreadable descriptor on this segment can safely be rebuilt
        // (nothing acknowledged could live there) or must be fatal.
        let resume_index = sealed.last().map(Segment::resume_index).unwrap_or(options.last_written_index + 1);

        let index = new_shared_index(options.journal_index_density);
        let active = match load_descriptor(&path, last_id, options.last_written_index) {
            Ok(descriptor) => Segment::open_active(path, descriptor, index, options.last_written_index, options.flush_explicitly)?,
            Err(e) if resume_index > options.last_written_index => {
                warn!(
                    "segment {last_id} at {} has an unreadable descriptor ({e}) but holds no acknowledged entries \
                     (resume_index={resume_index} > last_written_index={}); rebuilding as a fresh empty segment",
                    path.display(),
                    options.last_written_index
                );
                std::fs::remove_file(&path).map_err(|e| JournalError::io(&path, e))?;
                let fresh = Descriptor::new(last_id, resume_index, max_segment_size);
                Segment::create(&dir, &active_file_name(&options.name, last_id), fresh, index, options.flush_explicitly)?
            }
            Err(e) => return Err(e),
        };

        let mut registry = Vec::with_capacity(sealed.len() + 1);
        registry.extend(sealed.iter().map(Segment::handle));
        registry.push(active.handle());

        info!(
            "recovered journal at {} with {} sealed segment(s), active segment id={} next_index={}",
            dir.display(),
            sealed.len(),
            active.descriptor.id,
            active.writer().unwrap().next_index()
        );

        Ok(Self {
            dir,
            options,
            next_id: last_id + 1,
            deletion_epoch: 0,
            sealed,
            active,
            registry: Arc::new(Mutex::new(registry)),
        })
    }

    pub fn next_index(&self) -> u64 {
        self.active.writer().expect("active segment always has a writer").next_index()
    }

    /// Index of the first record still held by the journal, i.e. the
    /// descriptor index of the oldest surviving segment.
    pub fn first_index(&self) -> u64 {
        self.sealed.first().map(|s| s.descriptor.index).unwrap_or(self.active.descriptor.index)
    }

    /// Index of the most recently appended record, or `first_index() - 1`
    /// if nothing has been written yet.
    pub fn last_index(&self) -> u64 {
        self.next_index() - 1
    }

    /// Whether the journal currently holds no records.
    pub fn is_empty(&self) -> bool {
        self.next_index() == self.first_index()
    }

    fn check_disk_space(&self, required: usize) -> Result<(), JournalError> {
        if self.options.free_disk_space == 0 {
            return Ok(());
        }
        if let Some(available) = available_disk_space(&self.dir) {
            let required = required as u64;
            if available < self.options.free_disk_space + required {
                return Err(JournalError::OutOfDisk { available, required });
            }
        }
        Ok(())
    }

    fn create_segment(&mut self, next_index: u64) -> Result<Segment, JournalError> {
        let id = self.next_id;
        self.next_id += 1;
        let max_segment_size = max_segment_size_u32(self.options.max_segment_size)?;
        let descriptor = Descriptor::new(id, next_index, max_segment_size);
        let index = new_shared_index(self.options.journal_index_density);
        Segment::create(&self.dir, &active_file_name(&self.options.name, id), descriptor, index, self.options.flush_explicitly)
    }

    fn rebuild_registry(&self) {
        let mut reg = self.registry.lock().unwrap();
        reg.clear();
        reg.extend(self.sealed.iter().map(Segment::handle));
        reg.push(self.active.handle());
    }

    fn roll_over(&mut self) -> Result<(), JournalError> {
        let next_index = self.active.writer().unwrap().next_index();
        let mut fresh = self.create_segment(next_index)?;
        std::mem::swap(&mut fresh, &mut self.active);
        let mut sealed = fresh;
        sealed.seal();
        debug!("rolled over segment id={} at index {next_index}", sealed.descriptor.id);
        self.sealed.push(sealed);
        self.rebuild_registry();
        Ok(())
    }

    /// Append a new record, assigning it the journal's next index.
    pub fn append(&mut self, asqn: i64, payload: &[u8]) -> Result<Record, JournalError> {
        self.check_disk_space(record::encoded_len(payload.len()))?;

        let result = self.active.writer_mut().unwrap().append(asqn, payload);
        let record = match result {
            Ok(record) => record,
            Err(SegmentFull) => {
                self.roll_over()?;
                self.active
                    .writer_mut()
                    .unwrap()
                    .append(asqn, payload)
                    .map_err(|_| JournalError::IllegalState("record does not fit in an empty segment"))?
            }
        };
        // No journal-level flush here: the writer itself already
        // `flush_range`s exactly the bytes this append touched when
        // `flush_explicitly` is set (see SegmentWriter::append).
        Ok(record)
    }

    /// Append a caller-supplied, already-indexed record (the replication
    /// append path). Fails if `record.index` is not the journal's next
    /// index, or if `record.checksum` does not match `crc32c(record.data)`.
    pub fn append_record(&mut self, record: Record) -> Result<(), JournalError> {
        let expected = self.next_index();
        if record.index != expected {
            return Err(JournalError::InvalidIndex { expected, actual: record.index });
        }
        if crc32c::crc32c(&record.data) != record.checksum {
            return Err(JournalError::InvalidChecksum { index: record.index });
        }
        self.check_disk_space(record::encoded_len(record.data.len()))?;

        let result = self.active.writer_mut().unwrap().append_record(&record);
        match result {
            Ok(()) => {}
            Err(SegmentFull) => {
                self.roll_over()?;
                self.active
                    .writer_mut()
                    .unwrap()
                    .append_record(&record)
                    .map_err(|_| JournalError::IllegalState("record does not fit in an empty segment"))?;
            }
        }
        // No journal-level flush here: the writer itself already
        // `flush_range`s exactly the bytes this append touched when
        // `flush_explicitly` is set (see SegmentWriter::append_record).
        Ok(())
    }

    fn segment_containing(&self, index: u64) -> Option<&Segment> {
        let active_next = self.active.writer().map(|w| w.next_index()).unwrap_or(self.active.descriptor.index);
        if index >= active_next {
            // Never written (or compacted/truncated away at the tail):
            // no segment, sealed or active, can hold it.
            return None;
        }
        if index >= self.active.descriptor.index {
            return Some(&self.active);
        }
        let pos = self.sealed.partition_point(|s| s.descriptor.index <= index);
        if pos == 0 {
            return None;
        }
        Some(&self.sealed[pos - 1])
    }

    /// Read the record at `index`, or `None` if it has been compacted away,
    /// truncated, or never written.
    pub fn read(&self, index: u64) -> Result<Option<Record>, JournalError> {
        let segment = match self.segment_containing(index) {
            Some(s) => s,
            None => return Ok(None),
        };
        let mut reader = segment.create_reader().map_err(|e| JournalError::io(segment.path(), e))?;
        reader.seek(index)?;
        reader.next()
    }

    /// Open a cursor that reads forward from `from_index`, transparently
    /// advancing across segment boundaries.
    pub fn open_reader(&self, from_index: u64) -> Result<JournalReader, JournalError> {
        JournalReader::new(Arc::clone(&self.registry), from_index)
    }

    /// Discard every record with index `> index`, rewinding the append
    /// cursor so the next `append` reuses that space. Segments wholly past
    /// `index` are deleted; a segment straddling it is reopened for writing
    /// and truncated in place.
    pub fn delete_after(&mut self, index: u64) -> Result<(), JournalError> {
        // Recorded before any mutation: the oldest index the journal can
        // still vouch for. Used only if `index` precedes every surviving
        // segment, so the oldest segment's identity is rebuilt rather than
        // dropped — firstIndex must never move backwards past data that a
        // prior `deleteUntil` has already compacted away.
        let floor_index = self.first_index();

        // Every sealed segment starting at or below `index` survives
        // untouched; everything after it is wholly beyond the truncation
        // point and must go.
        let keep_upto = self.sealed.partition_point(|s| s.descriptor.index <= index);
        let mut doomed: Vec<Segment> = self.sealed.split_off(keep_upto);

        if self.active.descriptor.index > index {
            // The active segment starts after `index`; it cannot survive as
            // the active segment and must be replaced by the newest
            // surviving sealed segment, reopened for writing. If none
            // survived the split above, `index` precedes every remaining
            // segment, so rebuild an empty segment at `floor_index` instead
            // of letting firstIndex jump forward to the old active's start.
            let mut replacement = match self.sealed.pop() {
                Some(mut candidate) => {
                    candidate.reopen_for_writing(self.options.last_written_index, self.options.flush_explicitly)?;
                    candidate
                }
                None => self.create_segment(floor_index)?,
            };
            std::mem::swap(&mut replacement, &mut self.active);
            doomed.push(replacement);
        }

        for mut seg in doomed {
            self.deletion_epoch += 1;
            let name = deleted_file_name(&self.options.name, seg.descriptor.id, self.deletion_epoch);
            seg.delete(&name).map_err(|e| JournalError::io(seg.path(), e))?;
        }

        if let Some(writer) = self.active.writer_mut() {
            writer.truncate(index);
        }
        self.active.mark_truncated(index);
        self.rebuild_registry();
        Ok(())
    }

    /// Remove every complete segment whose highest index is `< index`,
    /// retaining the segment that holds `index - 1` (per spec §4.7).
    /// Never removes the active segment.
    pub fn delete_until(&mut self, index: u64) -> Result<(), JournalError> {
        let mut boundary = 0;
        for i in 0..self.sealed.len() {
            let next_start = self
                .sealed
                .get(i + 1)
                .map(|s| s.descriptor.index)
                .unwrap_or(self.active.descriptor.index);
            if next_start < index {
                boundary = i + 1;
            } else {
                break;
            }
        }

        let removed: Vec<Segment> = self.sealed.drain(0..boundary).collect();
        for mut seg in removed {
            self.deletion_epoch += 1;
            let name = deleted_file_name(&self.options.name, seg.descriptor.id, self.deletion_epoch);
            seg.delete(&name).map_err(|e| JournalError::io(seg.path(), e))?;
        }
        self.rebuild_registry();
        Ok(())
    }

    /// Discard every existing segment and start fresh, accepting appends
    /// beginning at `next_index`.
    pub fn reset(&mut self, next_index: u64) -> Result<(), JournalError> {
        let removed: Vec<Segment> = self.sealed.drain(..).collect();
        for mut seg in removed {
            self.deletion_epoch += 1;
            let name = deleted_file_name(&self.options.name, seg.descriptor.id, self.deletion_epoch);
            seg.delete(&name).map_err(|e| JournalError::io(seg.path(), e))?;
        }

        let mut fresh = self.create_segment(next_index)?;
        std::mem::swap(&mut fresh, &mut self.active);
        let mut old_active = fresh;
        self.deletion_epoch += 1;
        let name = deleted_file_name(&self.options.name, old_active.descriptor.id, self.deletion_epoch);
        old_active.delete(&name).map_err(|e| JournalError::io(old_active.path(), e))?;

        self.rebuild_registry();
        warn!("journal at {} reset, next index {next_index}", self.dir.display());
        Ok(())
    }

    /// Flush the active segment's touched byte range to disk.
    pub fn flush(&mut self) -> Result<(), JournalError> {
        self.active
            .writer_mut()
            .unwrap()
            .flush()
            .map_err(|e| JournalError::io(self.active.path(), e))
    }

    /// Flush and release the journal. Outstanding readers opened via
    /// [`Journal::open_reader`] hold their own independent mapped views and
    /// remain usable after this call until they are closed or dropped.
    /// Consumes the journal, since any further append would panic on the
    /// now-sealed active segment.
    pub fn close(mut self) -> Result<(), JournalError> {
        self.flush()?;
        self.active.seal();
        for seg in &mut self.sealed {
            seg.seal();
        }
        Ok(())
    }
}

#[cfg(unix)]
fn available_disk_space(dir: &Path) -> Option<u64> {
    nix::sys::statvfs::statvfs(dir)
        .ok()
        .map(|stats| stats.blocks_available() as u64 * stats.fragment_size())
}

#[cfg(not(unix))]
fn available_disk_space(_dir: &Path) -> Option<u64> {
    None
}

/// A forward-only cursor over the whole journal, transparently advancing
/// across segment boundaries as each one is exhausted.
///
/// Holds a snapshot of the segment registry at the time each segment
/// boundary is crossed; segments appended by the journal after this reader
/// was created are visible once the reader reaches them.
pub struct JournalReader {
    registry: Arc<Mutex<Vec<SegmentHandle>>>,
    current: Option<(usize, segment::SegmentReader)>,
}

impl JournalReader {
    fn new(registry: Arc<Mutex<Vec<SegmentHandle>>>, from_index: u64) -> Result<Self, JournalError> {
        let mut reader = Self { registry, current: None };
        reader.seek(from_index)?;
        Ok(reader)
    }

    fn open_at(&self, pos: usize) -> Result<segment::SegmentReader, JournalError> {
        let reg = self.registry.lock().unwrap();
        let handle = reg.get(pos).cloned().ok_or(JournalError::IllegalState("no such segment"))?;
        drop(reg);
        segment::open_reader_for_handle(&handle).map_err(|e| JournalError::io(&handle.path, e))
    }

    /// Reposition the cursor at `index`, which may be in any segment.
    pub fn seek(&mut self, index: u64) -> Result<(), JournalError> {
        let reg = self.registry.lock().unwrap();
        let pos = reg.partition_point(|h| h.descriptor.index <= index);
        if pos == 0 {
            return Err(JournalError::IllegalState("read index precedes the first segment"));
        }
        drop(reg);

        let mut reader = self.open_at(pos - 1)?;
        reader.seek(index)?;
        self.current = Some((pos - 1, reader));
        Ok(())
    }

    /// Whether calling `next()` would currently yield a record, transparently
    /// skipping over any exhausted-but-not-yet-advanced segment boundaries.
    pub fn has_next(&mut self) -> bool {
        loop {
            let (seg_pos, reader) = match &mut self.current {
                Some(c) => c,
                None => return false,
            };
            if reader.has_next() {
                return true;
            }
            let next_pos = *seg_pos + 1;
            match self.open_at(next_pos) {
                Ok(new_reader) => self.current = Some((next_pos, new_reader)),
                Err(_) => {
                    self.current = None;
                    return false;
                }
            }
        }
    }

    /// Release this reader's segment handle. Idempotent; also run on drop.
    pub fn close(&mut self) {
        self.current = None;
    }

    /// Return the next record in index order, or `None` once the journal
    /// has no more records past this cursor.
    pub fn next(&mut self) -> Result<Option<Record>, JournalError> {
        loop {
            let (seg_pos, reader) = match &mut self.current {
                Some(c) => c,
                None => return Ok(None),
            };
            match reader.next()? {
                Some(record) => return Ok(Some(record)),
                None => {
                    let next_pos = *seg_pos + 1;
                    match self.open_at(next_pos) {
                        Ok(new_reader) => self.current = Some((next_pos, new_reader)),
                        Err(_) => {
                            self.current = None;
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }
}
