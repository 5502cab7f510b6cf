//! On-disk record framing.
//!
//! Frame layout (all multi-byte integers little-endian):
//!
//! ```text
//! [frame-type:1][checksum:4][payload-len:4][index:8][asqn:8][payload:N]
//! ```
//!
//! A `frame-type` of [`FRAME_INVALID`] (zero, the value of an untouched
//! mmap page) terminates the valid portion of a segment.

use std::convert::TryInto;

use crc32c::crc32c;

/// Marks the end of the valid portion of a segment. Also the value of any
/// byte in a freshly-mapped, never-written segment region.
pub const FRAME_INVALID: u8 = 0;
/// Marks a fully-framed record.
pub const FRAME_RECORD: u8 = 1;

const FRAME_TYPE_LEN: usize = 1;
const CHECKSUM_LEN: usize = 4;
const PAYLOAD_LEN_LEN: usize = 4;
const INDEX_LEN: usize = 8;
const ASQN_LEN: usize = 8;

/// Bytes of frame header preceding the body (marker + metadata).
pub const FRAME_HEADER_LEN: usize = FRAME_TYPE_LEN + CHECKSUM_LEN + PAYLOAD_LEN_LEN;
/// Bytes of the fixed-width portion of a record body (index + asqn).
pub const BODY_FIXED_LEN: usize = INDEX_LEN + ASQN_LEN;
/// Total framing overhead (header + fixed body) around a payload.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_LEN + BODY_FIXED_LEN;

/// A logical record: a caller-supplied payload at a journal index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub index: u64,
    pub asqn: i64,
    pub checksum: u32,
    pub data: Vec<u8>,
}

impl Record {
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Encoded size in bytes of a record with the given payload length.
pub fn encoded_len(payload_len: usize) -> usize {
    FRAME_OVERHEAD + payload_len
}

/// Outcome of attempting to decode a frame at a given position.
#[derive(Debug)]
pub enum Decoded {
    Record { record: Record, frame_len: usize },
    EndOfSegment,
    Corrupt(CorruptReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptReason {
    ChecksumMismatch,
    IndexMismatch { expected: u64, actual: u64 },
    TruncatedFrame,
}

/// Write one record frame at `pos` in `buf`.
///
/// The frame is assembled in a scratch buffer first and copied onto `buf` in
/// one shot, so a crash can only ever leave "nothing written" or "everything
/// written" at the byte level, never a half-patched metadata section.
///
/// Returns the number of bytes written. Returns `None` if `buf` does not
/// have `encoded_len(payload.len())` bytes remaining at `pos` — the caller
/// should treat this as `SEGMENT_FULL` and roll over to a new segment.
pub fn write_record(buf: &mut [u8], pos: usize, index: u64, asqn: i64, payload: &[u8]) -> Option<usize> {
    let total = encoded_len(payload.len());
    if pos.checked_add(total)? > buf.len() {
        return None;
    }

    let checksum = crc32c(payload);

    let mut frame = Vec::with_capacity(total);
    frame.push(FRAME_RECORD);
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&index.to_le_bytes());
    frame.extend_from_slice(&asqn.to_le_bytes());
    frame.extend_from_slice(payload);

    buf[pos..pos + total].copy_from_slice(&frame);
    Some(total)
}

/// Write a caller-supplied, pre-checksummed record (the replication append
/// path). The caller is responsible for having validated `record.checksum`
/// against `record.data` beforehand; see [`crate::error::JournalError::InvalidChecksum`].
pub fn write_stored_record(buf: &mut [u8], pos: usize, record: &Record) -> Option<usize> {
    let total = encoded_len(record.data.len());
    if pos.checked_add(total)? > buf.len() {
        return None;
    }

    let mut frame = Vec::with_capacity(total);
    frame.push(FRAME_RECORD);
    frame.extend_from_slice(&record.checksum.to_le_bytes());
    frame.extend_from_slice(&(record.data.len() as u32).to_le_bytes());
    frame.extend_from_slice(&record.index.to_le_bytes());
    frame.extend_from_slice(&record.asqn.to_le_bytes());
    frame.extend_from_slice(&record.data);

    buf[pos..pos + total].copy_from_slice(&frame);
    Some(total)
}

/// Decode the frame at `pos` in `buf`.
///
/// If `expected_index` is supplied and the decoded index does not match,
/// returns `Corrupt(IndexMismatch)` rather than a record — used during
/// sequential recovery scans to detect a non-contiguous tail.
pub fn read_record(buf: &[u8], pos: usize, expected_index: Option<u64>) -> Decoded {
    if pos >= buf.len() || buf[pos] != FRAME_RECORD {
        return Decoded::EndOfSegment;
    }

    let header_end = pos + FRAME_HEADER_LEN;
    if header_end > buf.len() {
        return Decoded::EndOfSegment;
    }

    let checksum = u32::from_le_bytes(buf[pos + 1..pos + 5].try_into().unwrap());
    let payload_len = u32::from_le_bytes(buf[pos + 5..pos + 9].try_into().unwrap()) as usize;

    let body_start = header_end;
    let fixed_end = body_start + BODY_FIXED_LEN;
    let payload_end = match fixed_end.checked_add(payload_len) {
        Some(end) => end,
        None => return Decoded::Corrupt(CorruptReason::TruncatedFrame),
    };
    if payload_end > buf.len() {
        return Decoded::Corrupt(CorruptReason::TruncatedFrame);
    }

    let index = u64::from_le_bytes(buf[body_start..body_start + 8].try_into().unwrap());
    let asqn = i64::from_le_bytes(buf[body_start + 8..body_start + 16].try_into().unwrap());
    let payload = &buf[fixed_end..payload_end];

    if crc32c(payload) != checksum {
        return Decoded::Corrupt(CorruptReason::ChecksumMismatch);
    }

    if let Some(expected) = expected_index {
        if expected != index {
            return Decoded::Corrupt(CorruptReason::IndexMismatch { expected, actual: index });
        }
    }

    Decoded::Record {
        record: Record {
            index,
            asqn,
            checksum,
            data: payload.to_vec(),
        },
        frame_len: payload_end - pos,
    }
}

/// Overwrite the frame-type byte at `pos` with [`FRAME_INVALID`], so the
/// segment terminates there on the next scan. Used by truncate/reset.
pub fn mark_invalid(buf: &mut [u8], pos: usize) {
    if pos < buf.len() {
        buf[pos] = FRAME_INVALID;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip() {
        let mut buf = vec![0u8; 256];
        let n = write_record(&mut buf, 0, 1, 42, b"hello").unwrap();
        assert_eq!(n, encoded_len(5));

        match read_record(&buf, 0, Some(1)) {
            Decoded::Record { record, frame_len } => {
                assert_eq!(record.index, 1);
                assert_eq!(record.asqn, 42);
                assert_eq!(record.data, b"hello");
                assert_eq!(record.checksum, crc32c(b"hello"));
                assert_eq!(frame_len, n);
            }
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn segment_full() {
        let mut buf = vec![0u8; 10];
        assert!(write_record(&mut buf, 0, 1, 0, b"too long for this buffer").is_none());
    }

    #[test]
    fn end_of_segment_on_invalid_marker() {
        let buf = vec![0u8; 64];
        assert!(matches!(read_record(&buf, 0, None), Decoded::EndOfSegment));
    }

    #[test]
    fn checksum_mismatch_detected() {
        let mut buf = vec![0u8; 256];
        write_record(&mut buf, 0, 1, 0, b"hello").unwrap();
        // Flip a payload bit.
        buf[FRAME_HEADER_LEN + BODY_FIXED_LEN] ^= 0x01;
        assert!(matches!(
            read_record(&buf, 0, None),
            Decoded::Corrupt(CorruptReason::ChecksumMismatch)
        ));
    }

    #[test]
    fn index_mismatch_detected() {
        let mut buf = vec![0u8; 256];
        write_record(&mut buf, 0, 5, 0, b"hello").unwrap();
        assert!(matches!(
            read_record(&buf, 0, Some(6)),
            Decoded::Corrupt(CorruptReason::IndexMismatch {
                expected: 6,
                actual: 5
            })
        ));
    }

    #[test]
    fn mark_invalid_terminates_scan() {
        let mut buf = vec![0u8; 256];
        write_record(&mut buf, 0, 1, 0, b"hello").unwrap();
        mark_invalid(&mut buf, 0);
        assert!(matches!(read_record(&buf, 0, None), Decoded::EndOfSegment));
    }
}
