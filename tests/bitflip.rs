//! Bit-flip corruption detection, in the teacher's proptest style
//! (`src_teacher_ref/tests/bitflip.rs`): flip a random byte somewhere past
//! the descriptor and first record header of a closed journal's only
//! segment, then reopen and confirm recovery either discards the damaged
//! tail (torn-tail tolerance) or refuses to open (fatal corruption at or
//! below `last_written_index`), but never silently returns wrong data.

use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroU64;

use proptest::prelude::*;
use raft_journal::test_support::enable_logging;
use raft_journal::{Journal, JournalError, JournalOptions};

const NUM_RECORDS: usize = 20;
const PAYLOAD_LEN: usize = 16;

fn mk_journal(dir: &std::path::Path) -> u64 {
    let options = JournalOptions {
        journal_index_density: NonZeroU64::new(1).unwrap(),
        ..JournalOptions::default()
    };
    let mut journal = Journal::open(dir, options).unwrap();
    let payload = vec![0xABu8; PAYLOAD_LEN];
    for i in 0..NUM_RECORDS {
        journal.append(i as i64, &payload).unwrap();
    }
    let last = journal.last_index();
    journal.close().unwrap();
    last
}

fn segment_file(dir: &std::path::Path) -> std::path::PathBuf {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .find(|e| e.file_name().to_string_lossy().ends_with(".log"))
        .unwrap()
        .path()
}

/// Copy every regular file from `src` into `dst`, so the lenient and strict
/// reopen checks below each see an untouched copy of the corrupted
/// directory — recovery can itself rewrite bytes in place (truncating a
/// torn tail), so reusing one directory across both checks would let the
/// first reopen erase the evidence the second one needs to see.
fn copy_dir(src: &std::path::Path, dst: &std::path::Path) {
    for entry in std::fs::read_dir(src).unwrap().filter_map(|e| e.ok()) {
        std::fs::copy(entry.path(), dst.join(entry.file_name())).unwrap();
    }
}

proptest! {
    #[test]
    fn flipped_byte_in_a_record_body_is_detected_not_silently_accepted(
        byte_offset in 0usize..(raft_journal::descriptor_len() + NUM_RECORDS * raft_journal::encoded_record_len(PAYLOAD_LEN)),
        bit_mask in any::<u8>(),
    ) {
        enable_logging();
        prop_assume!(bit_mask != 0);

        let dir = tempfile::tempdir().unwrap();
        let last_index = mk_journal(dir.path());

        // Skip the descriptor itself: a flipped descriptor byte is covered
        // by descriptor.rs's own unit tests, and this test is about record
        // framing.
        prop_assume!(byte_offset >= raft_journal::descriptor_len());

        let path = segment_file(dir.path());
        let range_len = raft_journal::descriptor_len() + NUM_RECORDS * raft_journal::encoded_record_len(PAYLOAD_LEN);
        let original = {
            let mut f = std::fs::File::open(&path).unwrap();
            let mut buf = vec![0u8; range_len];
            f.read_exact(&mut buf).unwrap();
            buf
        };

        {
            let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(byte_offset as u64)).unwrap();
            f.write_all(&[original[byte_offset] ^ bit_mask]).unwrap();
        }

        // Reopening with every record already acknowledged must treat any
        // detected corruption as fatal rather than quietly truncating
        // committed data. Checked against its own untouched copy of the
        // corrupted directory, first.
        let strict_dir = tempfile::tempdir().unwrap();
        copy_dir(dir.path(), strict_dir.path());
        let strict = JournalOptions {
            journal_index_density: NonZeroU64::new(1).unwrap(),
            last_written_index: last_index,
            ..JournalOptions::default()
        };
        match Journal::open(strict_dir.path(), strict) {
            Ok(journal) => prop_assert_eq!(journal.last_index(), last_index),
            Err(JournalError::CorruptedLog { .. }) => {}
            Err(other) => prop_assert!(false, "unexpected error: {other:?}"),
        }

        // Reopening with a lenient bound (nothing acknowledged) must never
        // surface data past the corruption, and must never fail outright:
        // this is the torn-tail-tolerant path.
        let lenient_dir = tempfile::tempdir().unwrap();
        copy_dir(dir.path(), lenient_dir.path());
        let lenient = JournalOptions {
            journal_index_density: NonZeroU64::new(1).unwrap(),
            last_written_index: 0,
            ..JournalOptions::default()
        };
        if let Ok(journal) = Journal::open(lenient_dir.path(), lenient) {
            prop_assert!(journal.last_index() <= last_index);
        }
    }
}
