//! Segment descriptor: the fixed 32-byte header at offset 0 of every segment
//! file.
//!
//! Layout (little-endian):
//!
//! ```text
//! [checksum:4][magic:4][id:8][index:8][max_segment_size:4][reserved:4]
//! ```
//!
//! The checksum covers every byte after itself.

use crc32c::crc32c;

pub const MAGIC: [u8; 4] = *b"RJN1";
pub const DESCRIPTOR_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Descriptor {
    /// Monotone across segments of one journal.
    pub id: u64,
    /// First record index this segment may hold (or the next index to be
    /// written, if the segment is empty).
    pub index: u64,
    pub max_segment_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorError {
    TooShort,
    /// All-zero region: the file was created but the descriptor was never
    /// written.
    PartiallyWritten,
    BadMagic,
    ChecksumMismatch,
}

impl Descriptor {
    pub fn new(id: u64, index: u64, max_segment_size: u32) -> Self {
        Self {
            id,
            index,
            max_segment_size,
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        assert!(buf.len() >= DESCRIPTOR_LEN);

        let mut rest = [0u8; DESCRIPTOR_LEN - 4];
        rest[0..4].copy_from_slice(&MAGIC);
        rest[4..12].copy_from_slice(&self.id.to_le_bytes());
        rest[12..20].copy_from_slice(&self.index.to_le_bytes());
        rest[20..24].copy_from_slice(&self.max_segment_size.to_le_bytes());
        // rest[24..28] reserved, left zeroed.

        let checksum = crc32c(&rest);
        buf[0..4].copy_from_slice(&checksum.to_le_bytes());
        buf[4..DESCRIPTOR_LEN].copy_from_slice(&rest);
    }

    pub fn read(buf: &[u8]) -> Result<Self, DescriptorError> {
        if buf.len() < DESCRIPTOR_LEN {
            return Err(DescriptorError::TooShort);
        }
        let region = &buf[..DESCRIPTOR_LEN];
        if region.iter().all(|b| *b == 0) {
            return Err(DescriptorError::PartiallyWritten);
        }

        let checksum = u32::from_le_bytes(region[0..4].try_into().unwrap());
        let rest = &region[4..DESCRIPTOR_LEN];
        if crc32c(rest) != checksum {
            return Err(DescriptorError::ChecksumMismatch);
        }
        if rest[0..4] != MAGIC {
            return Err(DescriptorError::BadMagic);
        }

        let id = u64::from_le_bytes(rest[4..12].try_into().unwrap());
        let index = u64::from_le_bytes(rest[12..20].try_into().unwrap());
        let max_segment_size = u32::from_le_bytes(rest[20..24].try_into().unwrap());

        Ok(Self {
            id,
            index,
            max_segment_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let d = Descriptor::new(3, 100, 4096);
        let mut buf = [0u8; DESCRIPTOR_LEN];
        d.write(&mut buf);
        assert_eq!(Descriptor::read(&buf).unwrap(), d);
    }

    #[test]
    fn all_zero_is_partially_written() {
        let buf = [0u8; DESCRIPTOR_LEN];
        assert_eq!(Descriptor::read(&buf), Err(DescriptorError::PartiallyWritten));
    }

    #[test]
    fn bitflip_detected() {
        let d = Descriptor::new(1, 1, 1024);
        let mut buf = [0u8; DESCRIPTOR_LEN];
        d.write(&mut buf);
        buf[10] ^= 0xff;
        assert_eq!(Descriptor::read(&buf), Err(DescriptorError::ChecksumMismatch));
    }

    #[test]
    fn too_short() {
        let buf = [0u8; 10];
        assert_eq!(Descriptor::read(&buf), Err(DescriptorError::TooShort));
    }
}
