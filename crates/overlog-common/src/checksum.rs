//! Checksum utilities for persisted sections
//!
//! Sections carry an xxh64 digest computed over the whole section with
//! the checksum field itself treated as zero, so the digest can be
//! recomputed in place without copying the buffer.

use xxhash_rust::xxh64::Xxh64;

/// Size of the allocation extent used for record buffers and reservations
pub const EXTENT_SIZE: u64 = 4096;

/// Compute the checksum of `section`, skipping the 8-byte checksum field
/// located at `checksum_offset`.
#[must_use]
pub fn section_checksum(section: &[u8], checksum_offset: usize) -> u64 {
    let end = (checksum_offset + 8).min(section.len());
    let mut hasher = Xxh64::new(0);
    hasher.update(&section[..checksum_offset.min(section.len())]);
    hasher.update(&[0u8; 8][..end.saturating_sub(checksum_offset)]);
    hasher.update(&section[end..]);
    hasher.digest()
}

/// Verify a section against an expected checksum
#[inline]
#[must_use]
pub fn verify_section_checksum(section: &[u8], checksum_offset: usize, expected: u64) -> bool {
    section_checksum(section, checksum_offset) == expected
}

/// Checksum of a plain data buffer
#[inline]
#[must_use]
pub fn data_checksum(data: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(data, 0)
}

/// Round a byte count up to the next 4 KiB extent
#[inline]
#[must_use]
pub const fn round_up_4k(value: u64) -> u64 {
    value.div_ceil(EXTENT_SIZE) * EXTENT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_ignores_own_field() {
        let mut section = vec![7u8; 256];
        let before = section_checksum(&section, 24);
        section[24..32].copy_from_slice(&before.to_le_bytes());
        assert_eq!(section_checksum(&section, 24), before);
        assert!(verify_section_checksum(&section, 24, before));
    }

    #[test]
    fn test_checksum_matches_zeroed_field() {
        let mut section = vec![3u8; 128];
        let stored = section_checksum(&section, 8);
        section[8..16].fill(0);
        assert_eq!(data_checksum(&section), stored);
    }

    #[test]
    fn test_checksum_detects_flip() {
        let mut section: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let sum = section_checksum(&section, 24);
        let idx = rand::random::<usize>() % section.len();
        if (24..32).contains(&idx) {
            section[0] ^= 0x01;
        } else {
            section[idx] ^= 0x01;
        }
        assert!(!verify_section_checksum(&section, 24, sum));
    }

    #[test]
    fn test_round_up_4k() {
        assert_eq!(round_up_4k(0), 0);
        assert_eq!(round_up_4k(1), 4096);
        assert_eq!(round_up_4k(4096), 4096);
        assert_eq!(round_up_4k(8193), 12288);
    }
}
