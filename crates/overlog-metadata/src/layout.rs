//! Metadata section layout
//!
//! Every metadata block is stored twice in its backing file. Each copy is
//! a self-describing section:
//!
//! ```text
//! +----------------------+  offset 0 of the section
//! |   Section header     |  256 bytes - signature, file offset, generation,
//! |                      |  checksum, sizes, version, timestamp
//! +----------------------+  offset 256
//! |   Payload            |  data_size bytes written by the owner
//! +----------------------+
//! |   Zero padding       |  up to section_size
//! +----------------------+
//! ```
//!
//! The checksum covers the whole section with the checksum field read as
//! zero. A section is accepted only if the signature, file offset, version
//! and declared size match what the reader expects and the checksum
//! recomputes.

use bytes::{Buf, BufMut};
use overlog_common::{Error, Result, section_checksum};

/// Signature of a metadata section
pub const SECTION_SIGNATURE: u64 = 0xabac_adae_eada_caba;

/// Current section format version
pub const SECTION_VERSION: u32 = 1;

/// Section header size (256 bytes)
pub const SECTION_HEADER_SIZE: usize = 256;

/// Header bytes that carry fields; the rest of the header is reserved
const SECTION_FIELDS_SIZE: usize = 56;

/// Offset of the checksum field within the section:
/// signature(8) + file_offset(8) + generation(8) = 24
pub const CHECKSUM_OFFSET: usize = 24;

/// Header stored at the start of every metadata section
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionHeader {
    /// Signature for format identification
    pub signature: u64,
    /// File offset this copy occupies
    pub file_offset: u64,
    /// Generation number of the content
    pub generation: u64,
    /// Checksum of the section (this field read as zero)
    pub checksum: u64,
    /// Declared section size
    pub section_size: u32,
    /// Format version
    pub version: u32,
    /// Payload bytes following the header
    pub data_size: u32,
    /// Write timestamp (Unix epoch milliseconds)
    pub timestamp: i64,
}

impl SectionHeader {
    /// Create a header for a section about to be written
    #[must_use]
    pub fn new(file_offset: u64, generation: u64, section_size: u32, data_size: u32) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or_default();

        Self {
            signature: SECTION_SIGNATURE,
            file_offset,
            generation,
            checksum: 0,
            section_size,
            version: SECTION_VERSION,
            data_size,
            timestamp,
        }
    }

    /// Usable payload bytes in a section of `section_size`
    #[must_use]
    pub const fn payload_capacity(section_size: u32) -> usize {
        (section_size as usize).saturating_sub(SECTION_HEADER_SIZE)
    }

    /// Serialize the header fields into the first bytes of `section`
    fn write_to(&self, section: &mut [u8]) {
        let mut cursor = &mut section[..SECTION_FIELDS_SIZE];
        cursor.put_u64_le(self.signature);
        cursor.put_u64_le(self.file_offset);
        cursor.put_u64_le(self.generation);
        cursor.put_u64_le(self.checksum);
        cursor.put_u32_le(self.section_size);
        cursor.put_u32_le(self.version);
        cursor.put_u32_le(self.data_size);
        cursor.put_u32_le(0); // reserved
        cursor.put_i64_le(self.timestamp);
    }

    /// Parse the header fields without validating them
    pub fn read_from(section: &[u8]) -> Result<Self> {
        if section.len() < SECTION_HEADER_SIZE {
            return Err(Error::structure_fault(format!(
                "section of {} bytes is smaller than its header",
                section.len()
            )));
        }

        let mut buf = &section[..SECTION_FIELDS_SIZE];
        let signature = buf.get_u64_le();
        let file_offset = buf.get_u64_le();
        let generation = buf.get_u64_le();
        let checksum = buf.get_u64_le();
        let section_size = buf.get_u32_le();
        let version = buf.get_u32_le();
        let data_size = buf.get_u32_le();
        let _reserved = buf.get_u32_le();
        let timestamp = buf.get_i64_le();

        Ok(Self {
            signature,
            file_offset,
            generation,
            checksum,
            section_size,
            version,
            data_size,
            timestamp,
        })
    }

    /// Build a complete section: header, payload and zero padding, with
    /// the checksum filled in.
    pub fn seal(
        file_offset: u64,
        generation: u64,
        section_size: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let capacity = Self::payload_capacity(section_size);
        if payload.len() > capacity {
            return Err(Error::invalid_argument(format!(
                "payload of {} bytes exceeds section capacity {}",
                payload.len(),
                capacity
            )));
        }

        let mut section = vec![0u8; section_size as usize];
        section[SECTION_HEADER_SIZE..SECTION_HEADER_SIZE + payload.len()].copy_from_slice(payload);

        #[allow(clippy::cast_possible_truncation)]
        let mut header = Self::new(file_offset, generation, section_size, payload.len() as u32);
        header.write_to(&mut section);
        header.checksum = section_checksum(&section, CHECKSUM_OFFSET);
        header.write_to(&mut section);

        Ok(section)
    }

    /// Validate a section read from `expected_offset`
    pub fn validate(section: &[u8], expected_offset: u64, expected_size: u32) -> Result<Self> {
        let header = Self::read_from(section)?;

        if header.signature != SECTION_SIGNATURE {
            return Err(Error::structure_fault(format!(
                "invalid section signature {:#018x} at offset {}",
                header.signature, expected_offset
            )));
        }
        if header.file_offset != expected_offset {
            return Err(Error::structure_fault(format!(
                "section claims offset {} but was read from {}",
                header.file_offset, expected_offset
            )));
        }
        if header.version != SECTION_VERSION {
            return Err(Error::structure_fault(format!(
                "unsupported section version {} at offset {}",
                header.version, expected_offset
            )));
        }
        if header.section_size != expected_size || section.len() != expected_size as usize {
            return Err(Error::structure_fault(format!(
                "section size {} at offset {} does not match expected {}",
                header.section_size, expected_offset, expected_size
            )));
        }
        if header.data_size as usize > Self::payload_capacity(expected_size) {
            return Err(Error::structure_fault(format!(
                "section data size {} at offset {} exceeds capacity",
                header.data_size, expected_offset
            )));
        }

        let actual = section_checksum(section, CHECKSUM_OFFSET);
        if actual != header.checksum {
            return Err(Error::ChecksumMismatch {
                offset: expected_offset,
                expected: header.checksum,
                actual,
            });
        }

        Ok(header)
    }
}
