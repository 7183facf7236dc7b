//! Records and the stream block header
//!
//! Every coalesced record is written with a 48-byte stream block header as
//! its metadata:
//!
//! ```text
//! signature u64 | stream_offset u64 | highest_operation_id u64
//! head_truncation_point u64 | data_size u32 | record_marker u32
//! data_checksum u64
//! ```
//!
//! `record_marker` is the data offset at which the last complete logical
//! record ends, or `u32::MAX` if no logical record ends in this block.

use bytes::{Buf, BufMut, Bytes};
use overlog_common::{Error, Result, data_checksum};
use serde::Serialize;

/// Signature of a stream block header ("OVLGSBLK")
pub const STREAM_BLOCK_SIGNATURE: u64 = 0x4b4c_4253_474c_564f;

/// Encoded size of a stream block header
pub const STREAM_BLOCK_HEADER_SIZE: usize = 48;

const NO_RECORD_MARKER: u32 = u32::MAX;

/// A write submitted by the stream's owner
#[derive(Clone, Debug)]
pub struct Record {
    /// Stream offset (ASN) of the first data byte
    pub stream_offset: u64,
    /// Operation id; consecutive records carry consecutive versions
    pub version: u64,
    pub head_truncation_point: u64,
    pub data: Bytes,
    /// A logical record ends with this payload
    pub is_record_end: bool,
}

impl Record {
    #[must_use]
    pub const fn new(stream_offset: u64, version: u64, data: Bytes) -> Self {
        Self {
            stream_offset,
            version,
            head_truncation_point: 0,
            data,
            is_record_end: true,
        }
    }

    #[must_use]
    pub const fn with_head_truncation_point(mut self, point: u64) -> Self {
        self.head_truncation_point = point;
        self
    }

    /// Mark the payload as the middle of a logical record
    #[must_use]
    pub const fn continued(mut self) -> Self {
        self.is_record_end = false;
        self
    }

    /// Stream offset just past the last data byte
    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.stream_offset + self.data.len() as u64
    }
}

/// One durable write issued to the dedicated stream
#[derive(Clone, Debug)]
pub struct RecordWrite {
    /// Reservation this write consumes
    pub reserve: u64,
    pub stream_offset: u64,
    /// Highest operation id contained
    pub version: u64,
    /// Encoded [`StreamBlockHeader`]
    pub metadata: Bytes,
    pub data: Bytes,
}

/// A record served from memory before it is durable
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoundRecord {
    pub stream_offset: u64,
    pub version: u64,
    pub metadata: Bytes,
    pub data: Bytes,
}

impl FoundRecord {
    /// Build the header for `data` and wrap both
    pub(crate) fn build(
        stream_offset: u64,
        version: u64,
        head_truncation_point: u64,
        record_marker: Option<u32>,
        data: Bytes,
    ) -> Self {
        let header = StreamBlockHeader::describe(
            stream_offset,
            version,
            head_truncation_point,
            record_marker,
            &data,
        );
        Self {
            stream_offset,
            version,
            metadata: header.encode(),
            data,
        }
    }

    /// An uncoalesced record with a header of its own
    pub(crate) fn from_record(record: &Record) -> Self {
        let marker = record
            .is_record_end
            .then(|| u32::try_from(record.data.len()).unwrap_or(u32::MAX));
        Self::build(
            record.stream_offset,
            record.version,
            record.head_truncation_point,
            marker,
            record.data.clone(),
        )
    }

    pub(crate) fn to_write(&self, reserve: u64) -> RecordWrite {
        RecordWrite {
            reserve,
            stream_offset: self.stream_offset,
            version: self.version,
            metadata: self.metadata.clone(),
            data: self.data.clone(),
        }
    }
}

/// How a read-back offset is matched against in-flight records
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadType {
    /// The record starts at the offset
    Exact,
    /// The offset falls inside the record's data
    Containing,
}

impl ReadType {
    #[must_use]
    pub const fn matches(self, start: u64, len: u64, offset: u64) -> bool {
        match self {
            Self::Exact => start == offset,
            Self::Containing => offset == start || (offset > start && offset - start < len),
        }
    }
}

/// Metadata written in front of every coalesced record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StreamBlockHeader {
    pub stream_offset: u64,
    pub highest_operation_id: u64,
    pub head_truncation_point: u64,
    pub data_size: u32,
    pub record_marker: Option<u32>,
    pub data_checksum: u64,
}

impl StreamBlockHeader {
    pub fn new(
        stream_offset: u64,
        highest_operation_id: u64,
        head_truncation_point: u64,
        record_marker: Option<u32>,
        data: &[u8],
    ) -> Result<Self> {
        if u32::try_from(data.len()).is_err() {
            return Err(Error::invalid_argument("record data exceeds 4 GiB"));
        }
        Ok(Self::describe(
            stream_offset,
            highest_operation_id,
            head_truncation_point,
            record_marker,
            data,
        ))
    }

    /// Header for data already bounded by the maximum record size
    pub(crate) fn describe(
        stream_offset: u64,
        highest_operation_id: u64,
        head_truncation_point: u64,
        record_marker: Option<u32>,
        data: &[u8],
    ) -> Self {
        Self {
            stream_offset,
            highest_operation_id,
            head_truncation_point,
            data_size: u32::try_from(data.len()).unwrap_or(u32::MAX),
            record_marker,
            data_checksum: data_checksum(data),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(STREAM_BLOCK_HEADER_SIZE);
        buf.put_u64_le(STREAM_BLOCK_SIGNATURE);
        buf.put_u64_le(self.stream_offset);
        buf.put_u64_le(self.highest_operation_id);
        buf.put_u64_le(self.head_truncation_point);
        buf.put_u32_le(self.data_size);
        buf.put_u32_le(self.record_marker.unwrap_or(NO_RECORD_MARKER));
        buf.put_u64_le(self.data_checksum);
        Bytes::from(buf)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < STREAM_BLOCK_HEADER_SIZE {
            return Err(Error::structure_fault(format!(
                "stream block header of {} bytes is truncated",
                buf.len()
            )));
        }
        let signature = buf.get_u64_le();
        if signature != STREAM_BLOCK_SIGNATURE {
            return Err(Error::structure_fault(format!(
                "invalid stream block signature {signature:#018x}"
            )));
        }

        let stream_offset = buf.get_u64_le();
        let highest_operation_id = buf.get_u64_le();
        let head_truncation_point = buf.get_u64_le();
        let data_size = buf.get_u32_le();
        let record_marker = match buf.get_u32_le() {
            NO_RECORD_MARKER => None,
            marker if marker > data_size => {
                return Err(Error::structure_fault(format!(
                    "record marker {marker} beyond data size {data_size}"
                )));
            }
            marker => Some(marker),
        };
        let data_checksum = buf.get_u64_le();

        Ok(Self {
            stream_offset,
            highest_operation_id,
            head_truncation_point,
            data_size,
            record_marker,
            data_checksum,
        })
    }

    /// Check that `data` is what this header describes
    pub fn verify_data(&self, data: &[u8]) -> Result<()> {
        if data.len() != self.data_size as usize {
            return Err(Error::structure_fault(format!(
                "stream block at {} holds {} bytes, header says {}",
                self.stream_offset,
                data.len(),
                self.data_size
            )));
        }
        let actual = data_checksum(data);
        if actual != self.data_checksum {
            return Err(Error::ChecksumMismatch {
                offset: self.stream_offset,
                expected: self.data_checksum,
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let data = b"coalesced payload";
        let header = StreamBlockHeader::new(4096, 17, 1024, Some(9), data).unwrap();
        let encoded = header.encode();
        assert_eq!(encoded.len(), STREAM_BLOCK_HEADER_SIZE);

        let decoded = StreamBlockHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        decoded.verify_data(data).unwrap();
    }

    #[test]
    fn test_header_without_marker() {
        let header = StreamBlockHeader::new(0, 1, 0, None, b"").unwrap();
        let decoded = StreamBlockHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.record_marker, None);
    }

    #[test]
    fn test_header_detects_corrupt_data() {
        let header = StreamBlockHeader::new(8192, 3, 0, Some(4), b"abcd").unwrap();
        assert!(matches!(
            header.verify_data(b"abce"),
            Err(Error::ChecksumMismatch { offset: 8192, .. })
        ));
        assert!(header.verify_data(b"abc").unwrap_err().is_structure_fault());
    }

    #[test]
    fn test_header_rejects_bad_signature() {
        let mut encoded = StreamBlockHeader::new(0, 1, 0, None, b"x")
            .unwrap()
            .encode()
            .to_vec();
        encoded[0] ^= 1;
        assert!(StreamBlockHeader::decode(&encoded).unwrap_err().is_structure_fault());
        assert!(StreamBlockHeader::decode(&encoded[..20]).is_err());
    }

    #[test]
    fn test_read_type_matching() {
        assert!(ReadType::Exact.matches(100, 50, 100));
        assert!(!ReadType::Exact.matches(100, 50, 120));
        assert!(ReadType::Containing.matches(100, 50, 120));
        assert!(ReadType::Containing.matches(100, 50, 149));
        assert!(!ReadType::Containing.matches(100, 50, 150));
        assert!(!ReadType::Containing.matches(100, 50, 99));
        // Empty records are still found at their offset
        assert!(ReadType::Containing.matches(100, 0, 100));
    }

    #[test]
    fn test_record_from_payload() {
        let record = Record::new(10, 2, Bytes::from_static(b"hello")).continued();
        assert_eq!(record.end_offset(), 15);
        let found = FoundRecord::from_record(&record);
        let header = StreamBlockHeader::decode(&found.metadata).unwrap();
        assert_eq!(header.record_marker, None);
        assert_eq!(header.highest_operation_id, 2);
    }
}
