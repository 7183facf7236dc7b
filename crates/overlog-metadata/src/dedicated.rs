//! Dedicated container header
//!
//! A dedicated container holds exactly one stream. Its metadata file is a
//! one-block [`MetadataBlockStore`] whose section carries a small header
//! and the stream's metadata blob:
//!
//! ```text
//! +---------------------------+  offset 0
//! |  Section header           |  256 bytes (block store)
//! |  max_metadata_size  u32   |
//! |  sd_size            u32   |
//! |  actual_size        u32   |  u32::MAX until the first write
//! |  security descriptor      |  up to the end of the 4 KiB header region
//! +---------------------------+  offset 4096
//! |  metadata blob            |  actual_size bytes, at most max_metadata_size
//! +---------------------------+
//! ```

use crate::block_store::MetadataBlockStore;
use crate::file::FileSystem;
use crate::layout::SECTION_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes};
use overlog_common::{Error, Result, round_up_4k};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Bytes from the start of the section to the metadata blob
pub const DEDICATED_HEADER_SIZE: usize = 4096;

/// Actual size recorded before any metadata has been written
pub const UNWRITTEN_SENTINEL: u32 = u32::MAX;

const HEADER_FIELDS_SIZE: usize = 12;

/// Payload offset of the blob (the block store owns the first 256 bytes)
const BLOB_PAYLOAD_OFFSET: usize = DEDICATED_HEADER_SIZE - SECTION_HEADER_SIZE;

/// Largest security descriptor that fits the header region
pub const MAX_SECURITY_DESCRIPTOR_SIZE: usize = BLOB_PAYLOAD_OFFSET - HEADER_FIELDS_SIZE;

/// Decoded header of a dedicated container
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DedicatedHeader {
    pub max_metadata_size: u32,
    #[serde(skip)]
    pub security_descriptor: Bytes,
    /// `None` until metadata is first written
    pub actual_metadata_size: Option<u32>,
}

impl DedicatedHeader {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_FIELDS_SIZE + self.security_descriptor.len());
        buf.put_u32_le(self.max_metadata_size);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.security_descriptor.len() as u32);
        buf.put_u32_le(self.actual_metadata_size.unwrap_or(UNWRITTEN_SENTINEL));
        buf.put_slice(&self.security_descriptor);
        buf
    }

    fn decode(payload: &Bytes, expected_max: u32) -> Result<Self> {
        if payload.len() < HEADER_FIELDS_SIZE {
            return Err(Error::structure_fault(format!(
                "dedicated header payload of {} bytes is truncated",
                payload.len()
            )));
        }

        let mut buf = &payload[..HEADER_FIELDS_SIZE];
        let max_metadata_size = buf.get_u32_le();
        let sd_size = buf.get_u32_le() as usize;
        let actual = buf.get_u32_le();

        if max_metadata_size != expected_max {
            return Err(Error::structure_fault(format!(
                "dedicated header max metadata size {max_metadata_size}, expected {expected_max}"
            )));
        }
        if sd_size > MAX_SECURITY_DESCRIPTOR_SIZE || payload.len() < HEADER_FIELDS_SIZE + sd_size {
            return Err(Error::structure_fault(format!(
                "dedicated header security descriptor size {sd_size} is invalid"
            )));
        }

        let actual_metadata_size = if actual == UNWRITTEN_SENTINEL {
            None
        } else if actual > max_metadata_size
            || payload.len() < BLOB_PAYLOAD_OFFSET + actual as usize
        {
            return Err(Error::structure_fault(format!(
                "dedicated header actual size {actual} exceeds the stored metadata"
            )));
        } else {
            Some(actual)
        };

        Ok(Self {
            max_metadata_size,
            security_descriptor: payload.slice(HEADER_FIELDS_SIZE..HEADER_FIELDS_SIZE + sd_size),
            actual_metadata_size,
        })
    }
}

/// Single-block metadata record of a dedicated container
pub struct DedicatedContainerHeader {
    store: MetadataBlockStore,
    max_metadata_size: u32,
    header: Mutex<Option<DedicatedHeader>>,
}

impl DedicatedContainerHeader {
    /// Describe the header file at `path` for blobs of up to `max_metadata_size` bytes
    pub fn new(
        fs: Arc<dyn FileSystem>,
        path: impl Into<PathBuf>,
        max_metadata_size: u32,
    ) -> Result<Self> {
        let block_size = round_up_4k(DEDICATED_HEADER_SIZE as u64 + u64::from(max_metadata_size));
        let block_size = u32::try_from(block_size).map_err(|_| {
            Error::invalid_argument(format!(
                "max metadata size {max_metadata_size} is too large"
            ))
        })?;

        Ok(Self {
            store: MetadataBlockStore::new(fs, path, 1, block_size)?,
            max_metadata_size,
            header: Mutex::new(None),
        })
    }

    /// Create the header file with no metadata written
    pub async fn initialize(&self, security_descriptor: &[u8]) -> Result<()> {
        if security_descriptor.len() > MAX_SECURITY_DESCRIPTOR_SIZE {
            return Err(Error::invalid_argument(format!(
                "security descriptor of {} bytes exceeds {}",
                security_descriptor.len(),
                MAX_SECURITY_DESCRIPTOR_SIZE
            )));
        }

        let header = DedicatedHeader {
            max_metadata_size: self.max_metadata_size,
            security_descriptor: Bytes::copy_from_slice(security_descriptor),
            actual_metadata_size: None,
        };
        self.store.initialize(Some(&header.encode())).await?;
        *self.header.lock() = Some(header);

        info!(
            "Initialized dedicated header {:?} (max metadata {} bytes)",
            self.store.path(),
            self.max_metadata_size
        );
        Ok(())
    }

    /// Open an existing header file and cache its header
    pub async fn open(&self) -> Result<()> {
        self.store.open().await?;
        let payload = self.store.read_section(0).await?;
        let header = DedicatedHeader::decode(&payload, self.max_metadata_size)?;
        debug!(
            "Opened dedicated header {:?}: actual size {:?}",
            self.store.path(),
            header.actual_metadata_size
        );
        *self.header.lock() = Some(header);
        Ok(())
    }

    fn cached(&self) -> Result<DedicatedHeader> {
        self.header
            .lock()
            .clone()
            .ok_or_else(|| Error::invalid_argument("dedicated header is not open"))
    }

    /// Replace the stored metadata blob
    pub async fn write_metadata(&self, blob: &[u8]) -> Result<()> {
        if blob.len() > self.max_metadata_size as usize {
            return Err(Error::invalid_argument(format!(
                "metadata of {} bytes exceeds maximum {}",
                blob.len(),
                self.max_metadata_size
            )));
        }

        let _guard = self.store.lock().await;
        let mut header = self.cached()?;
        #[allow(clippy::cast_possible_truncation)]
        let actual = blob.len() as u32;
        header.actual_metadata_size = Some(actual);

        let mut payload = header.encode();
        payload.resize(BLOB_PAYLOAD_OFFSET, 0);
        payload.extend_from_slice(blob);

        let generation = self.store.write_section(0, &payload).await?;
        *self.header.lock() = Some(header);
        debug!(
            "Wrote {} bytes of metadata to {:?} (generation {})",
            actual,
            self.store.path(),
            generation
        );
        Ok(())
    }

    /// The stored metadata blob; `NotFound` if none was ever written
    pub async fn read_metadata(&self) -> Result<Bytes> {
        let header = self.cached()?;
        if header.actual_metadata_size.is_none() {
            return Err(Error::not_found(format!(
                "no metadata written to {}",
                self.store.path().display()
            )));
        }

        let payload = self.store.read_section(0).await?;
        let stored = DedicatedHeader::decode(&payload, self.max_metadata_size)?;
        let actual = stored.actual_metadata_size.ok_or_else(|| {
            Error::structure_fault("dedicated header lost its written metadata size")
        })? as usize;
        Ok(payload.slice(BLOB_PAYLOAD_OFFSET..BLOB_PAYLOAD_OFFSET + actual))
    }

    pub fn security_descriptor(&self) -> Result<Bytes> {
        Ok(self.cached()?.security_descriptor)
    }

    /// Size of the stored blob; `None` if none was ever written
    pub fn actual_metadata_size(&self) -> Result<Option<u32>> {
        Ok(self.cached()?.actual_metadata_size)
    }

    /// Cached header, if open
    #[must_use]
    pub fn header(&self) -> Option<DedicatedHeader> {
        self.header.lock().clone()
    }

    #[must_use]
    pub const fn max_metadata_size(&self) -> u32 {
        self.max_metadata_size
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Underlying block store
    #[must_use]
    pub const fn store(&self) -> &MetadataBlockStore {
        &self.store
    }

    pub fn close(&self) {
        *self.header.lock() = None;
        self.store.close();
    }

    /// Close the header and delete its file
    pub async fn cleanup(&self) -> Result<()> {
        *self.header.lock() = None;
        self.store.cleanup().await
    }
}
