//! Dual-copy metadata block store
//!
//! File layout for a store of N blocks of `block_size` bytes:
//!
//! ```text
//! +-----------+-----------+-----+-------------+-----------+-----+-------------+
//! | block 0 A | block 1 A | ... | block N-1 A | block 0 B | ... | block N-1 B |
//! +-----------+-----------+-----+-------------+-----------+-----+-------------+
//! ```
//!
//! Each block has two on-disk copies. The copy holding the highest valid
//! generation is authoritative. A write always lands on the other copy
//! with the next generation, and the authoritative copy only switches
//! after that write is durable and re-validated, so a torn write leaves
//! the previous content intact.
//!
//! If both copies of any block fail validation during open, or the
//! authoritative copy fails validation on a later read, the whole store
//! enters a terminal fault state and every subsequent call returns the
//! same error.

use crate::file::{BlockFile, FileSystem};
use crate::layout::{SECTION_HEADER_SIZE, SectionHeader};
use bytes::Bytes;
use futures::future::try_join_all;
use futures::stream::{self, StreamExt};
use overlog_common::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

/// Which of the two on-disk copies of a block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BlockCopy {
    A,
    B,
}

impl BlockCopy {
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// In-memory state of one logical block
#[derive(Clone, Debug)]
struct BlockSlot {
    latest: BlockCopy,
    generation: u64,
    cached: Option<Bytes>,
}

/// Validation outcome of one on-disk copy, as reported by [`MetadataBlockStore::inspect`]
#[derive(Clone, Debug, Serialize)]
pub struct CopyReport {
    pub copy: BlockCopy,
    pub file_offset: u64,
    pub valid: bool,
    pub generation: Option<u64>,
    pub data_size: Option<u32>,
    pub timestamp: Option<i64>,
    pub error: Option<String>,
}

/// Both copies of one block, as reported by [`MetadataBlockStore::inspect`]
#[derive(Clone, Debug, Serialize)]
pub struct BlockReport {
    pub index: u32,
    pub copies: [CopyReport; 2],
    /// Copy that open would select, if any
    pub authoritative: Option<BlockCopy>,
}

/// Exclusive-access guard returned by [`MetadataBlockStore::lock`]
pub type MetadataGuard = OwnedMutexGuard<()>;

/// Durable, checksummed, dual-copy store of fixed-size blocks
pub struct MetadataBlockStore {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    block_count: u32,
    block_size: u32,
    cache_sections: bool,
    /// Blocks read concurrently during open
    read_window: usize,
    file: RwLock<Option<Arc<dyn BlockFile>>>,
    slots: Mutex<Vec<BlockSlot>>,
    /// Sticky fault; once set the store is unusable
    fault: Mutex<Option<Error>>,
    /// Serializes read-modify-write sequences of callers
    exclusive: Arc<tokio::sync::Mutex<()>>,
    /// One lock per block; writes to the same block are serialized so
    /// generations never repeat
    write_locks: Vec<tokio::sync::Mutex<()>>,
}

const DEFAULT_READ_WINDOW: usize = 16;

impl MetadataBlockStore {
    /// Describe a store of `block_count` blocks of `block_size` bytes at `path`
    pub fn new(
        fs: Arc<dyn FileSystem>,
        path: impl Into<PathBuf>,
        block_count: u32,
        block_size: u32,
    ) -> Result<Self> {
        if block_count == 0 {
            return Err(Error::invalid_argument("block count must be positive"));
        }
        if (block_size as usize) <= SECTION_HEADER_SIZE {
            return Err(Error::invalid_argument(format!(
                "block size {block_size} does not leave room for the section header"
            )));
        }

        Ok(Self {
            fs,
            path: path.into(),
            block_count,
            block_size,
            cache_sections: true,
            read_window: DEFAULT_READ_WINDOW,
            file: RwLock::new(None),
            slots: Mutex::new(Vec::new()),
            fault: Mutex::new(None),
            exclusive: Arc::new(tokio::sync::Mutex::new(())),
            write_locks: (0..block_count)
                .map(|_| tokio::sync::Mutex::new(()))
                .collect(),
        })
    }

    /// Keep validated sections in memory (default: on)
    #[must_use]
    pub const fn with_cache(mut self, cache_sections: bool) -> Self {
        self.cache_sections = cache_sections;
        self
    }

    /// Number of blocks read concurrently by [`open`](Self::open)
    #[must_use]
    pub fn with_read_window(mut self, read_window: usize) -> Self {
        self.read_window = read_window.max(1);
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn block_count(&self) -> u32 {
        self.block_count
    }

    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Largest payload a single block accepts
    #[must_use]
    pub const fn payload_capacity(&self) -> usize {
        SectionHeader::payload_capacity(self.block_size)
    }

    /// Total size of the backing file
    #[must_use]
    pub fn file_size(&self) -> u64 {
        2 * u64::from(self.block_count) * u64::from(self.block_size)
    }

    /// File offset of one copy of a block
    #[must_use]
    pub fn copy_offset(&self, index: u32, copy: BlockCopy) -> u64 {
        let slot = match copy {
            BlockCopy::A => u64::from(index),
            BlockCopy::B => u64::from(self.block_count) + u64::from(index),
        };
        slot * u64::from(self.block_size)
    }

    /// Current fault, if the store has been tainted
    #[must_use]
    pub fn fault(&self) -> Option<Error> {
        self.fault.lock().clone()
    }

    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.fault.lock().is_some()
    }

    fn check_fault(&self) -> Result<()> {
        match self.fault.lock().as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Record `err` as the store's terminal fault and return it
    fn taint(&self, err: Error) -> Error {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            error!("Metadata store {:?} is now in error: {}", self.path, err);
            *fault = Some(err.clone());
        }
        err
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.block_count {
            return Err(Error::invalid_argument(format!(
                "block index {} out of range (store has {} blocks)",
                index, self.block_count
            )));
        }
        Ok(())
    }

    fn current_file(&self) -> Result<Arc<dyn BlockFile>> {
        self.file
            .read()
            .clone()
            .ok_or_else(|| Error::invalid_argument(format!("metadata store {:?} is not open", self.path)))
    }

    /// Convert a block-aligned file offset into a block index
    pub fn index_for_offset(&self, offset: u64) -> Result<u32> {
        let block_size = u64::from(self.block_size);
        if offset % block_size != 0 {
            return Err(Error::invalid_argument(format!(
                "offset {offset} is not aligned to block size {block_size}"
            )));
        }
        let index = offset / block_size;
        if index >= u64::from(self.block_count) {
            return Err(Error::invalid_argument(format!(
                "offset {offset} is beyond the last block"
            )));
        }
        u32::try_from(index).map_err(|_| Error::invalid_argument("offset out of range"))
    }

    /// Create a new backing file and write every block to both copies
    /// with generation 1.
    ///
    /// `seed` is stored as the payload of every block; `None` leaves the
    /// payload empty. Fails if the file already exists.
    pub async fn initialize(&self, seed: Option<&[u8]>) -> Result<()> {
        let seed = seed.unwrap_or_default();
        if seed.len() > self.payload_capacity() {
            return Err(Error::invalid_argument(format!(
                "seed of {} bytes exceeds block payload capacity {}",
                seed.len(),
                self.payload_capacity()
            )));
        }

        let file = self.fs.create_new(&self.path).await?;
        file.set_size(self.file_size()).await?;

        let mut writes = Vec::with_capacity(2 * self.block_count as usize);
        for index in 0..self.block_count {
            for copy in [BlockCopy::A, BlockCopy::B] {
                let offset = self.copy_offset(index, copy);
                let section = SectionHeader::seal(offset, 1, self.block_size, seed)?;
                writes.push(file.write_at(offset, Bytes::from(section)));
            }
        }
        try_join_all(writes).await?;
        file.sync().await?;

        let cached = self.cache_sections.then(|| Bytes::copy_from_slice(seed));
        *self.slots.lock() = (0..self.block_count)
            .map(|_| BlockSlot {
                latest: BlockCopy::A,
                generation: 1,
                cached: cached.clone(),
            })
            .collect();
        *self.file.write() = Some(file);
        *self.fault.lock() = None;

        info!(
            "Initialized metadata store {:?}: {} blocks of {} bytes",
            self.path, self.block_count, self.block_size
        );
        Ok(())
    }

    /// Read and validate one copy; returns the header and the whole section
    async fn read_copy(
        &self,
        file: &Arc<dyn BlockFile>,
        index: u32,
        copy: BlockCopy,
    ) -> Result<(SectionHeader, Bytes)> {
        let offset = self.copy_offset(index, copy);
        let section = file.read_at(offset, self.block_size as usize).await?;
        let header = SectionHeader::validate(&section, offset, self.block_size)?;
        Ok((header, section))
    }

    /// Payload of a validated section
    fn payload(header: &SectionHeader, section: &Bytes) -> Bytes {
        section.slice(SECTION_HEADER_SIZE..SECTION_HEADER_SIZE + header.data_size as usize)
    }

    /// Pick the authoritative copy from the two validation outcomes
    fn arbitrate(
        &self,
        index: u32,
        a: Result<(SectionHeader, Bytes)>,
        b: Result<(SectionHeader, Bytes)>,
    ) -> Result<(BlockCopy, SectionHeader, Bytes)> {
        match (a, b) {
            (Ok((ha, sa)), Ok((hb, sb))) => {
                if ha.generation.abs_diff(hb.generation) > 1 {
                    warn!(
                        "Block {} of {:?} has copies {} generations apart (A={}, B={})",
                        index,
                        self.path,
                        ha.generation.abs_diff(hb.generation),
                        ha.generation,
                        hb.generation
                    );
                }
                // Copy B wins only with a strictly newer generation
                if hb.generation > ha.generation {
                    Ok((BlockCopy::B, hb, sb))
                } else {
                    Ok((BlockCopy::A, ha, sa))
                }
            }
            (Ok((ha, sa)), Err(e)) => {
                warn!("Block {} copy B of {:?} is invalid, using copy A: {}", index, self.path, e);
                Ok((BlockCopy::A, ha, sa))
            }
            (Err(e), Ok((hb, sb))) => {
                warn!("Block {} copy A of {:?} is invalid, using copy B: {}", index, self.path, e);
                Ok((BlockCopy::B, hb, sb))
            }
            (Err(ea), Err(eb)) => Err(Error::structure_fault(format!(
                "both copies of block {index} are invalid: A: {ea}; B: {eb}"
            ))),
        }
    }

    /// Open an existing store and determine the authoritative copy of
    /// every block.
    ///
    /// Up to `read_window` blocks are read and arbitrated at once.
    pub async fn open(&self) -> Result<()> {
        let file = self.fs.open_existing(&self.path).await?;

        let size = file.size().await?;
        if size < self.file_size() {
            return Err(self.taint(Error::structure_fault(format!(
                "metadata file {:?} is {} bytes, expected {}",
                self.path,
                size,
                self.file_size()
            ))));
        }

        let reader = &file;
        let mut reads = stream::iter(0..self.block_count)
            .map(|index| async move {
                let (a, b) = tokio::join!(
                    self.read_copy(reader, index, BlockCopy::A),
                    self.read_copy(reader, index, BlockCopy::B)
                );
                self.arbitrate(index, a, b)
            })
            .buffered(self.read_window);

        let mut slots = Vec::with_capacity(self.block_count as usize);
        while let Some(outcome) = reads.next().await {
            let (latest, header, section) = outcome.map_err(|e| self.taint(e))?;
            slots.push(BlockSlot {
                latest,
                generation: header.generation,
                cached: self
                    .cache_sections
                    .then(|| Self::payload(&header, &section)),
            });
        }
        drop(reads);

        *self.slots.lock() = slots;
        *self.file.write() = Some(file);

        info!(
            "Opened metadata store {:?}: {} blocks of {} bytes",
            self.path, self.block_count, self.block_size
        );
        Ok(())
    }

    /// Read the authoritative payload of a block
    pub async fn read_section(&self, index: u32) -> Result<Bytes> {
        self.check_fault()?;
        self.check_index(index)?;

        let latest = {
            let slots = self.slots.lock();
            let slot = slots
                .get(index as usize)
                .ok_or_else(|| Error::invalid_argument("metadata store is not open"))?;
            if let Some(cached) = &slot.cached {
                return Ok(cached.clone());
            }
            slot.latest
        };

        let file = self.current_file()?;
        let (header, section) = match self.read_copy(&file, index, latest).await {
            Ok(read) => read,
            Err(e) if e.is_structure_fault() => return Err(self.taint(e)),
            Err(e) => return Err(e),
        };
        let payload = Self::payload(&header, &section);

        if self.cache_sections {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(index as usize)
                && slot.generation == header.generation
            {
                slot.cached = Some(payload.clone());
            }
        }
        Ok(payload)
    }

    /// Read the block at a block-aligned file offset
    pub async fn read_section_at(&self, offset: u64) -> Result<Bytes> {
        let index = self.index_for_offset(offset)?;
        self.read_section(index).await
    }

    /// Write a new payload for a block; returns the new generation
    pub async fn write_section(&self, index: u32, data: &[u8]) -> Result<u64> {
        self.check_fault()?;
        self.check_index(index)?;
        if data.len() > self.payload_capacity() {
            return Err(Error::invalid_argument(format!(
                "data of {} bytes exceeds block payload capacity {}",
                data.len(),
                self.payload_capacity()
            )));
        }

        let _serial = self
            .write_locks
            .get(index as usize)
            .ok_or_else(|| Error::invalid_argument("block index out of range"))?
            .lock()
            .await;

        let (target, generation) = {
            let slots = self.slots.lock();
            let slot = slots
                .get(index as usize)
                .ok_or_else(|| Error::invalid_argument("metadata store is not open"))?;
            (slot.latest.other(), slot.generation + 1)
        };

        let offset = self.copy_offset(index, target);
        let section = SectionHeader::seal(offset, generation, self.block_size, data)?;
        SectionHeader::validate(&section, offset, self.block_size)
            .map_err(|e| Error::internal(format!("freshly built section failed validation: {e}")))?;

        let file = self.current_file()?;
        file.write_at(offset, Bytes::from(section)).await?;
        file.sync().await?;

        {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(index as usize) {
                slot.latest = target;
                slot.generation = generation;
                slot.cached = self.cache_sections.then(|| Bytes::copy_from_slice(data));
            }
        }

        debug!(
            "Wrote block {} of {:?} to copy {:?} at generation {}",
            index, self.path, target, generation
        );
        Ok(generation)
    }

    /// Write the block at a block-aligned file offset
    pub async fn write_section_at(&self, offset: u64, data: &[u8]) -> Result<u64> {
        let index = self.index_for_offset(offset)?;
        self.write_section(index, data).await
    }

    /// Generation of the authoritative copy of a block
    pub fn generation(&self, index: u32) -> Result<u64> {
        self.check_fault()?;
        self.check_index(index)?;
        self.slots
            .lock()
            .get(index as usize)
            .map(|s| s.generation)
            .ok_or_else(|| Error::invalid_argument("metadata store is not open"))
    }

    /// Which copy of a block is authoritative
    pub fn latest_copy(&self, index: u32) -> Result<BlockCopy> {
        self.check_fault()?;
        self.check_index(index)?;
        self.slots
            .lock()
            .get(index as usize)
            .map(|s| s.latest)
            .ok_or_else(|| Error::invalid_argument("metadata store is not open"))
    }

    /// Acquire the store's exclusive-access lock
    ///
    /// Callers hold it across read-modify-write sequences that span
    /// several store calls.
    pub async fn lock(&self) -> MetadataGuard {
        Arc::clone(&self.exclusive).lock_owned().await
    }

    /// Report the state of both copies of every block without opening
    /// the store or tainting it.
    pub async fn inspect(&self) -> Result<Vec<BlockReport>> {
        let file = self.fs.open_existing(&self.path).await?;
        let mut reports = Vec::with_capacity(self.block_count as usize);

        for index in 0..self.block_count {
            let (a, b) = tokio::join!(
                self.read_copy(&file, index, BlockCopy::A),
                self.read_copy(&file, index, BlockCopy::B)
            );
            let report = |copy: BlockCopy, outcome: &Result<(SectionHeader, Bytes)>| {
                let file_offset = self.copy_offset(index, copy);
                match outcome {
                    Ok((header, _)) => CopyReport {
                        copy,
                        file_offset,
                        valid: true,
                        generation: Some(header.generation),
                        data_size: Some(header.data_size),
                        timestamp: Some(header.timestamp),
                        error: None,
                    },
                    Err(e) => CopyReport {
                        copy,
                        file_offset,
                        valid: false,
                        generation: None,
                        data_size: None,
                        timestamp: None,
                        error: Some(e.to_string()),
                    },
                }
            };
            let copies = [report(BlockCopy::A, &a), report(BlockCopy::B, &b)];
            let authoritative = match (&copies[0].generation, &copies[1].generation) {
                (Some(ga), Some(gb)) if gb > ga => Some(BlockCopy::B),
                (Some(_), _) => Some(BlockCopy::A),
                (None, Some(_)) => Some(BlockCopy::B),
                (None, None) => None,
            };
            reports.push(BlockReport {
                index,
                copies,
                authoritative,
            });
        }

        Ok(reports)
    }

    /// Release the backing file and cached sections
    pub fn close(&self) {
        *self.file.write() = None;
        self.slots.lock().clear();
        debug!("Closed metadata store {:?}", self.path);
    }

    /// Close the store and delete its backing file
    pub async fn cleanup(&self) -> Result<()> {
        self.close();
        self.fs.delete(&self.path).await?;
        info!("Deleted metadata store {:?}", self.path);
        Ok(())
    }
}
