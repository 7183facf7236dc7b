//! Shared container directory
//!
//! A shared container multiplexes many logical streams. Its directory is
//! a fixed-capacity table of stream entries persisted in a
//! [`MetadataBlockStore`], one section per block:
//!
//! ```text
//! +-------------------------+  offset 0
//! |  Section header         |  256 bytes (block store)
//! |  Directory header       |  section index, section count, max entries
//! +-------------------------+  offset 1024
//! |  Entry 0                |  1024 bytes
//! |  Entry 1                |
//! |  ...                    |
//! +-------------------------+  section_size
//! ```
//!
//! Entry layout (little endian):
//!
//! ```text
//! stream_id [16] | index u32 | max_ll_metadata_size u32 | max_record_size u32 | reserved u32
//! stream_size i64 | flags u32 | reserved u32
//! alias_name [128 x u16] | path_to_dedicated_container [360 x u16]
//! ```
//!
//! A null stream id marks a free slot. Every occupied entry stores its own
//! slot index, which open cross-checks to detect misplaced sections.

use crate::block_store::MetadataBlockStore;
use crate::file::FileSystem;
use crate::layout::SECTION_HEADER_SIZE;
use crate::slots::SlotBitmap;
use bytes::{Buf, BufMut, Bytes};
use futures::stream::{self, StreamExt};
use overlog_common::{Error, MetadataConfig, Result, StreamId};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bytes from the start of a section to the first entry
pub const DIRECTORY_HEADER_SIZE: usize = 1024;

/// Size of one stream entry
pub const ENTRY_SIZE: usize = 1024;

/// UTF-16 units reserved for the alias name, terminator included
pub const ALIAS_CHARS: usize = 128;

/// UTF-16 units reserved for the dedicated container path, terminator included
pub const PATH_CHARS: usize = 360;

const ENTRY_FIXED_SIZE: usize = 48;
const ALIAS_OFFSET: usize = ENTRY_FIXED_SIZE;
const PATH_OFFSET: usize = ALIAS_OFFSET + ALIAS_CHARS * 2;
const _: () = assert!(PATH_OFFSET + PATH_CHARS * 2 <= ENTRY_SIZE);

/// Payload offset of the first entry (the block store owns the first 256 bytes)
const ENTRIES_PAYLOAD_OFFSET: usize = DIRECTORY_HEADER_SIZE - SECTION_HEADER_SIZE;

/// Disposition of a stream entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum EntryFlags {
    Deleted = 0,
    Creating = 1,
    Created = 2,
    Deleting = 3,
}

impl TryFrom<u32> for EntryFlags {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Deleted),
            1 => Ok(Self::Creating),
            2 => Ok(Self::Created),
            3 => Ok(Self::Deleting),
            _ => Err(Error::structure_fault(format!(
                "invalid stream entry flags {value}"
            ))),
        }
    }
}

/// One row of the shared container directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamEntry {
    pub stream_id: StreamId,
    /// Slot the entry occupies
    pub index: u32,
    pub max_ll_metadata_size: u32,
    pub max_record_size: u32,
    pub stream_size: i64,
    pub flags: EntryFlags,
    pub alias: Option<String>,
    pub dedicated_path: Option<PathBuf>,
}

impl StreamEntry {
    /// A new entry in the `Creating` state
    #[must_use]
    pub const fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            index: 0,
            max_ll_metadata_size: 0,
            max_record_size: 0,
            stream_size: 0,
            flags: EntryFlags::Creating,
            alias: None,
            dedicated_path: None,
        }
    }

    #[must_use]
    pub const fn with_sizes(
        mut self,
        max_ll_metadata_size: u32,
        max_record_size: u32,
        stream_size: i64,
    ) -> Self {
        self.max_ll_metadata_size = max_ll_metadata_size;
        self.max_record_size = max_record_size;
        self.stream_size = stream_size;
        self
    }

    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    #[must_use]
    pub fn with_dedicated_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dedicated_path = Some(path.into());
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: EntryFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Encode into an entry-sized buffer
    fn encode(&self, out: &mut [u8]) -> Result<()> {
        let alias = encode_name(self.alias.as_deref().unwrap_or_default(), ALIAS_CHARS, "alias")?;
        let path = self
            .dedicated_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = encode_name(&path, PATH_CHARS, "dedicated container path")?;

        out[..ENTRY_SIZE].fill(0);
        let mut cursor = &mut out[..ENTRY_FIXED_SIZE];
        cursor.put_slice(self.stream_id.as_bytes());
        cursor.put_u32_le(self.index);
        cursor.put_u32_le(self.max_ll_metadata_size);
        cursor.put_u32_le(self.max_record_size);
        cursor.put_u32_le(0);
        cursor.put_i64_le(self.stream_size);
        cursor.put_u32_le(self.flags as u32);
        cursor.put_u32_le(0);

        out[ALIAS_OFFSET..ALIAS_OFFSET + alias.len()].copy_from_slice(&alias);
        out[PATH_OFFSET..PATH_OFFSET + path.len()].copy_from_slice(&path);
        Ok(())
    }

    /// Stream id stored in an encoded entry
    fn peek_stream_id(raw: &[u8]) -> StreamId {
        let mut id = [0u8; 16];
        id.copy_from_slice(&raw[..16]);
        StreamId::from_bytes(id)
    }

    /// Decode an entry-sized buffer
    fn decode(raw: &[u8]) -> Result<Self> {
        let mut buf = &raw[..ENTRY_FIXED_SIZE];
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let index = buf.get_u32_le();
        let max_ll_metadata_size = buf.get_u32_le();
        let max_record_size = buf.get_u32_le();
        let _reserved = buf.get_u32_le();
        let stream_size = buf.get_i64_le();
        let flags = EntryFlags::try_from(buf.get_u32_le())?;

        let alias = decode_name(&raw[ALIAS_OFFSET..ALIAS_OFFSET + ALIAS_CHARS * 2])?;
        let path = decode_name(&raw[PATH_OFFSET..PATH_OFFSET + PATH_CHARS * 2])?;

        Ok(Self {
            stream_id: StreamId::from_bytes(id),
            index,
            max_ll_metadata_size,
            max_record_size,
            stream_size,
            flags,
            alias: (!alias.is_empty()).then_some(alias),
            dedicated_path: (!path.is_empty()).then(|| PathBuf::from(path)),
        })
    }
}

/// Encode a name as null-terminated UTF-16LE of at most `chars` units
fn encode_name(name: &str, chars: usize, what: &str) -> Result<Vec<u8>> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() >= chars {
        return Err(Error::invalid_argument(format!(
            "{what} is {} UTF-16 units, limit is {}",
            units.len(),
            chars - 1
        )));
    }
    let mut out = Vec::with_capacity(units.len() * 2);
    for unit in units {
        out.put_u16_le(unit);
    }
    Ok(out)
}

fn decode_name(raw: &[u8]) -> Result<String> {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16(&units)
        .map_err(|e| Error::structure_fault(format!("stream entry name is not UTF-16: {e}")))
}

/// Field changes applied by [`SharedContainerDirectory::update_entry`]
///
/// `None` leaves a field unchanged.
#[derive(Clone, Debug, Default)]
pub struct EntryUpdate {
    pub alias: Option<String>,
    pub dedicated_path: Option<PathBuf>,
    pub flags: Option<EntryFlags>,
    pub stream_size: Option<i64>,
    /// Soft-delete: null the stream id and free the slot
    pub remove: bool,
}

impl EntryUpdate {
    #[must_use]
    pub fn remove() -> Self {
        Self {
            remove: true,
            flags: Some(EntryFlags::Deleted),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn flags(flags: EntryFlags) -> Self {
        Self {
            flags: Some(flags),
            ..Self::default()
        }
    }
}

/// Fixed-capacity table of stream entries for one shared container
pub struct SharedContainerDirectory {
    store: MetadataBlockStore,
    max_streams: u32,
    entries_per_section: u32,
    section_count: u32,
    slots: SlotBitmap,
    read_window: usize,
}

impl SharedContainerDirectory {
    fn describe(
        fs: Arc<dyn FileSystem>,
        path: &Path,
        max_streams: u32,
        config: &MetadataConfig,
    ) -> Result<Self> {
        if max_streams == 0 {
            return Err(Error::invalid_argument("max_streams must be positive"));
        }
        config.validate()?;

        let section_size = config.shared_section_size;
        #[allow(clippy::cast_possible_truncation)]
        let entries_per_section = ((section_size as usize - DIRECTORY_HEADER_SIZE) / ENTRY_SIZE) as u32;
        let section_count = max_streams.div_ceil(entries_per_section);

        let store = MetadataBlockStore::new(fs, path, section_count, section_size)?
            .with_cache(config.cache_sections)
            .with_read_window(config.open_read_window);

        Ok(Self {
            store,
            max_streams,
            entries_per_section,
            section_count,
            slots: SlotBitmap::new(max_streams),
            read_window: config.open_read_window,
        })
    }

    /// Create a new, empty directory
    pub async fn create(
        fs: Arc<dyn FileSystem>,
        path: &Path,
        max_streams: u32,
        config: &MetadataConfig,
    ) -> Result<Self> {
        let dir = Self::describe(fs, path, max_streams, config)?;
        dir.store.initialize(None).await?;
        info!(
            "Created shared container directory {:?}: {} entries in {} sections",
            path, max_streams, dir.section_count
        );
        Ok(dir)
    }

    /// Open an existing directory, invoking `on_entry` for every occupied
    /// entry.
    ///
    /// Sections are read concurrently, so entries are reported in no
    /// particular order. An error from `on_entry` aborts the open.
    pub async fn open<F>(
        fs: Arc<dyn FileSystem>,
        path: &Path,
        max_streams: u32,
        config: &MetadataConfig,
        mut on_entry: F,
    ) -> Result<Self>
    where
        F: FnMut(&StreamEntry) -> Result<()> + Send,
    {
        let dir = Self::describe(fs, path, max_streams, config)?;
        dir.store.open().await?;

        if let Err(e) = dir.load_entries(&mut on_entry).await {
            warn!("Failed to open shared container directory {:?}: {}", path, e);
            dir.store.close();
            return Err(e);
        }

        info!(
            "Opened shared container directory {:?}: {}/{} entries in use",
            path,
            dir.max_streams - dir.slots.free_count(),
            dir.max_streams
        );
        Ok(dir)
    }

    async fn load_entries<F>(&self, on_entry: &mut F) -> Result<()>
    where
        F: FnMut(&StreamEntry) -> Result<()> + Send,
    {
        let store = &self.store;
        let mut reads = stream::iter(0..self.section_count)
            .map(|section| async move { (section, store.read_section(section).await) })
            .buffer_unordered(self.read_window);

        while let Some((section, result)) = reads.next().await {
            let payload = self.expand(&result?);
            self.check_section_header(section, &payload)?;

            for slot_in_section in 0..self.entries_per_section {
                let index = section * self.entries_per_section + slot_in_section;
                let raw = Self::entry_bytes(&payload, slot_in_section);
                if StreamEntry::peek_stream_id(raw).is_null() {
                    continue;
                }
                if index >= self.max_streams {
                    return Err(Error::structure_fault(format!(
                        "entry beyond directory capacity at slot {index}"
                    )));
                }

                let entry = StreamEntry::decode(raw)?;
                if entry.index != index {
                    return Err(Error::structure_fault(format!(
                        "entry in slot {} claims index {}",
                        index, entry.index
                    )));
                }
                self.slots.mark_used(index);
                on_entry(&entry)?;
            }
        }
        Ok(())
    }

    /// A section payload padded to full size; never-written sections read as zeros
    fn expand(&self, payload: &Bytes) -> Vec<u8> {
        let mut full = vec![0u8; self.store.payload_capacity()];
        full[..payload.len()].copy_from_slice(payload);
        full
    }

    fn entry_bytes(payload: &[u8], slot_in_section: u32) -> &[u8] {
        let start = ENTRIES_PAYLOAD_OFFSET + slot_in_section as usize * ENTRY_SIZE;
        &payload[start..start + ENTRY_SIZE]
    }

    fn entry_bytes_mut(payload: &mut [u8], slot_in_section: u32) -> &mut [u8] {
        let start = ENTRIES_PAYLOAD_OFFSET + slot_in_section as usize * ENTRY_SIZE;
        &mut payload[start..start + ENTRY_SIZE]
    }

    /// A section header is valid if never written or consistent with its position
    fn check_section_header(&self, section: u32, payload: &[u8]) -> Result<()> {
        let mut buf = &payload[..12];
        let index = buf.get_u32_le();
        let total = buf.get_u32_le();
        let max_entries = buf.get_u32_le();

        let fresh = index == 0 && total == 0 && max_entries == 0;
        let matches =
            index == section && total == self.section_count && max_entries == self.max_streams;
        if fresh || matches {
            Ok(())
        } else {
            Err(Error::structure_fault(format!(
                "directory section {section} has header (index {index}, sections {total}, entries {max_entries})"
            )))
        }
    }

    fn set_section_header(&self, section: u32, payload: &mut [u8]) {
        let mut cursor = &mut payload[..12];
        cursor.put_u32_le(section);
        cursor.put_u32_le(self.section_count);
        cursor.put_u32_le(self.max_streams);
    }

    const fn position(&self, index: u32) -> (u32, u32) {
        (
            index / self.entries_per_section,
            index % self.entries_per_section,
        )
    }

    /// Read and validate the section holding slot `index`
    async fn load_section_for(&self, index: u32) -> Result<(u32, u32, Vec<u8>)> {
        let (section, slot_in_section) = self.position(index);
        let payload = self.expand(&self.store.read_section(section).await?);
        self.check_section_header(section, &payload)?;
        Ok((section, slot_in_section, payload))
    }

    /// Add a stream entry in the lowest free slot; returns the slot index
    pub async fn add_entry(&self, entry: &StreamEntry) -> Result<u32> {
        if entry.stream_id.is_null() {
            return Err(Error::invalid_argument("stream id must not be null"));
        }

        let _guard = self.store.lock().await;
        let index = self
            .slots
            .allocate()
            .ok_or_else(|| Error::resource_exhausted("no more entries"))?;

        match self.write_new_entry(index, entry).await {
            Ok(()) => {
                debug!("Added stream {} at slot {}", entry.stream_id, index);
                Ok(index)
            }
            Err(e) => {
                self.slots.free(index);
                Err(e)
            }
        }
    }

    async fn write_new_entry(&self, index: u32, entry: &StreamEntry) -> Result<()> {
        let (section, slot_in_section, mut payload) = self.load_section_for(index).await?;

        let mut stored = entry.clone();
        stored.index = index;
        stored.encode(Self::entry_bytes_mut(&mut payload, slot_in_section))?;
        self.set_section_header(section, &mut payload);

        self.store.write_section(section, &payload).await?;
        Ok(())
    }

    /// Modify the entry at `index`, which must belong to `stream_id`
    pub async fn update_entry(
        &self,
        index: u32,
        stream_id: StreamId,
        update: &EntryUpdate,
    ) -> Result<()> {
        if index >= self.max_streams {
            return Err(Error::invalid_argument(format!(
                "slot {} out of range (capacity {})",
                index, self.max_streams
            )));
        }

        let _guard = self.store.lock().await;
        let (section, slot_in_section, mut payload) = self.load_section_for(index).await?;

        let raw = Self::entry_bytes(&payload, slot_in_section);
        if StreamEntry::peek_stream_id(raw) != stream_id || stream_id.is_null() {
            return Err(Error::not_found(format!(
                "stream {stream_id} is not in slot {index}"
            )));
        }
        let mut entry = StreamEntry::decode(raw)?;
        if entry.index != index {
            return Err(Error::structure_fault(format!(
                "entry in slot {} claims index {}",
                index, entry.index
            )));
        }

        if update.remove {
            entry.stream_id = StreamId::null();
        }
        if let Some(alias) = &update.alias {
            entry.alias = (!alias.is_empty()).then(|| alias.clone());
        }
        if let Some(path) = &update.dedicated_path {
            entry.dedicated_path = Some(path.clone());
        }
        if let Some(flags) = update.flags {
            entry.flags = flags;
        }
        if let Some(size) = update.stream_size {
            entry.stream_size = size;
        }

        entry.encode(Self::entry_bytes_mut(&mut payload, slot_in_section))?;
        self.set_section_header(section, &mut payload);
        self.store.write_section(section, &payload).await?;

        if update.remove {
            self.slots.free(index);
            debug!("Removed stream {} from slot {}", stream_id, index);
        }
        Ok(())
    }

    /// Soft-delete the entry at `index`
    pub async fn remove_entry(&self, index: u32, stream_id: StreamId) -> Result<()> {
        self.update_entry(index, stream_id, &EntryUpdate::remove()).await
    }

    /// Read the entry at `index`; `None` if the slot is free
    pub async fn read_entry(&self, index: u32) -> Result<Option<StreamEntry>> {
        if index >= self.max_streams {
            return Err(Error::invalid_argument(format!(
                "slot {} out of range (capacity {})",
                index, self.max_streams
            )));
        }
        let (_, slot_in_section, payload) = self.load_section_for(index).await?;
        let raw = Self::entry_bytes(&payload, slot_in_section);
        if StreamEntry::peek_stream_id(raw).is_null() {
            return Ok(None);
        }
        StreamEntry::decode(raw).map(Some)
    }

    /// Snapshot of every occupied entry, in slot order
    pub async fn entries(&self) -> Result<Vec<StreamEntry>> {
        let mut entries = Vec::new();
        for section in 0..self.section_count {
            let payload = self.expand(&self.store.read_section(section).await?);
            self.check_section_header(section, &payload)?;
            for slot_in_section in 0..self.entries_per_section {
                let raw = Self::entry_bytes(&payload, slot_in_section);
                if !StreamEntry::peek_stream_id(raw).is_null() {
                    entries.push(StreamEntry::decode(raw)?);
                }
            }
        }
        Ok(entries)
    }

    #[must_use]
    pub const fn max_streams(&self) -> u32 {
        self.max_streams
    }

    #[must_use]
    pub const fn section_count(&self) -> u32 {
        self.section_count
    }

    #[must_use]
    pub const fn entries_per_section(&self) -> u32 {
        self.entries_per_section
    }

    #[must_use]
    pub fn free_slots(&self) -> u32 {
        self.slots.free_count()
    }

    /// Underlying block store
    #[must_use]
    pub const fn store(&self) -> &MetadataBlockStore {
        &self.store
    }

    pub fn close(&self) {
        self.store.close();
    }

    /// Close the directory and delete its metadata file
    pub async fn cleanup(&self) -> Result<()> {
        self.store.cleanup().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::LocalFileSystem;
    use tempfile::tempdir;

    fn small_sections() -> MetadataConfig {
        // 7 entries per section
        MetadataConfig {
            shared_section_size: 8192,
            ..MetadataConfig::default()
        }
    }

    fn fs() -> Arc<dyn FileSystem> {
        Arc::new(LocalFileSystem::new())
    }

    #[tokio::test]
    async fn test_capacity_and_slot_reuse() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.mbinfo");
        let directory = SharedContainerDirectory::create(fs(), &path, 8, &small_sections())
            .await
            .unwrap();
        assert_eq!(directory.entries_per_section(), 7);
        assert_eq!(directory.section_count(), 2);

        let mut ids = Vec::new();
        for expected in 0..8 {
            let id = StreamId::new();
            let index = directory.add_entry(&StreamEntry::new(id)).await.unwrap();
            assert_eq!(index, expected);
            ids.push(id);
        }

        let err = directory
            .add_entry(&StreamEntry::new(StreamId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));

        directory.remove_entry(3, ids[3]).await.unwrap();
        assert_eq!(directory.free_slots(), 1);
        assert_eq!(directory.read_entry(3).await.unwrap(), None);

        let index = directory
            .add_entry(&StreamEntry::new(StreamId::new()))
            .await
            .unwrap();
        assert_eq!(index, 3);
        assert_eq!(directory.free_slots(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_and_updates_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.mbinfo");
        let config = small_sections();
        let directory = Arc::new(
            SharedContainerDirectory::create(fs(), &path, 14, &config)
                .await
                .unwrap(),
        );

        // Slots 0..4 live in section 0, as do the first adds below
        let mut existing = Vec::new();
        for _ in 0..4 {
            let id = StreamId::new();
            let index = directory.add_entry(&StreamEntry::new(id)).await.unwrap();
            existing.push((index, id));
        }

        let mut tasks = tokio::task::JoinSet::new();
        let mut added = Vec::new();
        for n in 0..6 {
            let id = StreamId::new();
            added.push((id, format!("added-{n}")));
            let directory = Arc::clone(&directory);
            let alias = format!("added-{n}");
            tasks.spawn(async move {
                directory
                    .add_entry(&StreamEntry::new(id).with_alias(alias))
                    .await
                    .map(|_| ())
            });
        }
        for &(index, id) in &existing {
            let directory = Arc::clone(&directory);
            tasks.spawn(async move {
                let update = EntryUpdate {
                    flags: Some(EntryFlags::Created),
                    stream_size: Some(i64::from(index + 1) * 4096),
                    ..EntryUpdate::default()
                };
                directory.update_entry(index, id, &update).await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }
        assert_eq!(directory.free_slots(), 4);
        directory.close();

        let mut seen = Vec::new();
        let reopened = SharedContainerDirectory::open(fs(), &path, 14, &config, |entry| {
            seen.push(entry.clone());
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(seen.len(), 10);
        assert_eq!(reopened.free_slots(), 4);

        for (index, id) in existing {
            let entry = seen.iter().find(|e| e.stream_id == id).unwrap();
            assert_eq!(entry.index, index);
            assert_eq!(entry.flags, EntryFlags::Created);
            assert_eq!(entry.stream_size, i64::from(index + 1) * 4096);
        }
        for (id, alias) in added {
            let entry = seen.iter().find(|e| e.stream_id == id).unwrap();
            assert_eq!(entry.alias.as_deref(), Some(alias.as_str()));
            assert_eq!(entry.flags, EntryFlags::Creating);
        }
        let mut indices: Vec<u32> = seen.iter().map(|e| e.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_reopen_reports_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.mbinfo");
        let config = small_sections();
        let id_a = StreamId::new();
        let id_b = StreamId::new();
        {
            let directory = SharedContainerDirectory::create(fs(), &path, 20, &config)
                .await
                .unwrap();
            let entry = StreamEntry::new(id_a)
                .with_sizes(4096, 1024 * 1024, 1 << 30)
                .with_alias("orders")
                .with_dedicated_path("/data/streams/orders.log");
            assert_eq!(directory.add_entry(&entry).await.unwrap(), 0);
            assert_eq!(
                directory.add_entry(&StreamEntry::new(id_b)).await.unwrap(),
                1
            );
            directory
                .update_entry(0, id_a, &EntryUpdate::flags(EntryFlags::Created))
                .await
                .unwrap();
            directory.close();
        }

        let mut seen = Vec::new();
        let directory = SharedContainerDirectory::open(fs(), &path, 20, &config, |entry| {
            seen.push(entry.clone());
            Ok(())
        })
        .await
        .unwrap();

        seen.sort_by_key(|e| e.index);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].stream_id, id_a);
        assert_eq!(seen[0].flags, EntryFlags::Created);
        assert_eq!(seen[0].alias.as_deref(), Some("orders"));
        assert_eq!(
            seen[0].dedicated_path.as_deref(),
            Some(Path::new("/data/streams/orders.log"))
        );
        assert_eq!(seen[0].max_record_size, 1024 * 1024);
        assert_eq!(seen[1].stream_id, id_b);
        assert_eq!(seen[1].flags, EntryFlags::Creating);
        assert_eq!(directory.free_slots(), 18);

        // Next add skips the slots rebuilt from disk
        assert_eq!(
            directory
                .add_entry(&StreamEntry::new(StreamId::new()))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_open_across_many_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.mbinfo");
        let config = MetadataConfig {
            open_read_window: 3,
            ..small_sections()
        };
        let directory = SharedContainerDirectory::create(fs(), &path, 40, &config)
            .await
            .unwrap();
        assert_eq!(directory.section_count(), 6);
        for _ in 0..40 {
            directory
                .add_entry(&StreamEntry::new(StreamId::new()))
                .await
                .unwrap();
        }
        directory.close();

        let mut count = 0;
        let directory = SharedContainerDirectory::open(fs(), &path, 40, &config, |_| {
            count += 1;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(count, 40);
        assert_eq!(directory.entries().await.unwrap().len(), 40);
    }

    #[tokio::test]
    async fn test_removed_entry_not_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.mbinfo");
        let config = small_sections();
        let id = StreamId::new();
        {
            let directory = SharedContainerDirectory::create(fs(), &path, 4, &config)
                .await
                .unwrap();
            let index = directory.add_entry(&StreamEntry::new(id)).await.unwrap();
            directory.remove_entry(index, id).await.unwrap();
        }

        let directory = SharedContainerDirectory::open(fs(), &path, 4, &config, |_| {
            panic!("no entries expected")
        })
        .await
        .unwrap();
        assert_eq!(directory.free_slots(), 4);
    }

    #[tokio::test]
    async fn test_update_wrong_stream_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.mbinfo");
        let directory = SharedContainerDirectory::create(fs(), &path, 4, &small_sections())
            .await
            .unwrap();
        let index = directory
            .add_entry(&StreamEntry::new(StreamId::new()))
            .await
            .unwrap();

        let err = directory
            .update_entry(index, StreamId::new(), &EntryUpdate::remove())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(directory.free_slots(), 3);

        let err = directory
            .update_entry(9, StreamId::new(), &EntryUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_misplaced_entry_fails_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.mbinfo");
        let config = small_sections();
        {
            let directory = SharedContainerDirectory::create(fs(), &path, 4, &config)
                .await
                .unwrap();
            // Slot 0 holds an entry that claims to live in slot 2
            let mut payload = vec![0u8; directory.store().payload_capacity()];
            let mut entry = StreamEntry::new(StreamId::new());
            entry.index = 2;
            entry
                .encode(SharedContainerDirectory::entry_bytes_mut(&mut payload, 0))
                .unwrap();
            directory.set_section_header(0, &mut payload);
            directory.store().write_section(0, &payload).await.unwrap();
        }

        let err = SharedContainerDirectory::open(fs(), &path, 4, &config, |_| Ok(()))
            .await
            .err()
            .unwrap();
        assert!(err.is_structure_fault());
    }

    #[tokio::test]
    async fn test_wrong_capacity_fails_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.mbinfo");
        let config = small_sections();
        {
            let directory = SharedContainerDirectory::create(fs(), &path, 6, &config)
                .await
                .unwrap();
            directory
                .add_entry(&StreamEntry::new(StreamId::new()))
                .await
                .unwrap();
        }

        // Same section count, different declared capacity
        let err = SharedContainerDirectory::open(fs(), &path, 5, &config, |_| Ok(()))
            .await
            .err()
            .unwrap();
        assert!(err.is_structure_fault());
    }

    #[tokio::test]
    async fn test_callback_error_aborts_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.mbinfo");
        let config = small_sections();
        {
            let directory = SharedContainerDirectory::create(fs(), &path, 4, &config)
                .await
                .unwrap();
            directory
                .add_entry(&StreamEntry::new(StreamId::new()))
                .await
                .unwrap();
        }

        let result = SharedContainerDirectory::open(fs(), &path, 4, &config, |_| {
            Err(Error::internal("stream table full"))
        })
        .await;
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_names_too_long() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.mbinfo");
        let directory = SharedContainerDirectory::create(fs(), &path, 4, &small_sections())
            .await
            .unwrap();

        let entry = StreamEntry::new(StreamId::new()).with_alias("a".repeat(ALIAS_CHARS));
        let err = directory.add_entry(&entry).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        // The failed add returned its slot
        assert_eq!(directory.free_slots(), 4);

        let entry = StreamEntry::new(StreamId::new()).with_alias("a".repeat(ALIAS_CHARS - 1));
        directory.add_entry(&entry).await.unwrap();
    }

    #[test]
    fn test_entry_encoding() {
        let entry = StreamEntry::new(StreamId::new())
            .with_sizes(1, 2, -3)
            .with_alias("héllo")
            .with_flags(EntryFlags::Deleting);
        let mut raw = vec![0u8; ENTRY_SIZE];
        entry.encode(&mut raw).unwrap();
        assert_eq!(StreamEntry::decode(&raw).unwrap(), entry);
    }
}
