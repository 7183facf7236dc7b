//! overlog metadata - Crash-safe container metadata
//!
//! This crate implements the persisted bookkeeping of log containers:
//! - Block-file abstraction over the local filesystem
//! - Dual-copy, checksum-verified metadata block store
//! - Shared container directory (fixed-capacity stream table)
//! - Dedicated container header (single-stream metadata blob)

pub mod block_store;
pub mod dedicated;
pub mod file;
pub mod layout;
pub mod shared;
pub mod slots;

// Re-exports
pub use block_store::{BlockCopy, BlockReport, CopyReport, MetadataBlockStore, MetadataGuard};
pub use dedicated::{
    DEDICATED_HEADER_SIZE, DedicatedContainerHeader, DedicatedHeader, MAX_SECURITY_DESCRIPTOR_SIZE,
};
pub use file::{BlockFile, FileSystem, LocalFile, LocalFileSystem};
pub use layout::{SECTION_HEADER_SIZE, SECTION_SIGNATURE, SectionHeader};
pub use shared::{EntryFlags, EntryUpdate, SharedContainerDirectory, StreamEntry};
pub use slots::SlotBitmap;
