//! overlog-coalesce - Write coalescing for dedicated streams
//!
//! Small appends to a dedicated stream are packed into records of up to
//! `max_record_size` bytes before they reach storage. Each record carries
//! a [`StreamBlockHeader`] describing its place in the stream.

pub mod allocator;
pub mod engine;
pub mod record;
pub mod stream;

pub use allocator::{Allocation, PressureSource, ThrottledAllocator};
pub use engine::{CoalesceStats, RecordCoalescingEngine};
pub use record::{
    FoundRecord, ReadType, Record, RecordWrite, STREAM_BLOCK_HEADER_SIZE, STREAM_BLOCK_SIGNATURE,
    StreamBlockHeader,
};
pub use stream::DedicatedStream;
