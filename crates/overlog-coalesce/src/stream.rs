//! Dedicated stream collaborator

use crate::record::RecordWrite;
use async_trait::async_trait;
use overlog_common::Result;

/// The single stream of a dedicated container, as seen by the engine
#[async_trait]
pub trait DedicatedStream: Send + Sync {
    /// Durably write one record, consuming `write.reserve` bytes of the
    /// stream's reservation
    async fn reserved_write(&self, write: RecordWrite) -> Result<()>;

    /// Grow (positive) or release (negative) the stream's reservation
    async fn update_reservation(&self, delta: i64) -> Result<()>;
}
