//! Base log engine collaborator
//!
//! The lifecycle orchestrator does not manage log data itself. It drives a
//! [`LogEngine`] that owns the physical container files and the streams
//! inside them.

use async_trait::async_trait;
use overlog_common::{ContainerId, Result, StreamId};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An open physical log container
#[async_trait]
pub trait BaseContainer: Send + Sync {
    fn id(&self) -> ContainerId;

    /// Path of the container's data file
    fn path(&self) -> &Path;

    /// Number of streams the container was created for
    fn max_streams(&self) -> u32;

    /// Close the container; returns once every handle on it is released
    async fn close(&self) -> Result<()>;
}

/// Single-stream log engine that owns physical containers
#[async_trait]
pub trait LogEngine: Send + Sync {
    /// Create a container data file at `path`
    ///
    /// Fails with `AlreadyExists` if `path` exists.
    async fn create_container(
        &self,
        path: &Path,
        id: ContainerId,
        max_streams: u32,
    ) -> Result<Arc<dyn BaseContainer>>;

    /// Open the container data file at `path`
    async fn open_container(&self, path: &Path) -> Result<Arc<dyn BaseContainer>>;

    /// Delete the container data file at `path`
    async fn delete_container(&self, path: &Path) -> Result<()>;

    /// Delete one stream hosted by `container`
    async fn delete_stream(&self, container: ContainerId, stream_id: StreamId) -> Result<()>;

    /// Data files of the containers found under `directory`
    async fn enumerate_containers(&self, directory: &Path) -> Result<Vec<PathBuf>>;
}
