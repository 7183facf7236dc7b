//! Shared container lifecycle
//!
//! A shared container is two files: the data file owned by the base log
//! engine and the directory metadata file next to it (`<data>.mbinfo`).
//! The data file's name is the existence signal. Path-addressed containers
//! are therefore built under a temporary name and renamed into place in a
//! fixed order:
//!
//! 1. `<data>.<attempt>.tmp.mbinfo` -> `<data>.mbinfo`, replacing an
//!    existing file only while `<data>` is absent
//! 2. `<data>.<attempt>.tmp` -> `<data>` (never replaces)
//!
//! Every attempt builds under its own temporary names. Temporary files
//! are only swept once `<data>` exists, when no other attempt can finish
//! anyway. A crash before step 2 leaves no data file, so the container is
//! absent until it is created again. Id-addressed containers get a
//! fresh, unique name and are built in place.

use crate::engine::{BaseContainer, LogEngine};
use overlog_common::{
    Config, ContainerConfig, ContainerId, Error, MetadataConfig, Result, StreamId,
};
use overlog_metadata::{
    EntryUpdate, FileSystem, SharedContainerDirectory, StreamEntry,
};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How a container is addressed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerLocation {
    /// Explicit data file path
    Path(PathBuf),
    /// `Log{id}.log` in the configured default directory
    Id(ContainerId),
}

impl From<PathBuf> for ContainerLocation {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<ContainerId> for ContainerLocation {
    fn from(id: ContainerId) -> Self {
        Self::Id(id)
    }
}

/// Outcome of the per-stream deletes run by a container delete
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeleteSummary {
    pub streams_deleted: usize,
    pub streams_failed: usize,
}

/// `path` with `suffix` appended to its file name
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Delete a file, treating a missing file as deleted
async fn delete_if_present(fs: &dyn FileSystem, path: &Path) -> Result<()> {
    match fs.delete(path).await {
        Err(e) if !e.is_not_found() => Err(e),
        _ => Ok(()),
    }
}

/// An open shared container: the base container plus its stream directory
pub struct SharedContainer {
    base: Arc<dyn BaseContainer>,
    directory: SharedContainerDirectory,
}

impl SharedContainer {
    #[must_use]
    pub fn id(&self) -> ContainerId {
        self.base.id()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.base.path()
    }

    #[must_use]
    pub const fn directory(&self) -> &SharedContainerDirectory {
        &self.directory
    }

    /// Register a stream; returns its directory slot
    pub async fn add_stream(&self, entry: &StreamEntry) -> Result<u32> {
        self.directory.add_entry(entry).await
    }

    pub async fn update_stream(
        &self,
        index: u32,
        stream_id: StreamId,
        update: &EntryUpdate,
    ) -> Result<()> {
        self.directory.update_entry(index, stream_id, update).await
    }

    pub async fn remove_stream(&self, index: u32, stream_id: StreamId) -> Result<()> {
        self.directory.remove_entry(index, stream_id).await
    }

    pub async fn streams(&self) -> Result<Vec<StreamEntry>> {
        self.directory.entries().await
    }

    /// Close the directory and then the base container
    pub async fn close(self) -> Result<()> {
        self.directory.close();
        self.base.close().await?;
        debug!("Closed shared container {}", self.base.id());
        Ok(())
    }
}

/// Creates, opens and deletes shared containers
pub struct ContainerLifecycleOrchestrator {
    engine: Arc<dyn LogEngine>,
    fs: Arc<dyn FileSystem>,
    container: ContainerConfig,
    metadata: MetadataConfig,
}

struct ContainerPaths {
    data: PathBuf,
    metadata: PathBuf,
}

impl ContainerLifecycleOrchestrator {
    pub fn new(engine: Arc<dyn LogEngine>, fs: Arc<dyn FileSystem>, config: &Config) -> Result<Self> {
        config.container.validate()?;
        config.metadata.validate()?;
        Ok(Self {
            engine,
            fs,
            container: config.container.clone(),
            metadata: config.metadata.clone(),
        })
    }

    /// Path of the directory metadata file for a container data file
    #[must_use]
    pub fn metadata_path(&self, data: &Path) -> PathBuf {
        with_suffix(data, &self.container.metadata_suffix)
    }

    /// Path of the data file a location resolves to
    #[must_use]
    pub fn data_path(&self, location: &ContainerLocation) -> PathBuf {
        match location {
            ContainerLocation::Path(path) => path.clone(),
            ContainerLocation::Id(id) => self.container.default_directory.join(id.file_name()),
        }
    }

    fn paths(&self, location: &ContainerLocation) -> ContainerPaths {
        let data = self.data_path(location);
        let metadata = self.metadata_path(&data);
        ContainerPaths { data, metadata }
    }

    /// Remove a file, logging instead of failing
    async fn remove_quietly(&self, path: &Path) {
        if let Err(e) = delete_if_present(self.fs.as_ref(), path).await {
            warn!("Failed to remove {:?}: {}", path, e);
        }
    }

    /// Create a shared container able to hold `max_streams` streams
    pub async fn create_container(
        &self,
        location: &ContainerLocation,
        max_streams: u32,
    ) -> Result<ContainerId> {
        if max_streams == 0 {
            return Err(Error::invalid_argument("max_streams must be positive"));
        }

        let paths = self.paths(location);
        if self.fs.exists(&paths.data).await? {
            return Err(Self::already_exists(&paths));
        }

        let id = match location {
            ContainerLocation::Id(id) => {
                self.create_in_place(*id, &paths, max_streams).await?;
                *id
            }
            ContainerLocation::Path(_) => self.create_with_rename(&paths, max_streams).await?,
        };

        info!(
            "Created shared container {} at {:?} ({} streams)",
            id, paths.data, max_streams
        );
        Ok(id)
    }

    /// Build the directory next to a freshly created base container, then
    /// close both. The base container is closed even if the directory fails.
    async fn finish_build(
        &self,
        base: Arc<dyn BaseContainer>,
        metadata: &Path,
        max_streams: u32,
    ) -> Result<()> {
        let built = match SharedContainerDirectory::create(
            Arc::clone(&self.fs),
            metadata,
            max_streams,
            &self.metadata,
        )
        .await
        {
            Ok(directory) => {
                directory.close();
                Ok(())
            }
            Err(e) => Err(e),
        };
        let closed = base.close().await;
        built.and(closed)
    }

    async fn create_in_place(
        &self,
        id: ContainerId,
        paths: &ContainerPaths,
        max_streams: u32,
    ) -> Result<()> {
        let base = self
            .engine
            .create_container(&paths.data, id, max_streams)
            .await?;

        if let Err(e) = self.finish_build(base, &paths.metadata, max_streams).await {
            warn!("Failed to create container {}: {}", id, e);
            self.remove_quietly(&paths.metadata).await;
            if let Err(delete_err) = self.engine.delete_container(&paths.data).await {
                warn!("Failed to remove {:?}: {}", paths.data, delete_err);
            }
            return Err(e);
        }
        Ok(())
    }

    fn already_exists(paths: &ContainerPaths) -> Error {
        Error::already_exists(format!("container {} already exists", paths.data.display()))
    }

    /// Temporary data file of one create attempt: `<data>.<id><temp_suffix>`
    fn temp_data_path(&self, data: &Path, id: ContainerId) -> PathBuf {
        with_suffix(data, &format!(".{id}{}", self.container.temp_suffix))
    }

    /// Move the temporary metadata file to its final name. An existing
    /// metadata file is only replaced while no data file claims it.
    async fn move_metadata_into_place(
        &self,
        temp_metadata: &Path,
        paths: &ContainerPaths,
    ) -> Result<()> {
        if self.fs.exists(&paths.data).await? {
            return Err(Self::already_exists(paths));
        }
        match self.fs.rename(temp_metadata, &paths.metadata, false).await {
            Err(Error::Collision(_)) => {
                if self.fs.exists(&paths.data).await? {
                    return Err(Self::already_exists(paths));
                }
                debug!("Replacing stale metadata file {:?}", paths.metadata);
                self.fs.rename(temp_metadata, &paths.metadata, true).await
            }
            other => other,
        }
    }

    /// Report a failed rename as `AlreadyExists` when another creator has
    /// finished the container meanwhile
    async fn lost_race(&self, paths: &ContainerPaths, err: Error) -> Error {
        if err.is_already_exists() {
            return err;
        }
        match self.fs.exists(&paths.data).await {
            Ok(true) => Self::already_exists(paths),
            _ => err,
        }
    }

    /// Remove the temporary files of earlier attempts on `data`. Once the
    /// data file exists none of them can finish, so none is still needed.
    async fn sweep_stale_attempts(&self, data: &Path) {
        let (Some(parent), Some(name)) = (data.parent(), data.file_name()) else {
            return;
        };
        let prefix = format!("{}.", name.to_string_lossy());
        let candidates = match self.engine.enumerate_containers(parent).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Failed to look for stale attempts on {:?}: {}", data, e);
                return;
            }
        };

        for temp_data in candidates {
            let stale = temp_data.file_name().is_some_and(|file| {
                let file = file.to_string_lossy();
                file.starts_with(&prefix) && file.ends_with(&self.container.temp_suffix)
            });
            if stale {
                debug!("Removing stale create attempt {:?}", temp_data);
                self.remove_quietly(&self.metadata_path(&temp_data)).await;
                self.remove_quietly(&temp_data).await;
            }
        }
    }

    async fn create_with_rename(
        &self,
        paths: &ContainerPaths,
        max_streams: u32,
    ) -> Result<ContainerId> {
        // A fresh id per attempt gives every attempt its own temporary names
        let id = ContainerId::new();
        let temp_data = self.temp_data_path(&paths.data, id);
        let temp_metadata = self.metadata_path(&temp_data);

        let base = self
            .engine
            .create_container(&temp_data, id, max_streams)
            .await?;

        if let Err(e) = self.finish_build(base, &temp_metadata, max_streams).await {
            warn!("Failed to build container {:?}: {}", paths.data, e);
            self.remove_quietly(&temp_metadata).await;
            self.remove_quietly(&temp_data).await;
            return Err(self.lost_race(paths, e).await);
        }

        if let Err(e) = self.move_metadata_into_place(&temp_metadata, paths).await {
            warn!("Failed to move metadata of {:?} into place: {}", paths.data, e);
            self.remove_quietly(&temp_metadata).await;
            self.remove_quietly(&temp_data).await;
            return Err(self.lost_race(paths, e).await);
        }

        if let Err(e) = self.fs.rename(&temp_data, &paths.data, false).await {
            warn!("Failed to move container {:?} into place: {}", paths.data, e);
            self.remove_quietly(&temp_data).await;
            let e = self.lost_race(paths, e).await;
            // Once another creator owns the data file the metadata file is theirs
            if !e.is_already_exists() {
                self.remove_quietly(&paths.metadata).await;
            }
            return Err(e);
        }

        self.sweep_stale_attempts(&paths.data).await;
        Ok(id)
    }

    /// Open a shared container, invoking `on_entry` for every stream in
    /// its directory
    pub async fn open_container<F>(
        &self,
        location: &ContainerLocation,
        on_entry: F,
    ) -> Result<SharedContainer>
    where
        F: FnMut(&StreamEntry) -> Result<()> + Send,
    {
        let paths = self.paths(location);
        let base = self.engine.open_container(&paths.data).await?;

        let directory = match SharedContainerDirectory::open(
            Arc::clone(&self.fs),
            &paths.metadata,
            base.max_streams(),
            &self.metadata,
            on_entry,
        )
        .await
        {
            Ok(directory) => directory,
            Err(e) => {
                if let Err(close_err) = base.close().await {
                    warn!("Failed to close container {}: {}", base.id(), close_err);
                }
                return Err(e);
            }
        };

        info!(
            "Opened shared container {} at {:?}: {} of {} slots free",
            base.id(),
            paths.data,
            directory.free_slots(),
            directory.max_streams()
        );
        Ok(SharedContainer { base, directory })
    }

    /// Delete a shared container and every stream its directory records
    ///
    /// Per-stream failures are counted in the summary and do not fail the
    /// container delete.
    pub async fn delete_container(&self, location: &ContainerLocation) -> Result<DeleteSummary> {
        let paths = self.paths(location);

        let base = self.engine.open_container(&paths.data).await?;
        let container_id = base.id();
        let max_streams = base.max_streams();
        base.close().await?;

        let limit = Arc::new(Semaphore::new(self.container.stream_delete_concurrency));
        let mut deletes = JoinSet::new();
        let opened = SharedContainerDirectory::open(
            Arc::clone(&self.fs),
            &paths.metadata,
            max_streams,
            &self.metadata,
            |entry| {
                deletes.spawn(delete_stream(
                    Arc::clone(&self.engine),
                    Arc::clone(&self.fs),
                    Arc::clone(&limit),
                    container_id,
                    entry.clone(),
                    self.container.metadata_suffix.clone(),
                ));
                Ok(())
            },
        )
        .await;

        let mut result = match opened {
            Ok(directory) => directory.cleanup().await,
            Err(e) => {
                warn!(
                    "Directory of container {} unreadable, deleting without it: {}",
                    container_id, e
                );
                delete_if_present(self.fs.as_ref(), &paths.metadata).await
            }
        };
        if let Err(e) = self.engine.delete_container(&paths.data).await {
            result = result.and(Err(e));
        }

        let mut summary = DeleteSummary::default();
        while let Some(joined) = deletes.join_next().await {
            match joined {
                Ok(Ok(())) => summary.streams_deleted += 1,
                Ok(Err(_)) => summary.streams_failed += 1,
                Err(e) => {
                    warn!("Stream delete task of container {} failed: {}", container_id, e);
                    summary.streams_failed += 1;
                }
            }
        }

        result?;
        info!(
            "Deleted shared container {} at {:?}: {} streams deleted, {} failed",
            container_id, paths.data, summary.streams_deleted, summary.streams_failed
        );
        Ok(summary)
    }

    /// Data files of the fully created containers under `directory`
    pub async fn enumerate_containers(&self, directory: &Path) -> Result<Vec<PathBuf>> {
        let mut found = self.engine.enumerate_containers(directory).await?;
        found.retain(|path| {
            !path
                .as_os_str()
                .to_string_lossy()
                .ends_with(&self.container.temp_suffix)
        });
        found.sort();
        Ok(found)
    }
}

/// Delete one stream recorded in a container directory
async fn delete_stream(
    engine: Arc<dyn LogEngine>,
    fs: Arc<dyn FileSystem>,
    limit: Arc<Semaphore>,
    container: ContainerId,
    entry: StreamEntry,
    metadata_suffix: String,
) -> Result<()> {
    let _permit = limit.acquire_owned().await.map_err(|_| Error::Cancelled)?;

    let result = async {
        if let Some(path) = &entry.dedicated_path {
            delete_if_present(fs.as_ref(), path).await?;
            delete_if_present(fs.as_ref(), &with_suffix(path, &metadata_suffix)).await?;
        }
        engine.delete_stream(container, entry.stream_id).await
    }
    .await;

    match &result {
        Ok(()) => debug!("Deleted stream {} of container {}", entry.stream_id, container),
        Err(e) => warn!(
            "Failed to delete stream {} of container {}: {}",
            entry.stream_id, container, e
        ),
    }
    result
}
