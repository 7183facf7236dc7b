//! Block-oriented file access
//!
//! The metadata structures never touch the filesystem directly. They go
//! through [`FileSystem`] and [`BlockFile`], which keeps them testable and
//! lets a caller substitute a different backing store.
//!
//! [`LocalFileSystem`] is the production implementation: positional
//! reads and writes on regular files, run on the blocking thread pool so
//! no async worker is held while the kernel services the request.

use async_trait::async_trait;
use bytes::Bytes;
use overlog_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A file addressed by byte offset
#[async_trait]
pub trait BlockFile: Send + Sync {
    /// Path the file was opened with
    fn path(&self) -> &Path;

    /// Current file size in bytes
    async fn size(&self) -> Result<u64>;

    /// Grow or shrink the file
    async fn set_size(&self, size: u64) -> Result<()>;

    /// Read exactly `len` bytes at `offset`
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes>;

    /// Write all of `data` at `offset`
    async fn write_at(&self, offset: u64, data: Bytes) -> Result<()>;

    /// Flush data and metadata to stable storage
    async fn sync(&self) -> Result<()>;
}

/// Namespace operations on block files
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Create a file that must not already exist
    async fn create_new(&self, path: &Path) -> Result<Arc<dyn BlockFile>>;

    /// Open a file that must already exist
    async fn open_existing(&self, path: &Path) -> Result<Arc<dyn BlockFile>>;

    /// Delete a file
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Rename `from` to `to`
    ///
    /// When `replace` is false and `to` exists the call fails with
    /// [`Error::Collision`] and `from` is left in place.
    async fn rename(&self, from: &Path, to: &Path, replace: bool) -> Result<()>;

    /// Check whether a file exists
    async fn exists(&self, path: &Path) -> Result<bool>;
}

/// Map an I/O error on `path` into the overlog taxonomy
fn map_io_error(err: std::io::Error, path: &Path) -> Error {
    match err.kind() {
        std::io::ErrorKind::NotFound => Error::not_found(path.display().to_string()),
        std::io::ErrorKind::AlreadyExists => Error::already_exists(path.display().to_string()),
        _ => Error::from(err),
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::internal(format!("blocking I/O task failed: {e}")))?
}

/// Regular file on the local filesystem
#[derive(Debug)]
pub struct LocalFile {
    file: Arc<File>,
    path: PathBuf,
}

impl LocalFile {
    fn new(file: File, path: &Path) -> Self {
        Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
        }
    }
}

#[async_trait]
impl BlockFile for LocalFile {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn size(&self) -> Result<u64> {
        let file = Arc::clone(&self.file);
        run_blocking(move || Ok(file.metadata()?.len())).await
    }

    async fn set_size(&self, size: u64) -> Result<()> {
        let file = Arc::clone(&self.file);
        run_blocking(move || Ok(file.set_len(size)?)).await
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        let file = Arc::clone(&self.file);
        run_blocking(move || {
            let mut buf = vec![0u8; len];
            file.read_exact_at(&mut buf, offset)?;
            Ok(Bytes::from(buf))
        })
        .await
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> Result<()> {
        let file = Arc::clone(&self.file);
        run_blocking(move || Ok(file.write_all_at(&data, offset)?)).await
    }

    async fn sync(&self) -> Result<()> {
        let file = Arc::clone(&self.file);
        run_blocking(move || Ok(file.sync_all()?)).await
    }
}

/// [`FileSystem`] backed by the local filesystem
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn create_new(&self, path: &Path) -> Result<Arc<dyn BlockFile>> {
        let path = path.to_path_buf();
        run_blocking(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
                .map_err(|e| map_io_error(e, &path))?;
            debug!("Created block file {:?}", path);
            Ok(Arc::new(LocalFile::new(file, &path)) as Arc<dyn BlockFile>)
        })
        .await
    }

    async fn open_existing(&self, path: &Path) -> Result<Arc<dyn BlockFile>> {
        let path = path.to_path_buf();
        run_blocking(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| map_io_error(e, &path))?;
            Ok(Arc::new(LocalFile::new(file, &path)) as Arc<dyn BlockFile>)
        })
        .await
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| map_io_error(e, path))
    }

    async fn rename(&self, from: &Path, to: &Path, replace: bool) -> Result<()> {
        if replace {
            return tokio::fs::rename(from, to)
                .await
                .map_err(|e| map_io_error(e, from));
        }

        // link(2) refuses an existing target atomically; the source name
        // is dropped only once the new name is in place.
        let (from, to) = (from.to_path_buf(), to.to_path_buf());
        run_blocking(move || {
            std::fs::hard_link(&from, &to).map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    Error::collision(format!("{} already exists", to.display()))
                }
                _ => map_io_error(e, &from),
            })?;
            std::fs::remove_file(&from).map_err(|e| map_io_error(e, &from))
        })
        .await
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_local_file_create_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.dat");
        let fs = LocalFileSystem::new();

        let file = fs.create_new(&path).await.unwrap();
        file.set_size(8192).await.unwrap();
        file.write_at(4096, Bytes::from_static(b"test data pattern"))
            .await
            .unwrap();
        file.sync().await.unwrap();
        assert_eq!(file.size().await.unwrap(), 8192);
        drop(file);

        let file = fs.open_existing(&path).await.unwrap();
        let data = file.read_at(4096, 17).await.unwrap();
        assert_eq!(&data[..], b"test data pattern");
    }

    #[tokio::test]
    async fn test_create_new_rejects_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.dat");
        let fs = LocalFileSystem::new();

        fs.create_new(&path).await.unwrap();
        let err = fs.create_new(&path).await.err().unwrap();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_open_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let err = fs
            .open_existing(&dir.path().join("missing"))
            .await
            .err()
            .unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let file = fs.create_new(&dir.path().join("short")).await.unwrap();
        file.set_size(100).await.unwrap();
        assert!(file.read_at(0, 4096).await.is_err());
    }

    #[tokio::test]
    async fn test_rename_without_replace() {
        let dir = tempdir().unwrap();
        let fs = LocalFileSystem::new();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs.create_new(&a).await.unwrap();
        fs.create_new(&b).await.unwrap();

        let err = fs.rename(&a, &b, false).await.err().unwrap();
        assert!(matches!(err, Error::Collision(_)));
        assert!(fs.exists(&a).await.unwrap());

        fs.rename(&a, &b, true).await.unwrap();
        assert!(!fs.exists(&a).await.unwrap());
        assert!(fs.exists(&b).await.unwrap());

        let c = dir.path().join("c");
        fs.rename(&b, &c, false).await.unwrap();
        assert!(!fs.exists(&b).await.unwrap());
        assert!(fs.exists(&c).await.unwrap());
    }
}
