//! Filesystem-backed archive storage for the module cache.

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempPath;
use tokio::{fs, io::AsyncWriteExt, task};

use crate::application::repos::ArchiveSink;
use crate::cache::archives::{ArchiveReader, ArchiveStore, PendingArchive};

/// Stores each archive as one file directly under `root`.
///
/// Writes go to a hidden temp file in the same directory and are renamed into
/// place on commit, so readers never observe a partially written archive.
#[derive(Debug, Clone)]
pub struct DirectoryArchiveStore {
    root: PathBuf,
}

impl DirectoryArchiveStore {
    /// Initialise storage rooted at the provided directory, creating it if necessary.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Archive names must be a single plain path component.
    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(name)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid archive name `{name}`"),
            )),
        }
    }
}

#[async_trait]
impl ArchiveStore for DirectoryArchiveStore {
    async fn open(&self, name: &str) -> io::Result<ArchiveReader> {
        let path = self.resolve(name)?;
        let file = fs::File::open(path).await?;
        Ok(Box::new(file))
    }

    async fn create(&self, name: &str) -> io::Result<Box<dyn PendingArchive>> {
        let target = self.resolve(name)?;
        let root = self.root.clone();
        let temp = task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(".partial-")
                .tempfile_in(root)
        })
        .await
        .map_err(io::Error::other)??;

        let (file, temp_path) = temp.into_parts();
        Ok(Box::new(DirectoryPendingArchive {
            file: fs::File::from_std(file),
            temp_path,
            target,
        }))
    }
}

struct DirectoryPendingArchive {
    file: fs::File,
    temp_path: TempPath,
    target: PathBuf,
}

#[async_trait]
impl ArchiveSink for DirectoryPendingArchive {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.file.write_all(&chunk).await
    }
}

#[async_trait]
impl PendingArchive for DirectoryPendingArchive {
    fn sink(&mut self) -> &mut dyn ArchiveSink {
        self
    }

    async fn commit(self: Box<Self>) -> io::Result<()> {
        let DirectoryPendingArchive {
            mut file,
            temp_path,
            target,
        } = *self;
        file.flush().await?;
        file.sync_data().await?;
        drop(file);

        task::spawn_blocking(move || temp_path.persist(&target))
            .await
            .map_err(io::Error::other)?
            .map_err(|err| err.error)
    }
}
