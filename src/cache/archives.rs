//! Storage capability for cached module archives.

use std::io;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::application::repos::ArchiveSink;

pub type ArchiveReader = Box<dyn AsyncRead + Send + Unpin>;

/// An archive being written. Bytes become visible under the final name only
/// after [`PendingArchive::commit`]; dropping the entry discards them.
#[async_trait]
pub trait PendingArchive: Send {
    fn sink(&mut self) -> &mut dyn ArchiveSink;

    async fn commit(self: Box<Self>) -> io::Result<()>;
}

/// Named blob storage for archives. Entries are immutable once committed.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn open(&self, name: &str) -> io::Result<ArchiveReader>;

    async fn create(&self, name: &str) -> io::Result<Box<dyn PendingArchive>>;
}
