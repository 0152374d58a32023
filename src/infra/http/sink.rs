use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::application::repos::ArchiveSink;

/// Forwards archive chunks to a response body over a bounded channel.
pub(super) struct ChannelSink {
    tx: mpsc::Sender<io::Result<Bytes>>,
    started: bool,
}

impl ChannelSink {
    pub(super) fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self { tx, started: false }
    }

    /// Whether any bytes have been handed to the response.
    pub(super) fn started(&self) -> bool {
        self.started
    }

    /// Terminate a body that is already streaming so the client sees a
    /// truncated transfer instead of a clean end of stream.
    pub(super) async fn abort(self, error: impl std::fmt::Display) {
        let _ = self.tx.send(Err(io::Error::other(error.to_string()))).await;
    }
}

#[async_trait]
impl ArchiveSink for ChannelSink {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))?;
        self.started = true;
        Ok(())
    }
}

/// Aborts the wrapped task when dropped.
pub(super) struct AbortOnDrop<T>(pub(super) JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
