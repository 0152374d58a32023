//! Repository traits describing module sources.

use std::io;

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use thiserror::Error;

use crate::domain::credentials::BearerToken;
use crate::domain::modules::{ArchiveRequest, ModuleCoordinate};

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("repository `{owner}/{container}` is not allowed")]
    Forbidden { owner: String, container: String },
    #[error("upstream responded with {status}: {message}")]
    Upstream { status: StatusCode, message: String },
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode upstream response: {0}")]
    Decode(String),
    #[error("archive stream failed: {0}")]
    Archive(#[source] io::Error),
    #[error("failed to write archive output: {0}")]
    Sink(#[source] io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ModuleError {
    pub fn forbidden(owner: impl Into<String>, container: impl Into<String>) -> Self {
        Self::Forbidden {
            owner: owner.into(),
            container: container.into(),
        }
    }

    pub fn upstream(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }

    /// Transport status this error should surface as, if it carries one.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            ModuleError::Forbidden { .. } => Some(StatusCode::FORBIDDEN),
            ModuleError::Upstream { status, .. } => Some(*status),
            ModuleError::Transport(_)
            | ModuleError::Decode(_)
            | ModuleError::Archive(_)
            | ModuleError::Sink(_)
            | ModuleError::Internal(_) => None,
        }
    }
}

/// Destination for archive bytes produced by a repository.
#[async_trait]
pub trait ArchiveSink: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()>;
}

#[async_trait]
impl ArchiveSink for Vec<u8> {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.extend_from_slice(&chunk);
        Ok(())
    }
}

/// Writes every chunk to a primary and a best-effort secondary sink.
///
/// Primary failures are returned to the caller. The first secondary failure is
/// recorded and the secondary is skipped from then on.
pub struct TeeSink<'a> {
    primary: &'a mut dyn ArchiveSink,
    secondary: &'a mut dyn ArchiveSink,
    secondary_error: Option<io::Error>,
}

impl<'a> TeeSink<'a> {
    pub fn new(primary: &'a mut dyn ArchiveSink, secondary: &'a mut dyn ArchiveSink) -> Self {
        Self {
            primary,
            secondary,
            secondary_error: None,
        }
    }

    pub fn take_secondary_error(&mut self) -> Option<io::Error> {
        self.secondary_error.take()
    }
}

#[async_trait]
impl ArchiveSink for TeeSink<'_> {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        self.primary.write_chunk(chunk.clone()).await?;
        if self.secondary_error.is_none()
            && let Err(err) = self.secondary.write_chunk(chunk).await
        {
            self.secondary_error = Some(err);
        }
        Ok(())
    }
}

/// A source of module versions and archives.
///
/// `credential` is the caller's bearer token; implementations that talk to an
/// authenticated upstream fall back to their own service credential when it is
/// `None`.
#[async_trait]
pub trait ModuleRepository: Send + Sync {
    async fn list_versions(
        &self,
        coordinate: &ModuleCoordinate,
        credential: Option<&BearerToken>,
    ) -> Result<Vec<String>, ModuleError>;

    async fn proxy_download(
        &self,
        request: &ArchiveRequest,
        credential: Option<&BearerToken>,
        sink: &mut dyn ArchiveSink,
    ) -> Result<(), ModuleError>;
}
