//! GitHub-backed module repository.
//!
//! Versions come from the repository tag listing; archives are the tag
//! tarball, rewritten so that the module directory becomes the archive root.

mod rewrite;

use std::io::{self, Read, Write};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use metrics::counter;
use reqwest::{Client, Response, header};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use crate::application::repos::{ArchiveSink, ModuleError, ModuleRepository};
use crate::config::GithubSettings;
use crate::domain::allow_list::AllowList;
use crate::domain::credentials::BearerToken;
use crate::domain::modules::{ArchiveRequest, ModuleCoordinate};
use crate::infra::error::InfraError;

pub use rewrite::{EntryFilter, rewrite_archive};

const API_VERSION: &str = "2022-11-28";
const MEDIA_TYPE: &str = "application/vnd.github+json";
const TAGS_PER_PAGE: usize = 100;
const CHUNK_SIZE: usize = 32 * 1024;
const CHUNK_QUEUE: usize = 8;
const METRIC_UPSTREAM_REQUESTS: &str = "tagport_upstream_requests_total";

#[derive(Debug, Deserialize)]
struct TagRecord {
    name: String,
}

#[derive(Debug, Clone)]
pub struct GithubRepository {
    client: Client,
    base_url: Url,
    token: Option<BearerToken>,
    allow_list: AllowList,
}

impl GithubRepository {
    pub fn new(settings: &GithubSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("tagport/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut base_url = settings.api_url.clone();
        if base_url.cannot_be_a_base() {
            return Err(InfraError::configuration(format!(
                "github api url `{base_url}` cannot be used as a base"
            )));
        }
        // Keep any path prefix (e.g. `/api/v3`) when appending segments.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            token: settings.token.clone(),
            allow_list: settings.allow_list.clone(),
        })
    }

    fn ensure_allowed(&self, coordinate: &ModuleCoordinate) -> Result<(), ModuleError> {
        if self
            .allow_list
            .permits(coordinate.owner(), coordinate.container())
        {
            Ok(())
        } else {
            Err(ModuleError::forbidden(
                coordinate.owner(),
                coordinate.container(),
            ))
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ModuleError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ModuleError::Internal("github api url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(
        &self,
        url: Url,
        endpoint: &'static str,
        credential: Option<&BearerToken>,
    ) -> Result<Response, ModuleError> {
        let mut request = self
            .client
            .get(url)
            .header(header::ACCEPT, MEDIA_TYPE)
            .header("X-GitHub-Api-Version", API_VERSION);
        // The caller's credential takes precedence over the service token.
        if let Some(token) = credential.or(self.token.as_ref()) {
            request = request.bearer_auth(token.expose());
        }

        counter!(METRIC_UPSTREAM_REQUESTS, "endpoint" => endpoint).increment(1);
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = match response.text().await {
                Ok(body) => body,
                Err(err) => err.to_string(),
            };
            debug!(%status, endpoint, "upstream request rejected");
            return Err(ModuleError::upstream(status, message));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModuleRepository for GithubRepository {
    #[instrument(skip_all, fields(module = %coordinate))]
    async fn list_versions(
        &self,
        coordinate: &ModuleCoordinate,
        credential: Option<&BearerToken>,
    ) -> Result<Vec<String>, ModuleError> {
        self.ensure_allowed(coordinate)?;

        let mut versions = Vec::new();
        let mut page = 1usize;
        loop {
            let mut url = self.endpoint(&[
                "repos",
                coordinate.owner(),
                coordinate.container(),
                "tags",
            ])?;
            url.query_pairs_mut()
                .append_pair("per_page", &TAGS_PER_PAGE.to_string())
                .append_pair("page", &page.to_string());

            let body = self.get(url, "tags", credential).await?.bytes().await?;
            let tags: Vec<TagRecord> = serde_json::from_slice(&body)
                .map_err(|err| ModuleError::Decode(format!("decoding tag listing: {err}")))?;

            versions.extend(
                tags.iter()
                    .filter_map(|tag| coordinate.version_from_tag(&tag.name))
                    .map(str::to_string),
            );

            if tags.len() < TAGS_PER_PAGE {
                break;
            }
            page += 1;
        }

        debug!(count = versions.len(), pages = page, "resolved module versions");
        Ok(versions)
    }

    #[instrument(skip_all, fields(archive = %request))]
    async fn proxy_download(
        &self,
        request: &ArchiveRequest,
        credential: Option<&BearerToken>,
        sink: &mut dyn ArchiveSink,
    ) -> Result<(), ModuleError> {
        let coordinate = request.coordinate();
        self.ensure_allowed(coordinate)?;

        let tag = request.tag();
        let mut segments = vec![
            "repos",
            coordinate.owner(),
            coordinate.container(),
            "tarball",
            "refs",
            "tags",
        ];
        segments.extend(tag.split('/'));
        let url = self.endpoint(&segments)?;
        let response = self.get(url, "tarball", credential).await?;

        let body = StreamReader::new(Box::pin(response.bytes_stream().map_err(io::Error::other)));
        restream(SyncIoBridge::new(body), EntryFilter::new(coordinate), sink).await
    }
}

/// Rewrite `source` on a blocking worker and forward the result to `sink`.
///
/// tar and flate2 are blocking; chunks cross back over a bounded channel so
/// the archive is never held in memory. The worker stops at its next read
/// once this future is dropped or the sink fails.
async fn restream<R>(
    source: R,
    filter: EntryFilter,
    sink: &mut dyn ArchiveSink,
) -> Result<(), ModuleError>
where
    R: Read + Send + 'static,
{
    let cancel = CancellationToken::new();
    let _stop_worker = cancel.clone().drop_guard();
    let source = CancellableReader {
        inner: source,
        cancel: cancel.clone(),
    };
    let (tx, mut rx) = mpsc::channel::<Bytes>(CHUNK_QUEUE);

    let worker = task::spawn_blocking(move || {
        let mut writer = rewrite_archive(source, ChunkWriter::new(tx), &filter)?;
        writer.flush()
    });

    let mut sink_error = None;
    while let Some(chunk) = rx.recv().await {
        if let Err(err) = sink.write_chunk(chunk).await {
            sink_error = Some(err);
            cancel.cancel();
            break;
        }
    }
    drop(rx);

    let outcome = worker
        .await
        .map_err(|err| ModuleError::Internal(format!("archive worker failed: {err}")))?;
    if let Some(err) = sink_error {
        return Err(ModuleError::Sink(err));
    }
    outcome.map_err(ModuleError::Archive)
}

struct CancellableReader<R> {
    inner: R,
    cancel: CancellationToken,
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "archive download cancelled",
            ));
        }
        self.inner.read(buf)
    }
}

/// Buffers blocking writes into chunks handed to an async consumer.
struct ChunkWriter {
    tx: mpsc::Sender<Bytes>,
    buffer: BytesMut,
}

impl ChunkWriter {
    fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            buffer: BytesMut::with_capacity(CHUNK_SIZE),
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = self.buffer.split().freeze();
        self.tx
            .blocking_send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive consumer went away"))
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}
