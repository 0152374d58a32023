//! Read-through caching in front of any [`ModuleRepository`].
//!
//! Cache faults never fail a request: they are logged, counted and treated as
//! a miss. Upstream errors pass through unchanged and are never cached.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use metrics::counter;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::application::repos::{ArchiveSink, ModuleError, ModuleRepository, TeeSink};
use crate::domain::allow_list::AllowList;
use crate::domain::credentials::BearerToken;
use crate::domain::modules::{ArchiveRequest, ModuleCoordinate};

use super::archives::{ArchiveReader, ArchiveStore};
use super::ttl::{Expiration, VersionStore};

const METRIC_VERSIONS_HIT: &str = "tagport_cache_versions_hit_total";
const METRIC_VERSIONS_MISS: &str = "tagport_cache_versions_miss_total";
const METRIC_ARCHIVE_HIT: &str = "tagport_cache_archive_hit_total";
const METRIC_ARCHIVE_MISS: &str = "tagport_cache_archive_miss_total";
const METRIC_CACHE_FAULT: &str = "tagport_cache_fault_total";

pub struct CachedRepository<R> {
    inner: R,
    versions: Arc<dyn VersionStore>,
    archives: Arc<dyn ArchiveStore>,
    allow_list: AllowList,
}

impl<R> CachedRepository<R>
where
    R: ModuleRepository,
{
    pub fn new(inner: R, versions: Arc<dyn VersionStore>, archives: Arc<dyn ArchiveStore>) -> Self {
        Self {
            inner,
            versions,
            archives,
            allow_list: AllowList::allow_all(),
        }
    }

    /// Refuse cache hits for coordinates the allow-list does not permit.
    pub fn with_allow_list(mut self, allow_list: AllowList) -> Self {
        self.allow_list = allow_list;
        self
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

    async fn download_uncached(
        &self,
        request: &ArchiveRequest,
        credential: Option<&BearerToken>,
        sink: &mut dyn ArchiveSink,
        filename: &str,
    ) -> Result<(), ModuleError> {
        let mut pending = match self.archives.create(filename).await {
            Ok(pending) => pending,
            Err(err) => {
                record_fault("create", filename, &err);
                return self.inner.proxy_download(request, credential, sink).await;
            }
        };

        let (result, cache_error) = {
            let mut tee = TeeSink::new(sink, pending.sink());
            let result = self.inner.proxy_download(request, credential, &mut tee).await;
            (result, tee.take_secondary_error())
        };

        match (&result, cache_error) {
            (Ok(()), None) => {
                if let Err(err) = pending.commit().await {
                    record_fault("commit", filename, &err);
                }
            }
            (Ok(()), Some(err)) => record_fault("write", filename, &err),
            // Dropping the pending entry discards the partial archive.
            (Err(_), _) => {}
        }

        result
    }
}

#[async_trait]
impl<R> ModuleRepository for CachedRepository<R>
where
    R: ModuleRepository,
{
    async fn list_versions(
        &self,
        coordinate: &ModuleCoordinate,
        credential: Option<&BearerToken>,
    ) -> Result<Vec<String>, ModuleError> {
        self.ensure_allowed(coordinate)?;

        let key = coordinate.cache_key();
        if let Some(versions) = self.versions.get(&key) {
            counter!(METRIC_VERSIONS_HIT).increment(1);
            debug!(key = %key, "version list served from cache");
            return Ok(versions);
        }
        counter!(METRIC_VERSIONS_MISS).increment(1);

        let versions = self.inner.list_versions(coordinate, credential).await?;
        self.versions
            .set(key, versions.clone(), Expiration::Default);
        Ok(versions)
    }

    async fn proxy_download(
        &self,
        request: &ArchiveRequest,
        credential: Option<&BearerToken>,
        sink: &mut dyn ArchiveSink,
    ) -> Result<(), ModuleError> {
        self.ensure_allowed(request.coordinate())?;

        let filename = request.archive_filename();
        match self.archives.open(&filename).await {
            Ok(reader) => {
                counter!(METRIC_ARCHIVE_HIT).increment(1);
                debug!(archive = %request, filename = %filename, "archive served from cache");
                // A failed copy has already written to the sink, so there is
                // no upstream fallback here.
                return copy_cached(reader, sink).await;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(archive = %request, filename = %filename, "archive not cached");
            }
            Err(err) => record_fault("open", &filename, &err),
        }
        counter!(METRIC_ARCHIVE_MISS).increment(1);

        self.download_uncached(request, credential, sink, &filename)
            .await
    }
}

async fn copy_cached(reader: ArchiveReader, sink: &mut dyn ArchiveSink) -> Result<(), ModuleError> {
    let mut chunks = ReaderStream::new(reader);
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(ModuleError::Archive)?;
        sink.write_chunk(chunk).await.map_err(ModuleError::Sink)?;
    }
    Ok(())
}

fn record_fault(op: &'static str, filename: &str, error: &io::Error) {
    counter!(METRIC_CACHE_FAULT).increment(1);
    warn!(
        target = "tagport::cache",
        op,
        filename,
        error = %error,
        "archive cache fault; continuing without cache"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::http::StatusCode;
    use bytes::Bytes;

    use super::*;
    use crate::cache::archives::PendingArchive;
    use crate::cache::ttl::TtlCache;
    use crate::infra::archive_store::DirectoryArchiveStore;

    const ARCHIVE: &[u8] = b"archive-bytes";

    #[derive(Default)]
    struct CountingRepository {
        list_calls: AtomicUsize,
        download_calls: AtomicUsize,
        fail_downloads: bool,
    }

    #[async_trait]
    impl ModuleRepository for CountingRepository {
        async fn list_versions(
            &self,
            coordinate: &ModuleCoordinate,
            _credential: Option<&BearerToken>,
        ) -> Result<Vec<String>, ModuleError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if coordinate.module() == "missing" {
                return Err(ModuleError::upstream(StatusCode::NOT_FOUND, "Not Found"));
            }
            Ok(vec![
                format!("{}.{}.1.0.0", coordinate.container(), coordinate.module()),
                "2.0.0".to_string(),
            ])
        }

        async fn proxy_download(
            &self,
            _request: &ArchiveRequest,
            _credential: Option<&BearerToken>,
            sink: &mut dyn ArchiveSink,
        ) -> Result<(), ModuleError> {
            self.download_calls.fetch_add(1, Ordering::SeqCst);
            sink.write_chunk(Bytes::from_static(&ARCHIVE[..7]))
                .await
                .map_err(ModuleError::Sink)?;
            if self.fail_downloads {
                return Err(ModuleError::upstream(StatusCode::BAD_GATEWAY, "reset"));
            }
            sink.write_chunk(Bytes::from_static(&ARCHIVE[7..]))
                .await
                .map_err(ModuleError::Sink)
        }
    }

    struct TruncatedStore;

    #[async_trait]
    impl ArchiveStore for TruncatedStore {
        async fn open(&self, _name: &str) -> io::Result<ArchiveReader> {
            let chunks = futures::stream::iter(vec![
                Ok::<Bytes, io::Error>(Bytes::from_static(b"part")),
                Err(io::Error::other("disk read failed")),
            ]);
            Ok(Box::new(tokio_util::io::StreamReader::new(chunks)))
        }

        async fn create(&self, _name: &str) -> io::Result<Box<dyn PendingArchive>> {
            Err(io::Error::other("read-only store"))
        }
    }

    fn coordinate(module: &str) -> ModuleCoordinate {
        ModuleCoordinate::new("acme", "infra", module).expect("coordinate")
    }

    fn request() -> ArchiveRequest {
        ArchiveRequest::new(coordinate("network"), "1.0.0").expect("request")
    }

    fn cached(
        inner: CountingRepository,
        dir: &std::path::Path,
    ) -> CachedRepository<CountingRepository> {
        CachedRepository::new(
            inner,
            Arc::new(TtlCache::<String, Vec<String>>::new(Some(Duration::from_secs(10)))),
            Arc::new(DirectoryArchiveStore::new(dir).expect("store")),
        )
    }

    #[tokio::test]
    async fn version_list_is_fetched_once_within_ttl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = cached(CountingRepository::default(), dir.path());

        let first = repo.list_versions(&coordinate("network"), None).await.expect("first");
        let second = repo.list_versions(&coordinate("network"), None).await.expect("second");

        assert_eq!(first, second);
        assert_eq!(repo.inner.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn upstream_errors_are_not_cached() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = cached(CountingRepository::default(), dir.path());

        for _ in 0..2 {
            let err = repo
                .list_versions(&coordinate("missing"), None)
                .await
                .expect_err("upstream error");
            assert_eq!(err.status_code(), Some(StatusCode::NOT_FOUND));
        }
        assert_eq!(repo.inner.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn archive_is_served_from_cache_after_first_download() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = cached(CountingRepository::default(), dir.path());

        let mut first: Vec<u8> = Vec::new();
        repo.proxy_download(&request(), None, &mut first).await.expect("first");
        let mut second: Vec<u8> = Vec::new();
        repo.proxy_download(&request(), None, &mut second).await.expect("second");

        assert_eq!(first, ARCHIVE);
        assert_eq!(second, ARCHIVE);
        assert_eq!(repo.inner.download_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_download_is_not_committed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = cached(
            CountingRepository {
                fail_downloads: true,
                ..CountingRepository::default()
            },
            dir.path(),
        );

        for _ in 0..2 {
            let mut sink: Vec<u8> = Vec::new();
            let err = repo
                .proxy_download(&request(), None, &mut sink)
                .await
                .expect_err("upstream failure");
            assert_eq!(err.status_code(), Some(StatusCode::BAD_GATEWAY));
        }
        assert_eq!(repo.inner.download_calls.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read_dir(dir.path()).expect("dir").count(), 0);
    }

    #[tokio::test]
    async fn allow_list_applies_to_cache_hits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = cached(CountingRepository::default(), dir.path());
        repo.list_versions(&coordinate("network"), None).await.expect("warm");

        let repo = CachedRepository {
            allow_list: "globex:tools".parse().expect("allow list"),
            ..repo
        };
        let err = repo
            .list_versions(&coordinate("network"), None)
            .await
            .expect_err("forbidden");
        assert_eq!(err.status_code(), Some(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn hyphenated_coordinates_keep_separate_version_lists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = cached(CountingRepository::default(), dir.path());
        let left = ModuleCoordinate::new("acme", "infra-net", "work").expect("coordinate");
        let right = ModuleCoordinate::new("acme", "infra", "net-work").expect("coordinate");

        let first = repo.list_versions(&left, None).await.expect("left");
        let second = repo.list_versions(&right, None).await.expect("right");

        assert_eq!(first[0], "infra-net.work.1.0.0");
        assert_eq!(second[0], "infra.net-work.1.0.0");
        assert_eq!(repo.inner.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cached_archive_read_failure_is_not_retried_upstream() {
        let repo = CachedRepository::new(
            CountingRepository::default(),
            Arc::new(TtlCache::<String, Vec<String>>::new(None)),
            Arc::new(TruncatedStore),
        );

        let mut sink: Vec<u8> = Vec::new();
        let err = repo
            .proxy_download(&request(), None, &mut sink)
            .await
            .expect_err("cached read failure");

        assert!(matches!(err, ModuleError::Archive(_)));
        assert_eq!(sink, b"part");
        assert_eq!(repo.inner.download_calls.load(Ordering::SeqCst), 0);
    }
}
