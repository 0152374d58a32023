use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::{Compression, write::GzEncoder};
use httpmock::MockServer;
use url::Url;

use tagport::application::repos::{ModuleError, ModuleRepository};
use tagport::cache::{ArchiveReader, ArchiveStore, CachedRepository, PendingArchive, TtlCache};
use tagport::config::GithubSettings;
use tagport::domain::allow_list::AllowList;
use tagport::domain::modules::{ArchiveRequest, ModuleCoordinate};
use tagport::infra::archive_store::DirectoryArchiveStore;
use tagport::infra::github::GithubRepository;

const TARBALL_PATH: &str = "/repos/acme/infra/tarball/refs/tags/network/1.1.0";

struct UnwritableStore;

#[async_trait]
impl ArchiveStore for UnwritableStore {
    async fn open(&self, _name: &str) -> io::Result<ArchiveReader> {
        Err(io::Error::new(io::ErrorKind::NotFound, "empty"))
    }

    async fn create(&self, _name: &str) -> io::Result<Box<dyn PendingArchive>> {
        Err(io::Error::new(io::ErrorKind::StorageFull, "disk full"))
    }
}

fn github(server: &MockServer) -> GithubRepository {
    GithubRepository::new(&GithubSettings {
        api_url: Url::parse(&server.base_url()).expect("mock url"),
        token: None,
        timeout: Duration::from_secs(5),
        allow_list: AllowList::allow_all(),
    })
    .expect("repository")
}

fn upstream_tarball() -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in [
        ("acme-infra-abc1234/network/main.tf", "module body"),
        ("acme-infra-abc1234/network/outputs.tf", "output \"id\" {}"),
        ("acme-infra-abc1234/storage/main.tf", "other module"),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .expect("append");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip")
}

fn request() -> ArchiveRequest {
    let coordinate = ModuleCoordinate::new("acme", "infra", "network").expect("coordinate");
    ArchiveRequest::new(coordinate, "1.1.0").expect("request")
}

async fn download(repository: &dyn ModuleRepository) -> Result<Vec<u8>, ModuleError> {
    let mut sink: Vec<u8> = Vec::new();
    repository.proxy_download(&request(), None, &mut sink).await?;
    Ok(sink)
}

#[tokio::test(flavor = "multi_thread")]
async fn archives_are_identical_with_and_without_cache() {
    let server = MockServer::start_async().await;
    let body = upstream_tarball();

    // Uncached.
    let plain = server
        .mock_async(|when, then| {
            when.method("GET").path(TARBALL_PATH);
            then.status(200).body(body.clone());
        })
        .await;
    let expected = download(&github(&server)).await.expect("uncached download");
    assert!(!expected.is_empty());
    plain.assert_async().await;
    plain.delete_async().await;

    // Cached: the second download never reaches upstream.
    let cached_mock = server
        .mock_async(|when, then| {
            when.method("GET").path(TARBALL_PATH);
            then.status(200).body(body.clone());
        })
        .await;
    let dir = tempfile::tempdir().expect("tempdir");
    let cached = CachedRepository::new(
        github(&server),
        Arc::new(TtlCache::<String, Vec<String>>::new(None)),
        Arc::new(DirectoryArchiveStore::new(dir.path()).expect("store")),
    );
    let first = download(&cached).await.expect("cold download");
    let second = download(&cached).await.expect("warm download");
    assert_eq!(first, expected);
    assert_eq!(second, expected);
    cached_mock.assert_async().await;
    cached_mock.delete_async().await;

    // Failing store: every download goes upstream and still succeeds.
    let failing_mock = server
        .mock_async(|when, then| {
            when.method("GET").path(TARBALL_PATH);
            then.status(200).body(body.clone());
        })
        .await;
    let failing = CachedRepository::new(
        github(&server),
        Arc::new(TtlCache::<String, Vec<String>>::new(None)),
        Arc::new(UnwritableStore),
    );
    assert_eq!(download(&failing).await.expect("download"), expected);
    failing_mock.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn upstream_errors_are_not_cached() {
    let server = MockServer::start_async().await;
    let missing = server
        .mock_async(|when, then| {
            when.method("GET").path(TARBALL_PATH);
            then.status(404).body("{\"message\":\"Not Found\"}");
        })
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let cached = CachedRepository::new(
        github(&server),
        Arc::new(TtlCache::<String, Vec<String>>::new(None)),
        Arc::new(DirectoryArchiveStore::new(dir.path()).expect("store")),
    );

    let err = download(&cached).await.expect_err("not found");
    assert!(matches!(err, ModuleError::Upstream { .. }));
    missing.assert_async().await;
    assert_eq!(
        std::fs::read_dir(dir.path()).expect("read dir").count(),
        0,
        "no archive should be left behind"
    );
}
