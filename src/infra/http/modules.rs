//! Terraform module registry protocol handlers.

use std::io;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::application::error::HttpError;
use crate::application::repos::ModuleRepository;
use crate::application::tokens::TokenCodec;
use crate::domain::credentials::BearerToken;
use crate::domain::modules::{ArchiveRequest, ModuleCoordinate};

use super::middleware::{log_responses, set_request_id};
use super::sink::{AbortOnDrop, ChannelSink};

const TERRAFORM_GET: &str = "x-terraform-get";
const MODULES_PREFIX: &str = "/v1/modules/";
const PROXY_QUEUE: usize = 8;

#[derive(Clone)]
pub struct HttpState {
    pub repository: Arc<dyn ModuleRepository>,
    pub tokens: TokenCodec,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/.well-known/terraform.json", get(service_discovery))
        .route(
            "/v1/modules/{namespace}/{name}/{system}/versions",
            get(list_versions),
        )
        .route(
            "/v1/modules/{namespace}/{name}/{system}/{version}/download",
            get(download_url),
        )
        .route(
            "/v1/modules/{namespace}/{name}/{system}/{version}/proxy",
            get(proxy_download),
        )
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_id))
}

#[derive(Debug, Deserialize)]
struct ModulePath {
    namespace: String,
    name: String,
    system: String,
}

impl ModulePath {
    /// The registry's `system` segment names the GitHub owner and its
    /// `namespace` names the repository.
    fn coordinate(self) -> Result<ModuleCoordinate, HttpError> {
        ModuleCoordinate::new(self.system, self.namespace, self.name).map_err(HttpError::from)
    }
}

#[derive(Debug, Deserialize)]
struct VersionPath {
    namespace: String,
    name: String,
    system: String,
    version: String,
}

impl VersionPath {
    fn archive_request(self) -> Result<ArchiveRequest, HttpError> {
        let coordinate = ModulePath {
            namespace: self.namespace,
            name: self.name,
            system: self.system,
        }
        .coordinate()?;
        ArchiveRequest::new(coordinate, self.version).map_err(HttpError::from)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProxyQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct VersionsResponse {
    modules: Vec<ModuleVersions>,
}

#[derive(Debug, Serialize)]
struct ModuleVersions {
    versions: Vec<VersionEntry>,
}

#[derive(Debug, Serialize)]
struct VersionEntry {
    version: String,
}

#[derive(Debug, Serialize)]
struct ServiceDiscovery {
    #[serde(rename = "modules.v1")]
    modules_v1: &'static str,
}

async fn service_discovery() -> Json<ServiceDiscovery> {
    Json(ServiceDiscovery {
        modules_v1: MODULES_PREFIX,
    })
}

fn bearer_from(headers: &HeaderMap) -> Option<BearerToken> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(BearerToken::from_authorization)
}

async fn list_versions(
    State(state): State<HttpState>,
    Path(path): Path<ModulePath>,
    headers: HeaderMap,
) -> Result<Json<VersionsResponse>, HttpError> {
    let coordinate = path.coordinate()?;
    let credential = bearer_from(&headers);

    let versions = state
        .repository
        .list_versions(&coordinate, credential.as_ref())
        .await?;

    Ok(Json(VersionsResponse {
        modules: vec![ModuleVersions {
            versions: versions
                .into_iter()
                .map(|version| VersionEntry { version })
                .collect(),
        }],
    }))
}

async fn download_url(
    State(state): State<HttpState>,
    Path(path): Path<VersionPath>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    let request = path.archive_request()?;

    let mut location = String::from("./proxy?archive=tar.gz");
    if let Some(credential) = bearer_from(&headers) {
        let token = state.tokens.encode(&credential)?;
        location.push_str("&token=");
        location.push_str(&token);
    }

    debug!(archive = %request, "issued download location");
    Ok((StatusCode::NO_CONTENT, [(TERRAFORM_GET, location)]).into_response())
}

/// Stream the archive. The status is settled by the first chunk: errors
/// before any output map to an error response, errors after it truncate the
/// body.
async fn proxy_download(
    State(state): State<HttpState>,
    Path(path): Path<VersionPath>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    let request = path.archive_request()?;

    // A token in the URL supersedes the Authorization header.
    let credential = match query.token.as_deref().filter(|token| !token.is_empty()) {
        Some(token) => Some(state.tokens.decode(token)?),
        None => bearer_from(&headers),
    };

    let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(PROXY_QUEUE);
    let repository = Arc::clone(&state.repository);
    let mut task = AbortOnDrop(tokio::spawn(async move {
        let mut sink = ChannelSink::new(tx);
        let result = repository
            .proxy_download(&request, credential.as_ref(), &mut sink)
            .await;
        if let Err(err) = &result
            && sink.started()
        {
            sink.abort(err).await;
        }
        result
    }));

    match rx.recv().await {
        Some(Ok(first)) => {
            let body = async_stream::stream! {
                let _task = task;
                yield Ok::<Bytes, io::Error>(first);
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok((
                [(header::CONTENT_TYPE, "application/gzip")],
                Body::from_stream(body),
            )
                .into_response())
        }
        Some(Err(err)) => Err(HttpError::from_error(
            "infra::http::modules::proxy_download",
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal server error",
            &err,
        )),
        None => match (&mut task.0).await {
            Ok(Ok(())) => Ok(([(header::CONTENT_TYPE, "application/gzip")], Body::empty())
                .into_response()),
            Ok(Err(err)) => Err(err.into()),
            Err(err) => Err(HttpError::from_error(
                "infra::http::modules::proxy_download",
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error",
                &err,
            )),
        },
    }
}
