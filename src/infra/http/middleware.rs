use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_REQUEST_ID_LEN: usize = 128;

/// Correlation id for one registry request, echoed on the response.
#[derive(Clone)]
pub struct RequestId(HeaderValue);

impl RequestId {
    /// Reuse a caller-supplied id when it is short printable ASCII, otherwise
    /// mint a fresh one.
    fn for_request(request: &Request<Body>) -> Self {
        request
            .headers()
            .get(REQUEST_ID_HEADER)
            .filter(|value| is_acceptable_id(value.as_bytes()))
            .cloned()
            .map(Self)
            .unwrap_or_else(Self::generate)
    }

    fn generate() -> Self {
        let id = Uuid::new_v4().to_string();
        match HeaderValue::from_str(&id) {
            Ok(value) => Self(value),
            Err(_) => Self(HeaderValue::from_static("unknown")),
        }
    }

    fn as_str(&self) -> &str {
        self.0.to_str().unwrap_or_default()
    }
}

fn is_acceptable_id(raw: &[u8]) -> bool {
    !raw.is_empty() && raw.len() <= MAX_REQUEST_ID_LEN && raw.iter().all(u8::is_ascii_graphic)
}

pub async fn set_request_id(mut request: Request<Body>, next: Next) -> Response {
    let request_id = RequestId::for_request(&request);
    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(REQUEST_ID_HEADER, request_id.0.clone());
    response.extensions_mut().insert(request_id);
    response
}

/// Log every 4xx/5xx with the attached [`ErrorReport`]. Query strings are
/// never logged because download tokens travel in them.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request.extensions().get::<RequestId>().cloned();
    let start = Instant::now();

    let mut response = next.run(request).await;
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) {
        return response;
    }

    let elapsed_ms = start.elapsed().as_millis();
    let ErrorReport {
        source, messages, ..
    } = response
        .extensions_mut()
        .remove::<ErrorReport>()
        .unwrap_or(ErrorReport {
            source: "router",
            status,
            messages: Vec::new(),
        });
    let request_id = request_id.as_ref().map(RequestId::as_str).unwrap_or_default();

    if status.is_server_error() {
        error!(
            target = "tagport::http::response",
            status = status.as_u16(),
            %method,
            %path,
            elapsed_ms,
            source,
            chain = ?messages,
            request_id,
            "registry request failed",
        );
    } else {
        warn!(
            target = "tagport::http::response",
            status = status.as_u16(),
            %method,
            %path,
            elapsed_ms,
            source,
            chain = ?messages,
            request_id,
            "registry request rejected",
        );
    }

    response
}
