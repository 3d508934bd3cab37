//! Client reply builders
//!
//! The error envelope shape is a stable contract: `error`,
//! `error_description` (equal to `error`) and a numeric `error_code`.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde_json::json;

use super::CacheEntry;

/// Content type every proxy-authored reply carries
fn content_type_json() -> HeaderValue {
    HeaderValue::from_static("application/json;charset=UTF-8")
}

/// 503 reply used while the service is draining
pub(crate) fn service_unavailable() -> Response {
    with_error(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable")
}

/// 404 reply for requests that are not token requests
pub(crate) fn not_found() -> Response {
    with_error(StatusCode::NOT_FOUND, "Not found")
}

/// 400 reply for malformed or unsupported token requests
pub(crate) fn invalid() -> Response {
    with_error(StatusCode::BAD_REQUEST, "bad request")
}

/// Build an error reply carrying the JSON error envelope
pub(crate) fn with_error(status: StatusCode, msg: &str) -> Response {
    let body = json!({
        "error": msg,
        "error_description": msg,
        "error_code": status.as_u16(),
    });

    let mut resp = Response::new(Body::from(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, content_type_json());
    resp
}

/// Reply with a cached entry
///
/// Cache directives are set first so headers captured from the upstream win
/// on collision.
pub(crate) fn from_entry(entry: &CacheEntry) -> Response {
    let mut resp = Response::new(Body::from(entry.body.clone()));
    *resp.status_mut() = entry.status;

    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type_json());
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));

    for (name, value) in &entry.headers {
        headers.insert(name, value.clone());
    }

    resp
}

/// Reply passing an upstream response through verbatim
pub(crate) fn passthrough(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Response {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;

    for (name, value) in headers {
        resp.headers_mut().insert(name, value.clone());
    }

    resp
}
