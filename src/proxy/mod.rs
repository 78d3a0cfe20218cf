//! Reverse-proxy engines: the native Gemini passthrough and the
//! OpenAI-compatible engine with its retrying transport.

pub mod gemini;
pub mod openai;
pub mod sanitize;
pub mod transform;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;

/// Headers that must not be forwarded in either direction. The client's
/// credentials are replaced with a pooled key, and hop-by-hop headers are
/// managed by the HTTP stacks on both sides.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "authorization",
    "x-goog-api-key",
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
];

const STRIPPED_RESPONSE_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection"];

/// Copy forwardable client headers into a reqwest header map.
fn forward_request_headers(headers: &axum::http::HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        if STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(name, value);
        }
    }
    out
}

/// Turn an upstream response into an axum response without buffering the
/// body; chunked and SSE responses stream through unchanged.
fn forward_response(upstream: reqwest::Response) -> Response {
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(name, value);
        }
    }

    let stream = upstream.bytes_stream().map_err(std::io::Error::other);
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

fn plain_response(status: StatusCode, body: &'static str) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_else(|_| status.into_response())
}
