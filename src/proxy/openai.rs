//! OpenAI-compatible engine with a retrying transport.
//!
//! Requests arrive in OpenAI shape and are rewritten onto the upstream
//! compatibility endpoint. The request body is buffered once so it can be
//! replayed; on a retryable failure the engine reports the key, draws a
//! fresh one from the pool and tries again, up to `min(eligible, 5)`
//! attempts. Responses stream back to the client unbuffered.

use std::sync::Arc;

use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::models::key_suffix;
use crate::pool::{Manager, UPSTREAM_BASE_URL};

use super::{forward_request_headers, forward_response, plain_response, sanitize, transform};

const MAX_RETRY_ATTEMPTS: usize = 5;
pub const RETRY_EXHAUSTED_BODY: &str = "Service unavailable after multiple retries";

/// Statuses that indicate a key-level or transient upstream problem worth
/// retrying with a different key. Everything else is the client's fault and
/// passes through verbatim.
fn is_retryable_status(code: u16) -> bool {
    matches!(code, 401 | 403 | 429 | 500 | 502 | 503)
}

pub struct OpenAiProxy {
    manager: Arc<dyn Manager>,
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiProxy {
    pub fn new(manager: Arc<dyn Manager>) -> Self {
        Self::with_base_url(manager, UPSTREAM_BASE_URL)
    }

    pub fn with_base_url(manager: Arc<dyn Manager>, base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("failed to build upstream HTTP client");
        Self {
            manager,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn handle(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        let path = uri.path();
        let path = path.strip_prefix("/openai").unwrap_or(path);
        let mut url = format!("{}{}", self.base_url, transform::rewrite_openai_path(path));
        if let Some(query) = uri.query() {
            url.push('?');
            url.push_str(query);
        }

        let body = match sanitize::sanitize_openai_body(&body) {
            Some(sanitized) => Bytes::from(sanitized),
            None => body,
        };

        let mut key = match self.manager.select_next() {
            Ok(key) => key,
            Err(e) => {
                error!("Failed to get next available key for proxy: {}", e);
                return plain_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service temporarily unavailable",
                );
            }
        };

        let Ok(method) = reqwest::Method::from_bytes(method.as_str().as_bytes()) else {
            return plain_response(StatusCode::BAD_GATEWAY, "Proxy Error");
        };
        let base_headers = forward_request_headers(&headers);

        let attempts = self.manager.eligible_count().min(MAX_RETRY_ATTEMPTS).max(1);

        for attempt in 0..attempts {
            debug!(
                attempt = attempt + 1,
                key_suffix = key_suffix(&key),
                "Attempting upstream request"
            );

            let mut attempt_headers = base_headers.clone();
            match reqwest::header::HeaderValue::from_str(&format!("Bearer {key}")) {
                Ok(value) => {
                    attempt_headers.insert(reqwest::header::AUTHORIZATION, value);
                }
                Err(_) => {
                    error!("Selected key is not a valid header value");
                    return plain_response(StatusCode::BAD_GATEWAY, "Proxy Error");
                }
            }

            let result = self
                .client
                .request(method.clone(), &url)
                .headers(attempt_headers)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().as_u16() < 400 => {
                    self.manager.report_success(&key).await;
                    return forward_response(resp);
                }
                Ok(resp) if !is_retryable_status(resp.status().as_u16()) => {
                    warn!(
                        status = resp.status().as_u16(),
                        key_suffix = key_suffix(&key),
                        "Received non-retryable error status"
                    );
                    return forward_response(resp);
                }
                Ok(resp) => {
                    warn!(
                        status = resp.status().as_u16(),
                        key_suffix = key_suffix(&key),
                        "Request failed with retryable status, will retry"
                    );
                    self.manager.report_failure(&key).await;
                }
                Err(e) => {
                    warn!(
                        key_suffix = key_suffix(&key),
                        "Request failed with transport error, will retry: {}", e
                    );
                    self.manager.report_failure(&key).await;
                }
            }

            if attempt + 1 == attempts {
                break;
            }
            key = match self.manager.select_next() {
                Ok(next) => next,
                Err(e) => {
                    error!("Failed to get next key for retry: {}", e);
                    break;
                }
            };
        }

        error!("Proxy error after all retries");
        plain_response(StatusCode::SERVICE_UNAVAILABLE, RETRY_EXHAUSTED_BODY)
    }
}
