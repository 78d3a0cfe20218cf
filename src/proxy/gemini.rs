//! Native Gemini passthrough engine.
//!
//! Swaps the caller's credentials for a pooled key, fixes up the model
//! path, and streams both bodies without buffering. This engine does not
//! retry; clients speaking the native protocol handle their own errors.

use std::sync::Arc;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::Response;
use tracing::{error, warn};

use crate::pool::{Manager, UPSTREAM_BASE_URL};

use super::{forward_request_headers, forward_response, plain_response, transform};

pub struct GeminiProxy {
    manager: Arc<dyn Manager>,
    client: reqwest::Client,
    base_url: String,
}

impl GeminiProxy {
    pub fn new(manager: Arc<dyn Manager>) -> Self {
        Self::with_base_url(manager, UPSTREAM_BASE_URL)
    }

    pub fn with_base_url(manager: Arc<dyn Manager>, base_url: &str) -> Self {
        // No overall timeout: generateContent streams can stay open for
        // minutes. Connects are still bounded.
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

    pub async fn handle(&self, req: Request) -> Response {
        let key = match self.manager.select_next() {
            Ok(key) => key,
            Err(e) => {
                error!("Failed to get next available key for proxy: {}", e);
                return plain_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service temporarily unavailable",
                );
            }
        };

        let (parts, body) = req.into_parts();

        let path = parts.uri.path();
        let path = path.strip_prefix("/gemini").unwrap_or(path);
        let path = if path.is_empty() { "/" } else { path };
        let mut url = format!("{}{}", self.base_url, transform::rewrite_gemini_path(path));
        if let Some(query) = parts.uri.query() {
            url.push('?');
            url.push_str(query);
        }

        let Ok(method) = reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) else {
            return plain_response(StatusCode::BAD_GATEWAY, "Proxy Error");
        };

        let mut headers = forward_request_headers(&parts.headers);
        let Ok(key_value) = reqwest::header::HeaderValue::from_str(&key) else {
            error!("Selected key is not a valid header value");
            return plain_response(StatusCode::BAD_GATEWAY, "Proxy Error");
        };
        headers.insert("x-goog-api-key", key_value);

        let result = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await;

        match result {
            Ok(resp) => forward_response(resp),
            Err(e) if e.is_body() || e.is_request() => {
                // Typically the client went away mid-upload; nobody is
                // around to read an error response.
                warn!("Client disconnected: {}", e);
                plain_response(StatusCode::BAD_GATEWAY, "Proxy Error")
            }
            Err(e) => {
                error!("Proxy error: {}", e);
                plain_response(StatusCode::BAD_GATEWAY, "Proxy Error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolError;
    use async_trait::async_trait;
    use axum::body::Body;
    use std::sync::Mutex;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedManager {
        keys: Mutex<Vec<String>>,
    }

    impl FixedManager {
        fn new(keys: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                keys: Mutex::new(keys.iter().rev().map(|s| s.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl Manager for FixedManager {
        fn select_next(&self) -> Result<String, PoolError> {
            self.keys.lock().unwrap().pop().ok_or(PoolError::Empty)
        }
        async fn report_failure(&self, _secret: &str) {}
        async fn report_success(&self, _secret: &str) {}
        fn eligible_count(&self) -> usize {
            self.keys.lock().unwrap().len()
        }
    }

    fn request(uri: &str) -> Request {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", "Bearer client-key")
            .body(Body::from("{}"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_forwards_with_pooled_key_and_model_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-pro:generateContent"))
            .and(header("x-goog-api-key", "pool-key"))
            .and(query_param("alt", "sse"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let proxy = GeminiProxy::with_base_url(FixedManager::new(&["pool-key"]), &server.uri());
        let resp = proxy
            .handle(request("/gemini/v1beta/gemini-pro:generateContent?alt=sse"))
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_caller_credentials_are_not_forwarded() {
        let server = MockServer::start().await;
        // The mock only matches when the client's Authorization header is
        // absent upstream.
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-pro:generateContent"))
            .and(wiremock::matchers::header_exists("x-goog-api-key"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let proxy = GeminiProxy::with_base_url(FixedManager::new(&["pool-key"]), &server.uri());
        let resp = proxy
            .handle(request("/gemini/v1beta/models/gemini-pro:generateContent"))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        assert!(!received[0].headers.contains_key("authorization"));
        assert_eq!(received[0].headers.get("x-goog-api-key").unwrap(), "pool-key");
    }

    #[tokio::test]
    async fn test_no_keys_returns_503() {
        let proxy = GeminiProxy::with_base_url(FixedManager::new(&[]), "http://unused");
        let resp = proxy.handle(request("/gemini/v1beta/models/m:gen")).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_returns_502() {
        // Nothing listens on port 9; the connect fails fast.
        let proxy = GeminiProxy::with_base_url(FixedManager::new(&["k"]), "http://127.0.0.1:9");
        let resp = proxy.handle(request("/gemini/v1beta/models/m:gen")).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_upstream_errors_pass_through_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/m:gen"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .expect(1)
            .mount(&server)
            .await;

        let manager = FixedManager::new(&["k1", "k2"]);
        let proxy = GeminiProxy::with_base_url(manager.clone(), &server.uri());
        let resp = proxy.handle(request("/gemini/v1beta/models/m:gen")).await;

        // Status and body come back verbatim; the second key was never used.
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(manager.eligible_count(), 1);
    }
}
