use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, StatusCode, Uri};
use serde_json::{json, Value};

use hivebus_common::auth::API_KEY_HEADER;
use hivebus_common::config::RetryConfig;
use hivebus_common::protocol::error::{BusError, Result};
use hivebus_common::protocol::jsonrpc::{self, JsonRpcRequest, JsonRpcResponse};

use crate::http::{build_client, HttpClient};

/// JSON-RPC client for the broker's `/rpc` endpoint.
///
/// Transient failures (connection errors, timeouts, HTTP 5xx) are retried
/// with exponential backoff; JSON-RPC error objects are returned as
/// [`BusError::Remote`] without retrying. Clones share the HTTP client and
/// the request id counter.
#[derive(Clone)]
pub struct BusClient {
    rpc_url: Uri,
    client: HttpClient,
    api_key: Option<String>,
    timeout: Duration,
    retry: RetryConfig,
    next_id: Arc<AtomicU64>,
}

impl BusClient {
    /// `base_url` may be the broker root (`http://host:8080`) or the full
    /// `/rpc` URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let trimmed = base_url.trim_end_matches('/');
        let url = if trimmed.ends_with("/rpc") {
            trimmed.to_string()
        } else {
            format!("{}/rpc", trimmed)
        };
        let rpc_url: Uri = url
            .parse()
            .map_err(|e| BusError::validation(format!("invalid broker URL {}: {}", base_url, e)))?;
        if rpc_url.scheme_str() != Some("http") {
            return Err(BusError::validation(format!(
                "broker URL must start with http://, got {}",
                base_url
            )));
        }

        Ok(Self {
            rpc_url,
            client: build_client(),
            api_key: None,
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn rpc_url(&self) -> &Uri {
        &self.rpc_url
    }

    /// Calls `method` and returns its `result`.
    pub async fn call(&self, method: impl Into<String>, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(method, params, json!(id));
        let response = self
            .send_with_retry(&request)
            .await?
            .ok_or_else(|| BusError::Transport("empty response to a call".into()))?;

        if let Some(error) = response.error {
            return Err(BusError::Remote {
                code: error.code,
                message: error.message,
            });
        }
        response
            .result
            .ok_or_else(|| BusError::Transport("response missing result".into()))
    }

    /// Sends a notification; the broker sends nothing back.
    pub async fn notify(&self, method: impl Into<String>, params: Value) -> Result<()> {
        let request = JsonRpcRequest::notification(method, params);
        self.send_with_retry(&request).await.map(|_| ())
    }

    async fn send_with_retry(&self, request: &JsonRpcRequest) -> Result<Option<JsonRpcResponse>> {
        let body = Bytes::from(serde_json::to_vec(request)?);
        let mut backoff_ms = self.retry.initial_backoff_ms;

        for attempt in 0..=self.retry.max_retries {
            match self.send_once(body.clone()).await {
                Err(e) if attempt < self.retry.max_retries && e.is_retryable() => {
                    tracing::warn!(
                        "RPC {} to {} failed (attempt {}): {}, retrying in {}ms",
                        request.method,
                        self.rpc_url,
                        attempt + 1,
                        e,
                        backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = std::cmp::min(
                        (backoff_ms as f64 * self.retry.backoff_multiplier) as u64,
                        self.retry.max_backoff_ms,
                    );
                }
                other => return other,
            }
        }

        Err(BusError::Internal("retry loop exited without a result".into()))
    }

    async fn send_once(&self, body: Bytes) -> Result<Option<JsonRpcResponse>> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.rpc_url.clone())
            .header(CONTENT_TYPE, "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header(API_KEY_HEADER, key.as_str());
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| BusError::Transport(format!("failed to build request: {}", e)))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| BusError::Timeout(self.timeout.as_millis() as u64))?
            .map_err(|e| BusError::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| BusError::Transport(format!("failed to read response: {}", e)))?
            .to_bytes();

        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if status.is_server_error() {
            return Err(BusError::Transport(format!("broker answered HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(BusError::Remote {
                code: jsonrpc::INVALID_REQUEST,
                message: format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    String::from_utf8_lossy(&bytes)
                ),
            });
        }

        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_normalization() {
        let client = BusClient::new("http://127.0.0.1:8080").unwrap();
        assert_eq!(client.rpc_url().to_string(), "http://127.0.0.1:8080/rpc");

        let client = BusClient::new("http://127.0.0.1:8080/rpc/").unwrap();
        assert_eq!(client.rpc_url().to_string(), "http://127.0.0.1:8080/rpc");
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert!(BusClient::new("127.0.0.1:8080").is_err());
        assert!(BusClient::new("ftp://127.0.0.1").is_err());
    }

    #[test]
    fn test_clones_share_id_counter() {
        let client = BusClient::new("http://127.0.0.1:8080").unwrap();
        let other = client.clone();
        client.next_id.fetch_add(5, Ordering::Relaxed);
        assert_eq!(other.next_id.load(Ordering::Relaxed), 6);
    }
}
