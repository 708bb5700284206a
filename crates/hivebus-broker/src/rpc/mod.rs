//! JSON-RPC 2.0 dispatcher for the agent task protocol.
//!
//! Each entry of a request (single object or batch array) goes through the
//! same pipeline:
//!
//! 1. shape check (`-32600`)
//! 2. authorization (`-32002`)
//! 3. rate limit (`-32005`)
//! 4. built-in `_metrics` / `_info`
//! 5. method table lookup (`-32601`)
//! 6. typed params and handler, bounded by the handler timeout (`-32006`)
//!
//! Handlers run on their own tokio task so a panic becomes a `-32603`
//! response for that entry only.

mod handlers;
pub mod methods;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, error, warn};

use hivebus_common::auth::{Access, AuthConfig, Authorizer};
use hivebus_common::protocol::error::{BusError, Result};
use hivebus_common::protocol::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use hivebus_common::rate_limit::RateLimiter;
use hivebus_metrics::{BrokerMetricsCollector, MetricsCollector, INFO_METHOD};

use crate::delivery::DeliveryManager;
use crate::registry::ServiceRegistry;
use crate::tasks::TaskManager;

pub use methods::{Method, METHODS};

/// Caller identity attached to one HTTP request.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub api_key: Option<String>,
    /// Rate limit bucket key
    pub client_key: String,
}

impl CallContext {
    /// Keys the rate limit by API key, then by peer IP.
    pub fn new(api_key: Option<String>, peer: Option<SocketAddr>) -> Self {
        let client_key = match (&api_key, peer) {
            (Some(key), _) => format!("key:{}", key),
            (None, Some(addr)) => format!("ip:{}", addr.ip()),
            (None, None) => "anonymous".to_string(),
        };
        Self { api_key, client_key }
    }
}

pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    tasks: Arc<TaskManager>,
    delivery: Arc<DeliveryManager>,
    metrics: BrokerMetricsCollector,
    authorizer: Arc<dyn Authorizer>,
    rate_limiter: RateLimiter,
    handler_timeout: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher with authentication and rate limiting disabled.
    ///
    /// # Arguments
    /// * `registry` - Service and agent tables
    /// * `tasks` - Task lifecycle host
    /// * `delivery` - Delivery manager, read for `_info`
    /// * `metrics` - Collector for per-method calls
    ///
    /// # Returns
    /// - `Ok(Dispatcher)` - Ready to serve
    /// - `Err(BusError::Internal)` - The method table has duplicate entries
    pub fn new(
        registry: Arc<ServiceRegistry>,
        tasks: Arc<TaskManager>,
        delivery: Arc<DeliveryManager>,
        metrics: BrokerMetricsCollector,
    ) -> Result<Self> {
        methods::validate_table()?;
        Ok(Self {
            registry,
            tasks,
            delivery,
            metrics,
            authorizer: Arc::new(AuthConfig::disabled()),
            rate_limiter: RateLimiter::disabled(),
            handler_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.authorizer
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Handles one HTTP body.
    ///
    /// # Returns
    /// - `Some(Value)` - A response object or an array of them
    /// - `None` - Nothing to send back (only notifications)
    pub async fn handle_bytes(self: &Arc<Self>, body: &[u8], ctx: &CallContext) -> Option<Value> {
        let parsed: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                debug!("unparseable RPC body: {}", e);
                return Some(encode(&JsonRpcResponse::error(
                    Value::Null,
                    JsonRpcError::parse_error(),
                )));
            }
        };

        match parsed {
            Value::Array(entries) if entries.is_empty() => Some(encode(&JsonRpcResponse::error(
                Value::Null,
                JsonRpcError::invalid_request_with("empty batch"),
            ))),
            Value::Array(entries) => {
                let responses: Vec<JsonRpcResponse> =
                    join_all(entries.into_iter().map(|entry| self.handle_value(entry, ctx)))
                        .await
                        .into_iter()
                        .flatten()
                        .collect();
                if responses.is_empty() {
                    None
                } else {
                    Some(Value::Array(responses.iter().map(encode).collect()))
                }
            }
            single => self.handle_value(single, ctx).await.map(|r| encode(&r)),
        }
    }

    /// Handles one decoded entry. `None` for notifications.
    pub async fn handle_value(self: &Arc<Self>, entry: Value, ctx: &CallContext) -> Option<JsonRpcResponse> {
        let request = match JsonRpcRequest::from_value(entry) {
            Ok(request) => request,
            Err(rejection) => return Some(rejection),
        };
        self.handle_request(request, ctx).await
    }

    pub async fn handle_request(
        self: &Arc<Self>,
        request: JsonRpcRequest,
        ctx: &CallContext,
    ) -> Option<JsonRpcResponse> {
        let outcome = self.execute(&request, ctx).await;
        let id = request.id?;
        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(err) => JsonRpcResponse::error(id, err),
        })
    }

    async fn execute(
        self: &Arc<Self>,
        request: &JsonRpcRequest,
        ctx: &CallContext,
    ) -> std::result::Result<Value, JsonRpcError> {
        let method = Method::from_name(&request.method);
        let access = method.map_or(Access::Read, Method::access);

        self.authorizer.authorize(ctx.api_key.as_deref(), access)?;
        self.rate_limiter.check(&ctx.client_key).into_result()?;

        if self.metrics.is_metrics_request(&request.method) {
            return self.builtin(&request.method);
        }

        let Some(method) = method else {
            debug!(method = %request.method, "unknown RPC method");
            return Err(JsonRpcError::method_not_found());
        };

        let start = Instant::now();
        let outcome = self.run_handler(method, request.params_object()).await;
        self.metrics.record_call(method.name(), start, outcome.is_ok());
        outcome
    }

    async fn run_handler(
        self: &Arc<Self>,
        method: Method,
        params: Value,
    ) -> std::result::Result<Value, JsonRpcError> {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { handlers::invoke(&this, method, params).await });
        let abort = handle.abort_handle();

        match tokio::time::timeout(self.handler_timeout, handle).await {
            Ok(Ok(result)) => result.map_err(|e| rpc_error(method, e)),
            Ok(Err(join_err)) => {
                error!(%method, "RPC handler panicked: {}", join_err);
                Err(JsonRpcError::internal_error())
            }
            Err(_) => {
                abort.abort();
                let ms = self.handler_timeout.as_millis() as u64;
                warn!(%method, timeout_ms = ms, "RPC handler timed out");
                Err(BusError::Timeout(ms).into())
            }
        }
    }

    fn builtin(&self, name: &str) -> std::result::Result<Value, JsonRpcError> {
        let mut value = self
            .metrics
            .handle_metrics_request(name)
            .ok_or_else(JsonRpcError::method_not_found)?;

        if name == INFO_METHOD {
            if let Value::Object(info) = &mut value {
                let pool = self.delivery.pool().stats();
                info.insert("services".into(), self.registry.len().into());
                info.insert("subscriptions".into(), self.registry.subscriptions().len().into());
                info.insert("tasks".into(), self.tasks.len().into());
                info.insert("dead_letters".into(), self.delivery.dead_letter_count().into());
                info.insert("pending_deliveries".into(), self.delivery.outstanding().into());
                info.insert("pooled_connections".into(), (pool.idle + pool.in_use).into());
                info.insert(
                    "methods".into(),
                    METHODS.iter().map(|(_, n)| Value::from(*n)).collect(),
                );
            }
        }
        Ok(value)
    }
}

fn rpc_error(method: Method, err: BusError) -> JsonRpcError {
    if err.is_internal() {
        error!(%method, "RPC handler failed: {}", err);
    } else {
        debug!(%method, "RPC call rejected: {}", err);
    }
    JsonRpcError::from(&err)
}

fn encode(response: &JsonRpcResponse) -> Value {
    serde_json::to_value(response).unwrap_or_else(|e| {
        error!("failed to encode RPC response: {}", e);
        Value::Null
    })
}

#[cfg(test)]
mod tests;
