//! HTTP server for the bus
//!
//! REST endpoints under `/api`, JSON-RPC at `/rpc`, WebSocket sessions at
//! `/ws` and a liveness probe at `/health`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, DefaultBodyLimit, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use hyper::body::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use hivebus_common::auth::{Access, API_KEY_HEADER};
use hivebus_common::model::{PublishRequest, Registration, ServiceQuery};
use hivebus_common::protocol::error::{BusError, EntityKind};

use crate::bus::Bus;
use crate::rpc::CallContext;
use crate::websocket;

/// REST error carrying a [`BusError`].
///
/// Renders as `{"error": {"code": ..., "message": ...}}` with the error's
/// HTTP status. Internal faults are logged and shown as "Internal error".
#[derive(Debug)]
pub struct ApiError(pub BusError);

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        if err.is_internal() {
            error!("request failed: {}", err);
        }
        let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": {
                "code": err.code(),
                "message": err.public_message(),
            }
        });
        let mut response = (status, Json(body)).into_response();
        if let BusError::RateLimited { retry_after_ms } = err {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// HTTP server for a [`Bus`].
///
/// This server:
/// - Serves the REST API under `/api` (authorized and rate limited)
/// - Handles JSON-RPC POST requests at `/rpc`
/// - Upgrades `/ws` to a WebSocket session
/// - Provides health checks at `/health` and `/__health`
pub struct HttpServer {
    bus: Arc<Bus>,
}

impl HttpServer {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self { bus }
    }

    /// Builds the axum application.
    pub fn router(&self) -> Router {
        let bus = self.bus.clone();
        let max_body = bus.config().server.max_body_bytes;

        let api = Router::new()
            .route("/api/register", post(register))
            .route("/api/services", get(list_services))
            .route("/api/services/:id", get(get_service).delete(delete_service))
            .route("/api/heartbeat", post(heartbeat))
            .route("/api/messages", post(publish))
            .route("/api/subscriptions", get(list_subscriptions).post(subscribe))
            .route("/api/subscriptions/:id", delete(unsubscribe))
            .route("/api/dead-letters", get(list_dead_letters))
            .route(
                "/api/dead-letters/:id",
                get(get_dead_letter).delete(delete_dead_letter),
            )
            .route("/api/dead-letters/:id/replay", post(replay_dead_letter))
            .route("/api/circuits", get(list_circuits))
            .route_layer(middleware::from_fn_with_state(bus.clone(), require_access));

        Router::new()
            .merge(api)
            .route("/rpc", post(handle_rpc))
            .route("/ws", get(ws_upgrade))
            .route("/health", get(health_check))
            .route("/__health", get(health_check))
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(max_body))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(bus)
    }

    /// Binds `addr` and serves until the bus shuts down.
    ///
    /// # Arguments
    /// * `addr` - Socket address to bind to (e.g., "0.0.0.0:8080")
    ///
    /// # Returns
    /// - `Ok(())` - Server stopped after shutdown
    /// - `Err(BusError::Transport)` - Bind failed or the server errored
    pub async fn run(self, addr: SocketAddr) -> hivebus_common::Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BusError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener until the bus shuts down.
    pub async fn serve(self, listener: TcpListener) -> hivebus_common::Result<()> {
        let local = listener
            .local_addr()
            .map_err(|e| BusError::Transport(format!("Failed to get local addr: {}", e)))?;
        info!("Hivebus HTTP server listening on {}", local);

        let shutdown = self.bus.cancellation().clone();
        let app = self.router();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| BusError::Transport(format!("Server error: {}", e)))?;

        info!("Hivebus HTTP server stopped");
        Ok(())
    }
}

// ============================================================================
// Request helpers
// ============================================================================

pub(crate) fn api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError(BusError::validation(format!("invalid request body: {}", e))))
}

/// Authorizes and rate limits `/api` requests. Reads need [`Access::Read`].
async fn require_access(State(bus): State<Arc<Bus>>, request: Request, next: Next) -> Response {
    let access = match *request.method() {
        Method::GET | Method::HEAD => Access::Read,
        _ => Access::Write,
    };
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let ctx = CallContext::new(api_key(request.headers()), peer);

    let dispatcher = bus.dispatcher();
    let checked = dispatcher
        .authorizer()
        .authorize(ctx.api_key.as_deref(), access)
        .and_then(|_| dispatcher.rate_limiter().check(&ctx.client_key).into_result());
    match checked {
        Ok(()) => next.run(request).await,
        Err(e) => ApiError(e).into_response(),
    }
}

// ============================================================================
// Registry
// ============================================================================

async fn register(State(bus): State<Arc<Bus>>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let registration: Registration = parse_json(&body)?;
    let record = bus.registry().register(registration)?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_services(
    State(bus): State<Arc<Bus>>,
    query: Result<Query<ServiceQuery>, axum::extract::rejection::QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query.map_err(|e| ApiError(BusError::validation(e.body_text())))?;
    Ok(Json(bus.registry().query(&query)))
}

async fn get_service(State(bus): State<Arc<Bus>>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(bus.registry().lookup(&id)?))
}

async fn delete_service(State(bus): State<Arc<Bus>>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    bus.registry().deregister(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct HeartbeatBody {
    service_id: String,
}

async fn heartbeat(State(bus): State<Arc<Bus>>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let HeartbeatBody { service_id } = parse_json(&body)?;
    let status = bus.registry().heartbeat(&service_id)?;
    Ok(Json(json!({ "service_id": service_id, "status": status })))
}

// ============================================================================
// Messaging
// ============================================================================

async fn publish(State(bus): State<Arc<Bus>>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let request: PublishRequest = parse_json(&body)?;
    let receipt = bus.router().publish(request.into_envelope()?)?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

#[derive(Deserialize)]
struct SubscribeBody {
    topic: String,
    subscriber_id: String,
}

async fn subscribe(State(bus): State<Arc<Bus>>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let SubscribeBody { topic, subscriber_id } = parse_json(&body)?;
    let outcome = bus.registry().subscribe(&topic, &subscriber_id)?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome.subscription)))
}

async fn list_subscriptions(State(bus): State<Arc<Bus>>) -> impl IntoResponse {
    Json(bus.registry().subscriptions())
}

async fn unsubscribe(State(bus): State<Arc<Bus>>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    bus.registry().unsubscribe(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Dead letters and circuits
// ============================================================================

async fn list_dead_letters(State(bus): State<Arc<Bus>>) -> impl IntoResponse {
    Json(bus.delivery().dead_letters())
}

async fn get_dead_letter(State(bus): State<Arc<Bus>>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    bus.delivery()
        .dead_letter_by_id(&id)
        .map(Json)
        .ok_or_else(|| ApiError(BusError::not_found(EntityKind::DeadLetter, id)))
}

async fn delete_dead_letter(State(bus): State<Arc<Bus>>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    bus.delivery()
        .remove_dead_letter(&id)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or_else(|| ApiError(BusError::not_found(EntityKind::DeadLetter, id)))
}

async fn replay_dead_letter(State(bus): State<Arc<Bus>>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    let receipt = bus.router().replay(&id)?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn list_circuits(State(bus): State<Arc<Bus>>) -> impl IntoResponse {
    Json(bus.registry().health().circuits().statuses())
}

// ============================================================================
// RPC, WebSocket, health
// ============================================================================

async fn handle_rpc(
    State(bus): State<Arc<Bus>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Response {
    let ctx = CallContext::new(api_key(&headers), peer.map(|info| info.0));
    match bus.dispatcher().handle_bytes(&body, &ctx).await {
        Some(value) => Json(value).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn ws_upgrade(State(bus): State<Arc<Bus>>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    if let Err(e) = bus
        .dispatcher()
        .authorizer()
        .authorize(api_key(&headers).as_deref(), Access::Write)
    {
        return ApiError(e).into_response();
    }
    ws.on_upgrade(move |socket| websocket::run_session(bus, socket))
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use hivebus_common::model::TaskState;

    async fn body_of(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_api_error_shape() {
        let response = ApiError(BusError::not_found(EntityKind::Service, "svc-9")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_of(response).await;
        assert_eq!(body["error"]["code"], "not_found");
        assert!(body["error"]["message"].as_str().unwrap().contains("svc-9"));
    }

    #[tokio::test]
    async fn test_internal_errors_are_masked() {
        let response = ApiError(BusError::Internal("db pool poisoned".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_of(response).await;
        assert_eq!(body["error"]["message"], "Internal error");
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let response = ApiError(BusError::RateLimited { retry_after_ms: 1_500 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }

    #[tokio::test]
    async fn test_state_conflict_is_409() {
        let err = BusError::InvalidStateTransition {
            from: TaskState::Completed,
            to: TaskState::Running,
        };
        assert_eq!(ApiError(err).into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = health_check().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_api_key_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(api_key(&headers), None);
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("secret"));
        assert_eq!(api_key(&headers).as_deref(), Some("secret"));
    }
}
