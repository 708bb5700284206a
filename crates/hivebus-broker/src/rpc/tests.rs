use super::*;
use crate::events::EventBus;
use crate::health::HealthMonitor;
use crate::testing::RecordingConnector;
use hivebus_client::ConnectionPool;
use hivebus_common::config::{BatchConfig, CircuitBreakerConfig, HealthConfig, PoolConfig, RetryConfig};
use hivebus_common::model::TransportKind;
use hivebus_common::protocol::jsonrpc::{
    CAPABILITY_NOT_SUPPORTED, INVALID_PARAMS, INVALID_REQUEST, INVALID_STATE_TRANSITION,
    METHOD_NOT_FOUND, PARSE_ERROR, RATE_LIMITED, TASK_NOT_FOUND, UNAUTHORIZED,
};
use hivebus_common::rate_limit::RateLimitConfig;
use serde_json::json;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Harness
// ============================================================================

fn dispatcher_with(configure: impl FnOnce(Dispatcher) -> Dispatcher) -> Arc<Dispatcher> {
    let pool = Arc::new(
        ConnectionPool::new(PoolConfig::default())
            .with_connector(TransportKind::Http, Arc::new(RecordingConnector::default())),
    );
    let (health, _scheduler) = HealthMonitor::new(HealthConfig::default(), CircuitBreakerConfig::default());
    let health = Arc::new(health);
    let events = EventBus::new(64);
    let metrics = BrokerMetricsCollector::new();
    let registry = Arc::new(ServiceRegistry::new(health.clone(), events.clone()));
    let tasks = Arc::new(TaskManager::new(events.clone()));
    let delivery = DeliveryManager::new(
        RetryConfig::default(),
        BatchConfig::default(),
        pool,
        health,
        metrics.clone(),
        events,
        CancellationToken::new(),
    );
    let dispatcher = Dispatcher::new(registry, tasks, delivery, metrics).unwrap();
    Arc::new(configure(dispatcher))
}

fn dispatcher() -> Arc<Dispatcher> {
    dispatcher_with(|d| d)
}

async fn call(d: &Arc<Dispatcher>, method: &str, params: Value) -> Value {
    call_as(d, &CallContext::default(), method, params).await
}

async fn call_as(d: &Arc<Dispatcher>, ctx: &CallContext, method: &str, params: Value) -> Value {
    let body = json!({"jsonrpc": "2.0", "method": method, "params": params, "id": 1});
    d.handle_bytes(body.to_string().as_bytes(), ctx)
        .await
        .expect("request with id gets a response")
}

fn error_code(response: &Value) -> i64 {
    response["error"]["code"].as_i64().unwrap_or_else(|| panic!("expected error in {response}"))
}

async fn register_agent(d: &Arc<Dispatcher>, id: &str, capability: &str) {
    let response = call(
        d,
        "agent.register",
        json!({
            "id": id,
            "name": id,
            "endpoint": {"address": format!("http://127.0.0.1:9100/{id}"), "transport": "http"},
            "capabilities": [capability],
            "agent_card": {"supported_methods": ["tasks/send"], "version": "1.0.0"},
        }),
    )
    .await;
    assert_eq!(response["result"]["id"], id, "{response}");
}

// ============================================================================
// Envelope handling
// ============================================================================

#[tokio::test]
async fn test_parse_error() {
    let d = dispatcher();
    let response = d.handle_bytes(b"{not json", &CallContext::default()).await.unwrap();
    assert_eq!(error_code(&response), PARSE_ERROR as i64);
    assert_eq!(response["id"], Value::Null);
}

#[tokio::test]
async fn test_empty_batch_is_one_invalid_request() {
    let d = dispatcher();
    let response = d.handle_bytes(b"[]", &CallContext::default()).await.unwrap();
    assert!(response.is_object());
    assert_eq!(error_code(&response), INVALID_REQUEST as i64);
}

#[tokio::test]
async fn test_wrong_version_is_invalid_request() {
    let d = dispatcher();
    let body = json!({"jsonrpc": "1.0", "method": "task.list", "id": "abc"});
    let response = d
        .handle_bytes(body.to_string().as_bytes(), &CallContext::default())
        .await
        .unwrap();
    assert_eq!(error_code(&response), INVALID_REQUEST as i64);
    assert_eq!(response["id"], "abc");
}

#[tokio::test]
async fn test_unknown_method() {
    let d = dispatcher();
    let response = call(&d, "task.explode", json!({})).await;
    assert_eq!(error_code(&response), METHOD_NOT_FOUND as i64);
}

#[tokio::test]
async fn test_notifications_produce_no_body() {
    let d = dispatcher();
    let single = json!({"jsonrpc": "2.0", "method": "task.create", "params": {"name": "a"}});
    assert!(d
        .handle_bytes(single.to_string().as_bytes(), &CallContext::default())
        .await
        .is_none());

    let batch = json!([single, single]);
    assert!(d
        .handle_bytes(batch.to_string().as_bytes(), &CallContext::default())
        .await
        .is_none());
    // Notifications still run
    assert_eq!(d.tasks.len(), 3);
}

#[tokio::test]
async fn test_batch_keeps_order_and_skips_notifications() {
    let d = dispatcher();
    let batch = json!([
        {"jsonrpc": "2.0", "method": "task.create", "params": {"name": "a", "id": "t-a"}, "id": 1},
        {"jsonrpc": "2.0", "method": "task.create", "params": {"name": "b"}},
        {"jsonrpc": "2.0", "method": "task.get", "params": {"task_id": "t-missing"}, "id": 2},
        {"jsonrpc": "2.0", "method": 5, "id": 3},
    ]);
    let response = d
        .handle_bytes(batch.to_string().as_bytes(), &CallContext::default())
        .await
        .unwrap();
    let entries = response.as_array().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0]["result"]["id"], "t-a");
    assert_eq!(error_code(&entries[1]), TASK_NOT_FOUND as i64);
    assert_eq!(error_code(&entries[2]), INVALID_REQUEST as i64);
    assert_eq!(entries[2]["id"], 3);
}

// ============================================================================
// Agent and discovery methods
// ============================================================================

#[tokio::test]
async fn test_agent_register_discover_unregister() {
    let d = dispatcher();
    register_agent(&d, "summarizer", "nlp").await;
    register_agent(&d, "painter", "vision").await;

    let found = call(&d, "discovery.find_for_capability", json!({"capability": "nlp"})).await;
    let ids: Vec<_> = found["result"].as_array().unwrap().iter().map(|c| c["id"].clone()).collect();
    assert_eq!(ids, vec![json!("summarizer")]);

    let services = call(&d, "discovery.query", json!({"capability": "vision"})).await;
    assert_eq!(services["result"][0]["id"], "painter");

    let beat = call(&d, "agent.heartbeat", json!({"agent_id": "painter"})).await;
    assert_eq!(beat["result"]["status"], "online");

    call(&d, "agent.unregister", json!({"agent_id": "painter"})).await;
    let listed = call(&d, "agent.list", json!({})).await;
    assert_eq!(listed["result"].as_array().unwrap().len(), 1);

    // Unregistering twice is fine
    let again = call(&d, "agent.unregister", json!({"agent_id": "painter"})).await;
    assert!(again.get("error").is_none(), "{again}");
}

#[tokio::test]
async fn test_register_without_card_still_lists_as_agent() {
    let d = dispatcher();
    let response = call(
        &d,
        "agent.register",
        json!({"name": "plain", "endpoint": {"address": "http://127.0.0.1:9100/plain"}}),
    )
    .await;
    let id = response["result"]["id"].as_str().unwrap().to_string();
    let listed = call(&d, "agent.list", Value::Null).await;
    assert_eq!(listed["result"][0]["id"], id);
}

#[tokio::test]
async fn test_register_invalid_params() {
    let d = dispatcher();
    let response = call(&d, "agent.register", json!({"name": "no-endpoint"})).await;
    assert_eq!(error_code(&response), INVALID_PARAMS as i64);
}

// ============================================================================
// Task methods
// ============================================================================

#[tokio::test]
async fn test_complete_without_result_keeps_running() {
    let d = dispatcher();
    register_agent(&d, "worker", "nlp").await;
    let created = call(&d, "task.create", json!({"name": "summarize", "input_data": {"text": "hi"}})).await;
    let task_id = created["result"]["id"].as_str().unwrap().to_string();
    assert_eq!(created["result"]["state"], "pending");

    let assigned = call(&d, "task.assign", json!({"task_id": task_id, "agent_id": "worker"})).await;
    assert_eq!(assigned["result"]["state"], "running");
    assert_eq!(assigned["result"]["assigned_agent_id"], "worker");

    let rejected = call(
        &d,
        "task.update_state",
        json!({"task_id": task_id, "state": "completed"}),
    )
    .await;
    assert_eq!(error_code(&rejected), INVALID_PARAMS as i64);

    let task = call(&d, "task.get", json!({"task_id": task_id})).await;
    assert_eq!(task["result"]["state"], "running");
}

#[tokio::test]
async fn test_assign_requires_capability() {
    let d = dispatcher();
    register_agent(&d, "painter", "vision").await;
    let created = call(&d, "task.create", json!({"name": "t", "required_capability": "nlp"})).await;
    let task_id = created["result"]["id"].clone();

    let response = call(&d, "task.assign", json!({"task_id": task_id, "agent_id": "painter"})).await;
    assert_eq!(error_code(&response), CAPABILITY_NOT_SUPPORTED as i64);

    let response = call(&d, "task.assign", json!({"task_id": task_id, "agent_id": "ghost"})).await;
    assert_eq!(response["error"]["data"], "not_found");
}

#[tokio::test]
async fn test_lifecycle_through_rpc() {
    let d = dispatcher();
    register_agent(&d, "worker", "nlp").await;
    call(&d, "task.create", json!({"name": "t", "id": "t-1"})).await;
    call(&d, "task.assign", json!({"task_id": "t-1", "agent_id": "worker"})).await;

    let progress = call(&d, "task.update_progress", json!({"task_id": "t-1", "progress": 0.5})).await;
    assert_eq!(progress["result"]["progress"], 0.5);

    let bad = call(&d, "task.update_progress", json!({"task_id": "t-1", "progress": 2.0})).await;
    assert_eq!(error_code(&bad), INVALID_PARAMS as i64);

    let done = call(&d, "task.complete", json!({"task_id": "t-1", "result": {"ok": true}})).await;
    assert_eq!(done["result"]["state"], "completed");
    assert_eq!(done["result"]["history"].as_array().unwrap().len(), 2);

    let late = call(&d, "task.cancel", json!({"task_id": "t-1"})).await;
    assert_eq!(error_code(&late), INVALID_STATE_TRANSITION as i64);

    let listed = call(&d, "task.list", json!({"state": "completed"})).await;
    assert_eq!(listed["result"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_fail_requires_error_message() {
    let d = dispatcher();
    register_agent(&d, "worker", "nlp").await;
    call(&d, "task.create", json!({"name": "t", "id": "t-1"})).await;
    call(&d, "task.assign", json!({"task_id": "t-1", "agent_id": "worker"})).await;

    let missing = call(&d, "task.fail", json!({"task_id": "t-1"})).await;
    assert_eq!(error_code(&missing), INVALID_PARAMS as i64);
    let failed = call(&d, "task.fail", json!({"task_id": "t-1", "error": "oom"})).await;
    assert_eq!(failed["result"]["error"], "oom");
}

// ============================================================================
// Auth, rate limit, built-ins
// ============================================================================

#[tokio::test]
async fn test_auth_is_checked_per_method() {
    let auth = AuthConfig::with_api_key("admin").with_read_only_key("viewer");
    let d = dispatcher_with(|d| d.with_authorizer(Arc::new(auth)));

    let anonymous = call(&d, "task.list", json!({})).await;
    assert_eq!(error_code(&anonymous), UNAUTHORIZED as i64);

    let viewer = CallContext::new(Some("viewer".into()), None);
    let read = call_as(&d, &viewer, "task.list", json!({})).await;
    assert!(read.get("error").is_none());
    let write = call_as(&d, &viewer, "task.create", json!({"name": "t"})).await;
    assert_eq!(error_code(&write), UNAUTHORIZED as i64);
    assert_eq!(write["error"]["data"], "permission_denied");

    let admin = CallContext::new(Some("admin".into()), None);
    let write = call_as(&d, &admin, "task.create", json!({"name": "t"})).await;
    assert_eq!(write["result"]["state"], "pending");
}

#[tokio::test]
async fn test_rate_limit_per_client() {
    let d = dispatcher_with(|d| d.with_rate_limiter(RateLimiter::new(RateLimitConfig::new(0.01, 2))));
    let a = CallContext::new(None, Some("10.0.0.1:5000".parse().unwrap()));
    let b = CallContext::new(None, Some("10.0.0.2:5000".parse().unwrap()));

    for _ in 0..2 {
        assert!(call_as(&d, &a, "task.list", json!({})).await.get("error").is_none());
    }
    let limited = call_as(&d, &a, "task.list", json!({})).await;
    assert_eq!(error_code(&limited), RATE_LIMITED as i64);
    assert!(limited["error"]["data"]["retry_after_ms"].as_u64().unwrap() > 0);

    assert!(call_as(&d, &b, "task.list", json!({})).await.get("error").is_none());
}

#[tokio::test]
async fn test_builtin_methods() {
    let d = dispatcher();
    call(&d, "task.create", json!({"name": "t"})).await;
    call(&d, "task.get", json!({"task_id": "nope"})).await;

    let metrics = call(&d, "_metrics", Value::Null).await;
    let create = &metrics["result"]["methods"]["task.create"];
    assert_eq!(create["call_count"], 1);
    assert_eq!(metrics["result"]["methods"]["task.get"]["failure_count"], 1);

    let info = call(&d, "_info", Value::Null).await;
    assert_eq!(info["result"]["server_type"], "broker");
    assert_eq!(info["result"]["tasks"], 1);
    assert_eq!(info["result"]["dead_letters"], 0);
    assert_eq!(info["result"]["methods"].as_array().unwrap().len(), METHODS.len());
}

#[test]
fn test_call_context_keys() {
    assert_eq!(CallContext::new(Some("k".into()), None).client_key, "key:k");
    let peer: SocketAddr = "192.168.1.4:1234".parse().unwrap();
    assert_eq!(CallContext::new(None, Some(peer)).client_key, "ip:192.168.1.4");
    assert_eq!(CallContext::new(None, None).client_key, "anonymous");
}
