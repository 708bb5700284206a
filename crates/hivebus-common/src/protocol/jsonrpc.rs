//! JSON-RPC 2.0 Protocol Types
//!
//! Wire types for the agent task protocol.
//!
//! # Error Codes
//!
//! Standard JSON-RPC 2.0 error codes:
//! - `-32700`: Parse error
//! - `-32600`: Invalid request
//! - `-32601`: Method not found
//! - `-32602`: Invalid params
//! - `-32603`: Internal error
//!
//! Domain codes live in the reserved `-32000..-32099` range:
//! - `-32000`: Agent or service not found
//! - `-32001`: Task not found
//! - `-32002`: Unauthorized
//! - `-32003`: Capability not supported
//! - `-32004`: Invalid task state transition
//! - `-32005`: Rate limited
//! - `-32006`: Timeout
//! - `-32007`: Duplicate id
//! - `-32008`: Circuit open
//! - `-32009`: Delivery failure
//!
//! # Example
//!
//! ```
//! use hivebus_common::protocol::jsonrpc::{JsonRpcRequest, JsonRpcResponse, JsonRpcError};
//! use serde_json::json;
//!
//! let request = JsonRpcRequest::new("task.get", json!({"task_id": "t-1"}), json!(1));
//! assert!(!request.is_notification());
//!
//! let response = JsonRpcResponse::error(json!(1), JsonRpcError::method_not_found());
//! assert_eq!(response.error.unwrap().code, -32601);
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::protocol::error::BusError;

/// JSON-RPC version string carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request
///
/// A missing `id` member marks the request as a notification. An explicit
/// `"id": null` is kept as `Some(Value::Null)` and still gets a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,
    /// Name of the method to invoke
    pub method: String,
    /// Parameter values (object, array, or omitted)
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    /// Request identifier, `None` for notifications
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<Value>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,
    /// Result value on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error object on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Request identifier (null when it could not be determined)
    pub id: Value,
}

/// JSON-RPC 2.0 error
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    /// Error code
    pub code: i32,
    /// Short description of the error
    pub message: String,
    /// Additional data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Invalid JSON was received by the server
pub const PARSE_ERROR: i32 = -32700;
/// The JSON sent is not a valid Request object
pub const INVALID_REQUEST: i32 = -32600;
/// The method does not exist / is not available
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Invalid method parameter(s)
pub const INVALID_PARAMS: i32 = -32602;
/// Internal JSON-RPC error
pub const INTERNAL_ERROR: i32 = -32603;

/// Unknown agent or service id
pub const AGENT_NOT_FOUND: i32 = -32000;
/// Unknown task id
pub const TASK_NOT_FOUND: i32 = -32001;
/// Missing or rejected credentials
pub const UNAUTHORIZED: i32 = -32002;
/// Agent does not advertise the required capability
pub const CAPABILITY_NOT_SUPPORTED: i32 = -32003;
/// Task lifecycle violation
pub const INVALID_STATE_TRANSITION: i32 = -32004;
/// Caller exceeded its request budget
pub const RATE_LIMITED: i32 = -32005;
/// Handler did not finish in time
pub const TIMEOUT: i32 = -32006;
/// Caller-supplied id already registered
pub const DUPLICATE_ID: i32 = -32007;
/// Destination circuit is open
pub const CIRCUIT_OPEN: i32 = -32008;
/// Message could not be delivered
pub const DELIVERY_FAILURE: i32 = -32009;

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Requests without an `id` member get no response.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Validates the shape of one decoded request entry.
    ///
    /// On failure returns the `-32600` response to send back, carrying the
    /// entry's id when one could be recovered.
    pub fn from_value(value: Value) -> Result<Self, JsonRpcResponse> {
        let Value::Object(mut obj) = value else {
            return Err(JsonRpcResponse::error(
                Value::Null,
                JsonRpcError::invalid_request(),
            ));
        };

        let id = obj.remove("id");
        let reply_id = match &id {
            Some(v @ (Value::String(_) | Value::Number(_) | Value::Null)) => v.clone(),
            Some(_) => {
                return Err(JsonRpcResponse::error(
                    Value::Null,
                    JsonRpcError::invalid_request_with("id must be a string, number or null"),
                ))
            }
            None => Value::Null,
        };

        let invalid = |msg: &str| {
            JsonRpcResponse::error(reply_id.clone(), JsonRpcError::invalid_request_with(msg))
        };

        match obj.remove("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            _ => return Err(invalid("jsonrpc must be \"2.0\"")),
        }

        let method = match obj.remove("method") {
            Some(Value::String(m)) if !m.is_empty() => m,
            _ => return Err(invalid("method must be a non-empty string")),
        };

        let params = match obj.remove("params") {
            None | Some(Value::Null) => Value::Null,
            Some(p @ (Value::Object(_) | Value::Array(_))) => p,
            Some(_) => return Err(invalid("params must be an object or an array")),
        };

        Ok(Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method,
            params,
            id,
        })
    }

    /// Params as an object, treating omitted params as `{}`.
    pub fn params_object(&self) -> Value {
        match &self.params {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        }
    }
}

impl JsonRpcError {
    /// Create a parse error (-32700)
    pub fn parse_error() -> Self {
        Self {
            code: PARSE_ERROR,
            message: "Parse error".into(),
            data: None,
        }
    }

    /// Create an invalid request error (-32600)
    pub fn invalid_request() -> Self {
        Self {
            code: INVALID_REQUEST,
            message: "Invalid Request".into(),
            data: None,
        }
    }

    /// Invalid request error with a detail string in `data`.
    pub fn invalid_request_with(detail: &str) -> Self {
        Self {
            data: Some(Value::String(detail.into())),
            ..Self::invalid_request()
        }
    }

    /// Create a method not found error (-32601)
    pub fn method_not_found() -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: "Method not found".into(),
            data: None,
        }
    }

    /// Create an invalid params error (-32602)
    pub fn invalid_params(msg: &str) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: msg.into(),
            data: None,
        }
    }

    /// Create an internal error (-32603)
    ///
    /// The message is fixed; internal detail stays in the server log.
    pub fn internal_error() -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: "Internal error".into(),
            data: None,
        }
    }
}

impl From<&BusError> for JsonRpcError {
    fn from(err: &BusError) -> Self {
        let data = match err {
            BusError::RateLimited { retry_after_ms } => {
                Some(serde_json::json!({ "retry_after_ms": retry_after_ms }))
            }
            _ => None,
        };
        Self {
            code: err.rpc_code(),
            message: err.public_message(),
            data: data.or_else(|| Some(Value::String(err.code().into()))),
        }
    }
}

impl From<BusError> for JsonRpcError {
    fn from(err: BusError) -> Self {
        JsonRpcError::from(&err)
    }
}

impl JsonRpcResponse {
    /// Create a success response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response
    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
