use std::fmt;

use thiserror::Error;

use crate::model::TaskState;
use crate::protocol::jsonrpc;

/// Kind of entity a lookup failed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Service,
    Agent,
    Task,
    Subscription,
    DeadLetter,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Service => "service",
            EntityKind::Agent => "agent",
            EntityKind::Task => "task",
            EntityKind::Subscription => "subscription",
            EntityKind::DeadLetter => "dead letter",
        };
        f.write_str(name)
    }
}

/// Every error the bus can surface.
///
/// Each variant has a stable JSON-RPC code ([`BusError::rpc_code`]), a
/// machine-readable string code ([`BusError::code`]) used by the REST
/// surface, and an HTTP status ([`BusError::http_status`]).
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Capability not supported: {0}")]
    CapabilityNotSupported(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: TaskState, to: TaskState },

    #[error("Delivery failure: {0}")]
    DeliveryFailure(String),

    #[error("Circuit open for destination {0}")]
    CircuitOpen(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    /// Error object returned by a remote JSON-RPC server.
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BusError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        BusError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        BusError::Validation(msg.into())
    }

    /// JSON-RPC error code for this error.
    pub fn rpc_code(&self) -> i32 {
        match self {
            BusError::Validation(_) => jsonrpc::INVALID_PARAMS,
            BusError::NotFound {
                kind: EntityKind::Task,
                ..
            } => jsonrpc::TASK_NOT_FOUND,
            BusError::NotFound { .. } => jsonrpc::AGENT_NOT_FOUND,
            BusError::DuplicateId(_) => jsonrpc::DUPLICATE_ID,
            BusError::Unauthorized(_) | BusError::PermissionDenied(_) => jsonrpc::UNAUTHORIZED,
            BusError::CapabilityNotSupported(_) => jsonrpc::CAPABILITY_NOT_SUPPORTED,
            BusError::InvalidStateTransition { .. } => jsonrpc::INVALID_STATE_TRANSITION,
            BusError::RateLimited { .. } => jsonrpc::RATE_LIMITED,
            BusError::Timeout(_) => jsonrpc::TIMEOUT,
            BusError::CircuitOpen(_) => jsonrpc::CIRCUIT_OPEN,
            BusError::DeliveryFailure(_) => jsonrpc::DELIVERY_FAILURE,
            BusError::Remote { code, .. } => *code,
            BusError::Transport(_)
            | BusError::Json(_)
            | BusError::Io(_)
            | BusError::Config(_)
            | BusError::Internal(_) => jsonrpc::INTERNAL_ERROR,
        }
    }

    /// Machine-readable code used in REST error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            BusError::Validation(_) => "validation_error",
            BusError::NotFound { .. } => "not_found",
            BusError::DuplicateId(_) => "duplicate_id",
            BusError::Unauthorized(_) => "unauthorized",
            BusError::PermissionDenied(_) => "permission_denied",
            BusError::CapabilityNotSupported(_) => "capability_not_supported",
            BusError::InvalidStateTransition { .. } => "invalid_state_transition",
            BusError::DeliveryFailure(_) => "delivery_failure",
            BusError::CircuitOpen(_) => "circuit_open",
            BusError::RateLimited { .. } => "rate_limited",
            BusError::Timeout(_) => "timeout",
            BusError::Remote { .. } => "remote_error",
            BusError::Transport(_)
            | BusError::Json(_)
            | BusError::Io(_)
            | BusError::Config(_)
            | BusError::Internal(_) => "internal_error",
        }
    }

    /// HTTP status code for the REST surface.
    pub fn http_status(&self) -> u16 {
        match self {
            BusError::Validation(_) => 400,
            BusError::Unauthorized(_) => 401,
            BusError::PermissionDenied(_) => 403,
            BusError::NotFound { .. } => 404,
            BusError::DuplicateId(_) | BusError::InvalidStateTransition { .. } => 409,
            BusError::CapabilityNotSupported(_) => 422,
            BusError::RateLimited { .. } => 429,
            BusError::CircuitOpen(_) | BusError::DeliveryFailure(_) => 503,
            BusError::Timeout(_) => 504,
            BusError::Remote { .. } => 502,
            _ => 500,
        }
    }

    /// True for faults whose text must not leave the process.
    pub fn is_internal(&self) -> bool {
        self.code() == "internal_error"
    }

    /// Message safe to show to a remote caller.
    pub fn public_message(&self) -> String {
        if self.is_internal() {
            "Internal error".to_string()
        } else {
            self.to_string()
        }
    }

    /// Whether a delivery attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::DeliveryFailure(_)
                | BusError::Timeout(_)
                | BusError::Transport(_)
                | BusError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
