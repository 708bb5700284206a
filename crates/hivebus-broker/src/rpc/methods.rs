//! Static method table and typed parameters of the agent task protocol.

use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use hivebus_common::auth::Access;
use hivebus_common::model::{Registration, TaskState};
use hivebus_common::protocol::error::{BusError, Result};

/// Every domain method the dispatcher serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    AgentRegister,
    AgentUnregister,
    AgentHeartbeat,
    AgentList,
    DiscoveryQuery,
    DiscoveryFindForCapability,
    TaskCreate,
    TaskAssign,
    TaskUpdateState,
    TaskUpdateProgress,
    TaskComplete,
    TaskFail,
    TaskCancel,
    TaskGet,
    TaskList,
}

/// Wire names of [`Method`]. Checked for duplicates by [`validate_table`].
pub const METHODS: &[(Method, &str)] = &[
    (Method::AgentRegister, "agent.register"),
    (Method::AgentUnregister, "agent.unregister"),
    (Method::AgentHeartbeat, "agent.heartbeat"),
    (Method::AgentList, "agent.list"),
    (Method::DiscoveryQuery, "discovery.query"),
    (Method::DiscoveryFindForCapability, "discovery.find_for_capability"),
    (Method::TaskCreate, "task.create"),
    (Method::TaskAssign, "task.assign"),
    (Method::TaskUpdateState, "task.update_state"),
    (Method::TaskUpdateProgress, "task.update_progress"),
    (Method::TaskComplete, "task.complete"),
    (Method::TaskFail, "task.fail"),
    (Method::TaskCancel, "task.cancel"),
    (Method::TaskGet, "task.get"),
    (Method::TaskList, "task.list"),
];

impl Method {
    pub fn name(self) -> &'static str {
        METHODS
            .iter()
            .find(|(m, _)| *m == self)
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }

    pub fn from_name(name: &str) -> Option<Method> {
        METHODS.iter().find(|(_, n)| *n == name).map(|(m, _)| *m)
    }

    pub fn access(self) -> Access {
        match self {
            Method::AgentList
            | Method::DiscoveryQuery
            | Method::DiscoveryFindForCapability
            | Method::TaskGet
            | Method::TaskList => Access::Read,
            _ => Access::Write,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fails when two methods share a wire name or a method has none.
pub fn validate_table() -> Result<()> {
    let mut names = HashSet::new();
    let mut methods = HashSet::new();
    for (method, name) in METHODS {
        if !names.insert(*name) {
            return Err(BusError::Internal(format!("duplicate method name '{}'", name)));
        }
        if !methods.insert(*method) {
            return Err(BusError::Internal(format!("method {:?} listed twice", method)));
        }
    }
    Ok(())
}

/// Deserializes `params` into a method's parameter struct.
pub fn parse_params<T: for<'de> Deserialize<'de>>(method: Method, params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| BusError::validation(format!("invalid params for {}: {}", method, e)))
}

// ============================================================================
// Parameters
// ============================================================================

/// `agent.register` takes a [`Registration`] as-is.
pub type AgentRegisterParams = Registration;

#[derive(Debug, Deserialize)]
pub struct AgentIdParams {
    pub agent_id: String,
}

#[derive(Debug, Deserialize)]
pub struct FindForCapabilityParams {
    pub capability: String,
    #[serde(default)]
    pub method: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TaskIdParams {
    pub task_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TaskAssignParams {
    pub task_id: String,
    pub agent_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TaskUpdateStateParams {
    pub task_id: String,
    pub state: TaskState,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TaskProgressParams {
    pub task_id: String,
    pub progress: f64,
}

#[derive(Debug, Deserialize)]
pub struct TaskCompleteParams {
    pub task_id: String,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct TaskFailParams {
    pub task_id: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TaskCancelParams {
    pub task_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}
