//! Domain handlers behind the method table.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use hivebus_common::model::{AgentProfile, ServiceQuery, TaskFilter};
use hivebus_common::protocol::error::{BusError, Result};

use super::methods::*;
use super::Dispatcher;
use crate::registry::AgentFilter;
use crate::tasks::{NewTask, TransitionInput};

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Runs one domain method with already-checked credentials.
pub(super) async fn invoke(dispatcher: &Dispatcher, method: Method, params: Value) -> Result<Value> {
    debug!(%method, "invoking handler");
    let registry = &dispatcher.registry;
    let tasks = &dispatcher.tasks;

    match method {
        Method::AgentRegister => {
            let mut registration: AgentRegisterParams = parse_params(method, params)?;
            if registration.agent.is_none() {
                registration.agent = Some(AgentProfile::default());
            }
            let record = registry.register(registration)?;
            to_value(registry.agent(&record.id)?)
        }
        Method::AgentUnregister => {
            let p: AgentIdParams = parse_params(method, params)?;
            registry.deregister(&p.agent_id)?;
            to_value(serde_json::json!({ "agent_id": p.agent_id, "unregistered": true }))
        }
        Method::AgentHeartbeat => {
            let p: AgentIdParams = parse_params(method, params)?;
            let status = registry.heartbeat(&p.agent_id)?;
            to_value(serde_json::json!({ "agent_id": p.agent_id, "status": status }))
        }
        Method::AgentList => {
            let filter: AgentFilter = parse_params(method, params)?;
            to_value(registry.agents(&filter))
        }
        Method::DiscoveryQuery => {
            let query: ServiceQuery = parse_params(method, params)?;
            to_value(registry.query(&query))
        }
        Method::DiscoveryFindForCapability => {
            let p: FindForCapabilityParams = parse_params(method, params)?;
            to_value(registry.find_for_capability(&p.capability, p.method.as_deref()))
        }
        Method::TaskCreate => {
            let new_task: NewTask = parse_params(method, params)?;
            to_value(tasks.create(new_task)?)
        }
        Method::TaskAssign => {
            let p: TaskAssignParams = parse_params(method, params)?;
            let task = tasks.get(&p.task_id)?;
            let agent = registry.agent(&p.agent_id)?;
            if let Some(capability) = &task.required_capability {
                if !agent.supports(capability) {
                    return Err(BusError::CapabilityNotSupported(format!(
                        "agent '{}' does not advertise '{}'",
                        agent.id, capability
                    )));
                }
            }
            to_value(tasks.assign(&p.task_id, &agent.id)?)
        }
        Method::TaskUpdateState => {
            let p: TaskUpdateStateParams = parse_params(method, params)?;
            let input = TransitionInput {
                agent_id: None,
                result: p.result,
                error: p.error,
                reason: p.reason,
            };
            to_value(tasks.update_state(&p.task_id, p.state, input)?)
        }
        Method::TaskUpdateProgress => {
            let p: TaskProgressParams = parse_params(method, params)?;
            to_value(tasks.update_progress(&p.task_id, p.progress)?)
        }
        Method::TaskComplete => {
            let p: TaskCompleteParams = parse_params(method, params)?;
            to_value(tasks.complete(&p.task_id, p.result)?)
        }
        Method::TaskFail => {
            let p: TaskFailParams = parse_params(method, params)?;
            to_value(tasks.fail(&p.task_id, p.error)?)
        }
        Method::TaskCancel => {
            let p: TaskCancelParams = parse_params(method, params)?;
            to_value(tasks.cancel(&p.task_id, p.reason)?)
        }
        Method::TaskGet => {
            let p: TaskIdParams = parse_params(method, params)?;
            to_value(tasks.get(&p.task_id)?)
        }
        Method::TaskList => {
            let filter: TaskFilter = parse_params(method, params)?;
            to_value(tasks.list(&filter))
        }
    }
}
