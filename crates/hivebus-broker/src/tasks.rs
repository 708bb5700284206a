//! Task lifecycle host.
//!
//! Every transition goes through [`TaskManager::transition`], which checks
//! the edge against [`TaskState::can_transition_to`], validates the
//! payload the target state needs, then mutates and appends to the
//! history in one step under the task's map entry. A rejected transition
//! leaves the task untouched.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use hivebus_common::model::{Task, TaskFilter, TaskState, TaskTransition};
use hivebus_common::protocol::error::{BusError, EntityKind, Result};

use crate::events::{BusEvent, EventBus};

/// Input of `task.create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub input_data: Value,
    #[serde(default)]
    pub required_capability: Option<String>,
}

/// Optional data carried by a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionInput {
    pub agent_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub reason: Option<String>,
}

/// Runs synchronously with the task right after it was cancelled.
pub type CancelHook = Box<dyn Fn(&Task) + Send + Sync>;

pub struct TaskManager {
    tasks: DashMap<String, Task>,
    events: EventBus,
    on_cancelled: Option<CancelHook>,
}

impl TaskManager {
    pub fn new(events: EventBus) -> Self {
        Self {
            tasks: DashMap::new(),
            events,
            on_cancelled: None,
        }
    }

    pub fn with_cancel_hook(mut self, hook: impl Fn(&Task) + Send + Sync + 'static) -> Self {
        self.on_cancelled = Some(Box::new(hook));
        self
    }

    pub fn create(&self, new_task: NewTask) -> Result<Task> {
        if new_task.name.trim().is_empty() {
            return Err(BusError::validation("task name is required"));
        }
        if let Some(id) = &new_task.id {
            if id.trim().is_empty() {
                return Err(BusError::validation("task id must not be empty when supplied"));
            }
        }
        let id = new_task.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let task = Task {
            id: id.clone(),
            name: new_task.name,
            state: TaskState::Pending,
            assigned_agent_id: None,
            required_capability: new_task.required_capability,
            input_data: new_task.input_data,
            progress: 0.0,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        };

        match self.tasks.entry(id.clone()) {
            Entry::Occupied(_) => Err(BusError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(task.clone());
                info!(task_id = %id, name = %task.name, "task created");
                Ok(task)
            }
        }
    }

    pub fn get(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .get(task_id)
            .map(|t| t.clone())
            .ok_or_else(|| BusError::not_found(EntityKind::Task, task_id))
    }

    /// Tasks matching `filter`, oldest first, truncated to `filter.limit`.
    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<_> = self
            .tasks
            .iter()
            .filter(|t| filter.matches(t))
            .map(|t| t.clone())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Starts a pending task on `agent_id`.
    ///
    /// Agent existence and capability are the caller's to check.
    pub fn assign(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        self.transition(
            task_id,
            TaskState::Running,
            TransitionInput {
                agent_id: Some(agent_id.to_string()),
                ..Default::default()
            },
        )
    }

    pub fn update_state(&self, task_id: &str, to: TaskState, input: TransitionInput) -> Result<Task> {
        self.transition(task_id, to, input)
    }

    pub fn complete(&self, task_id: &str, result: Option<Value>) -> Result<Task> {
        self.transition(
            task_id,
            TaskState::Completed,
            TransitionInput {
                result,
                ..Default::default()
            },
        )
    }

    pub fn fail(&self, task_id: &str, error: Option<String>) -> Result<Task> {
        self.transition(
            task_id,
            TaskState::Failed,
            TransitionInput {
                error,
                ..Default::default()
            },
        )
    }

    pub fn cancel(&self, task_id: &str, reason: Option<String>) -> Result<Task> {
        self.transition(
            task_id,
            TaskState::Cancelled,
            TransitionInput {
                reason,
                ..Default::default()
            },
        )
    }

    /// Sets progress on a running task. `progress` must lie in `0.0..=1.0`.
    pub fn update_progress(&self, task_id: &str, progress: f64) -> Result<Task> {
        if !(0.0..=1.0).contains(&progress) {
            return Err(BusError::validation(format!(
                "progress must be between 0.0 and 1.0, got {}",
                progress
            )));
        }
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BusError::not_found(EntityKind::Task, task_id))?;
        if task.state != TaskState::Running {
            return Err(BusError::validation(format!(
                "progress can only be reported while running, task is {}",
                task.state
            )));
        }
        task.progress = progress;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    fn transition(&self, task_id: &str, to: TaskState, input: TransitionInput) -> Result<Task> {
        let (snapshot, from) = {
            let mut task = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| BusError::not_found(EntityKind::Task, task_id))?;
            let from = task.state;

            if !from.can_transition_to(to) {
                return Err(BusError::InvalidStateTransition { from, to });
            }
            if input.agent_id.is_some() && !(from == TaskState::Pending && to == TaskState::Running) {
                return Err(BusError::validation(
                    "an agent can only be assigned when a pending task starts",
                ));
            }
            match to {
                TaskState::Completed if input.result.is_none() => {
                    return Err(BusError::validation("completing a task requires a result"));
                }
                TaskState::Failed if input.error.as_deref().map_or(true, |e| e.trim().is_empty()) => {
                    return Err(BusError::validation("failing a task requires an error"));
                }
                _ => {}
            }

            let now = Utc::now();
            task.state = to;
            task.updated_at = now;
            if let Some(agent) = input.agent_id {
                task.assigned_agent_id = Some(agent);
            }
            match to {
                TaskState::Completed => {
                    task.result = input.result;
                    task.progress = 1.0;
                }
                TaskState::Failed => task.error = input.error,
                _ => {}
            }
            task.history.push(TaskTransition {
                from,
                to,
                at: now,
                reason: input.reason,
            });
            (task.clone(), from)
        };

        info!(
            task_id,
            %from,
            %to,
            agent_id = snapshot.assigned_agent_id.as_deref().unwrap_or("-"),
            "task state changed"
        );
        self.events.publish(BusEvent::TaskStateChanged {
            task_id: snapshot.id.clone(),
            from,
            to,
            assigned_agent_id: snapshot.assigned_agent_id.clone(),
            reason: snapshot.history.last().and_then(|t| t.reason.clone()),
        });
        if to == TaskState::Cancelled {
            if let Some(hook) = &self.on_cancelled {
                hook(&snapshot);
            }
        }
        Ok(snapshot)
    }
}
