//! Internal bus events.
//!
//! Components publish [`BusEvent`]s on a shared broadcast channel. The bus
//! event pump turns each one into a topic message (`service.registered`,
//! `task.stateChanged`, ...) so services can subscribe to platform activity.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use hivebus_common::model::{Endpoint, ServiceStatus, TaskState};

/// Publisher id stamped on messages the bus emits itself.
pub const BUS_SOURCE: &str = "hivebus";

/// Why a service left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Requested,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum BusEvent {
    #[serde(rename = "service.registered")]
    ServiceRegistered { service_id: String, name: String },

    #[serde(rename = "service.deregistered")]
    ServiceDeregistered {
        service_id: String,
        endpoint: Endpoint,
        reason: RemovalReason,
    },

    #[serde(rename = "service.statusChanged")]
    ServiceStatusChanged {
        service_id: String,
        from: ServiceStatus,
        to: ServiceStatus,
    },

    #[serde(rename = "task.stateChanged")]
    TaskStateChanged {
        task_id: String,
        from: TaskState,
        to: TaskState,
        assigned_agent_id: Option<String>,
        reason: Option<String>,
    },

    #[serde(rename = "message.expired")]
    MessageExpired {
        message_id: String,
        destination: String,
        source: Option<String>,
    },

    #[serde(rename = "message.deadLettered")]
    MessageDeadLettered {
        dead_letter_id: String,
        message_id: String,
        destination: String,
        last_error: String,
        source: Option<String>,
    },
}

impl BusEvent {
    /// Topic the event is published on.
    pub fn topic(&self) -> &'static str {
        match self {
            BusEvent::ServiceRegistered { .. } => "service.registered",
            BusEvent::ServiceDeregistered { .. } => "service.deregistered",
            BusEvent::ServiceStatusChanged { .. } => "service.statusChanged",
            BusEvent::TaskStateChanged { .. } => "task.stateChanged",
            BusEvent::MessageExpired { .. } => "message.expired",
            BusEvent::MessageDeadLettered { .. } => "message.deadLettered",
        }
    }

    /// True for message events about messages the bus itself emitted.
    /// The pump does not republish these.
    pub fn is_self_referential(&self) -> bool {
        match self {
            BusEvent::MessageExpired { source, .. }
            | BusEvent::MessageDeadLettered { source, .. } => {
                source.as_deref() == Some(BUS_SOURCE)
            }
            _ => false,
        }
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Cloneable handle on the broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: BusEvent) {
        tracing::debug!(topic = event.topic(), "bus event");
        // No receivers is fine, e.g. in unit tests
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
