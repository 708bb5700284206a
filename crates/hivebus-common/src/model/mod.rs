//! Entities owned by the bus.
//!
//! Every type here derives `Serialize`/`Deserialize` so a storage
//! collaborator can persist rows keyed by the entity id as-is.

pub mod agent;
pub mod message;
pub mod service;
pub mod task;

pub use agent::{AgentCard, AgentProfile};
pub use message::{
    DeadLetter, MessageEnvelope, MessageStatus, Priority, PublishReceipt, PublishRequest,
    SkippedDestination,
};
pub use service::{
    topic_matches, validate_topic, Endpoint, Registration, ServiceQuery, ServiceRecord,
    ServiceStatus, Subscription, TransportKind,
};
pub use task::{Task, TaskFilter, TaskState, TaskTransition};
