//! Hivebus broker: registry, health, routing, delivery and the task protocol.
pub mod bus;
pub mod circuit;
pub mod delivery;
pub mod events;
pub mod health;
pub mod http_server;
pub mod registry;
pub mod router;
pub mod rpc;
pub mod sessions;
pub mod tasks;
pub mod websocket;

#[cfg(test)]
mod testing;

pub use bus::Bus;
pub use circuit::{CircuitBreakers, CircuitState, CircuitStatus};
pub use delivery::DeliveryManager;
pub use events::{BusEvent, EventBus};
pub use health::{HealthMonitor, HealthNotice, HealthScheduler};
pub use http_server::{ApiError, HttpServer};
pub use registry::{AgentFilter, ServiceRegistry, SubscribeOutcome};
pub use router::MessageRouter;
pub use rpc::{CallContext, Dispatcher, Method};
pub use sessions::{ClientFrame, ServerFrame, SessionConnector, SessionHub};
pub use tasks::{NewTask, TaskManager, TransitionInput};
