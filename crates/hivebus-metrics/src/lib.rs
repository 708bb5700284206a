//! Hivebus Metrics Collection
//!
//! Thread-safe metrics for the Hivebus broker: RPC call counts and latency
//! percentiles per method, publish counts, and delivery outcomes per
//! destination service.
//!
//! # Architecture
//!
//! - [`MetricsRegistry`]: storage with atomic counters and a logarithmic
//!   latency histogram per method
//! - [`MetricsCollector`]: trait the dispatcher uses to record calls and
//!   answer the built-in methods
//! - [`MetricsSnapshot`]: serializable point-in-time view
//!
//! # Built-in Monitoring Methods
//!
//! - **`_metrics`**: returns the complete [`MetricsSnapshot`]
//! - **`_info`**: returns [`ServerInfo`] with version and uptime
//!
//! Both are answered by the collector and never reach a domain handler.

mod collector;
mod registry;
mod snapshot;

pub use collector::{BrokerMetricsCollector, MetricsCollector, INFO_METHOD, METRICS_METHOD};
pub use registry::{DeliveryOutcome, MetricsConfig, MetricsRegistry};
pub use snapshot::{DestinationMetrics, MethodMetrics, MetricsSnapshot, ServerInfo};
