//! Hivebus Common Types
//!
//! Shared building blocks for the Hivebus service bus: the entity model,
//! the JSON-RPC 2.0 wire types, the error taxonomy, configuration, and the
//! authentication and rate limiting checks applied at every entry point.
//!
//! # Overview
//!
//! Hivebus connects AI services and agents. Services register an endpoint
//! and a set of capabilities, keep themselves alive with heartbeats, and
//! exchange messages either by topic (pub/sub) or by service id (direct).
//! Agents additionally take part in a task protocol driven over JSON-RPC.
//!
//! # Components
//!
//! - [`model`] - Services, agents, subscriptions, envelopes, dead letters, tasks
//! - [`protocol`] - JSON-RPC types and [`BusError`]
//! - [`config`] - Layered [`BusConfig`] (defaults, TOML file, environment)
//! - [`auth`] - API key checks
//! - [`rate_limit`] - Per-client token buckets
//!
//! # Example
//!
//! ```
//! use hivebus_common::model::{Endpoint, Registration};
//!
//! let registration = Registration::new("summarizer", Endpoint::http("http://10.0.0.5:7000/inbox"))
//!     .with_capability("summarize")
//!     .with_tag("gpu");
//! assert!(registration.validate().is_ok());
//! ```

pub mod auth;
pub mod config;
pub mod model;
pub mod protocol;
pub mod rate_limit;

pub use config::BusConfig;
pub use protocol::*;
