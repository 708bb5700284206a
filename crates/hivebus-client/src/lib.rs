//! Hivebus Client
//!
//! Outbound plumbing shared by the broker and by tools that talk to it:
//!
//! - [`ConnectionPool`]: per-destination pool the delivery workers draw from
//! - [`Connector`] / [`Connection`]: transport seam, one connector per
//!   [`TransportKind`](hivebus_common::model::TransportKind)
//! - [`HttpConnector`]: delivers envelopes to `http://` endpoints
//! - [`BusClient`]: JSON-RPC client for the broker's `/rpc` endpoint

pub mod client;
pub mod http;
pub mod pool;

pub use client::BusClient;
pub use http::HttpConnector;
pub use pool::{Connection, ConnectionPool, Connector, PoolStats, PooledConnection};
