//! Per-destination connection pool.
//!
//! Each destination endpoint gets a semaphore of `max_connections` permits
//! and a LIFO list of idle connections. [`ConnectionPool::acquire`] waits at
//! most `acquire_timeout` for a permit, then reuses the most recently
//! released open connection or opens a new one through the [`Connector`]
//! registered for the endpoint's transport kind.
//!
//! The returned [`PooledConnection`] goes back to the idle list when
//! dropped. Call [`PooledConnection::discard`] after an error so a broken
//! connection is closed instead of reused.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hivebus_client::{ConnectionPool, HttpConnector};
//! use hivebus_common::config::PoolConfig;
//! use hivebus_common::model::{Endpoint, MessageEnvelope, TransportKind};
//! use serde_json::json;
//!
//! # async fn demo() -> hivebus_common::Result<()> {
//! let pool = ConnectionPool::new(PoolConfig::default())
//!     .with_connector(TransportKind::Http, Arc::new(HttpConnector::new()));
//!
//! let endpoint = Endpoint::http("http://10.0.0.5:7000/inbox");
//! let mut conn = pool.acquire(&endpoint).await?;
//! conn.transmit(&MessageEnvelope::direct("svc-1", json!({"hello": "world"}))).await?;
//! // dropped here, back to the idle list
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use hivebus_common::config::PoolConfig;
use hivebus_common::model::{Endpoint, MessageEnvelope, TransportKind};
use hivebus_common::protocol::error::{BusError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// An open channel to one destination.
#[async_trait]
pub trait Connection: Send {
    /// Hands one envelope to the destination and waits for its acknowledgment.
    async fn transmit(&mut self, envelope: &MessageEnvelope) -> Result<()>;

    /// False once the connection is known to be broken.
    fn is_open(&self) -> bool;
}

/// Opens connections for one transport kind.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>>;
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    since: Instant,
}

struct DestinationSlots {
    permits: Arc<Semaphore>,
    /// Most recently released last
    idle: Mutex<Vec<IdleConnection>>,
    in_use: AtomicUsize,
}

impl DestinationSlots {
    fn new(max_connections: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_connections)),
            idle: Mutex::new(Vec::new()),
            in_use: AtomicUsize::new(0),
        }
    }

    fn pop_open(&self) -> Option<Box<dyn Connection>> {
        let mut idle = self.idle.lock();
        while let Some(entry) = idle.pop() {
            if entry.conn.is_open() {
                return Some(entry.conn);
            }
            tracing::debug!("dropping closed idle connection");
        }
        None
    }

    fn is_unused(&self) -> bool {
        self.in_use.load(Ordering::Relaxed) == 0 && self.idle.lock().is_empty()
    }
}

/// Idle and in-use connection counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub destinations: usize,
    pub idle: usize,
    pub in_use: usize,
}

/// Connection pool keyed by destination endpoint.
pub struct ConnectionPool {
    config: PoolConfig,
    connectors: HashMap<TransportKind, Arc<dyn Connector>>,
    destinations: Mutex<HashMap<Endpoint, Arc<DestinationSlots>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            connectors: HashMap::new(),
            destinations: Mutex::new(HashMap::new()),
        }
    }

    /// Registers the connector used for endpoints of `kind`.
    pub fn with_connector(mut self, kind: TransportKind, connector: Arc<dyn Connector>) -> Self {
        self.connectors.insert(kind, connector);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn slots_for(&self, endpoint: &Endpoint) -> Arc<DestinationSlots> {
        let mut destinations = self.destinations.lock();
        destinations
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(DestinationSlots::new(self.config.max_connections)))
            .clone()
    }

    /// Acquires a connection to `endpoint`.
    ///
    /// # Errors
    ///
    /// - [`BusError::Timeout`] if no permit frees up within `acquire_timeout`
    /// - [`BusError::Transport`] if no connector handles the transport kind
    /// - whatever the connector returns when opening a new connection fails
    pub async fn acquire(&self, endpoint: &Endpoint) -> Result<PooledConnection> {
        let slots = self.slots_for(endpoint);

        let permit = match tokio::time::timeout(
            self.config.acquire_timeout(),
            slots.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(BusError::Internal("connection pool closed".into())),
            Err(_) => {
                tracing::debug!(endpoint = %endpoint, "pool acquisition timed out");
                return Err(BusError::Timeout(self.config.acquire_timeout_ms));
            }
        };

        let conn = match slots.pop_open() {
            Some(conn) => conn,
            None => {
                let connector = self.connectors.get(&endpoint.transport).ok_or_else(|| {
                    BusError::Transport(format!("no connector for {} endpoints", endpoint.transport))
                })?;
                tracing::debug!(endpoint = %endpoint, "opening connection");
                connector.connect(endpoint).await?
            }
        };

        slots.in_use.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            conn: Some(conn),
            slots,
            _permit: permit,
        })
    }

    /// Closes idle connections older than `idle_timeout`, keeping the
    /// `min_connections` most recent ones per destination. Returns how many
    /// were closed.
    pub fn reap_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let min = self.config.min_connections;
        let now = Instant::now();
        let mut closed = 0;

        let mut destinations = self.destinations.lock();
        for slots in destinations.values() {
            let mut idle = slots.idle.lock();
            let mut kept = Vec::with_capacity(idle.len());
            for entry in idle.drain(..).rev() {
                let fresh = now.duration_since(entry.since) < idle_timeout;
                if entry.conn.is_open() && (fresh || kept.len() < min) {
                    kept.push(entry);
                } else {
                    closed += 1;
                }
            }
            kept.reverse();
            *idle = kept;
        }
        destinations.retain(|_, slots| !slots.is_unused());

        if closed > 0 {
            tracing::debug!(closed, "reaped idle connections");
        }
        closed
    }

    /// Forgets a destination; its idle connections are closed.
    pub fn remove(&self, endpoint: &Endpoint) {
        self.destinations.lock().remove(endpoint);
    }

    pub fn stats(&self) -> PoolStats {
        let destinations = self.destinations.lock();
        destinations.values().fold(
            PoolStats {
                destinations: destinations.len(),
                ..Default::default()
            },
            |mut acc, slots| {
                acc.idle += slots.idle.lock().len();
                acc.in_use += slots.in_use.load(Ordering::Relaxed);
                acc
            },
        )
    }

    pub fn stats_for(&self, endpoint: &Endpoint) -> Option<PoolStats> {
        let slots = self.destinations.lock().get(endpoint).cloned()?;
        let idle = slots.idle.lock().len();
        Some(PoolStats {
            destinations: 1,
            idle,
            in_use: slots.in_use.load(Ordering::Relaxed),
        })
    }
}

/// A checked-out connection. Returns to the pool on drop.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    slots: Arc<DestinationSlots>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub async fn transmit(&mut self, envelope: &MessageEnvelope) -> Result<()> {
        match self.conn.as_mut() {
            Some(conn) => conn.transmit(envelope).await,
            None => Err(BusError::Internal("connection already discarded".into())),
        }
    }

    pub fn is_open(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.is_open())
    }

    /// Closes the connection instead of returning it to the pool.
    pub fn discard(mut self) {
        self.conn = None;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.slots.in_use.fetch_sub(1, Ordering::Relaxed);
        if let Some(conn) = self.conn.take() {
            if conn.is_open() {
                self.slots.idle.lock().push(IdleConnection {
                    conn,
                    since: Instant::now(),
                });
            }
        }
    }
}
