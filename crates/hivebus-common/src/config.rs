//! Broker configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `HIVEBUS_*` environment variables, then whatever the CLI overrides.
//! Every field has a documented default, so an empty file is valid.
//!
//! ```toml
//! [server]
//! port = 9090
//!
//! [health]
//! heartbeat_interval_ms = 5000
//!
//! [retry]
//! max_retries = 5
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;
use crate::protocol::error::{BusError, Result};
use crate::rate_limit::{RateLimitConfig, RateLimiter};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub server: ServerConfig,
    pub health: HealthConfig,
    pub circuit: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub batch: BatchConfig,
    pub pool: PoolConfig,
    pub auth: AuthSettings,
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Default: "0.0.0.0"
    pub host: String,
    /// Default: 8080
    pub port: u16,
    /// Largest accepted request body. Default: 1 MiB
    pub max_body_bytes: usize,
    /// Upper bound for one RPC handler. Default: 10000ms
    pub handler_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_body_bytes: 1024 * 1024,
            handler_timeout_ms: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

/// Heartbeat policy.
///
/// A service is online while silent for at most
/// `heartbeat_interval × missed_threshold`, degraded for one more such
/// window, offline after that, and removed after `absence_timeout`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Expected heartbeat period. Default: 10000ms
    pub heartbeat_interval_ms: u64,
    /// Missed heartbeats tolerated before degrading. Default: 2
    pub missed_threshold: u32,
    /// Silence after which the record is deleted, 0 disables. Default: 600000ms
    pub absence_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            missed_threshold: 2,
            absence_timeout_ms: 600_000,
        }
    }
}

impl HealthConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence tolerated before a service leaves `Online`.
    pub fn degraded_after(&self) -> Duration {
        self.heartbeat_interval() * self.missed_threshold
    }

    /// Silence after which a service is `Offline`.
    pub fn offline_after(&self) -> Duration {
        self.degraded_after() * 2
    }

    pub fn absence_timeout(&self) -> Option<Duration> {
        (self.absence_timeout_ms > 0).then(|| Duration::from_millis(self.absence_timeout_ms))
    }
}

/// Per-destination circuit breaker policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit. Default: 3
    pub failure_threshold: u32,
    /// First cooldown. Default: 5000ms
    pub cooldown_ms: u64,
    /// Cooldown cap. Default: 300000ms
    pub max_cooldown_ms: u64,
    /// Cooldown growth per re-open. Default: 2.0
    pub backoff_multiplier: f64,
    /// Successes in half-open needed to close. Default: 2
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 5_000,
            max_cooldown_ms: 300_000,
            backoff_multiplier: 2.0,
            half_open_successes: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Cooldown for the `opens`-th consecutive opening (1-based).
    pub fn calculate_cooldown(&self, opens: u32) -> Duration {
        let exponent = opens.max(1) as i32 - 1;
        let backoff_ms = (self.cooldown_ms as f64 * self.backoff_multiplier.powi(exponent)) as u64;
        Duration::from_millis(backoff_ms.min(self.max_cooldown_ms))
    }
}

/// Delivery retry policy with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts = max_retries + 1. Default: 3
    pub max_retries: u32,
    /// Wait before the first retry. Default: 50ms
    pub initial_backoff_ms: u64,
    /// Backoff cap. Default: 5000ms
    pub max_backoff_ms: u64,
    /// Default: 2.0
    pub backoff_multiplier: f64,
    /// Bound on one transmit. Default: 5000ms
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            attempt_timeout_ms: 5_000,
        }
    }
}

impl RetryConfig {
    /// Wait before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.max(1) as i32 - 1;
        let ms = (self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent)) as u64;
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Per-destination batching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// How long the first queued message waits for company. Default: 50ms
    pub window_ms: u64,
    /// A full batch flushes immediately. Default: 32
    pub max_batch_size: usize,
    /// Bound on queued messages per destination. Default: 1024
    pub queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_ms: 50,
            max_batch_size: 32,
            queue_capacity: 1024,
        }
    }
}

impl BatchConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Outbound connection pool limits, per destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections kept by the reaper. Default: 0
    pub min_connections: usize,
    /// Concurrent connections. Default: 8
    pub max_connections: usize,
    /// Wait for a free slot. Default: 2000ms
    pub acquire_timeout_ms: u64,
    /// Idle connections older than this are closed. Default: 60000ms
    pub idle_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 8,
            acquire_timeout_ms: 2_000,
            idle_timeout_ms: 60_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Full-access key; absent disables authentication
    pub api_key: Option<String>,
    pub read_only_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Absent disables rate limiting
    pub requests_per_second: Option<f64>,
    /// Default: twice the rate
    pub burst_size: Option<u32>,
}

impl BusConfig {
    /// Defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    BusError::Config(format!("failed to read {}: {}", path.display(), e))
                })?;
                tracing::debug!("loading configuration from {}", path.display());
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| BusError::Config(e.to_string()))
    }

    /// Applies `HIVEBUS_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HIVEBUS_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("HIVEBUS_PORT") {
            self.server.port = parse_env("HIVEBUS_PORT", &port)?;
        }
        if let Some(key) = lookup("HIVEBUS_API_KEY") {
            self.auth.api_key = Some(key);
        }
        if let Some(ms) = lookup("HIVEBUS_HEARTBEAT_INTERVAL_MS") {
            self.health.heartbeat_interval_ms = parse_env("HIVEBUS_HEARTBEAT_INTERVAL_MS", &ms)?;
        }
        if let Some(rps) = lookup("HIVEBUS_RATE_LIMIT_RPS") {
            self.rate_limit.requests_per_second = Some(parse_env("HIVEBUS_RATE_LIMIT_RPS", &rps)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 10] = [
            (self.health.heartbeat_interval_ms > 0, "health.heartbeat_interval_ms must be > 0"),
            (self.health.missed_threshold > 0, "health.missed_threshold must be > 0"),
            (self.circuit.failure_threshold > 0, "circuit.failure_threshold must be > 0"),
            (self.circuit.half_open_successes > 0, "circuit.half_open_successes must be > 0"),
            (self.batch.max_batch_size > 0, "batch.max_batch_size must be > 0"),
            (self.batch.queue_capacity > 0, "batch.queue_capacity must be > 0"),
            (self.pool.max_connections > 0, "pool.max_connections must be > 0"),
            (
                self.pool.min_connections <= self.pool.max_connections,
                "pool.min_connections must not exceed pool.max_connections",
            ),
            (self.retry.backoff_multiplier >= 1.0, "retry.backoff_multiplier must be >= 1.0"),
            (self.server.handler_timeout_ms > 0, "server.handler_timeout_ms must be > 0"),
        ];
        for (ok, msg) in checks {
            if !ok {
                return Err(BusError::Config(msg.to_string()));
            }
        }
        if let Some(rps) = self.rate_limit.requests_per_second {
            if !(rps > 0.0) {
                return Err(BusError::Config(
                    "rate_limit.requests_per_second must be > 0".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| {
                BusError::Config(format!(
                    "invalid bind address {}:{}: {}",
                    self.server.host, self.server.port, e
                ))
            })
    }

    pub fn auth_config(&self) -> AuthConfig {
        match &self.auth.api_key {
            Some(key) => {
                let auth = AuthConfig::with_api_key(key.clone());
                match &self.auth.read_only_key {
                    Some(read) => auth.with_read_only_key(read.clone()),
                    None => auth,
                }
            }
            None => AuthConfig::disabled(),
        }
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        match self.rate_limit.requests_per_second {
            Some(rps) => {
                let mut config = RateLimitConfig::per_second(rps);
                if let Some(burst) = self.rate_limit.burst_size {
                    config.burst_size = burst.max(1);
                }
                RateLimiter::new(config)
            }
            None => RateLimiter::disabled(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BusError::Config(format!("{key}={value}: {e}")))
}
