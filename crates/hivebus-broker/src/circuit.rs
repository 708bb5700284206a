//! Per-destination circuit breakers.
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open   --(cooldown elapsed, checked lazily)--------> HalfOpen
//! HalfOpen --(half_open_successes successes)---------> Closed
//! HalfOpen --(any failure)---------------------------> Open (next cooldown step)
//! ```
//!
//! The cooldown for the n-th consecutive opening is
//! `cooldown × backoff_multiplier^(n-1)`, capped at `max_cooldown`.

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use hivebus_common::config::CircuitBreakerConfig;
use hivebus_common::protocol::error::{BusError, Result};

/// Circuit breaker state for a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, deliveries flow through
    Closed,
    /// Tripped, deliveries fail fast without a network call
    Open,
    /// Probing whether the destination recovered
    HalfOpen,
}

#[derive(Debug, Clone)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    /// Openings since the circuit was last closed
    opens: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opens: 0,
            opened_at: None,
            cooldown: Duration::ZERO,
        }
    }

    fn open(&mut self, config: &CircuitBreakerConfig, now: Instant) {
        self.opens = self.opens.saturating_add(1);
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.cooldown = config.calculate_cooldown(self.opens);
        self.half_open_successes = 0;
    }

    /// Moves an open circuit to half-open once its cooldown elapsed.
    fn refresh(&mut self, now: Instant) {
        if self.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = self.opened_at {
            if now.saturating_duration_since(opened_at) >= self.cooldown {
                self.state = CircuitState::HalfOpen;
                self.opened_at = None;
                self.half_open_successes = 0;
            }
        }
    }
}

/// Snapshot of one circuit, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitStatus {
    pub destination: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub cooldown_ms: u64,
}

/// Circuit breakers keyed by destination service id.
///
/// Destinations without a recorded outcome are implicitly closed.
#[derive(Debug)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Circuit>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Fails with [`BusError::CircuitOpen`] while the destination's circuit is open.
    pub fn check(&self, destination: &str) -> Result<()> {
        let Some(mut circuit) = self.circuits.get_mut(destination) else {
            return Ok(());
        };
        let before = circuit.state;
        circuit.refresh(Instant::now());
        match circuit.state {
            CircuitState::Open => Err(BusError::CircuitOpen(destination.to_string())),
            CircuitState::HalfOpen => {
                if before == CircuitState::Open {
                    info!(destination, "circuit half-open, allowing probe");
                }
                Ok(())
            }
            CircuitState::Closed => Ok(()),
        }
    }

    /// Time left before an open circuit lets a probe through, `None` unless open.
    pub fn open_remaining(&self, destination: &str) -> Option<Duration> {
        let mut circuit = self.circuits.get_mut(destination)?;
        let now = Instant::now();
        circuit.refresh(now);
        match (circuit.state, circuit.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                Some(circuit.cooldown.saturating_sub(now.saturating_duration_since(opened_at)))
            }
            _ => None,
        }
    }

    pub fn record_success(&self, destination: &str) -> CircuitState {
        let Some(mut circuit) = self.circuits.get_mut(destination) else {
            return CircuitState::Closed;
        };
        circuit.refresh(Instant::now());
        match circuit.state {
            CircuitState::Closed => circuit.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                circuit.half_open_successes += 1;
                if circuit.half_open_successes >= self.config.half_open_successes {
                    *circuit = Circuit::new();
                    info!(destination, "circuit closed after successful probes");
                }
            }
            // A late success from before the circuit opened
            CircuitState::Open => {}
        }
        circuit.state
    }

    pub fn record_failure(&self, destination: &str) -> CircuitState {
        let now = Instant::now();
        let mut circuit = self
            .circuits
            .entry(destination.to_string())
            .or_insert_with(Circuit::new);
        circuit.refresh(now);
        match circuit.state {
            CircuitState::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    circuit.open(&self.config, now);
                    warn!(
                        destination,
                        failures = circuit.consecutive_failures,
                        cooldown_ms = circuit.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.consecutive_failures += 1;
                circuit.open(&self.config, now);
                warn!(
                    destination,
                    cooldown_ms = circuit.cooldown.as_millis() as u64,
                    "probe failed, circuit re-opened"
                );
            }
            CircuitState::Open => {}
        }
        circuit.state
    }

    pub fn state(&self, destination: &str) -> CircuitState {
        match self.circuits.get_mut(destination) {
            Some(mut circuit) => {
                circuit.refresh(Instant::now());
                circuit.state
            }
            None => CircuitState::Closed,
        }
    }

    pub fn remove(&self, destination: &str) {
        self.circuits.remove(destination);
    }

    /// Every destination with a non-trivial circuit, sorted by destination.
    pub fn statuses(&self) -> Vec<CircuitStatus> {
        let now = Instant::now();
        let mut statuses: Vec<_> = self
            .circuits
            .iter_mut()
            .map(|mut entry| {
                entry.refresh(now);
                CircuitStatus {
                    destination: entry.key().clone(),
                    state: entry.state,
                    consecutive_failures: entry.consecutive_failures,
                    cooldown_ms: entry.cooldown.as_millis() as u64,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.destination.cmp(&b.destination));
        statuses
    }
}
