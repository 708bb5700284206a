//! Heartbeat-driven liveness tracking.
//!
//! Status is a pure function of the silence since the last heartbeat, with
//! `window = heartbeat_interval × missed_threshold`:
//!
//! | silence            | status     |
//! |--------------------|------------|
//! | `<= window`        | `online`   |
//! | `<= 2 × window`    | `degraded` |
//! | `> 2 × window`     | `offline`  |
//!
//! Reads ([`HealthMonitor::status`]) derive the status on the spot. The
//! [`HealthScheduler`] owns a `DelayQueue` with one timer per service that
//! fires just past each boundary, so status changes and absence expiry are
//! reported as [`HealthNotice`]s without polling.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::{debug, info};

use hivebus_common::config::{CircuitBreakerConfig, HealthConfig};
use hivebus_common::model::ServiceStatus;

use crate::circuit::CircuitBreakers;

/// Timers fire this far past a boundary so the boundary itself stays in
/// the earlier status.
const BOUNDARY_SLACK: Duration = Duration::from_millis(1);

/// Something the scheduler noticed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthNotice {
    StatusChanged {
        service_id: String,
        from: ServiceStatus,
        to: ServiceStatus,
    },
    /// Silent for longer than the absence timeout
    Expired { service_id: String },
}

#[derive(Debug, Clone, Copy)]
struct Liveness {
    last_seen: Instant,
    /// Last status reported through a notice or a heartbeat
    reported: ServiceStatus,
}

#[derive(Debug)]
enum Command {
    Watch(String),
    Forget(String),
}

fn derive_status(config: &HealthConfig, silence: Duration) -> ServiceStatus {
    if silence <= config.degraded_after() {
        ServiceStatus::Online
    } else if silence <= config.offline_after() {
        ServiceStatus::Degraded
    } else {
        ServiceStatus::Offline
    }
}

/// Next boundary not yet passed at `silence`, if any.
fn next_boundary(config: &HealthConfig, silence: Duration) -> Option<Duration> {
    [
        Some(config.degraded_after()),
        Some(config.offline_after()),
        config.absence_timeout(),
    ]
    .into_iter()
    .flatten()
    .filter(|b| *b >= silence)
    .min()
}

/// Liveness table plus the per-destination circuit breakers.
///
/// Cheap to share behind an `Arc`; the timers live in the
/// [`HealthScheduler`] returned by [`HealthMonitor::new`].
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    liveness: Arc<DashMap<String, Liveness>>,
    commands: mpsc::UnboundedSender<Command>,
    circuits: CircuitBreakers,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, circuit: CircuitBreakerConfig) -> (Self, HealthScheduler) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let liveness = Arc::new(DashMap::new());
        let scheduler = HealthScheduler {
            config: config.clone(),
            liveness: Arc::clone(&liveness),
            commands: command_rx,
            queue: DelayQueue::new(),
            keys: HashMap::new(),
        };
        let monitor = Self {
            config,
            liveness,
            commands,
            circuits: CircuitBreakers::new(circuit),
        };
        (monitor, scheduler)
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn circuits(&self) -> &CircuitBreakers {
        &self.circuits
    }

    /// Starts tracking a service as online.
    pub fn track(&self, service_id: &str) {
        self.liveness.insert(
            service_id.to_string(),
            Liveness {
                last_seen: Instant::now(),
                reported: ServiceStatus::Online,
            },
        );
        self.watch(service_id);
    }

    /// Records a heartbeat. Returns the status the service had just before,
    /// or `None` if it is not tracked.
    pub fn beat(&self, service_id: &str) -> Option<ServiceStatus> {
        let now = Instant::now();
        let previous = {
            let mut entry = self.liveness.get_mut(service_id)?;
            let previous = derive_status(&self.config, now.saturating_duration_since(entry.last_seen));
            entry.last_seen = now;
            entry.reported = ServiceStatus::Online;
            previous
        };
        self.watch(service_id);
        Some(previous)
    }

    pub fn forget(&self, service_id: &str) {
        self.liveness.remove(service_id);
        self.circuits.remove(service_id);
        let _ = self.commands.send(Command::Forget(service_id.to_string()));
    }

    pub fn status(&self, service_id: &str) -> Option<ServiceStatus> {
        let entry = self.liveness.get(service_id)?;
        let silence = Instant::now().saturating_duration_since(entry.last_seen);
        Some(derive_status(&self.config, silence))
    }

    /// Liveness only; circuits are checked separately.
    pub fn is_online(&self, service_id: &str) -> bool {
        self.status(service_id) == Some(ServiceStatus::Online)
    }

    pub fn tracked(&self) -> usize {
        self.liveness.len()
    }

    fn watch(&self, service_id: &str) {
        // The scheduler is gone only during shutdown
        let _ = self.commands.send(Command::Watch(service_id.to_string()));
    }
}

/// Timer task of a [`HealthMonitor`].
pub struct HealthScheduler {
    config: HealthConfig,
    liveness: Arc<DashMap<String, Liveness>>,
    commands: mpsc::UnboundedReceiver<Command>,
    queue: DelayQueue<String>,
    keys: HashMap<String, Key>,
}

impl HealthScheduler {
    /// Runs until `cancel` fires or the monitor is dropped.
    pub async fn run(mut self, notices: mpsc::UnboundedSender<HealthNotice>, cancel: CancellationToken) {
        info!(
            heartbeat_interval_ms = self.config.heartbeat_interval_ms,
            missed_threshold = self.config.missed_threshold,
            "health scheduler started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Watch(id)) => self.schedule(&id),
                    Some(Command::Forget(id)) => self.unschedule(&id),
                    None => break,
                },
                Some(expired) = self.queue.next() => {
                    let id = expired.into_inner();
                    self.keys.remove(&id);
                    self.on_timer(&id, &notices);
                }
            }
        }
        debug!("health scheduler stopped");
    }

    fn schedule(&mut self, service_id: &str) {
        let Some(last_seen) = self.liveness.get(service_id).map(|l| l.last_seen) else {
            self.unschedule(service_id);
            return;
        };
        let silence = Instant::now().saturating_duration_since(last_seen);
        match next_boundary(&self.config, silence) {
            Some(boundary) => {
                let deadline = last_seen + boundary + BOUNDARY_SLACK;
                match self.keys.get(service_id) {
                    Some(key) => self.queue.reset_at(key, deadline),
                    None => {
                        let key = self.queue.insert_at(service_id.to_string(), deadline);
                        self.keys.insert(service_id.to_string(), key);
                    }
                }
            }
            None => self.unschedule(service_id),
        }
    }

    fn unschedule(&mut self, service_id: &str) {
        if let Some(key) = self.keys.remove(service_id) {
            self.queue.remove(&key);
        }
    }

    fn on_timer(&mut self, service_id: &str, notices: &mpsc::UnboundedSender<HealthNotice>) {
        let now = Instant::now();
        let change = {
            let Some(mut entry) = self.liveness.get_mut(service_id) else {
                return;
            };
            let silence = now.saturating_duration_since(entry.last_seen);

            if self.config.absence_timeout().is_some_and(|t| silence > t) {
                drop(entry);
                self.liveness.remove(service_id);
                info!(service_id, silence_ms = silence.as_millis() as u64, "service expired");
                let _ = notices.send(HealthNotice::Expired {
                    service_id: service_id.to_string(),
                });
                return;
            }

            let status = derive_status(&self.config, silence);
            let from = entry.reported;
            entry.reported = status;
            (from != status).then_some((from, status))
        };

        if let Some((from, to)) = change {
            info!(service_id, %from, %to, "service status changed");
            let _ = notices.send(HealthNotice::StatusChanged {
                service_id: service_id.to_string(),
                from,
                to,
            });
        }
        self.schedule(service_id);
    }
}
