//! Delivery manager.
//!
//! One bounded queue and one worker task per destination, so deliveries to
//! a destination happen in enqueue order and a slow destination never
//! delays another.
//!
//! A worker takes the first queued envelope, keeps collecting until the
//! batch window passes or the batch is full, then delivers the batch in
//! order over one pooled connection. Each envelope is retried with
//! exponential backoff; after `max_retries` retries it is dead-lettered
//! once and never retried automatically.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hivebus_client::{ConnectionPool, PooledConnection};
use hivebus_common::config::{BatchConfig, RetryConfig};
use hivebus_common::model::{DeadLetter, Endpoint, MessageEnvelope, MessageStatus};
use hivebus_common::protocol::error::{BusError, Result};
use hivebus_metrics::{BrokerMetricsCollector, DeliveryOutcome};

use crate::events::{BusEvent, EventBus};
use crate::health::HealthMonitor;

#[derive(Debug)]
struct Job {
    destination: String,
    endpoint: Endpoint,
    envelope: MessageEnvelope,
}

/// Queue and worker of one destination.
struct Lane {
    sender: mpsc::Sender<Job>,
    worker: JoinHandle<()>,
}

/// Failures where nothing reached the destination. Only these count
/// toward its circuit; a destination that answered with an error status
/// is reachable.
fn is_unreachable(error: &BusError) -> bool {
    matches!(
        error,
        BusError::Transport(_) | BusError::Timeout(_) | BusError::Io(_)
    )
}

pub struct DeliveryManager {
    retry: RetryConfig,
    batch: BatchConfig,
    pool: Arc<ConnectionPool>,
    health: Arc<HealthMonitor>,
    metrics: BrokerMetricsCollector,
    events: EventBus,
    lanes: DashMap<String, Lane>,
    /// Workers of removed destinations that still drain their queue
    retiring: DashMap<String, JoinHandle<()>>,
    dead_letters: DashMap<String, DeadLetter>,
    /// Envelopes enqueued and not yet settled
    outstanding: AtomicUsize,
    idle: Notify,
    cancel: CancellationToken,
}

impl DeliveryManager {
    pub fn new(
        retry: RetryConfig,
        batch: BatchConfig,
        pool: Arc<ConnectionPool>,
        health: Arc<HealthMonitor>,
        metrics: BrokerMetricsCollector,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            retry,
            batch,
            pool,
            health,
            metrics,
            events,
            lanes: DashMap::new(),
            retiring: DashMap::new(),
            dead_letters: DashMap::new(),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
            cancel,
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Queues `envelope` for `destination`.
    ///
    /// Fails with `DeliveryFailure` when the destination's queue is full.
    pub fn enqueue(
        self: &Arc<Self>,
        destination: &str,
        endpoint: &Endpoint,
        envelope: MessageEnvelope,
    ) -> Result<()> {
        let sender = self
            .lanes
            .entry(destination.to_string())
            .or_insert_with(|| self.spawn_lane(destination))
            .sender
            .clone();

        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let job = Job {
            destination: destination.to_string(),
            endpoint: endpoint.clone(),
            envelope,
        };
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.settle();
                Err(BusError::DeliveryFailure(format!(
                    "delivery queue for {} is full",
                    destination
                )))
            }
            Err(TrySendError::Closed(_)) => {
                self.settle();
                self.lanes.remove(destination);
                Err(BusError::DeliveryFailure("delivery is shutting down".into()))
            }
        }
    }

    fn spawn_lane(self: &Arc<Self>, destination: &str) -> Lane {
        let (sender, rx) = mpsc::channel(self.batch.queue_capacity.max(1));
        let previous = self.retiring.remove(destination).map(|(_, worker)| worker);
        let worker = tokio::spawn(Arc::clone(self).run_worker(destination.to_string(), rx, previous));
        Lane { sender, worker }
    }

    async fn run_worker(
        self: Arc<Self>,
        destination: String,
        mut rx: mpsc::Receiver<Job>,
        previous: Option<JoinHandle<()>>,
    ) {
        // A re-registered destination starts once the old queue is empty
        if let Some(previous) = previous {
            debug!(destination, "waiting for the previous worker to drain");
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = previous => {}
            }
        }
        debug!(destination, "delivery worker started");
        loop {
            let first = tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let mut batch = vec![first];
            let deadline = Instant::now() + self.batch.window();
            while batch.len() < self.batch.max_batch_size {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(job)) => batch.push(job),
                    Ok(None) | Err(_) => break,
                }
            }

            debug!(destination, size = batch.len(), "delivering batch");
            self.deliver_batch(batch).await;
        }

        rx.close();
        let mut abandoned = 0;
        while rx.try_recv().is_ok() {
            abandoned += 1;
            self.settle();
        }
        debug!(destination, abandoned, "delivery worker stopped");
    }

    async fn deliver_batch(&self, batch: Vec<Job>) {
        let mut conn: Option<PooledConnection> = None;
        for job in batch {
            self.deliver_one(job, &mut conn).await;
            self.settle();
        }
    }

    async fn deliver_one(&self, job: Job, conn: &mut Option<PooledConnection>) {
        let Job {
            destination,
            endpoint,
            mut envelope,
        } = job;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            if envelope.is_expired() {
                envelope.status = MessageStatus::Failed;
                info!(message_id = %envelope.id, destination, "message expired before delivery");
                self.events.publish(BusEvent::MessageExpired {
                    message_id: envelope.id.clone(),
                    destination: destination.clone(),
                    source: envelope.source.clone(),
                });
                return;
            }

            // No network call while the circuit is open; the wait is not an attempt
            if let Some(wait) = self.health.circuits().open_remaining(&destination) {
                self.metrics
                    .record_delivery(&destination, DeliveryOutcome::CircuitRejected);
                debug!(
                    message_id = %envelope.id,
                    destination,
                    wait_ms = wait.as_millis() as u64,
                    "circuit open, holding delivery"
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                continue;
            }

            let error = match self.attempt(&endpoint, &envelope, conn).await {
                Ok(()) => {
                    envelope.status = MessageStatus::Delivered;
                    self.health.circuits().record_success(&destination);
                    self.metrics
                        .record_delivery(&destination, DeliveryOutcome::Delivered);
                    debug!(message_id = %envelope.id, destination, "delivered");
                    return;
                }
                Err(e) => e,
            };

            envelope.record_attempt();
            if is_unreachable(&error) {
                self.health.circuits().record_failure(&destination);
            }
            self.metrics
                .record_delivery(&destination, DeliveryOutcome::FailedAttempt);

            if !error.is_retryable() || envelope.delivery_attempts > self.retry.max_retries {
                self.dead_letter(envelope, &destination, &error);
                return;
            }

            let backoff = self.retry.backoff_for(envelope.delivery_attempts);
            warn!(
                message_id = %envelope.id,
                destination,
                attempt = envelope.delivery_attempts,
                backoff_ms = backoff.as_millis() as u64,
                "delivery failed: {}, retrying",
                error
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn attempt(
        &self,
        endpoint: &Endpoint,
        envelope: &MessageEnvelope,
        conn: &mut Option<PooledConnection>,
    ) -> Result<()> {
        if !conn.as_ref().is_some_and(|c| c.is_open()) {
            if let Some(stale) = conn.take() {
                stale.discard();
            }
            *conn = Some(self.pool.acquire(endpoint).await?);
        }
        let active = conn
            .as_mut()
            .ok_or_else(|| BusError::Internal("no pooled connection".into()))?;

        let timeout = self.retry.attempt_timeout();
        let result = tokio::time::timeout(timeout, active.transmit(envelope)).await;
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                if !active.is_open() {
                    if let Some(broken) = conn.take() {
                        broken.discard();
                    }
                }
                Err(e)
            }
            Err(_) => {
                if let Some(stuck) = conn.take() {
                    stuck.discard();
                }
                Err(BusError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    fn dead_letter(&self, mut envelope: MessageEnvelope, destination: &str, error: &BusError) {
        envelope.status = MessageStatus::DeadLettered;
        let dead = DeadLetter {
            id: Uuid::new_v4().to_string(),
            envelope,
            destination: destination.to_string(),
            last_error: error.to_string(),
            dead_lettered_at: Utc::now(),
        };
        warn!(
            message_id = %dead.envelope.id,
            dead_letter_id = %dead.id,
            destination,
            attempts = dead.envelope.delivery_attempts,
            "message dead-lettered: {}",
            error
        );
        self.metrics
            .record_delivery(destination, DeliveryOutcome::DeadLettered);
        self.events.publish(BusEvent::MessageDeadLettered {
            dead_letter_id: dead.id.clone(),
            message_id: dead.envelope.id.clone(),
            destination: destination.to_string(),
            last_error: dead.last_error.clone(),
            source: dead.envelope.source.clone(),
        });
        self.dead_letters.insert(dead.id.clone(), dead);
    }

    fn settle(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Waits until every enqueued envelope is delivered, expired or dead-lettered.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Stops accepting work for a destination. Already queued envelopes
    /// are still attempted, and a new lane for the same id waits for them.
    pub fn remove_destination(&self, destination: &str, endpoint: &Endpoint) {
        if let Some((_, lane)) = self.lanes.remove(destination) {
            self.retiring.retain(|_, worker| !worker.is_finished());
            self.retiring.insert(destination.to_string(), lane.worker);
        }
        self.pool.remove(endpoint);
        self.metrics.forget_destination(destination);
    }

    pub fn active_destinations(&self) -> usize {
        self.lanes.len()
    }

    // ========================================================================
    // Dead letters
    // ========================================================================

    /// Dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        let mut all: Vec<_> = self.dead_letters.iter().map(|d| d.clone()).collect();
        all.sort_by(|a, b| {
            a.dead_lettered_at
                .cmp(&b.dead_lettered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    pub fn dead_letter_by_id(&self, id: &str) -> Option<DeadLetter> {
        self.dead_letters.get(id).map(|d| d.clone())
    }

    pub fn remove_dead_letter(&self, id: &str) -> Option<DeadLetter> {
        self.dead_letters.remove(id).map(|(_, d)| d)
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingConnector;
    use hivebus_common::config::{CircuitBreakerConfig, HealthConfig, PoolConfig};
    use crate::circuit::CircuitState;
    use hivebus_common::model::TransportKind;
    use hivebus_metrics::MetricsCollector;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        manager: Arc<DeliveryManager>,
        connector: Arc<RecordingConnector>,
        health: Arc<HealthMonitor>,
        metrics: BrokerMetricsCollector,
        events: EventBus,
        cancel: CancellationToken,
    }

    fn harness(retry: RetryConfig, batch: BatchConfig, circuit: CircuitBreakerConfig) -> Harness {
        let connector = Arc::new(RecordingConnector::default());
        let pool = Arc::new(
            ConnectionPool::new(PoolConfig::default())
                .with_connector(TransportKind::Http, connector.clone()),
        );
        let (health, _scheduler) = HealthMonitor::new(HealthConfig::default(), circuit);
        let health = Arc::new(health);
        let metrics = BrokerMetricsCollector::new();
        let events = EventBus::new(64);
        let cancel = CancellationToken::new();
        let manager = DeliveryManager::new(
            retry,
            batch,
            pool,
            health.clone(),
            metrics.clone(),
            events.clone(),
            cancel.clone(),
        );
        Harness {
            manager,
            connector,
            health,
            metrics,
            events,
            cancel,
        }
    }

    fn default_harness() -> Harness {
        harness(
            RetryConfig::default(),
            BatchConfig::default(),
            CircuitBreakerConfig::default(),
        )
    }

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::http(format!("http://127.0.0.1:9000/{name}"))
    }

    fn message(dest: &str, seq: u64) -> MessageEnvelope {
        MessageEnvelope::direct(dest, json!({ "seq": seq }))
    }

    fn seqs(envelopes: &[MessageEnvelope]) -> Vec<u64> {
        envelopes
            .iter()
            .map(|e| e.payload["seq"].as_u64().unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_per_destination() {
        let h = default_harness();
        let (a, b) = (endpoint("a"), endpoint("b"));
        for seq in 0..50 {
            h.manager.enqueue("a", &a, message("a", seq)).unwrap();
            h.manager.enqueue("b", &b, message("b", 100 + seq)).unwrap();
        }
        h.manager.drain().await;

        assert_eq!(seqs(&h.connector.delivered_to(&a.address)), (0..50).collect::<Vec<_>>());
        assert_eq!(
            seqs(&h.connector.delivered_to(&b.address)),
            (100..150).collect::<Vec<_>>()
        );
        assert_eq!(h.manager.outstanding(), 0);
        assert_eq!(h.manager.active_destinations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_shares_one_connection() {
        let h = default_harness();
        let ep = endpoint("a");
        for seq in 0..5 {
            h.manager.enqueue("a", &ep, message("a", seq)).unwrap();
        }
        h.manager.drain().await;
        assert_eq!(h.connector.opened.load(Ordering::SeqCst), 1);
        assert_eq!(h.connector.delivered_to(&ep.address).len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_mid_batch_is_dead_lettered_once() {
        let h = default_harness();
        let ep = endpoint("a");
        for seq in 1..=5 {
            let mut msg = message("a", seq);
            if seq == 3 {
                msg.payload["fail"] = json!(true);
            }
            h.manager.enqueue("a", &ep, msg).unwrap();
        }
        h.manager.drain().await;

        assert_eq!(seqs(&h.connector.delivered_to(&ep.address)), vec![1, 2, 4, 5]);
        let dead = h.manager.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].envelope.payload["seq"], 3);
        assert_eq!(dead[0].envelope.delivery_attempts, 4);
        assert_eq!(dead[0].envelope.status, MessageStatus::DeadLettered);
        assert_eq!(dead[0].destination, "a");
        assert!(dead[0].last_error.contains("500"));
        // max_retries + 1 transmits for the failing message
        assert_eq!(h.connector.transmits(), 4 + 4);
        // The destination kept answering, so its circuit never opened
        assert_eq!(h.health.circuits().state("a"), CircuitState::Closed);

        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.total_delivered(), 4);
        assert_eq!(snapshot.total_dead_lettered(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers() {
        let h = default_harness();
        let ep = endpoint("a");
        h.connector.fail_address(&ep.address);
        h.manager.enqueue("a", &ep, message("a", 1)).unwrap();

        // First attempt fails after the batch window, then heal before the retry
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.connector.heal_address(&ep.address);
        h.manager.drain().await;

        let delivered = h.connector.delivered_to(&ep.address);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].delivery_attempts, 1);
        assert!(h.manager.dead_letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_destination_opens_circuit() {
        let h = harness(
            RetryConfig {
                max_retries: 5,
                ..Default::default()
            },
            BatchConfig::default(),
            CircuitBreakerConfig {
                failure_threshold: 3,
                cooldown_ms: 60_000,
                ..Default::default()
            },
        );
        let ep = endpoint("a");
        h.connector.cut_address(&ep.address);
        h.manager.enqueue("a", &ep, message("a", 1)).unwrap();
        h.manager.drain().await;

        // Three failures open the circuit; each later attempt is a single
        // half-open attempt after a cooldown, and the cooldowns spend no attempts
        assert_eq!(h.connector.transmits(), 6);
        let dead = h.manager.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].envelope.delivery_attempts, 6);
        assert!(dead[0].last_error.contains("refused"));
        assert_eq!(h.health.circuits().state("a"), CircuitState::Open);

        let metrics = h.metrics.snapshot();
        let dest = &metrics.destinations["a"];
        assert_eq!(dest.failed_attempts, 6);
        assert_eq!(dest.circuit_rejections, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_holds_queue_without_spending_retries() {
        let h = default_harness();
        let ep = endpoint("a");
        h.connector.cut_address(&ep.address);
        h.manager.enqueue("a", &ep, message("a", 1)).unwrap();
        h.manager.enqueue("a", &ep, message("a", 2)).unwrap();

        // The destination comes back while its circuit is open
        let health = h.health.clone();
        let connector = h.connector.clone();
        let address = ep.address.clone();
        tokio::spawn(async move {
            while health.circuits().state("a") != CircuitState::Open {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            connector.restore_address(&address);
        });
        h.manager.drain().await;

        let delivered = h.connector.delivered_to(&ep.address);
        assert_eq!(seqs(&delivered), vec![1, 2]);
        assert_eq!(delivered[0].delivery_attempts, 3);
        assert_eq!(delivered[1].delivery_attempts, 0);
        assert!(h.manager.dead_letters().is_empty());
        // Two successful probes close it again
        assert_eq!(h.health.circuits().state("a"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readded_destination_waits_for_previous_worker() {
        let h = harness(
            RetryConfig {
                initial_backoff_ms: 500,
                ..Default::default()
            },
            BatchConfig::default(),
            CircuitBreakerConfig::default(),
        );
        let ep = endpoint("a");
        h.connector.fail_address(&ep.address);
        h.manager.enqueue("a", &ep, message("a", 1)).unwrap();

        // First attempt has failed, the message now waits for its retry
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.manager.remove_destination("a", &ep);
        assert_eq!(h.manager.active_destinations(), 0);

        h.manager.enqueue("a", &ep, message("a", 2)).unwrap();
        h.connector.heal_address(&ep.address);
        h.manager.drain().await;

        assert_eq!(seqs(&h.connector.delivered_to(&ep.address)), vec![1, 2]);
        assert_eq!(h.manager.active_destinations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_is_not_delivered() {
        let h = default_harness();
        let mut events = h.events.subscribe();
        let ep = endpoint("a");
        // TTL is wall-clock, so backdate instead of sleeping
        let mut msg = message("a", 1).with_ttl(Duration::from_millis(10));
        msg.created_at -= chrono::Duration::milliseconds(20);
        let id = msg.id.clone();

        h.manager.enqueue("a", &ep, msg).unwrap();
        h.manager.drain().await;

        assert!(h.connector.delivered_to(&ep.address).is_empty());
        assert!(h.manager.dead_letters().is_empty());
        match events.recv().await.unwrap() {
            BusEvent::MessageExpired { message_id, .. } => assert_eq!(message_id, id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_rejects() {
        let h = harness(
            RetryConfig::default(),
            BatchConfig {
                queue_capacity: 2,
                max_batch_size: 1,
                window_ms: 10,
            },
            CircuitBreakerConfig::default(),
        );
        let ep = endpoint("a");
        let results: Vec<_> = (0..10)
            .map(|seq| h.manager.enqueue("a", &ep, message("a", seq)))
            .collect();
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(BusError::DeliveryFailure(m)) if m.contains("full"))));
        h.manager.drain().await;
        assert_eq!(h.manager.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_settles_outstanding_work() {
        let h = default_harness();
        let ep = endpoint("a");
        h.connector.fail_address(&ep.address);
        for seq in 0..3 {
            h.manager.enqueue("a", &ep, message("a", seq)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.cancel.cancel();
        h.manager.drain().await;
        assert_eq!(h.manager.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_dead_letter() {
        let h = default_harness();
        let ep = endpoint("a");
        let mut msg = message("a", 1);
        msg.payload["fail"] = json!(true);
        h.manager.enqueue("a", &ep, msg).unwrap();
        h.manager.drain().await;

        let id = h.manager.dead_letters()[0].id.clone();
        assert!(h.manager.dead_letter_by_id(&id).is_some());
        assert!(h.manager.remove_dead_letter(&id).is_some());
        assert_eq!(h.manager.dead_letter_count(), 0);
    }
}
