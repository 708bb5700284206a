//! Composition root of a running bus.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hivebus_client::{ConnectionPool, HttpConnector};
use hivebus_common::config::BusConfig;
use hivebus_common::model::{MessageEnvelope, Task, TransportKind};
use hivebus_common::protocol::error::Result;
use hivebus_metrics::BrokerMetricsCollector;

use crate::delivery::DeliveryManager;
use crate::events::{BusEvent, EventBus, BUS_SOURCE};
use crate::health::{HealthMonitor, HealthNotice};
use crate::http_server::HttpServer;
use crate::registry::ServiceRegistry;
use crate::router::MessageRouter;
use crate::rpc::Dispatcher;
use crate::sessions::{SessionConnector, SessionHub};
use crate::tasks::TaskManager;

/// A bus instance: every component plus its background tasks.
///
/// The background tasks are:
/// - the health scheduler and the consumer of its notices
/// - the event pump, which republishes [`BusEvent`]s as topic messages
/// - the idle connection reaper
///
/// All of them stop on [`Bus::shutdown`].
pub struct Bus {
    config: BusConfig,
    events: EventBus,
    metrics: BrokerMetricsCollector,
    registry: Arc<ServiceRegistry>,
    tasks: Arc<TaskManager>,
    delivery: Arc<DeliveryManager>,
    router: Arc<MessageRouter>,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionHub>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Bus {
    /// Builds every component from `config` and starts the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Arguments
    /// * `config` - Validated bus configuration
    ///
    /// # Returns
    /// - `Ok(Arc<Bus>)` - The running bus
    /// - `Err(BusError::Config)` - The configuration is invalid
    pub async fn start(config: BusConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let events = EventBus::default();
        let event_rx = events.subscribe();
        let metrics = BrokerMetricsCollector::new();
        let sessions = Arc::new(SessionHub::default());

        let pool = Arc::new(
            ConnectionPool::new(config.pool.clone())
                .with_connector(TransportKind::Http, Arc::new(HttpConnector::default()))
                .with_connector(
                    TransportKind::WebSocket,
                    Arc::new(SessionConnector::new(sessions.clone())),
                ),
        );

        let (health, scheduler) = HealthMonitor::new(config.health.clone(), config.circuit.clone());
        let health = Arc::new(health);
        let delivery = DeliveryManager::new(
            config.retry.clone(),
            config.batch.clone(),
            pool,
            health.clone(),
            metrics.clone(),
            events.clone(),
            cancel.child_token(),
        );
        let registry = Arc::new(
            ServiceRegistry::new(health, events.clone()).with_removal_hook({
                let delivery = delivery.clone();
                move |record| delivery.remove_destination(&record.id, &record.endpoint)
            }),
        );
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            delivery.clone(),
            metrics.clone(),
        ));
        let tasks = Arc::new(TaskManager::new(events.clone()).with_cancel_hook({
            let router = router.clone();
            move |task| notify_cancelled(&router, task)
        }));
        let dispatcher = Arc::new(
            Dispatcher::new(registry.clone(), tasks.clone(), delivery.clone(), metrics.clone())?
                .with_authorizer(Arc::new(config.auth_config()))
                .with_rate_limiter(config.rate_limiter())
                .with_handler_timeout(config.server.handler_timeout()),
        );

        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let mut background = vec![tokio::spawn(scheduler.run(notice_tx, cancel.child_token()))];
        background.push(tokio::spawn(consume_notices(
            notice_rx,
            registry.clone(),
            events.clone(),
            cancel.child_token(),
        )));
        background.push(tokio::spawn(pump_events(event_rx, router.clone(), cancel.child_token())));
        background.push(tokio::spawn(reap_idle_connections(
            delivery.clone(),
            config.pool.idle_timeout(),
            cancel.child_token(),
        )));

        info!(
            auth = %config.auth_config(),
            rate_limited = dispatcher.rate_limiter().is_enabled(),
            "bus started"
        );

        Ok(Arc::new(Self {
            config,
            events,
            metrics,
            registry,
            tasks,
            delivery,
            router,
            dispatcher,
            sessions,
            cancel,
            background: Mutex::new(background),
        }))
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> &BrokerMetricsCollector {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    pub fn delivery(&self) -> &Arc<DeliveryManager> {
        &self.delivery
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn sessions(&self) -> &Arc<SessionHub> {
        &self.sessions
    }

    /// Token cancelled by [`Bus::shutdown`].
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Serves HTTP on the configured address until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = self.config.bind_addr()?;
        self.serve_on(addr).await
    }

    pub async fn serve_on(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        HttpServer::new(self).run(addr).await
    }

    /// Serves HTTP on an already bound listener until shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        HttpServer::new(self).serve(listener).await
    }

    /// Stops the background tasks, the delivery workers and the HTTP server.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("bus shutting down");
        self.cancel.cancel();
        let handles: Vec<_> = self.background.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.delivery.drain().await;
    }
}

async fn consume_notices(
    mut notices: mpsc::UnboundedReceiver<HealthNotice>,
    registry: Arc<ServiceRegistry>,
    events: EventBus,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            notice = notices.recv() => match notice {
                Some(HealthNotice::StatusChanged { service_id, from, to }) => {
                    events.publish(BusEvent::ServiceStatusChanged { service_id, from, to });
                }
                Some(HealthNotice::Expired { service_id }) => {
                    if registry.expire(&service_id) {
                        info!(service_id = %service_id, "service expired after absence timeout");
                    }
                }
                None => break,
            },
        }
    }
}

/// Sends the assigned agent a direct `task.cancelled` notice.
fn notify_cancelled(router: &MessageRouter, task: &Task) {
    let Some(agent_id) = task.assigned_agent_id.as_deref() else {
        return;
    };
    let reason = task.history.last().and_then(|step| step.reason.clone());
    let notice = MessageEnvelope::direct(
        agent_id,
        json!({ "type": "task.cancelled", "task_id": task.id, "reason": reason }),
    )
    .with_source(BUS_SOURCE);
    if let Err(e) = router.publish(notice) {
        warn!(task_id = %task.id, agent_id, "could not notify agent of cancellation: {}", e);
    }
}

/// Republishes bus events as topic messages. Best effort: a lagging pump drops events.
async fn pump_events(mut events: broadcast::Receiver<BusEvent>, router: Arc<MessageRouter>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event pump lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        if event.is_self_referential() {
            continue;
        }
        let message = MessageEnvelope::to_topic(event.topic(), event.to_payload()).with_source(BUS_SOURCE);
        match router.publish(message) {
            Ok(receipt) if !receipt.routed.is_empty() => {
                debug!(topic = event.topic(), routed = receipt.routed.len(), "event published");
            }
            Ok(_) => {}
            Err(e) => warn!(topic = event.topic(), "failed to publish event: {}", e),
        }
    }
    debug!("event pump stopped");
}

async fn reap_idle_connections(delivery: Arc<DeliveryManager>, idle_timeout: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval((idle_timeout / 2).max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let closed = delivery.pool().reap_idle();
                if closed > 0 {
                    debug!(closed, "reaped idle connections");
                }
            }
        }
    }
}
