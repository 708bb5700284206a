//! Service registry.
//!
//! Single source of truth for services, agent profiles and subscriptions.
//! All tables are `DashMap`s; no guard is held across an `.await` (the
//! registry has no async methods at all).

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use hivebus_common::model::{
    topic_matches, validate_topic, AgentCard, AgentProfile, Registration, ServiceQuery,
    ServiceRecord, ServiceStatus, Subscription,
};
use hivebus_common::protocol::error::{BusError, EntityKind, Result};

use crate::events::{BusEvent, EventBus, RemovalReason};
use crate::health::HealthMonitor;

/// Filter for agent listings. All set fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFilter {
    #[serde(default)]
    pub capability: Option<String>,
    /// Method the agent must serve
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub include_unavailable: bool,
}

/// Runs synchronously whenever a service leaves the registry.
pub type RemovalHook = Box<dyn Fn(&ServiceRecord) + Send + Sync>;

/// Outcome of [`ServiceRegistry::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub subscription: Subscription,
    /// False when the pair was already subscribed
    pub created: bool,
}

pub struct ServiceRegistry {
    services: DashMap<String, ServiceRecord>,
    agents: DashMap<String, AgentProfile>,
    subscriptions: DashMap<String, Subscription>,
    /// (topic, subscriber_id) -> subscription id
    subscription_index: DashMap<(String, String), String>,
    /// Ids that were registered once and are gone now
    tombstones: DashSet<String>,
    health: Arc<HealthMonitor>,
    events: EventBus,
    on_removed: Option<RemovalHook>,
}

impl ServiceRegistry {
    pub fn new(health: Arc<HealthMonitor>, events: EventBus) -> Self {
        Self {
            services: DashMap::new(),
            agents: DashMap::new(),
            subscriptions: DashMap::new(),
            subscription_index: DashMap::new(),
            tombstones: DashSet::new(),
            health,
            events,
            on_removed: None,
        }
    }

    /// Installs cleanup that must follow every removal, deregistration
    /// and expiry alike.
    pub fn with_removal_hook(mut self, hook: impl Fn(&ServiceRecord) + Send + Sync + 'static) -> Self {
        self.on_removed = Some(Box::new(hook));
        self
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn register(&self, registration: Registration) -> Result<ServiceRecord> {
        registration.validate()?;
        let id = registration
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(card_id) = registration.agent.as_ref().and_then(|a| a.id.as_ref()) {
            if *card_id != id {
                return Err(BusError::validation(format!(
                    "agent card id '{}' does not match registration id '{}'",
                    card_id, id
                )));
            }
        }

        let now = Utc::now();
        let record = ServiceRecord {
            id: id.clone(),
            name: registration.name,
            endpoint: registration.endpoint,
            capabilities: registration.capabilities,
            tags: registration.tags,
            metadata: registration.metadata,
            registered_at: now,
            last_heartbeat_at: now,
            status: ServiceStatus::Online,
        };

        match self.services.entry(id.clone()) {
            Entry::Occupied(_) => return Err(BusError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }

        if let Some(profile) = registration.agent {
            self.agents.insert(id.clone(), profile);
        }
        self.tombstones.remove(&id);
        self.health.track(&id);

        info!(
            service_id = %id,
            name = %record.name,
            endpoint = %record.endpoint,
            agent = self.agents.contains_key(&id),
            "service registered"
        );
        self.events.publish(BusEvent::ServiceRegistered {
            service_id: id,
            name: record.name.clone(),
        });
        Ok(record)
    }

    /// Removes a service, its agent profile and its subscriptions.
    ///
    /// Repeating the call for a removed id succeeds; an id that was never
    /// registered is `NotFound`.
    pub fn deregister(&self, service_id: &str) -> Result<()> {
        if self.remove(service_id, RemovalReason::Requested) {
            return Ok(());
        }
        if self.tombstones.contains(service_id) {
            debug!(service_id, "deregister of an already removed service");
            return Ok(());
        }
        Err(BusError::not_found(EntityKind::Service, service_id))
    }

    /// Drops a service whose absence timeout passed.
    pub fn expire(&self, service_id: &str) -> bool {
        self.remove(service_id, RemovalReason::Expired)
    }

    fn remove(&self, service_id: &str, reason: RemovalReason) -> bool {
        let Some((_, record)) = self.services.remove(service_id) else {
            return false;
        };
        self.agents.remove(service_id);
        let dropped = self.drop_subscriptions_of(service_id);
        self.health.forget(service_id);
        self.tombstones.insert(service_id.to_string());

        info!(
            service_id,
            ?reason,
            subscriptions = dropped,
            "service deregistered"
        );
        if let Some(hook) = &self.on_removed {
            hook(&record);
        }
        self.events.publish(BusEvent::ServiceDeregistered {
            service_id: service_id.to_string(),
            endpoint: record.endpoint,
            reason,
        });
        true
    }

    /// Refreshes liveness; a degraded or offline service is back online.
    pub fn heartbeat(&self, service_id: &str) -> Result<ServiceStatus> {
        {
            let mut record = self
                .services
                .get_mut(service_id)
                .ok_or_else(|| BusError::not_found(EntityKind::Service, service_id))?;
            record.last_heartbeat_at = Utc::now();
        }

        let previous = match self.health.beat(service_id) {
            Some(previous) => previous,
            None => {
                // Tracking was lost (e.g. a race with expiry), start over
                self.health.track(service_id);
                ServiceStatus::Online
            }
        };
        if previous != ServiceStatus::Online {
            info!(service_id, from = %previous, "service back online");
            self.events.publish(BusEvent::ServiceStatusChanged {
                service_id: service_id.to_string(),
                from: previous,
                to: ServiceStatus::Online,
            });
        }
        Ok(ServiceStatus::Online)
    }

    fn with_status(&self, mut record: ServiceRecord) -> ServiceRecord {
        record.status = self
            .health
            .status(&record.id)
            .unwrap_or(ServiceStatus::Offline);
        record
    }

    /// The record whatever its status, `None` if unknown.
    pub fn get(&self, service_id: &str) -> Option<ServiceRecord> {
        let record = self.services.get(service_id)?.clone();
        Some(self.with_status(record))
    }

    pub fn lookup(&self, service_id: &str) -> Result<ServiceRecord> {
        self.get(service_id)
            .ok_or_else(|| BusError::not_found(EntityKind::Service, service_id))
    }

    /// Matching services sorted by name then id. Empty is not an error.
    pub fn query(&self, query: &ServiceQuery) -> Vec<ServiceRecord> {
        let mut records: Vec<_> = self
            .services
            .iter()
            .map(|entry| self.with_status(entry.value().clone()))
            .filter(|record| query.matches(record))
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub fn is_routable(&self, service_id: &str) -> bool {
        self.services.contains_key(service_id) && self.health.is_online(service_id)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribes a registered service to a topic or `prefix.*` pattern.
    pub fn subscribe(&self, topic: &str, subscriber_id: &str) -> Result<SubscribeOutcome> {
        validate_topic(topic)?;
        if !self.services.contains_key(subscriber_id) {
            return Err(BusError::not_found(EntityKind::Service, subscriber_id));
        }

        match self
            .subscription_index
            .entry((topic.to_string(), subscriber_id.to_string()))
        {
            Entry::Occupied(existing) => {
                let subscription = self
                    .subscriptions
                    .get(existing.get())
                    .map(|s| s.clone())
                    .ok_or_else(|| BusError::Internal("subscription index out of sync".into()))?;
                Ok(SubscribeOutcome {
                    subscription,
                    created: false,
                })
            }
            Entry::Vacant(slot) => {
                let subscription = Subscription {
                    id: Uuid::new_v4().to_string(),
                    topic: topic.to_string(),
                    subscriber_id: subscriber_id.to_string(),
                    created_at: Utc::now(),
                };
                self.subscriptions
                    .insert(subscription.id.clone(), subscription.clone());
                slot.insert(subscription.id.clone());
                debug!(topic, subscriber_id, "subscribed");
                Ok(SubscribeOutcome {
                    subscription,
                    created: true,
                })
            }
        }
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> Result<Subscription> {
        let (_, subscription) = self
            .subscriptions
            .remove(subscription_id)
            .ok_or_else(|| BusError::not_found(EntityKind::Subscription, subscription_id))?;
        self.subscription_index.remove(&(
            subscription.topic.clone(),
            subscription.subscriber_id.clone(),
        ));
        debug!(topic = %subscription.topic, subscriber_id = %subscription.subscriber_id, "unsubscribed");
        Ok(subscription)
    }

    /// Removes the (topic, subscriber) pair if present.
    pub fn unsubscribe_topic(&self, topic: &str, subscriber_id: &str) -> bool {
        let key = (topic.to_string(), subscriber_id.to_string());
        match self.subscription_index.remove(&key) {
            Some((_, id)) => {
                self.subscriptions.remove(&id);
                true
            }
            None => false,
        }
    }

    fn drop_subscriptions_of(&self, subscriber_id: &str) -> usize {
        let ids: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|s| s.subscriber_id == subscriber_id)
            .map(|s| s.id.clone())
            .collect();
        for id in &ids {
            let _ = self.unsubscribe(id);
        }
        ids.len()
    }

    /// Distinct subscriber ids whose patterns cover `topic`, sorted.
    pub fn subscribers_for(&self, topic: &str) -> Vec<String> {
        let subscribers: BTreeSet<String> = self
            .subscriptions
            .iter()
            .filter(|s| topic_matches(&s.topic, topic))
            .map(|s| s.subscriber_id.clone())
            .collect();
        subscribers.into_iter().collect()
    }

    /// All subscriptions, oldest first.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut all: Vec<_> = self.subscriptions.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    // ========================================================================
    // Agents
    // ========================================================================

    fn card_for(&self, record: &ServiceRecord) -> Option<AgentCard> {
        let profile = self.agents.get(&record.id)?;
        Some(AgentCard::from_record(record, &profile))
    }

    pub fn agent(&self, agent_id: &str) -> Result<AgentCard> {
        self.get(agent_id)
            .and_then(|record| self.card_for(&record))
            .ok_or_else(|| BusError::not_found(EntityKind::Agent, agent_id))
    }

    /// Matching agent cards sorted by name then id.
    pub fn agents(&self, filter: &AgentFilter) -> Vec<AgentCard> {
        let query = ServiceQuery {
            capability: filter.capability.clone(),
            tag: filter.tag.clone(),
            name: None,
            include_unavailable: filter.include_unavailable,
        };
        self.query(&query)
            .iter()
            .filter_map(|record| self.card_for(record))
            .filter(|card| filter.method.as_deref().map_or(true, |m| card.serves(m)))
            .collect()
    }

    /// Online agents advertising `capability` (and serving `method`, if given).
    pub fn find_for_capability(&self, capability: &str, method: Option<&str>) -> Vec<AgentCard> {
        self.agents(&AgentFilter {
            capability: Some(capability.to_string()),
            method: method.map(str::to_string),
            tag: None,
            include_unavailable: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hivebus_common::config::{CircuitBreakerConfig, HealthConfig};
    use hivebus_common::model::Endpoint;
    use std::collections::HashSet;
    use tokio::time::Duration;

    fn registry() -> ServiceRegistry {
        let health = HealthConfig {
            heartbeat_interval_ms: 100,
            missed_threshold: 2,
            absence_timeout_ms: 0,
        };
        let (monitor, _scheduler) = HealthMonitor::new(health, CircuitBreakerConfig::default());
        ServiceRegistry::new(Arc::new(monitor), EventBus::new(64))
    }

    fn reg(name: &str) -> Registration {
        Registration::new(name, Endpoint::http(format!("http://127.0.0.1:9000/{name}")))
    }

    fn agent_reg(name: &str, capability: &str) -> Registration {
        reg(name).with_capability(capability).with_agent(AgentProfile {
            supported_methods: ["tasks/send".to_string()].into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_register_assigns_unique_ids() {
        let registry = registry();
        let mut ids = HashSet::new();
        for i in 0..20 {
            let record = registry.register(reg(&format!("svc-{i}"))).unwrap();
            assert_eq!(registry.lookup(&record.id).unwrap().name, record.name);
            assert!(ids.insert(record.id));
        }
        assert_eq!(registry.len(), 20);
    }

    #[tokio::test]
    async fn test_duplicate_supplied_id_is_rejected() {
        let registry = registry();
        registry.register(reg("a").with_id("svc-1")).unwrap();
        assert!(matches!(
            registry.register(reg("b").with_id("svc-1")),
            Err(BusError::DuplicateId(id)) if id == "svc-1"
        ));
        assert_eq!(registry.lookup("svc-1").unwrap().name, "a");
    }

    #[tokio::test]
    async fn test_invalid_registration_is_rejected() {
        let registry = registry();
        assert!(matches!(
            registry.register(Registration::new("", Endpoint::http("http://h/"))),
            Err(BusError::Validation(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_generated_id_must_match_agent_card_id() {
        let registry = registry();
        let card = AgentProfile {
            id: Some("agent-1".into()),
            ..Default::default()
        };
        assert!(matches!(
            registry.register(reg("a").with_agent(card)),
            Err(BusError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent() {
        let registry = registry();
        let id = registry.register(reg("a")).unwrap().id;
        registry.subscribe("alerts", &id).unwrap();

        registry.deregister(&id).unwrap();
        registry.deregister(&id).unwrap();
        assert!(registry.lookup(&id).is_err());
        assert!(registry.subscribers_for("alerts").is_empty());

        assert!(matches!(
            registry.deregister("never-seen"),
            Err(BusError::NotFound { kind: EntityKind::Service, .. })
        ));
    }

    #[tokio::test]
    async fn test_reregister_after_deregister() {
        let registry = registry();
        registry.register(reg("a").with_id("svc-1")).unwrap();
        registry.deregister("svc-1").unwrap();
        registry.register(reg("a").with_id("svc-1")).unwrap();
        assert!(registry.is_routable("svc-1"));
    }

    #[tokio::test]
    async fn test_deregister_publishes_event() {
        let registry = registry();
        let mut events = registry.events.subscribe();
        let id = registry.register(reg("a")).unwrap().id;
        registry.deregister(&id).unwrap();

        assert_eq!(events.recv().await.unwrap().topic(), "service.registered");
        match events.recv().await.unwrap() {
            BusEvent::ServiceDeregistered { service_id, reason, .. } => {
                assert_eq!(service_id, id);
                assert_eq!(reason, RemovalReason::Requested);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_removal_hook_runs_once_per_removal() {
        let removed = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = removed.clone();
        let registry =
            registry().with_removal_hook(move |record| sink.lock().push(record.id.clone()));

        registry.register(reg("a").with_id("svc-1")).unwrap();
        registry.register(reg("b").with_id("svc-2")).unwrap();
        registry.deregister("svc-1").unwrap();
        registry.deregister("svc-1").unwrap();
        assert!(registry.expire("svc-2"));

        assert_eq!(*removed.lock(), vec!["svc-1".to_string(), "svc-2".to_string()]);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_service() {
        let registry = registry();
        assert!(matches!(
            registry.heartbeat("ghost"),
            Err(BusError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_service_leaves_query_but_not_lookup() {
        let registry = registry();
        let id = registry.register(reg("nlp").with_capability("nlp")).unwrap().id;
        let query = ServiceQuery::capability("nlp");
        assert_eq!(registry.query(&query).len(), 1);

        tokio::time::advance(Duration::from_millis(450)).await;
        assert!(registry.query(&query).is_empty());
        assert_eq!(registry.lookup(&id).unwrap().status, ServiceStatus::Offline);

        let all = ServiceQuery {
            include_unavailable: true,
            ..query.clone()
        };
        assert_eq!(registry.query(&all).len(), 1);

        let mut events = registry.events.subscribe();
        assert_eq!(registry.heartbeat(&id).unwrap(), ServiceStatus::Online);
        assert_eq!(registry.query(&query).len(), 1);
        assert!(matches!(
            events.recv().await.unwrap(),
            BusEvent::ServiceStatusChanged { from: ServiceStatus::Offline, to: ServiceStatus::Online, .. }
        ));
    }

    #[tokio::test]
    async fn test_query_is_sorted_and_filtered() {
        let registry = registry();
        registry.register(reg("zeta").with_capability("nlp")).unwrap();
        registry.register(reg("alpha").with_capability("nlp")).unwrap();
        registry.register(reg("vision").with_capability("cv")).unwrap();

        let names: Vec<_> = registry
            .query(&ServiceQuery::capability("nlp"))
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(registry.query(&ServiceQuery::capability("audio")).is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_same_pair_returns_existing() {
        let registry = registry();
        let id = registry.register(reg("a")).unwrap().id;

        let first = registry.subscribe("task.*", &id).unwrap();
        let second = registry.subscribe("task.*", &id).unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.subscription.id, second.subscription.id);
        assert_eq!(registry.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_requires_registered_subscriber() {
        let registry = registry();
        assert!(matches!(
            registry.subscribe("alerts", "ghost"),
            Err(BusError::NotFound { .. })
        ));
        let id = registry.register(reg("a")).unwrap().id;
        assert!(matches!(
            registry.subscribe("bad topic", &id),
            Err(BusError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribers_for_patterns() {
        let registry = registry();
        let a = registry.register(reg("a")).unwrap().id;
        let b = registry.register(reg("b")).unwrap().id;
        registry.subscribe("task.completed", &a).unwrap();
        registry.subscribe("task.*", &a).unwrap();
        registry.subscribe("*", &b).unwrap();

        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(registry.subscribers_for("task.completed"), expected);
        assert_eq!(registry.subscribers_for("service.registered"), vec![b]);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let registry = registry();
        let id = registry.register(reg("a")).unwrap().id;
        let sub = registry.subscribe("alerts", &id).unwrap().subscription;

        registry.unsubscribe(&sub.id).unwrap();
        assert!(registry.subscribers_for("alerts").is_empty());
        assert!(matches!(
            registry.unsubscribe(&sub.id),
            Err(BusError::NotFound { kind: EntityKind::Subscription, .. })
        ));

        registry.subscribe("alerts", &id).unwrap();
        assert!(registry.unsubscribe_topic("alerts", &id));
        assert!(!registry.unsubscribe_topic("alerts", &id));
    }

    #[tokio::test]
    async fn test_agent_cards_follow_registrations() {
        let registry = registry();
        let agent = registry.register(agent_reg("summarizer", "summarize")).unwrap().id;
        let plain = registry.register(reg("plain").with_capability("summarize")).unwrap().id;

        let card = registry.agent(&agent).unwrap();
        assert_eq!(card.id, agent);
        assert!(card.serves("tasks/send"));
        assert!(matches!(
            registry.agent(&plain),
            Err(BusError::NotFound { kind: EntityKind::Agent, .. })
        ));

        let found = registry.find_for_capability("summarize", None);
        assert_eq!(found.len(), 1);
        assert!(registry.find_for_capability("summarize", Some("tasks/cancel")).is_empty());

        registry.deregister(&agent).unwrap();
        assert!(registry.agent(&agent).is_err());
        assert!(registry.agents(&AgentFilter::default()).is_empty());
    }
}
