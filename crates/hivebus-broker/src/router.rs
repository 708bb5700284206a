//! Message router.
//!
//! Resolves who receives an envelope and hands one copy per destination to
//! the [`DeliveryManager`]. Topic fan-out never fails as a whole: each
//! subscriber that cannot take the message is reported in the receipt's
//! `skipped` list. Direct sends fail with the reason instead.

use std::sync::Arc;

use tracing::debug;

use hivebus_common::model::{MessageEnvelope, PublishReceipt, SkippedDestination};
use hivebus_common::protocol::error::{BusError, EntityKind, Result};
use hivebus_metrics::{BrokerMetricsCollector, DeliveryOutcome};

use crate::delivery::DeliveryManager;
use crate::registry::ServiceRegistry;

pub struct MessageRouter {
    registry: Arc<ServiceRegistry>,
    delivery: Arc<DeliveryManager>,
    metrics: BrokerMetricsCollector,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        delivery: Arc<DeliveryManager>,
        metrics: BrokerMetricsCollector,
    ) -> Self {
        Self {
            registry,
            delivery,
            metrics,
        }
    }

    pub fn publish(&self, envelope: MessageEnvelope) -> Result<PublishReceipt> {
        envelope.validate()?;
        if envelope.is_expired() {
            return Err(BusError::validation(format!(
                "message {} expired before it was published",
                envelope.id
            )));
        }
        self.metrics.record_publish();

        let receipt = match (&envelope.topic, &envelope.destination) {
            (Some(topic), None) => {
                let topic = topic.clone();
                self.fan_out(&topic, envelope)
            }
            (None, Some(destination)) => {
                let destination = destination.clone();
                self.send_direct(&destination, envelope)?
            }
            // validate() rules out the rest
            _ => return Err(BusError::validation("message must set either topic or destination")),
        };

        debug!(
            message_id = %receipt.message_id,
            routed = receipt.routed.len(),
            skipped = receipt.skipped.len(),
            "message routed"
        );
        Ok(receipt)
    }

    fn fan_out(&self, topic: &str, envelope: MessageEnvelope) -> PublishReceipt {
        let mut receipt = PublishReceipt {
            message_id: envelope.id.clone(),
            routed: Vec::new(),
            skipped: Vec::new(),
        };

        for subscriber in self.registry.subscribers_for(topic) {
            match self.route_to(&subscriber, envelope.clone()) {
                Ok(()) => receipt.routed.push(subscriber),
                Err(e) => receipt.skipped.push(SkippedDestination {
                    destination: subscriber,
                    reason: skip_reason(&e).to_string(),
                }),
            }
        }
        receipt
    }

    fn send_direct(&self, destination: &str, envelope: MessageEnvelope) -> Result<PublishReceipt> {
        let message_id = envelope.id.clone();
        self.route_to(destination, envelope)?;
        Ok(PublishReceipt {
            message_id,
            routed: vec![destination.to_string()],
            skipped: Vec::new(),
        })
    }

    fn route_to(&self, service_id: &str, envelope: MessageEnvelope) -> Result<()> {
        let record = self
            .registry
            .get(service_id)
            .ok_or_else(|| BusError::not_found(EntityKind::Service, service_id))?;
        if !record.status.is_routable() {
            return Err(BusError::validation(format!(
                "service {} is {}",
                service_id, record.status
            )));
        }
        if let Err(e) = self.registry.health().circuits().check(service_id) {
            self.metrics
                .record_delivery(service_id, DeliveryOutcome::CircuitRejected);
            return Err(e);
        }
        self.delivery.enqueue(service_id, &record.endpoint, envelope)
    }

    /// Re-publishes a dead letter as a fresh envelope to its original
    /// destination. The dead letter is removed once the copy is queued.
    pub fn replay(&self, dead_letter_id: &str) -> Result<PublishReceipt> {
        let dead = self
            .delivery
            .dead_letter_by_id(dead_letter_id)
            .ok_or_else(|| BusError::not_found(EntityKind::DeadLetter, dead_letter_id))?;

        let original = dead.envelope;
        let mut fresh = MessageEnvelope::direct(dead.destination, original.payload)
            .with_priority(original.priority);
        fresh.ttl_ms = original.ttl_ms;
        fresh.source = original.source;
        fresh.replay_of = Some(dead.id);

        let receipt = self.publish(fresh)?;
        self.delivery.remove_dead_letter(dead_letter_id);
        Ok(receipt)
    }
}

fn skip_reason(error: &BusError) -> &'static str {
    match error {
        BusError::NotFound { .. } => "not_registered",
        BusError::Validation(_) => "unavailable",
        BusError::CircuitOpen(_) => "circuit_open",
        BusError::DeliveryFailure(_) => "queue_full",
        _ => error.code(),
    }
}
