//! Message envelopes and delivery records.
//!
//! The bus validates the envelope fields and never looks inside `payload`.
//! One envelope type carries both addressing modes: exactly one of `topic`
//! (pub/sub fan-out) or `destination` (direct service id) is set.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::service::validate_topic;
use crate::protocol::error::{BusError, Result};

/// Advisory priority, forwarded to consumers. Ordering stays FIFO per destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Pending,
    Delivered,
    Failed,
    DeadLettered,
}

/// A message travelling through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivery_attempts: u32,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Dead letter this envelope replays
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<String>,
}

impl MessageEnvelope {
    fn blank(payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: None,
            destination: None,
            payload,
            priority: Priority::Normal,
            ttl_ms: None,
            created_at: Utc::now(),
            delivery_attempts: 0,
            status: MessageStatus::Pending,
            source: None,
            replay_of: None,
        }
    }

    pub fn to_topic(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Self::blank(payload)
        }
    }

    pub fn direct(destination: impl Into<String>, payload: Value) -> Self {
        Self {
            destination: Some(destination.into()),
            ..Self::blank(payload)
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(BusError::validation("message id must not be empty"));
        }
        match (&self.topic, &self.destination) {
            (Some(topic), None) => validate_topic(topic),
            (None, Some(dest)) if !dest.trim().is_empty() => Ok(()),
            (None, Some(_)) => Err(BusError::validation("destination must not be empty")),
            (Some(_), Some(_)) => Err(BusError::validation(
                "message must set either topic or destination, not both",
            )),
            (None, None) => Err(BusError::validation(
                "message must set either topic or destination",
            )),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_ms {
            Some(ttl) => {
                let age = now.signed_duration_since(self.created_at);
                age.num_milliseconds() >= ttl as i64
            }
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Bumps the attempt counter; it only ever grows.
    pub fn record_attempt(&mut self) {
        self.delivery_attempts = self.delivery_attempts.saturating_add(1);
    }
}

/// Publish input accepted over REST, WebSocket and RPC.
///
/// Counters and status are owned by the bus and cannot be supplied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub source: Option<String>,
}

impl PublishRequest {
    pub fn into_envelope(self) -> Result<MessageEnvelope> {
        let mut envelope = MessageEnvelope::blank(self.payload);
        if let Some(id) = self.id {
            envelope.id = id;
        }
        envelope.topic = self.topic;
        envelope.destination = self.destination;
        envelope.priority = self.priority;
        envelope.ttl_ms = self.ttl_ms;
        envelope.source = self.source;
        envelope.validate()?;
        Ok(envelope)
    }
}

/// A message that exhausted its retries, frozen for inspection and replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub envelope: MessageEnvelope,
    /// Service id the envelope was being delivered to
    pub destination: String,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// A destination the router could not hand the message to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedDestination {
    pub destination: String,
    /// Machine-readable reason, e.g. `circuit_open`
    pub reason: String,
}

/// Result of a publish call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub message_id: String,
    /// Destinations the message was queued for
    pub routed: Vec<String>,
    #[serde(default)]
    pub skipped: Vec<SkippedDestination>,
}
