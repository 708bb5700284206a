use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::agent::AgentProfile;
use crate::protocol::error::{BusError, Result};

/// How the bus reaches an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// `POST` of the envelope JSON to an absolute `http://` URL
    #[default]
    #[serde(rename = "http")]
    Http,
    /// Frames pushed over a live WebSocket session
    #[serde(rename = "websocket")]
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Http => f.write_str("http"),
            TransportKind::WebSocket => f.write_str("websocket"),
        }
    }
}

/// Network location of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    #[serde(default)]
    pub transport: TransportKind,
}

impl Endpoint {
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            address: url.into(),
            transport: TransportKind::Http,
        }
    }

    pub fn websocket(session_id: impl Into<String>) -> Self {
        Self {
            address: session_id.into(),
            transport: TransportKind::WebSocket,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(BusError::validation("endpoint.address is required"));
        }
        if self.transport == TransportKind::Http
            && !(self.address.starts_with("http://") || self.address.starts_with("https://"))
        {
            return Err(BusError::validation(format!(
                "endpoint.address '{}' must start with http:// or https://",
                self.address
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.transport, self.address)
    }
}

/// Availability derived from heartbeats. Never accepted from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Online,
    Degraded,
    Offline,
}

impl ServiceStatus {
    /// Only online services receive routed traffic.
    pub fn is_routable(self) -> bool {
        self == ServiceStatus::Online
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Online => "online",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Operational record of a registered service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub name: String,
    pub endpoint: Endpoint,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status: ServiceStatus,
}

/// Registration request accepted by `POST /api/register` and `agent.register`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registration {
    /// Caller-supplied id, generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub endpoint: Endpoint,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Present when the service is agent-capable
    #[serde(default, alias = "agent_card")]
    pub agent: Option<AgentProfile>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::http("")
    }
}

impl Registration {
    pub fn new(name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            endpoint,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_agent(mut self, agent: AgentProfile) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                return Err(BusError::validation("id must not be empty when supplied"));
            }
        }
        if self.name.trim().is_empty() {
            return Err(BusError::validation("name is required"));
        }
        self.endpoint.validate()?;
        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(BusError::validation("capabilities must not contain empty names"));
        }
        if let (Some(id), Some(card_id)) = (&self.id, self.agent.as_ref().and_then(|a| a.id.as_ref())) {
            if id != card_id {
                return Err(BusError::validation(format!(
                    "agent card id '{}' does not match registration id '{}'",
                    card_id, id
                )));
            }
        }
        Ok(())
    }
}

/// Filter for discovery queries. All set fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceQuery {
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    /// Case-insensitive substring of the service name
    #[serde(default)]
    pub name: Option<String>,
    /// Also return degraded and offline services
    #[serde(default)]
    pub include_unavailable: bool,
}

impl ServiceQuery {
    pub fn capability(capability: impl Into<String>) -> Self {
        Self {
            capability: Some(capability.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &ServiceRecord) -> bool {
        if !self.include_unavailable && !record.status.is_routable() {
            return false;
        }
        if let Some(cap) = &self.capability {
            if !record.capabilities.contains(cap) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !record.tags.contains(tag) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if !record.name.to_lowercase().contains(&name.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Topic subscription held by a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub topic: String,
    pub subscriber_id: String,
    pub created_at: DateTime<Utc>,
}

/// Checks a topic name or subscription pattern.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(BusError::validation("topic is required"));
    }
    if topic.chars().any(char::is_whitespace) {
        return Err(BusError::validation(format!(
            "topic '{}' must not contain whitespace",
            topic
        )));
    }
    Ok(())
}

/// Whether a subscription pattern covers a published topic.
///
/// `*` matches everything; `a.b.*` matches `a.b.c` and `a.b.c.d` but not `a.b`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" || pattern == topic {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.') && rest.len() > 1),
        None => false,
    }
}
