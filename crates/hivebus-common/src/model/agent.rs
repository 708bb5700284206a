use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::service::{Endpoint, ServiceRecord};

/// Agent-only part of a registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Must equal the registration id when given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// RPC method names the agent can serve
    #[serde(default)]
    pub supported_methods: BTreeSet<String>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

/// Capability contract of an agent-capable service.
///
/// Shares its id with the service's [`ServiceRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCard {
    pub id: String,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub supported_methods: BTreeSet<String>,
    pub endpoint: Endpoint,
    pub tags: BTreeSet<String>,
    pub version: String,
}

impl AgentCard {
    pub fn from_record(record: &ServiceRecord, profile: &AgentProfile) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            capabilities: record.capabilities.clone(),
            supported_methods: profile.supported_methods.clone(),
            endpoint: record.endpoint.clone(),
            tags: record.tags.clone(),
            version: profile.version.clone(),
        }
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn serves(&self, method: &str) -> bool {
        self.supported_methods.contains(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::service::ServiceStatus;
    use chrono::Utc;

    #[test]
    fn test_card_mirrors_record() {
        let now = Utc::now();
        let record = ServiceRecord {
            id: "agent-7".into(),
            name: "summarizer".into(),
            endpoint: Endpoint::http("http://10.0.0.7:7000/a2a"),
            capabilities: ["summarize".to_string()].into(),
            tags: ["gpu".to_string()].into(),
            metadata: Default::default(),
            registered_at: now,
            last_heartbeat_at: now,
            status: ServiceStatus::Online,
        };
        let profile = AgentProfile {
            id: None,
            supported_methods: ["tasks/send".to_string()].into(),
            version: "1.2.0".into(),
        };

        let card = AgentCard::from_record(&record, &profile);
        assert_eq!(card.id, "agent-7");
        assert!(card.supports("summarize"));
        assert!(!card.supports("translate"));
        assert!(card.serves("tasks/send"));
        assert_eq!(card.version, "1.2.0");
    }

    #[test]
    fn test_profile_version_defaults() {
        let profile: AgentProfile = serde_json::from_str("{}").unwrap();
        assert_eq!(profile.version, "0.0.0");
        assert!(profile.supported_methods.is_empty());
    }
}
