// Copyright 2025 Hivebus Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Server information returned by `_info`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_type: String,
    pub version: String,
    pub uptime_ms: u64,
}

impl ServerInfo {
    pub fn new(uptime_ms: u64) -> Self {
        Self {
            server_type: "broker".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_ms,
        }
    }
}

/// Metrics for a specific RPC method
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodMetrics {
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Delivery outcomes for one destination service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationMetrics {
    pub destination: String,
    pub delivered: u64,
    pub failed_attempts: u64,
    pub dead_lettered: u64,
    pub circuit_rejections: u64,
    pub last_delivery_ms: u64,
}

impl DestinationMetrics {
    pub fn new(destination: String) -> Self {
        Self {
            destination,
            ..Default::default()
        }
    }
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Open WebSocket sessions
    pub active_connections: u64,
    pub messages_published: u64,
    pub uptime_ms: u64,
    pub methods: HashMap<String, MethodMetrics>,
    pub destinations: HashMap<String, DestinationMetrics>,
}

impl MetricsSnapshot {
    pub fn new(uptime_ms: u64) -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            active_connections: 0,
            messages_published: 0,
            uptime_ms,
            methods: HashMap::new(),
            destinations: HashMap::new(),
        }
    }

    /// Sum of delivered messages across destinations.
    pub fn total_delivered(&self) -> u64 {
        self.destinations.values().map(|d| d.delivered).sum()
    }

    pub fn total_dead_lettered(&self) -> u64 {
        self.destinations.values().map(|d| d.dead_lettered).sum()
    }
}
