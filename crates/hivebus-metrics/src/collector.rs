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

use crate::registry::{DeliveryOutcome, MetricsConfig, MetricsRegistry};
use crate::snapshot::{MetricsSnapshot, ServerInfo};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

/// Built-in method returning a [`MetricsSnapshot`].
pub const METRICS_METHOD: &str = "_metrics";
/// Built-in method returning [`ServerInfo`].
pub const INFO_METHOD: &str = "_info";

/// Metrics collection contract used by the broker's dispatcher.
///
/// The dispatcher asks [`is_metrics_request`](Self::is_metrics_request)
/// before its method table lookup, so `_metrics` and `_info` never reach a
/// domain handler.
pub trait MetricsCollector: Send + Sync {
    fn is_metrics_request(&self, method: &str) -> bool {
        method == METRICS_METHOD || method == INFO_METHOD
    }

    /// Result value for a built-in method, `None` for any other name.
    fn handle_metrics_request(&self, method: &str) -> Option<Value>;

    /// Records a finished RPC call.
    fn record_call(&self, method: &str, start_time: Instant, success: bool);

    fn snapshot(&self) -> MetricsSnapshot;
}

/// Collector for the broker: RPC calls plus delivery outcomes.
///
/// ```rust
/// use hivebus_metrics::{BrokerMetricsCollector, DeliveryOutcome, MetricsCollector};
/// use std::time::Instant;
///
/// let collector = BrokerMetricsCollector::new();
/// collector.record_call("task.create", Instant::now(), true);
/// collector.record_delivery("svc-1", DeliveryOutcome::Delivered);
///
/// let snapshot = collector.snapshot();
/// assert_eq!(snapshot.total_requests, 1);
/// assert_eq!(snapshot.total_delivered(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct BrokerMetricsCollector {
    registry: Arc<MetricsRegistry>,
}

impl BrokerMetricsCollector {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            registry: Arc::new(MetricsRegistry::with_config(config)),
        }
    }

    /// Shares an existing registry, e.g. between the dispatcher and the
    /// delivery workers.
    pub fn with_registry(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }

    pub fn record_delivery(&self, destination: &str, outcome: DeliveryOutcome) {
        self.registry.record_delivery(destination, outcome);
    }

    pub fn record_publish(&self) {
        self.registry.record_publish();
    }

    pub fn forget_destination(&self, destination: &str) {
        self.registry.forget_destination(destination);
    }

    pub fn session_opened(&self) {
        self.registry.increment_active_connections();
    }

    pub fn session_closed(&self) {
        self.registry.decrement_active_connections();
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo::new(self.registry.uptime_ms())
    }
}

impl Default for BrokerMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector for BrokerMetricsCollector {
    fn handle_metrics_request(&self, method: &str) -> Option<Value> {
        match method {
            METRICS_METHOD => Some(json!(self.snapshot())),
            INFO_METHOD => Some(json!(self.info())),
            _ => None,
        }
    }

    fn record_call(&self, method: &str, start_time: Instant, success: bool) {
        let latency_us = start_time.elapsed().as_micros() as u64;
        self.registry.record_method_call(method, latency_us, success);
    }

    fn snapshot(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }
}
