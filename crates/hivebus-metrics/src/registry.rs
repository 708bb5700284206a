use crate::snapshot::{DestinationMetrics, MethodMetrics, MetricsSnapshot};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

const NUM_HISTOGRAM_BINS: usize = 100;

/// Every this many recordings the registry sweeps stale entries.
const CLEANUP_INTERVAL: u64 = 1000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Size limits and TTLs for per-method and per-destination entries.
///
/// Destinations come and go with service registrations, so without a bound
/// a long-running broker would accumulate an entry for every service id it
/// ever delivered to.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// When exceeded, least-recently-used methods are evicted
    pub max_methods: usize,
    /// When exceeded, least-recently-used destinations are evicted
    pub max_destinations: usize,
    pub method_ttl_secs: u64,
    pub destination_ttl_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_methods: 1000,
            max_destinations: 10_000,
            method_ttl_secs: 3600,
            destination_ttl_secs: 3600,
        }
    }
}

/// Logarithmic latency histogram.
///
/// Bin `d * 10 + k` holds samples in `[k * 10^d, (k + 1) * 10^d)` microseconds,
/// so every decade from 1µs upward gets nine bins. Bin 0 holds zero-latency
/// samples. Percentiles are interpolated linearly inside the matching bin.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_latency: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        let bin = Self::latency_to_bin(latency_us);
        self.bins[bin].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn latency_to_bin(latency_us: u64) -> usize {
        if latency_us == 0 {
            return 0;
        }
        let decade = latency_us.ilog10();
        let leading = latency_us / 10u64.pow(decade);
        let bin = decade as usize * 10 + leading as usize;
        bin.min(NUM_HISTOGRAM_BINS - 1)
    }

    /// `[lower, upper)` bounds of a bin in microseconds.
    fn bin_bounds(bin: usize) -> (u64, u64) {
        if bin == 0 {
            return (0, 1);
        }
        let scale = 10u64.saturating_pow((bin / 10) as u32);
        let leading = (bin % 10) as u64;
        (
            leading.saturating_mul(scale),
            (leading + 1).saturating_mul(scale),
        )
    }

    fn estimate_percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = ((total * percentile).div_ceil(100)).max(1);
        let mut cumulative = 0;

        for (bin_idx, bin) in self.bins.iter().enumerate() {
            let count = bin.load(Ordering::Relaxed);
            if count > 0 && cumulative + count >= target {
                let (start, end) = Self::bin_bounds(bin_idx);
                let fraction = (target - cumulative) as f64 / count as f64;
                return start + (fraction * (end - start) as f64) as u64;
            }
            cumulative += count;
        }

        Self::bin_bounds(NUM_HISTOGRAM_BINS - 1).1
    }

    /// `(avg, p50, p95, p99)` in microseconds, zeros when empty.
    fn calculate_percentiles(&self) -> (u64, u64, u64, u64) {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return (0, 0, 0, 0);
        }

        let avg = self.total_latency.load(Ordering::Relaxed) / total;
        (
            avg,
            self.estimate_percentile(50),
            self.estimate_percentile(95),
            self.estimate_percentile(99),
        )
    }
}

#[derive(Debug)]
struct MethodStats {
    call_count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    latencies: LatencyHistogram,
    last_access_ms: AtomicU64,
}

impl MethodStats {
    fn new() -> Self {
        Self {
            call_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            latencies: LatencyHistogram::new(),
            last_access_ms: AtomicU64::new(now_ms()),
        }
    }

    fn record(&self, latency_us: u64, success: bool) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        self.latencies.record(latency_us);
        self.last_access_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> MethodMetrics {
        let (avg_latency_us, p50_latency_us, p95_latency_us, p99_latency_us) =
            self.latencies.calculate_percentiles();

        MethodMetrics {
            call_count: self.call_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            avg_latency_us,
            p50_latency_us,
            p95_latency_us,
            p99_latency_us,
        }
    }
}

/// Outcome of one delivery step for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    FailedAttempt,
    DeadLettered,
    CircuitRejected,
}

#[derive(Debug, Default)]
struct DestinationStats {
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    dead_lettered: AtomicU64,
    circuit_rejections: AtomicU64,
    last_delivery_ms: AtomicU64,
    last_access_ms: AtomicU64,
}

impl DestinationStats {
    fn record(&self, outcome: DeliveryOutcome) {
        let now = now_ms();
        let counter = match outcome {
            DeliveryOutcome::Delivered => {
                self.last_delivery_ms.store(now, Ordering::Relaxed);
                &self.delivered
            }
            DeliveryOutcome::FailedAttempt => &self.failed_attempts,
            DeliveryOutcome::DeadLettered => &self.dead_lettered,
            DeliveryOutcome::CircuitRejected => &self.circuit_rejections,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.last_access_ms.store(now, Ordering::Relaxed);
    }

    fn snapshot(&self, destination: &str) -> DestinationMetrics {
        DestinationMetrics {
            destination: destination.to_string(),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            last_delivery_ms: self.last_delivery_ms.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe metrics storage.
///
/// Counters are atomics; the method and destination maps sit behind
/// `RwLock`s that are only held long enough to clone an `Arc` out.
#[derive(Debug)]
pub struct MetricsRegistry {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    active_connections: AtomicU64,
    messages_published: AtomicU64,
    methods: RwLock<HashMap<String, Arc<MethodStats>>>,
    destinations: RwLock<HashMap<String, Arc<DestinationStats>>>,
    start_time: Instant,
    config: MetricsConfig,
    cleanup_counter: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            methods: RwLock::new(HashMap::new()),
            destinations: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
            config,
            cleanup_counter: AtomicU64::new(0),
        }
    }

    pub fn increment_active_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_active_connections(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_publish(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_method_call(&self, method: &str, latency_us: u64, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }

        self.maybe_cleanup();

        let stats = {
            let existing = self.methods.read().get(method).cloned();
            match existing {
                Some(stats) => stats,
                None => self
                    .methods
                    .write()
                    .entry(method.to_string())
                    .or_insert_with(|| Arc::new(MethodStats::new()))
                    .clone(),
            }
        };
        stats.record(latency_us, success);
    }

    pub fn record_delivery(&self, destination: &str, outcome: DeliveryOutcome) {
        self.maybe_cleanup();

        let stats = {
            let existing = self.destinations.read().get(destination).cloned();
            match existing {
                Some(stats) => stats,
                None => self
                    .destinations
                    .write()
                    .entry(destination.to_string())
                    .or_default()
                    .clone(),
            }
        };
        stats.record(outcome);
    }

    fn maybe_cleanup(&self) {
        let count = self.cleanup_counter.fetch_add(1, Ordering::Relaxed);
        if count % CLEANUP_INTERVAL == 0 {
            self.cleanup_stale_entries();
        }
    }

    fn cleanup_stale_entries(&self) {
        let now = now_ms();

        {
            let mut methods = self.methods.write();
            let ttl_ms = self.config.method_ttl_secs * 1000;
            methods.retain(|_, stats| {
                now.saturating_sub(stats.last_access_ms.load(Ordering::Relaxed)) < ttl_ms
            });
            evict_lru(&mut methods, self.config.max_methods, |s| {
                s.last_access_ms.load(Ordering::Relaxed)
            });
        }

        {
            let mut destinations = self.destinations.write();
            let ttl_ms = self.config.destination_ttl_secs * 1000;
            destinations.retain(|_, stats| {
                now.saturating_sub(stats.last_access_ms.load(Ordering::Relaxed)) < ttl_ms
            });
            evict_lru(&mut destinations, self.config.max_destinations, |s| {
                s.last_access_ms.load(Ordering::Relaxed)
            });
        }
    }

    /// Drops a destination's counters, e.g. after its service deregisters.
    pub fn forget_destination(&self, destination: &str) {
        self.destinations.write().remove(destination);
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let methods = self
            .methods
            .read()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();

        let destinations = self
            .destinations
            .read()
            .iter()
            .map(|(dest, stats)| (dest.clone(), stats.snapshot(dest)))
            .collect();

        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            methods,
            destinations,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn evict_lru<T, F>(map: &mut HashMap<String, Arc<T>>, max: usize, last_access: F)
where
    F: Fn(&T) -> u64,
{
    if map.len() <= max {
        return;
    }
    let mut entries: Vec<(String, u64)> = map
        .iter()
        .map(|(name, stats)| (name.clone(), last_access(stats)))
        .collect();
    entries.sort_by_key(|&(_, at)| at);

    let to_remove = entries.len() - max;
    for (name, _) in entries.into_iter().take(to_remove) {
        map.remove(&name);
    }
}
