//! Per-client token bucket rate limiting.
//!
//! Clients are keyed by an opaque string (the API key when present, the
//! peer IP otherwise). Each key owns a bucket that refills at
//! `requests_per_second` up to `burst_size` tokens. Buckets idle for longer
//! than `entry_ttl` are swept on the next check after `cleanup_interval`.
//!
//! # Example
//!
//! ```
//! use hivebus_common::rate_limit::{RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::new(1.0, 2));
//! assert!(limiter.check("10.0.0.1").is_allowed());
//! assert!(limiter.check("10.0.0.1").is_allowed());
//! assert!(!limiter.check("10.0.0.1").is_allowed());
//! // Other clients have their own bucket
//! assert!(limiter.check("10.0.0.2").is_allowed());
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::protocol::error::BusError;

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Sustained request rate per client
    pub requests_per_second: f64,
    /// Tokens available to a fresh or idle client
    pub burst_size: u32,
    pub cleanup_interval: Duration,
    pub entry_ttl: Duration,
}

impl RateLimitConfig {
    pub fn new(requests_per_second: f64, burst_size: u32) -> Self {
        Self {
            requests_per_second,
            burst_size: burst_size.max(1),
            cleanup_interval: Duration::from_secs(60),
            entry_ttl: Duration::from_secs(300),
        }
    }

    /// Burst of twice the sustained rate.
    pub fn per_second(rps: f64) -> Self {
        let burst_size = (rps * 2.0).ceil() as u32;
        Self::new(rps, burst_size)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    RateLimited { retry_after: Duration },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Allowed => None,
            Self::RateLimited { retry_after } => Some(*retry_after),
        }
    }

    /// Converts a rejection into [`BusError::RateLimited`].
    pub fn into_result(self) -> Result<(), BusError> {
        match self {
            Self::Allowed => Ok(()),
            Self::RateLimited { retry_after } => Err(BusError::RateLimited {
                retry_after_ms: retry_after.as_millis().max(1) as u64,
            }),
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(burst_size: u32, now: Instant) -> Self {
        Self {
            tokens: burst_size as f64,
            last_update: now,
        }
    }

    fn try_consume(&mut self, config: &RateLimitConfig, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.requests_per_second)
            .min(config.burst_size as f64);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_next_token(&self, config: &RateLimitConfig) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / config.requests_per_second)
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    buckets: HashMap<String, TokenBucket>,
    last_cleanup: Instant,
}

/// Shared token bucket limiter. Clones share state.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    config: Option<RateLimitConfig>,
    state: Arc<Mutex<LimiterState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::build(Some(config))
    }

    /// A limiter that admits everything.
    pub fn disabled() -> Self {
        Self::build(None)
    }

    fn build(config: Option<RateLimitConfig>) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(LimiterState {
                buckets: HashMap::new(),
                last_cleanup: Instant::now(),
            })),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    pub fn check(&self, client: &str) -> RateLimitResult {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: &str, now: Instant) -> RateLimitResult {
        let Some(config) = &self.config else {
            return RateLimitResult::Allowed;
        };

        let mut state = self.state.lock();
        if now.saturating_duration_since(state.last_cleanup) >= config.cleanup_interval {
            state
                .buckets
                .retain(|_, b| now.saturating_duration_since(b.last_update) < config.entry_ttl);
            state.last_cleanup = now;
        }

        let bucket = state
            .buckets
            .entry(client.to_string())
            .or_insert_with(|| TokenBucket::new(config.burst_size, now));

        if bucket.try_consume(config, now) {
            RateLimitResult::Allowed
        } else {
            RateLimitResult::RateLimited {
                retry_after: bucket.time_until_next_token(config),
            }
        }
    }

    pub fn tracked_clients(&self) -> usize {
        self.state.lock().buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_second_sets_double_burst() {
        let config = RateLimitConfig::per_second(10.0);
        assert_eq!(config.requests_per_second, 10.0);
        assert_eq!(config.burst_size, 20);
    }

    #[test]
    fn test_disabled_always_allows() {
        let limiter = RateLimiter::disabled();
        for _ in 0..10_000 {
            assert!(limiter.check("c").is_allowed());
        }
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn test_burst_then_limit() {
        let limiter = RateLimiter::new(RateLimitConfig::new(5.0, 3));
        let now = Instant::now();
        for _ in 0..3 {
            assert!(limiter.check_at("c", now).is_allowed());
        }
        let result = limiter.check_at("c", now);
        assert!(!result.is_allowed());
        let retry = result.retry_after().unwrap();
        assert!(retry > Duration::ZERO && retry <= Duration::from_millis(200));
    }

    #[test]
    fn test_refill_over_time() {
        let limiter = RateLimiter::new(RateLimitConfig::new(10.0, 1));
        let start = Instant::now();
        assert!(limiter.check_at("c", start).is_allowed());
        assert!(!limiter.check_at("c", start).is_allowed());
        assert!(limiter
            .check_at("c", start + Duration::from_millis(150))
            .is_allowed());
    }

    #[test]
    fn test_stale_buckets_are_swept() {
        let mut config = RateLimitConfig::new(1.0, 1);
        config.cleanup_interval = Duration::from_secs(1);
        config.entry_ttl = Duration::from_secs(2);
        let limiter = RateLimiter::new(config);
        let start = Instant::now();

        limiter.check_at("old", start);
        assert_eq!(limiter.tracked_clients(), 1);

        limiter.check_at("new", start + Duration::from_secs(5));
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn test_into_result_maps_to_bus_error() {
        let limited = RateLimitResult::RateLimited {
            retry_after: Duration::from_millis(40),
        };
        assert!(matches!(
            limited.into_result(),
            Err(BusError::RateLimited { retry_after_ms: 40 })
        ));
        assert!(RateLimitResult::Allowed.into_result().is_ok());
    }
}
