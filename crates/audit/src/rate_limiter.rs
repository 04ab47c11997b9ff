//! TokenBucketLimiter - Per-client token-bucket rate limiting
//!
//! Buckets refill lazily from elapsed time on every check; there is no
//! background refill timer.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use shared::{saturating_add, Clock, RateLimitConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Token bucket state for one client key
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    pub tokens: f64,
    pub capacity: f64,
    pub last_refill_at: DateTime<Utc>,
    pub refill_rate: f64,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: capacity,
            capacity,
            last_refill_at: now,
            refill_rate,
        }
    }

    /// Tokens the bucket would hold at `now`, without mutating it
    fn projected(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = seconds_between(self.last_refill_at, now);
        (self.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        self.tokens = self.projected(now);
        if now > self.last_refill_at {
            self.last_refill_at = now;
        }
    }

    /// Instant at which the bucket will be full again
    fn full_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let missing = (self.capacity - self.tokens).max(0.0);
        if missing == 0.0 || self.refill_rate <= 0.0 {
            return now;
        }
        let millis = (missing / self.refill_rate * 1000.0).ceil() as i64;
        saturating_add(now, Duration::try_milliseconds(millis).unwrap_or(Duration::MAX))
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 1000.0).max(0.0)
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn is_denied(&self) -> bool {
        !self.allowed
    }
}

/// Limiter counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterMetrics {
    pub total_checks: u64,
    pub allowed: u64,
    pub rejected: u64,
    pub refunds: u64,
    pub evictions: u64,
    pub distinct_keys: usize,
    /// Net tokens consumed per check (refunds subtract)
    pub average_tokens_per_check: f64,
}

#[derive(Debug, Default)]
struct LimiterState {
    buckets: HashMap<String, TokenBucket>,
    total_checks: u64,
    allowed: u64,
    rejected: u64,
    refunds: u64,
    evictions: u64,
    tokens_consumed: f64,
}

/// Token-bucket rate limiter keyed by client key
#[derive(Debug)]
pub struct TokenBucketLimiter {
    state: Mutex<LimiterState>,
    capacity: f64,
    refill_rate: f64,
    limit: u32,
    window: Duration,
    enabled: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    /// Create a limiter from rate-limit settings
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = config.capacity();
        Self {
            state: Mutex::new(LimiterState::default()),
            capacity,
            refill_rate: config.refill_rate(),
            limit: capacity as u32,
            window: config.window(),
            enabled: AtomicBool::new(config.enabled),
            clock,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Check a key and consume a token if one is available
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let now = self.clock.now();
        if !self.is_enabled() {
            return self.unlimited(now);
        }

        let mut state = self.state.lock();
        state.total_checks += 1;

        let bucket = state
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.capacity, self.refill_rate, now));
        bucket.refill(now);

        let decision = if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitDecision {
                allowed: true,
                limit: self.limit,
                remaining: bucket.tokens.floor() as u32,
                reset_at: bucket.full_at(now),
                retry_after_secs: None,
            }
        } else {
            let retry_after = if self.refill_rate > 0.0 {
                ((1.0 - bucket.tokens) / self.refill_rate).ceil() as u64
            } else {
                u64::MAX
            };
            RateLimitDecision {
                allowed: false,
                limit: self.limit,
                remaining: 0,
                reset_at: bucket.full_at(now),
                retry_after_secs: Some(retry_after),
            }
        };

        if decision.allowed {
            state.allowed += 1;
            state.tokens_consumed += 1.0;
        } else {
            state.rejected += 1;
            debug!(key, retry_after = ?decision.retry_after_secs, "rate limit rejected");
        }
        decision
    }

    /// Report the current standing of a key without consuming a token
    pub fn peek(&self, key: &str) -> RateLimitDecision {
        let now = self.clock.now();
        if !self.is_enabled() {
            return self.unlimited(now);
        }

        let state = self.state.lock();
        match state.buckets.get(key) {
            Some(bucket) => {
                let mut view = bucket.clone();
                view.refill(now);
                RateLimitDecision {
                    allowed: view.tokens >= 1.0,
                    limit: self.limit,
                    remaining: view.tokens.floor() as u32,
                    reset_at: view.full_at(now),
                    retry_after_secs: None,
                }
            }
            None => self.unlimited(now),
        }
    }

    /// Give back one token (e.g. for a call excluded from counting).
    ///
    /// Never raises a bucket above its capacity.
    pub fn refund(&self, key: &str) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(bucket) = state.buckets.get_mut(key) else {
            return;
        };
        bucket.refill(now);
        bucket.tokens = (bucket.tokens + 1.0).min(bucket.capacity);
        state.refunds += 1;
        state.tokens_consumed -= 1.0;
    }

    /// Drop full buckets that have been idle for more than twice the window.
    ///
    /// Buckets that are not full are still in use and are always kept.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let idle_cutoff = self.window.checked_mul(2).unwrap_or(Duration::MAX);
        let mut state = self.state.lock();

        let before = state.buckets.len();
        state.buckets.retain(|_, bucket| {
            let idle = now - bucket.last_refill_at > idle_cutoff;
            !(idle && bucket.projected(now) >= bucket.capacity)
        });
        let evicted = before - state.buckets.len();
        state.evictions += evicted as u64;

        if evicted > 0 {
            debug!(evicted, remaining = state.buckets.len(), "evicted idle rate-limit buckets");
        }
        evicted
    }

    /// Remove a key's bucket if it is full; returns whether it was removed
    pub fn evict_if_full(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let full = state
            .buckets
            .get(key)
            .map(|b| b.projected(now) >= b.capacity)
            .unwrap_or(false);
        if full {
            state.buckets.remove(key);
            state.evictions += 1;
        }
        full
    }

    /// Copy of a key's bucket
    pub fn bucket(&self, key: &str) -> Option<TokenBucket> {
        self.state.lock().buckets.get(key).cloned()
    }

    pub fn metrics(&self) -> LimiterMetrics {
        let state = self.state.lock();
        let average = if state.total_checks == 0 {
            0.0
        } else {
            state.tokens_consumed / state.total_checks as f64
        };

        LimiterMetrics {
            total_checks: state.total_checks,
            allowed: state.allowed,
            rejected: state.rejected,
            refunds: state.refunds,
            evictions: state.evictions,
            distinct_keys: state.buckets.len(),
            average_tokens_per_check: average,
        }
    }

    /// Forget every bucket
    pub fn reset(&self) {
        self.state.lock().buckets.clear();
    }

    fn unlimited(&self, now: DateTime<Utc>) -> RateLimitDecision {
        RateLimitDecision {
            allowed: true,
            limit: self.limit,
            remaining: self.limit,
            reset_at: now,
            retry_after_secs: None,
        }
    }
}
