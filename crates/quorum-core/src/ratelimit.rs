//! Per-tenant token bucket admission control.
//!
//! Refill is computed lazily on each check, so no background timer is needed.
//! Every bucket has its own lock; the tenant map lock is only held long enough
//! to look up or insert a bucket, never across the refill/decrement step.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::Result;
use serde::Serialize;

/// Shared key for unauthenticated routes.
pub const ANONYMOUS_KEY: &str = "anonymous";

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    pub admitted: bool,
    /// Zero when admitted; otherwise whole seconds until one token is available.
    pub retry_after: Duration,
    /// Tokens left after this check.
    pub remaining: f64,
    pub capacity: u32,
    /// Time until the bucket would be full again.
    pub reset_after: Duration,
}

/// Read-only view of one bucket, refilled up to the observation instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub capacity: u32,
    pub available_tokens: f64,
    pub refill_rate: f64,
    /// Seconds until at least one whole token is available (0 if one already is).
    pub next_token_in_s: f64,
    /// Seconds until the bucket is full.
    pub full_in_s: f64,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill_at: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill_at: now,
        }
    }

    fn refill(&mut self, capacity: f64, rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        if now > self.last_refill_at {
            self.last_refill_at = now;
        }
    }
}

pub struct RateLimiter {
    capacity: u32,
    refill_rate: f64,
    buckets: Mutex<HashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_rate: f64) -> Result<Self> {
        if capacity == 0 {
            anyhow::bail!("token bucket capacity must be at least 1");
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            anyhow::bail!("token refill rate must be positive and finite, got {refill_rate}");
        }
        Ok(Self {
            capacity,
            refill_rate,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn bucket(&self, key: &str, now: Instant) -> Arc<Mutex<TokenBucket>> {
        let mut map = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TokenBucket::full(self.capacity as f64, now)))
            })
            .clone()
    }

    pub fn allow(&self, key: &str) -> RateLimitDecision {
        self.allow_at(key, Instant::now())
    }

    /// Admission check at an explicit instant.
    pub fn allow_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let capacity = self.capacity as f64;
        let bucket = self.bucket(key, now);
        let mut b = bucket.lock().unwrap_or_else(|e| e.into_inner());
        b.refill(capacity, self.refill_rate, now);

        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            RateLimitDecision {
                admitted: true,
                retry_after: Duration::ZERO,
                remaining: b.tokens,
                capacity: self.capacity,
                reset_after: self.seconds_to(capacity - b.tokens),
            }
        } else {
            let wait = ((1.0 - b.tokens) / self.refill_rate).ceil().max(1.0);
            RateLimitDecision {
                admitted: false,
                retry_after: Duration::from_secs(wait as u64),
                remaining: b.tokens,
                capacity: self.capacity,
                reset_after: self.seconds_to(capacity - b.tokens),
            }
        }
    }

    pub fn snapshot(&self, key: &str) -> BucketSnapshot {
        self.snapshot_at(key, Instant::now())
    }

    /// Refills the bucket to `now` without consuming a token.
    pub fn snapshot_at(&self, key: &str, now: Instant) -> BucketSnapshot {
        let capacity = self.capacity as f64;
        let bucket = self.bucket(key, now);
        let mut b = bucket.lock().unwrap_or_else(|e| e.into_inner());
        b.refill(capacity, self.refill_rate, now);
        BucketSnapshot {
            capacity: self.capacity,
            available_tokens: b.tokens,
            refill_rate: self.refill_rate,
            next_token_in_s: ((1.0 - b.tokens).max(0.0)) / self.refill_rate,
            full_in_s: (capacity - b.tokens).max(0.0) / self.refill_rate,
        }
    }

    /// Refill the tenant's bucket to capacity.
    pub fn reset(&self, key: &str) {
        let now = Instant::now();
        let bucket = self.bucket(key, now);
        let mut b = bucket.lock().unwrap_or_else(|e| e.into_inner());
        *b = TokenBucket::full(self.capacity as f64, now);
    }

    fn seconds_to(&self, missing_tokens: f64) -> Duration {
        Duration::from_secs_f64((missing_tokens.max(0.0) / self.refill_rate).max(0.0))
    }
}
