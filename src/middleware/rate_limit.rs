//! Per-principal rate limiting.
//!
//! Classic token bucket, wall-clock refilled: every request consumes one
//! token from its principal's bucket; an empty bucket fails the request
//! with `RateLimited` and the time until the next token is surfaced so the
//! surface can emit `Retry-After`.

use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashMap;

use super::{ChainState, Middleware};
use crate::config::schema::RateLimitConfig;
use crate::error::{GatewayError, Result};

struct Bucket {
    tokens: f64,
    refilled: Instant,
}

/// Token buckets keyed by principal subject.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Mutex<Bucket>>,
}

impl RateLimiter {
    /// Creates a limiter with the given capacity and refill rate.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Takes one token for `principal`.
    ///
    /// # Errors
    ///
    /// `RateLimited` with the milliseconds until a token is available.
    pub fn acquire(&self, principal: &str) -> Result<()> {
        let entry = self
            .buckets
            .entry(principal.to_string())
            .or_insert_with(|| {
                Mutex::new(Bucket {
                    tokens: f64::from(self.config.capacity),
                    refilled: Instant::now(),
                })
            })
            .downgrade();
        let mut bucket = entry.lock().expect("bucket lock poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refilled).as_secs_f64();
        bucket.tokens = (elapsed.mul_add(self.config.refill_per_sec, bucket.tokens))
            .min(f64::from(self.config.capacity));
        bucket.refilled = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_ms = (deficit / self.config.refill_per_sec * 1000.0).ceil() as u64;
            Err(GatewayError::RateLimited { retry_after_ms })
        }
    }

    /// Remaining tokens for a principal (full capacity when never seen).
    #[must_use]
    pub fn remaining(&self, principal: &str) -> f64 {
        self.buckets.get(principal).map_or(f64::from(self.config.capacity), |b| {
            b.lock().expect("bucket lock poisoned").tokens
        })
    }
}

/// Chain stage consuming one token per request.
pub struct RateLimitMiddleware {
    limiter: RateLimiter,
}

impl RateLimitMiddleware {
    /// Creates the middleware from config.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            limiter: RateLimiter::new(config),
        }
    }
}

#[async_trait::async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate-limit"
    }

    async fn before_agent(&self, state: &mut ChainState) -> Result<()> {
        let subject = state
            .principal
            .as_ref()
            .map_or("anonymous", |p| p.subject.as_str());
        self.limiter.acquire(subject)
    }
}
