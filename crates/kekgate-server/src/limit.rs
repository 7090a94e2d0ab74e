//! Per-identity token-bucket rate limiting.
//!
//! Buckets live behind one lock and are mutated on the request path; a
//! periodic sweeper evicts entries that have been idle longer than a day.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use kekgate_core::RateLimitConfig;
use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::debug;

const IDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity: config.burst.max(1) as f64,
            refill_per_sec: config.requests_per_second.max(1) as f64,
        }
    }

    /// Take one token from the caller's bucket; `false` means throttled.
    pub fn check(&self, identity: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(identity.to_owned())
            .or_insert_with(|| TokenBucket {
                tokens: self.capacity,
                last_refill: now,
                last_seen: now,
            });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.last_refill = now;
        bucket.last_seen = now;
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec)
            .min(self.capacity);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            metrics::counter!("kekgate_rate_limit_allowed_total").increment(1);
            true
        } else {
            metrics::counter!("kekgate_rate_limit_blocked_total").increment(1);
            false
        }
    }

    pub fn active_buckets(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Evict buckets idle for longer than [`IDLE_TTL`] once an hour.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut buckets = limiter.buckets.lock();
                let before = buckets.len();
                buckets
                    .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) < IDLE_TTL);
                let evicted = before - buckets.len();
                if evicted > 0 {
                    debug!(evicted, "rate limiter sweep evicted idle buckets");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_honoured_then_throttled() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            requests_per_second: 1,
            burst: 3,
        });
        assert!(limiter.check("trader-1"));
        assert!(limiter.check("trader-1"));
        assert!(limiter.check("trader-1"));
        assert!(!limiter.check("trader-1"));
        // other identities are unaffected
        assert!(limiter.check("trader-2"));
        assert_eq!(limiter.active_buckets(), 2);
    }
}
