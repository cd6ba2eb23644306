// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Per-client-IP token-bucket rate limiting.
//!
//! Each IP gets a bucket of `burst` tokens refilled at `rate` per second.
//! Buckets idle for more than three minutes are evicted by a janitor task.
//! State is in-process only; a restart resets all buckets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Buckets idle longer than this are evicted.
const VISITOR_TTL: Duration = Duration::from_secs(3 * 60);

/// How often the janitor scans for idle buckets.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

struct Visitor {
    bucket: Mutex<Bucket>,
    /// Milliseconds since the limiter epoch, updated atomically on access.
    last_seen_ms: AtomicI64,
}

/// Token-bucket limiter keyed by client IP.
pub struct RateLimiter {
    visitors: RwLock<HashMap<String, Arc<Visitor>>>,
    rate: f64,
    burst: f64,
    epoch: Instant,
}

impl RateLimiter {
    #[must_use]
    pub fn new(rate: f64, burst: u32) -> Arc<Self> {
        let limiter = Arc::new(Self {
            visitors: RwLock::new(HashMap::new()),
            rate,
            burst: f64::from(burst),
            epoch: Instant::now(),
        });
        limiter.spawn_janitor();
        limiter
    }

    /// Whether a request from `ip` is admitted right now.
    #[must_use]
    pub fn allow(&self, ip: &str) -> bool {
        let visitor = self.visitor(ip);

        let now = Instant::now();
        visitor.last_seen_ms.store(
            i64::try_from(now.duration_since(self.epoch).as_millis()).unwrap_or(i64::MAX),
            Ordering::Relaxed,
        );

        let mut bucket = visitor.bucket.lock().expect("rate limiter mutex poisoned");
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn visitor(&self, ip: &str) -> Arc<Visitor> {
        if let Some(visitor) = self
            .visitors
            .read()
            .expect("rate limiter lock poisoned")
            .get(ip)
        {
            return Arc::clone(visitor);
        }

        let mut visitors = self.visitors.write().expect("rate limiter lock poisoned");
        Arc::clone(visitors.entry(ip.to_string()).or_insert_with(|| {
            Arc::new(Visitor {
                bucket: Mutex::new(Bucket {
                    tokens: self.burst,
                    last_refill: Instant::now(),
                }),
                last_seen_ms: AtomicI64::new(0),
            })
        }))
    }

    fn spawn_janitor(self: &Arc<Self>) {
        let limiter = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    return;
                };
                limiter.evict_idle();
            }
        });
    }

    fn evict_idle(&self) {
        let now_ms = i64::try_from(
            Instant::now().duration_since(self.epoch).as_millis(),
        )
        .unwrap_or(i64::MAX);
        let ttl_ms = i64::try_from(VISITOR_TTL.as_millis()).unwrap_or(i64::MAX);

        let mut visitors = self.visitors.write().expect("rate limiter lock poisoned");
        visitors.retain(|_, visitor| {
            now_ms - visitor.last_seen_ms.load(Ordering::Relaxed) <= ttl_ms
        });
    }

    #[cfg(test)]
    fn visitor_count(&self) -> usize {
        self.visitors.read().expect("rate limiter lock poisoned").len()
    }
}
