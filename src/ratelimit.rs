//! Token-bucket admission gate shared by all outbound generator calls.
//!
//! ## Why a token bucket?
//!
//! Concurrency limits (how many pages are in flight) and rate limits (how
//! many API calls per minute) are orthogonal. The page fan-out already
//! bounds concurrency; this bucket independently bounds the *call rate* so
//! a wide batch cannot stampede the provider into 429s. The bucket refills
//! continuously at `requests_per_minute / 60` tokens per second, capped at
//! `burst_capacity`, so idle periods buy a burst allowance without ever
//! exceeding the long-run rate.
//!
//! ## Why suspend instead of reject?
//!
//! Rejecting an acquire would drop work and push retry logic onto every
//! caller. Backing off preserves the work: `acquire` computes the exact
//! wait for the token deficit and sleeps precisely that long — no
//! busy-polling, and with a positive rate no waiter is starved forever.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

/// Mutable bucket state, always accessed under the mutex.
struct Bucket {
    /// Tokens currently available, fractional between refills.
    available: f64,
    last_refill: Instant,
}

/// A shared, internally synchronised token-bucket rate limiter.
///
/// One instance is created per batch and a clone of the `Arc` handed to
/// every consumer — no component instantiates its own, so the whole batch
/// shares a single budget.
pub struct RateLimiter {
    capacity: f64,
    /// Refill rate in tokens per second.
    rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter admitting `requests_per_minute` calls with a burst
    /// allowance of `burst_capacity`.
    ///
    /// The bucket starts full so a fresh batch can begin immediately.
    pub fn new(requests_per_minute: u32, burst_capacity: u32) -> Arc<Self> {
        let capacity = f64::from(burst_capacity.max(1));
        Arc::new(Self {
            capacity,
            rate: f64::from(requests_per_minute) / 60.0,
            bucket: Mutex::new(Bucket {
                available: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Wait until `cost` tokens are available, then debit them.
    ///
    /// Never rejects. Acquisition order is not strictly FIFO: a waiter
    /// sleeping out its deficit can be overtaken by a cheaper caller, but
    /// every waiter is admitted eventually because the refill rate is
    /// positive and each retry sleeps only the remaining deficit.
    pub async fn acquire(&self, cost: u32) {
        let cost = f64::from(cost.max(1)).min(self.capacity);
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.available >= cost {
                    bucket.available -= cost;
                    return;
                }
                // Exact time for the bucket to reach `cost` tokens.
                Duration::from_secs_f64((cost - bucket.available) / self.rate)
            };
            debug!(wait_ms = wait.as_millis() as u64, "rate limiter backing off");
            sleep(wait).await;
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.available = (bucket.available + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Tokens available right now, after refill. Test and metrics hook.
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.available
    }
}
