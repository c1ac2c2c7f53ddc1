// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-tenant token buckets with lazy refill.
//!
//! One bucket per tenant; a tenant saturating its own bucket never
//! affects another tenant's admission.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// The per-tenant quota table.
pub struct QuotaSet {
    buckets: Mutex<HashMap<String, Bucket>>,
    rate_per_sec: f64,
    burst: f64,
}

impl QuotaSet {
    /// Create a quota table: buckets refill at `rate_per_sec` up to `burst`.
    #[must_use]
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate_per_sec: rate_per_sec.max(0.0),
            burst: burst.max(1.0),
        }
    }

    /// Take one token for `tenant`. Returns `Err(retry_after_secs)` when
    /// the bucket is empty.
    pub fn try_take(&self, tenant: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("quota lock poisoned");
        let bucket = buckets.entry(tenant.to_owned()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }
        let deficit = 1.0 - bucket.tokens;
        let retry_after = if self.rate_per_sec > 0.0 {
            (deficit / self.rate_per_sec).ceil() as u64
        } else {
            u64::MAX
        };
        Err(retry_after.max(1))
    }
}
