//! Per-backend token buckets.
//!
//! Every grant spends one token which returns to its bucket `1/rate` seconds
//! later, so a bucket never hands out more than `burst` grants inside any
//! `1/rate`-second window. Exhausted callers sleep until the oldest spent
//! token comes back.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::backends::BackendKind;

/// Rate and burst capacity for one backend kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    pub rate_per_sec: f64,
    pub burst: usize,
}

impl BucketConfig {
    pub fn new(rate_per_sec: f64, burst: usize) -> Self {
        Self {
            rate_per_sec: rate_per_sec.max(f64::EPSILON),
            burst: burst.max(1),
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_per_sec)
    }
}

/// Bucket settings for all backend kinds.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub primary: BucketConfig,
    pub secondary: BucketConfig,
    pub rendering: BucketConfig,
}

impl RateLimitConfig {
    pub fn for_kind(&self, kind: BackendKind) -> BucketConfig {
        match kind {
            BackendKind::Primary => self.primary,
            BackendKind::Secondary => self.secondary,
            BackendKind::Rendering => self.rendering,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            primary: BucketConfig::new(2.0, 5),
            secondary: BucketConfig::new(1.5, 4),
            rendering: BucketConfig::new(0.5, 2),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    config: BucketConfig,
    // Instants at which currently spent tokens become available again.
    returns: VecDeque<Instant>,
}

impl Bucket {
    fn new(config: BucketConfig) -> Self {
        Self {
            config,
            returns: VecDeque::with_capacity(config.burst),
        }
    }

    /// Either spends a token or reports when the next one returns.
    fn try_take(&mut self, now: Instant) -> Result<(), Instant> {
        while self.returns.front().is_some_and(|at| *at <= now) {
            self.returns.pop_front();
        }
        if self.returns.len() < self.config.burst {
            self.returns.push_back(now + self.config.period());
            Ok(())
        } else {
            // burst >= 1 and the queue is full, so front() exists.
            Err(self.returns.front().copied().unwrap_or(now))
        }
    }
}

/// Shared limiter; clones observe the same buckets.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Arc<Mutex<HashMap<BackendKind, Bucket>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Wait cooperatively until a token is available for `kind`, then spend it.
    pub async fn acquire(&self, kind: BackendKind) {
        loop {
            let next = {
                let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
                let bucket = buckets
                    .entry(kind)
                    .or_insert_with(|| Bucket::new(self.config.for_kind(kind)));
                match bucket.try_take(Instant::now()) {
                    Ok(()) => return,
                    Err(at) => at,
                }
            };
            log::debug!(
                "{kind} bucket exhausted, waiting {:.2}s",
                next.saturating_duration_since(Instant::now()).as_secs_f64()
            );
            tokio::time::sleep_until(next).await;
        }
    }

    /// Tokens currently spendable without waiting.
    pub fn available(&self, kind: BackendKind) -> usize {
        let now = Instant::now();
        let buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let burst = self.config.for_kind(kind).burst;
        match buckets.get(&kind) {
            Some(bucket) => burst - bucket.returns.iter().filter(|at| **at > now).count(),
            None => burst,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
