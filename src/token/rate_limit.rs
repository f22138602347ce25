//! Fixed-window issuance quota per subject.
//!
//! Each subject owns a bucket `{window_start, count}`. The check and the
//! increment happen under the map's per-entry lock, so two concurrent calls
//! for the same subject can never both take the last slot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::security::mask::mask_user;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: Instant,
    count: u32,
}

/// Per-subject fixed-window rate limiter
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    /// `limit` issuances per `window` for each subject
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            limit,
            window,
        }
    }

    /// Configured quota per window
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Take one slot for `subject`, or fail with the time left in its window.
    pub fn check_and_increment(&self, subject: &str) -> Result<()> {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(subject.to_string()).or_insert(Bucket {
            window_start: now,
            count: 0,
        });

        if now.duration_since(bucket.window_start) >= self.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        if bucket.count >= self.limit {
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(bucket.window_start));
            return Err(Error::RateLimitExceeded {
                subject: mask_user(subject),
                retry_after,
            });
        }

        bucket.count += 1;
        Ok(())
    }

    /// Slots left for `subject` in its current window
    #[must_use]
    pub fn remaining(&self, subject: &str) -> u32 {
        self.buckets.get(subject).map_or(self.limit, |b| {
            if b.window_start.elapsed() >= self.window {
                self.limit
            } else {
                self.limit.saturating_sub(b.count)
            }
        })
    }

    /// Drop buckets whose window has ended. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| b.window_start.elapsed() < self.window);
        before.saturating_sub(self.buckets.len())
    }

    /// Number of tracked subjects
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}

/// Spawn a background task that evicts finished windows every `interval`.
pub fn spawn_reaper(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = limiter.evict_expired();
                    if evicted > 0 {
                        debug!(count = evicted, "Evicted expired rate-limit buckets");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Rate-limit reaper shutting down");
                    break;
                }
            }
        }
    });
}
