//! Per-client fixed-window rate limiting.
//!
//! Counters are keyed by `(client, minute-bucket)` in an LRU-bounded
//! map so an adversarial client set cannot grow memory without bound.
//! The window is the wall-clock minute; counters reset at the bucket
//! boundary.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

/// Seconds a limited client should wait before retrying.
pub const RETRY_AFTER_SECS: u64 = 60;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Request admitted; remaining budget in this window.
    Allowed {
        /// Requests left in the current window.
        remaining: u32,
    },
    /// Request rejected; retry after the given seconds.
    Limited {
        /// Seconds until the bucket resets.
        retry_after: u64,
    },
}

impl Decision {
    /// True when the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Fixed-window limiter with a bounded client map.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    buckets: Mutex<LruCache<(String, u64), u32>>,
}

impl RateLimiter {
    /// Create a limiter allowing `limit` requests per client per
    /// 60-second window, tracking at most `max_clients` live buckets.
    pub fn new(limit: u32, max_clients: usize) -> Self {
        let cap = NonZeroUsize::new(max_clients.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            limit,
            buckets: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Check and count one request for `client` at `now_unix` seconds.
    pub fn check(&self, client: &str, now_unix: u64) -> Decision {
        let bucket = now_unix / 60;
        let key = (client.to_owned(), bucket);

        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = buckets.get_or_insert_mut(key, || 0);
        *count = count.saturating_add(1);

        if *count > self.limit {
            Decision::Limited {
                retry_after: RETRY_AFTER_SECS,
            }
        } else {
            Decision::Allowed {
                remaining: self.limit.saturating_sub(*count),
            }
        }
    }
}
