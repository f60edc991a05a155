use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Sliding-window rate limiter keyed by (identifier, action).
///
/// Used to slow down credential guessing on the login endpoint. Entries are
/// pruned on each check; `cleanup` bounds memory for keys that never return.
pub struct RateLimiter {
    attempts: DashMap<(String, &'static str), Vec<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            attempts: DashMap::new(),
        }
    }

    /// Record an attempt for `key`/`action` and check it against the limit.
    /// Returns `Err(retry_after_secs)` when the window is full.
    pub fn check(
        &self,
        key: &str,
        action: &'static str,
        limit: usize,
        window: Duration,
    ) -> Result<(), u64> {
        let now = Instant::now();
        let mut entry = self
            .attempts
            .entry((key.to_string(), action))
            .or_default();
        entry.retain(|at| now.duration_since(*at) < window);
        if entry.len() < limit {
            entry.push(now);
            return Ok(());
        }
        let oldest = entry.first().copied().unwrap_or(now);
        let retry_after = window.saturating_sub(now.duration_since(oldest));
        Err(retry_after.as_secs().max(1))
    }

    /// Drop attempts older than `max_age` and empty buckets.
    pub fn cleanup(&self, max_age: Duration) {
        let now = Instant::now();
        self.attempts.retain(|_, attempts| {
            attempts.retain(|at| now.duration_since(*at) < max_age);
            !attempts.is_empty()
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
