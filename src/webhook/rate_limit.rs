//! Per-remote-address sliding window rate limiter for the webhook endpoint.
//!
//! Same sharded-state idiom as [`crate::manager::retry`]'s retry policy and
//! the teacher's `download::RateLimiter`, generalized from "one timestamp
//! per domain" to "a window of timestamps per address".

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window admit/reject decision for one remote address.
pub struct RateLimiter {
    limit_per_window: u32,
    windows: DashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit_per_window: u32) -> Self {
        Self { limit_per_window, windows: DashMap::new() }
    }

    /// Admits a request from `remote_addr`, pruning timestamps older than
    /// the 60s window before counting (spec.md §4.5). Returns `true` if the
    /// request is within the limit.
    pub fn admit(&self, remote_addr: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.windows.entry(remote_addr.to_string()).or_default();
        entry.retain(|timestamp| now.duration_since(*timestamp) < WINDOW);

        if entry.len() as u32 >= self.limit_per_window {
            return false;
        }
        entry.push(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_the_limit() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.admit("1.2.3.4"));
        assert!(limiter.admit("1.2.3.4"));
        assert!(limiter.admit("1.2.3.4"));
        assert!(!limiter.admit("1.2.3.4"));
    }

    #[tokio::test(start_paused = true)]
    async fn different_addresses_have_independent_windows() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.admit("1.1.1.1"));
        assert!(limiter.admit("2.2.2.2"));
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_60_seconds() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.admit("1.2.3.4"));
        assert!(!limiter.admit("1.2.3.4"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.admit("1.2.3.4"));
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_at_limit_is_admitted_one_over_is_not() {
        let limiter = RateLimiter::new(30);
        for _ in 0..30 {
            assert!(limiter.admit("1.2.3.4"));
        }
        assert!(!limiter.admit("1.2.3.4"));
    }
}
