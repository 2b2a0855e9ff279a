//! Counters for queue scans, decisions, webhook traffic, and cache activity.
//!
//! No external metrics protocol (spec.md §4.7 — a JSON snapshot suffices).
//! Every field is an `AtomicU64` so any component holding an `Arc<Metrics>`
//! can increment without a lock, in the same spirit as the teacher's
//! `RateLimiter::cumulative_delay_ms`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Long-lived counters, constructed once at startup and shared via `Arc`
/// across the scanner, webhook server, and scheduler.
#[derive(Debug, Default)]
pub struct Metrics {
    pub queue_scans: AtomicU64,
    pub items_processed: AtomicU64,
    pub forced_imports: AtomicU64,
    pub removals: AtomicU64,
    pub keeps: AtomicU64,
    pub no_actions: AtomicU64,
    pub webhook_grab_events: AtomicU64,
    pub webhook_import_events: AtomicU64,
    pub webhook_failure_events: AtomicU64,
    pub webhook_other_events: AtomicU64,
    pub webhook_auth_failures: AtomicU64,
    pub webhook_rate_limited: AtomicU64,
    pub manager_api_calls: AtomicU64,
}

/// Point-in-time snapshot of [`Metrics`], serializable for the `/metrics`
/// endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricsSnapshot {
    pub queue_scans: u64,
    pub items_processed: u64,
    pub forced_imports: u64,
    pub removals: u64,
    pub keeps: u64,
    pub no_actions: u64,
    pub webhook_grab_events: u64,
    pub webhook_import_events: u64,
    pub webhook_failure_events: u64,
    pub webhook_other_events: u64,
    pub webhook_auth_failures: u64,
    pub webhook_rate_limited: u64,
    pub manager_api_calls: u64,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decision(&self, kind: &str) {
        match kind {
            "force_import" => self.forced_imports.fetch_add(1, Ordering::Relaxed),
            "remove_public" => self.removals.fetch_add(1, Ordering::Relaxed),
            "keep_private" => self.keeps.fetch_add(1, Ordering::Relaxed),
            _ => self.no_actions.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_webhook_event(&self, event_type: &str) {
        let counter = match event_type {
            "Grab" => &self.webhook_grab_events,
            "Download" | "Import" => &self.webhook_import_events,
            "ImportFailure" | "DownloadFailure" => &self.webhook_failure_events,
            _ => &self.webhook_other_events,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_scans: self.queue_scans.load(Ordering::Relaxed),
            items_processed: self.items_processed.load(Ordering::Relaxed),
            forced_imports: self.forced_imports.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            keeps: self.keeps.load(Ordering::Relaxed),
            no_actions: self.no_actions.load(Ordering::Relaxed),
            webhook_grab_events: self.webhook_grab_events.load(Ordering::Relaxed),
            webhook_import_events: self.webhook_import_events.load(Ordering::Relaxed),
            webhook_failure_events: self.webhook_failure_events.load(Ordering::Relaxed),
            webhook_other_events: self.webhook_other_events.load(Ordering::Relaxed),
            webhook_auth_failures: self.webhook_auth_failures.load(Ordering::Relaxed),
            webhook_rate_limited: self.webhook_rate_limited.load(Ordering::Relaxed),
            manager_api_calls: self.manager_api_calls.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_decision_routes_to_the_right_counter() {
        let metrics = Metrics::new();
        metrics.record_decision("force_import");
        metrics.record_decision("remove_public");
        metrics.record_decision("keep_private");
        metrics.record_decision("no_action");

        let snap = metrics.snapshot();
        assert_eq!(snap.forced_imports, 1);
        assert_eq!(snap.removals, 1);
        assert_eq!(snap.keeps, 1);
        assert_eq!(snap.no_actions, 1);
    }

    #[test]
    fn record_webhook_event_groups_download_and_import() {
        let metrics = Metrics::new();
        metrics.record_webhook_event("Download");
        metrics.record_webhook_event("Import");
        assert_eq!(metrics.snapshot().webhook_import_events, 2);
    }

    #[test]
    fn unrecognized_event_counts_as_other() {
        let metrics = Metrics::new();
        metrics.record_webhook_event("HealthIssue");
        assert_eq!(metrics.snapshot().webhook_other_events, 1);
    }
}
