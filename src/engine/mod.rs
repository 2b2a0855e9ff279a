//! The reconciliation engine: periodic scan loop plus the `reconcile()`
//! routine invoked both from the scan and from webhook-triggered immediate
//! checks.
//!
//! Per-`download_id` serialization mirrors the teacher's per-domain state
//! sharding in [`crate::manager::retry`]; panic isolation per candidate
//! mirrors `download::engine`'s `JoinHandle` pattern for a batch of
//! concurrently-spawned tasks, adapted here to a sequential scan where each
//! candidate still runs as its own task so one panic cannot take the scan
//! down with it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::analyzer::{self, Decision, Thresholds};
use crate::cache::TtlCache;
use crate::manager::{
    HistoryEventType, ManagerClient, ManagerError, ManualImportCommand, ManualImportFile,
    QueueItem, RemoveQueueItemRequest,
};
use crate::metrics::Metrics;

/// How long a `(episode_id, download_id, decision_kind)` triple is
/// remembered to prevent repeating an action on unchanged queue state
/// (spec.md §4.4).
const IDEMPOTENCE_TTL: Duration = Duration::from_secs(10 * 60);

/// History is considered relevant to a stuck queue item within this window
/// when no grab event names the item's `download_id` directly.
const FALLBACK_GRAB_WINDOW: chrono::Duration = chrono::Duration::hours(24);

/// Tracker-classification substrings and the score threshold, loaded from
/// config.
#[derive(Debug, Clone, Default)]
pub struct TrackerLists {
    pub private: Vec<String>,
    pub public: Vec<String>,
}

/// Outcome of a single [`ReconciliationEngine::reconcile`] call that did not
/// hit a fatal error.
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// The analyzer reached a decision and it was (or, in dry-run, would
    /// have been) executed.
    Decided(Decision),
    /// The same decision was already acted on within the idempotence
    /// window; nothing was re-executed.
    Cooldown(Decision),
    /// A transient manager error; the item is left for the next scan.
    Deferred(String),
    /// The item vanished from the manager (404 on a follow-up fetch);
    /// dropped without action.
    Benign,
}

/// Fatal outcome of [`ReconciliationEngine::reconcile`]: the scan loop must
/// abort the current scan (but not the process) on this.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("manager rejected credentials: {0}")]
    Unauthorized(#[source] ManagerError),
}

/// Long-lived owner of the scan loop and the reconcile routine. Cheap to
/// clone: every field is `Arc`-backed or itself cloneable state.
#[derive(Clone)]
pub struct ReconciliationEngine {
    client: ManagerClient,
    trackers: Arc<TrackerLists>,
    thresholds: Thresholds,
    dry_run: bool,
    metrics: Arc<Metrics>,
    recently_acted_on: Arc<TtlCache<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    /// Minimum count of failure-type history events required before a
    /// `remove_public` decision executes (config `monitoring.remove_public_failures`).
    /// Zero (the default) disables the gate.
    remove_public_failures: u32,
}

impl ReconciliationEngine {
    #[must_use]
    pub fn new(
        client: ManagerClient,
        trackers: TrackerLists,
        thresholds: Thresholds,
        dry_run: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            trackers: Arc::new(trackers),
            thresholds,
            dry_run,
            metrics,
            recently_acted_on: Arc::new(TtlCache::new()),
            locks: Arc::new(DashMap::new()),
            remove_public_failures: 0,
        }
    }

    /// Sets the minimum failure-event count gate for `remove_public`
    /// decisions (spec.md §6 `monitoring.remove_public_failures`).
    #[must_use]
    pub fn with_remove_public_failures(mut self, count: u32) -> Self {
        self.remove_public_failures = count;
        self
    }

    /// Runs one scan: fetches the queue, selects stuck candidates, and
    /// reconciles each sequentially. A transient or benign outcome never
    /// aborts the scan; an `Unauthorized` manager error does.
    #[instrument(skip(self))]
    pub async fn scan_once(&self) -> Result<(), ReconcileError> {
        self.metrics.queue_scans.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let queue = match self.client.fetch_queue().await {
            Ok(queue) => queue,
            Err(ManagerError::Unauthorized { .. }) => {
                return Err(ReconcileError::Unauthorized(ManagerError::unauthorized("/queue")));
            }
            Err(err) => {
                warn!(error = %err, "queue fetch failed; skipping this scan");
                return Ok(());
            }
        };

        let candidates: Vec<QueueItem> = queue.into_iter().filter(QueueItem::is_stuck).collect();
        info!(candidate_count = candidates.len(), "scan selected candidates");

        for item in candidates {
            self.metrics.items_processed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let engine = self.clone();
            let handle = tokio::spawn(async move { engine.reconcile(&item).await });
            match handle.await {
                Ok(Ok(outcome)) => self.record_outcome(&outcome),
                Ok(Err(ReconcileError::Unauthorized(err))) => {
                    error!(error = %err, "manager rejected credentials; aborting scan");
                    return Err(ReconcileError::Unauthorized(err));
                }
                Err(join_err) => {
                    warn!(error = %join_err, "reconcile task panicked; continuing scan");
                }
            }
        }

        Ok(())
    }

    fn record_outcome(&self, outcome: &ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Decided(decision) => self.metrics.record_decision(decision.kind()),
            ReconcileOutcome::Cooldown(decision) => {
                info!(kind = decision.kind(), "decision already acted on; cooldown");
            }
            ReconcileOutcome::Deferred(reason) => {
                info!(reason, "reconcile deferred for next scan");
            }
            ReconcileOutcome::Benign => info!("item disappeared before reconcile; dropped"),
        }
    }

    /// The deterministic per-item routine (spec.md §4.4 steps 1-7).
    #[instrument(skip(self, item), fields(episode_id = item.episode_id, download_id = %item.download_id))]
    pub async fn reconcile(&self, item: &QueueItem) -> Result<ReconcileOutcome, ReconcileError> {
        let lock = self
            .locks
            .entry(item.download_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let cls = analyzer::classify_tracker(&item.indexer, &self.trackers.private, &self.trackers.public);

        let history = match self.client.fetch_history(item.episode_id).await {
            Ok(history) => history,
            Err(ManagerError::Unauthorized { .. }) => {
                return Err(ReconcileError::Unauthorized(ManagerError::unauthorized("/history")));
            }
            Err(ManagerError::NotFound { .. }) => return Ok(ReconcileOutcome::Benign),
            Err(err) => return Ok(ReconcileOutcome::Deferred(err.to_string())),
        };

        let cutoff = chrono::Utc::now() - FALLBACK_GRAB_WINDOW;
        let grab = history
            .iter()
            .filter(|event| event.event_type == HistoryEventType::Grabbed)
            .filter(|event| event.download_id.as_deref() == Some(item.download_id.as_str()))
            .max_by_key(|event| event.date)
            .or_else(|| {
                history
                    .iter()
                    .filter(|event| event.event_type == HistoryEventType::Grabbed)
                    .filter(|event| event.date >= cutoff)
                    .max_by_key(|event| event.date)
            });

        let Some(grab) = grab else {
            return Ok(ReconcileOutcome::Deferred("no matching grab event in history".to_string()));
        };
        let grab_formats = grab.custom_formats.clone();
        let grab_score = match grab.custom_format_score {
            Some(score) => score,
            None => match self.client.resolve_quality_profile(item.series_id).await {
                Ok(profile) => ManagerClient::score_against_profile(&profile, &grab_formats),
                Err(ManagerError::Unauthorized { .. }) => {
                    return Err(ReconcileError::Unauthorized(ManagerError::unauthorized("/qualityprofile")));
                }
                Err(err) => return Ok(ReconcileOutcome::Deferred(err.to_string())),
            },
        };

        let current_file = match self.client.fetch_episode_file(item.episode_id).await {
            Ok(file) => file,
            Err(ManagerError::Unauthorized { .. }) => {
                return Err(ReconcileError::Unauthorized(ManagerError::unauthorized("/episodefile")));
            }
            Err(ManagerError::NotFound { .. }) => None,
            Err(err) => return Ok(ReconcileOutcome::Deferred(err.to_string())),
        };
        let current_formats = current_file.as_ref().map(|file| file.custom_formats.clone()).unwrap_or_default();
        let current_score = match &current_file {
            None => None,
            Some(file) => match file.custom_format_score {
                Some(score) => Some(score),
                None => match self.client.quality_profile_by_id(file.quality_profile_id).await {
                    Ok(profile) => Some(ManagerClient::score_against_profile(&profile, &current_formats)),
                    Err(ManagerError::Unauthorized { .. }) => {
                        return Err(ReconcileError::Unauthorized(ManagerError::unauthorized("/qualityprofile")));
                    }
                    Err(err) => return Ok(ReconcileOutcome::Deferred(err.to_string())),
                },
            },
        };

        let decision = analyzer::analyze(
            grab_score,
            current_score,
            cls,
            self.thresholds,
            &grab_formats,
            &current_formats,
        );
        let decision = self.apply_remove_public_failure_gate(decision, &history);

        let idempotence_key = format!("{}:{}:{}", item.episode_id, item.download_id, decision.kind());
        if self.recently_acted_on.contains(&idempotence_key) {
            return Ok(ReconcileOutcome::Cooldown(decision));
        }

        self.execute(item, &decision, &grab_formats).await?;
        self.recently_acted_on.put(idempotence_key, (), IDEMPOTENCE_TTL);

        Ok(ReconcileOutcome::Decided(decision))
    }

    /// Downgrades `remove_public` to `no_action` when fewer than
    /// `self.remove_public_failures` `downloadFailed` events appear in
    /// `history` within the last 24h — a score gap alone isn't enough
    /// evidence to blocklist a release if the gate is configured.
    fn apply_remove_public_failure_gate(
        &self,
        decision: Decision,
        history: &[crate::manager::HistoryEvent],
    ) -> Decision {
        let Decision::RemovePublic { grab_score, current_score, .. } = &decision else {
            return decision;
        };
        if self.remove_public_failures == 0 {
            return decision;
        }

        let cutoff = chrono::Utc::now() - FALLBACK_GRAB_WINDOW;
        let failure_count = history
            .iter()
            .filter(|event| event.event_type == HistoryEventType::DownloadFailed && event.date >= cutoff)
            .count() as u32;

        if failure_count >= self.remove_public_failures {
            return decision;
        }

        Decision::NoAction {
            grab_score: *grab_score,
            current_score: *current_score,
            reason: format!(
                "would remove_public but only {failure_count} failure event(s) in 24h (need {})",
                self.remove_public_failures
            ),
        }
    }

    /// Handler for a fired `post_grab_check` scheduler task (spec.md §4.6).
    /// Looks up the current queue; reconciles the matching item if it's
    /// still present and stuck, otherwise records that it imported in time.
    #[instrument(skip(self), fields(episode_id = fingerprint.episode_id, download_id = %fingerprint.download_id))]
    pub async fn handle_post_grab_check(
        &self,
        fingerprint: &crate::scheduler::Fingerprint,
    ) -> Result<(), ReconcileError> {
        let queue = match self.client.fetch_queue().await {
            Ok(queue) => queue,
            Err(ManagerError::Unauthorized { .. }) => {
                return Err(ReconcileError::Unauthorized(ManagerError::unauthorized("/queue")));
            }
            Err(err) => {
                warn!(error = %err, "post-grab check: queue fetch failed, will retry next due task");
                return Ok(());
            }
        };

        let Some(item) = queue.iter().find(|item| item.download_id == fingerprint.download_id) else {
            info!("post-grab check: item imported in time, nothing to do");
            return Ok(());
        };

        if !item.is_stuck() {
            info!("post-grab check: item no longer stuck, nothing to do");
            return Ok(());
        }

        let outcome = self.reconcile(item).await?;
        self.record_outcome(&outcome);
        Ok(())
    }

    async fn execute(
        &self,
        item: &QueueItem,
        decision: &Decision,
        grab_formats: &std::collections::BTreeSet<String>,
    ) -> Result<(), ReconcileError> {
        if self.dry_run {
            info!(kind = decision.kind(), reason = decision.reason(), "dry-run: not executing decision");
            return Ok(());
        }

        match decision {
            Decision::ForceImport { .. } => {
                let Some(output_path) = item.output_path.clone() else {
                    warn!("force_import decided but queue item has no output_path; skipping");
                    return Ok(());
                };

                let series = match self.client.fetch_series(item.series_id).await {
                    Ok(series) => series,
                    Err(ManagerError::Unauthorized { .. }) => {
                        return Err(ReconcileError::Unauthorized(ManagerError::unauthorized("/series")));
                    }
                    Err(err) => {
                        warn!(error = %err, "could not resolve series for force_import; skipping");
                        return Ok(());
                    }
                };

                let command = ManualImportCommand::new(vec![ManualImportFile {
                    path: output_path,
                    episode_ids: vec![item.episode_id],
                    quality_profile_id: series.quality_profile_id,
                    custom_formats: grab_formats.iter().cloned().collect(),
                }]);

                if let Err(err) = self.client.manual_import(command).await {
                    warn!(error = %err, "manual import failed");
                }
            }
            Decision::RemovePublic { .. } => {
                let request = RemoveQueueItemRequest { id: item.id, block_release: true };
                if let Err(err) = self.client.remove_queue_item(request).await {
                    warn!(error = %err, "queue item removal failed");
                }
            }
            Decision::KeepPrivate { .. } | Decision::NoAction { .. } => {}
        }

        Ok(())
    }
}
