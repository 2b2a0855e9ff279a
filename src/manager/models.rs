//! Wire types for the media manager's HTTP/JSON API.
//!
//! These mirror the manager's JSON shapes closely enough to deserialize them,
//! but are not a full client SDK: unknown fields are ignored (serde's default
//! behavior for structs without `deny_unknown_fields`), and fields the engine
//! never reads are simply omitted rather than modeled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Status of a queue item as reported by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
}

/// The manager's finer-grained state for a queue item's import progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackedState {
    Importing,
    ImportPending,
    ImportBlocked,
    DownloadFailed,
    ImportFailed,
    /// Any state the manager reports that this engine does not special-case.
    #[serde(other)]
    Other,
}

/// A snapshot of one pending download as reported by `GET /queue`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: i64,
    pub download_id: String,
    pub episode_id: i64,
    pub series_id: i64,
    pub status: QueueStatus,
    pub tracked_state: TrackedState,
    #[serde(default)]
    pub status_messages: Vec<String>,
    pub indexer: String,
    #[serde(default)]
    pub output_path: Option<String>,
}

/// Known phrases in `status_messages` that indicate a stalled import, in
/// addition to a stuck [`TrackedState`].
pub const STUCK_STATUS_MARKERS: &[&str] =
    &["manual import required", "no files found", "unable to import"];

impl QueueItem {
    /// Whether this item's `tracked_state` or `status_messages` indicate
    /// import is not progressing on its own.
    #[must_use]
    pub fn is_stuck(&self) -> bool {
        let stuck_state = matches!(
            self.tracked_state,
            TrackedState::ImportPending | TrackedState::ImportBlocked | TrackedState::ImportFailed
        );
        let stuck_message = self.status_messages.iter().any(|message| {
            let lower = message.to_lowercase();
            STUCK_STATUS_MARKERS.iter().any(|marker| lower.contains(marker))
        });
        stuck_state || stuck_message
    }
}

/// One manager-recorded event for an episode, from `GET /history`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    pub event_type: HistoryEventType,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub download_id: Option<String>,
    #[serde(default)]
    pub source_title: Option<String>,
    #[serde(default)]
    pub indexer: Option<String>,
    #[serde(default)]
    pub custom_format_score: Option<i64>,
    #[serde(default)]
    pub custom_formats: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HistoryEventType {
    Grabbed,
    DownloadFolderImported,
    DownloadFailed,
    EpisodeFileDeleted,
    GrabbedImportPending,
    #[serde(other)]
    Other,
}

/// The currently-imported file for an episode, from `GET /episodefile/{id}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeFile {
    pub episode_id: i64,
    #[serde(default)]
    pub custom_format_score: Option<i64>,
    #[serde(default)]
    pub custom_formats: BTreeSet<String>,
    pub quality_profile_id: i64,
}

/// One custom format's contribution within a quality profile.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomFormatScore {
    pub format_id: i64,
    pub name: String,
    pub score: i64,
}

/// A quality profile's custom-format scoring table, keyed by format name so
/// [`crate::manager::score::compute_score`] can look formats up directly.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityProfile {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub format_scores: Vec<CustomFormatScore>,
}

impl QualityProfile {
    /// Score contributed by `format_name`, or zero if the profile does not
    /// configure it (spec: "unknown formats contribute zero").
    #[must_use]
    pub fn score_for(&self, format_name: &str) -> i64 {
        self.format_scores
            .iter()
            .find(|f| f.name == format_name)
            .map_or(0, |f| f.score)
    }
}

/// A manager series, used to resolve the quality profile that applies to an
/// episode.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Series {
    pub id: i64,
    pub quality_profile_id: i64,
}

/// Request body for `DELETE /queue/{id}`.
#[derive(Debug, Clone, Copy)]
pub struct RemoveQueueItemRequest {
    pub id: i64,
    pub block_release: bool,
}

/// One file entry within a `ManualImport` command body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualImportFile {
    pub path: String,
    pub episode_ids: Vec<i64>,
    pub quality_profile_id: i64,
    pub custom_formats: Vec<String>,
}

/// Body of `POST /command` for a manual import.
#[derive(Debug, Clone, Serialize)]
pub struct ManualImportCommand {
    pub name: &'static str,
    pub files: Vec<ManualImportFile>,
}

impl ManualImportCommand {
    #[must_use]
    pub fn new(files: Vec<ManualImportFile>) -> Self {
        Self { name: "ManualImport", files }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_item_stuck_via_tracked_state() {
        let item = QueueItem {
            id: 1,
            download_id: "D1".into(),
            episode_id: 1,
            series_id: 1,
            status: QueueStatus::Downloading,
            tracked_state: TrackedState::ImportPending,
            status_messages: vec![],
            indexer: "nyaa".into(),
            output_path: None,
        };
        assert!(item.is_stuck());
    }

    #[test]
    fn queue_item_stuck_via_status_message_case_insensitive() {
        let item = QueueItem {
            id: 1,
            download_id: "D1".into(),
            episode_id: 1,
            series_id: 1,
            status: QueueStatus::Downloading,
            tracked_state: TrackedState::Other,
            status_messages: vec!["Manual Import Required".into()],
            indexer: "nyaa".into(),
            output_path: None,
        };
        assert!(item.is_stuck());
    }

    #[test]
    fn queue_item_not_stuck_when_importing_cleanly() {
        let item = QueueItem {
            id: 1,
            download_id: "D1".into(),
            episode_id: 1,
            series_id: 1,
            status: QueueStatus::Downloading,
            tracked_state: TrackedState::Importing,
            status_messages: vec![],
            indexer: "nyaa".into(),
            output_path: None,
        };
        assert!(!item.is_stuck());
    }

    #[test]
    fn quality_profile_unknown_format_contributes_zero() {
        let profile = QualityProfile {
            id: 1,
            name: "HD".into(),
            format_scores: vec![CustomFormatScore { format_id: 1, name: "HDR".into(), score: 50 }],
        };
        assert_eq!(profile.score_for("HDR"), 50);
        assert_eq!(profile.score_for("unknown"), 0);
    }

    #[test]
    fn unrecognized_tracked_state_deserializes_to_other() {
        let json = r#"{
            "id": 1, "downloadId": "D1", "episodeId": 1, "seriesId": 1,
            "status": "downloading", "trackedState": "somethingNew",
            "indexer": "nyaa"
        }"#;
        let item: QueueItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.tracked_state, TrackedState::Other);
    }
}
