//! Pure decision function comparing grab-time and import-time scoring.
//!
//! No I/O, no async: everything here is a plain function over plain data so
//! it can be exhaustively unit-tested without a runtime. The engine is the
//! only caller that turns a [`Decision`] into an actual manager API call.

use std::collections::BTreeSet;

/// This system's classification of an indexer, derived from configured
/// substring lists. Computed on demand; never stored on a [`crate::manager::QueueItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerClass {
    Private,
    Public,
    Unknown,
}

/// Classifies `indexer` against case-insensitive substring lists. A name
/// appearing in both lists is treated as private (the more conservative
/// reading) rather than rejected as a config error.
#[must_use]
pub fn classify_tracker(indexer: &str, private: &[String], public: &[String]) -> TrackerClass {
    let lower = indexer.to_lowercase();
    if private.iter().any(|name| lower.contains(&name.to_lowercase())) {
        TrackerClass::Private
    } else if public.iter().any(|name| lower.contains(&name.to_lowercase())) {
        TrackerClass::Public
    } else {
        TrackerClass::Unknown
    }
}

/// Score-difference threshold and the unknown-tracker policy, both
/// config-supplied.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// `T` in spec.md's decision table.
    pub force_import_threshold: i64,
    /// Whether an unknown-class removal candidate is treated as protected
    /// (spec's chosen, conservative default) rather than removed.
    pub protect_unknown_trackers: bool,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { force_import_threshold: 10, protect_unknown_trackers: true }
    }
}

/// A decision produced by [`analyze`], plus the inputs and a human-readable
/// reason for observability. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    ForceImport { grab_score: i64, current_score: Option<i64>, reason: String },
    RemovePublic { grab_score: i64, current_score: i64, reason: String },
    KeepPrivate { grab_score: i64, current_score: i64, reason: String },
    NoAction { grab_score: i64, current_score: i64, reason: String },
}

impl Decision {
    /// The reason string, regardless of variant.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::ForceImport { reason, .. }
            | Self::RemovePublic { reason, .. }
            | Self::KeepPrivate { reason, .. }
            | Self::NoAction { reason, .. } => reason,
        }
    }

    /// Short tag used as the `decision_kind` component of an idempotence key
    /// (see spec.md §4.4) and in structured logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ForceImport { .. } => "force_import",
            Self::RemovePublic { .. } => "remove_public",
            Self::KeepPrivate { .. } => "keep_private",
            Self::NoAction { .. } => "no_action",
        }
    }
}

/// Applies spec.md §4.3's decision table, first match wins.
///
/// `current_score` is `None` when no episode file is currently imported.
/// `missing_formats` and `grab_formats` are used only to enrich the reason
/// string (e.g. "missing format C"); they do not change which branch fires.
#[must_use]
pub fn analyze(
    grab_score: i64,
    current_score: Option<i64>,
    cls: TrackerClass,
    thresholds: Thresholds,
    grab_formats: &BTreeSet<String>,
    current_formats: &BTreeSet<String>,
) -> Decision {
    let t = thresholds.force_import_threshold;

    let Some(current) = current_score else {
        if grab_score >= t {
            return Decision::ForceImport {
                grab_score,
                current_score: None,
                reason: "no current file; grab score exceeds threshold".to_string(),
            };
        }
        return Decision::NoAction {
            grab_score,
            current_score: 0,
            reason: "no current file; grab score below threshold".to_string(),
        };
    };

    let diff = grab_score - current;

    if diff >= t {
        let reason = format_force_import_reason(diff, grab_formats, current_formats);
        return Decision::ForceImport { grab_score, current_score: Some(current), reason };
    }

    if diff <= -t {
        return match cls {
            TrackerClass::Public => Decision::RemovePublic {
                grab_score,
                current_score: current,
                reason: "grab score materially lower; public tracker".to_string(),
            },
            TrackerClass::Private => Decision::KeepPrivate {
                grab_score,
                current_score: current,
                reason: "would remove but private tracker protected".to_string(),
            },
            TrackerClass::Unknown if thresholds.protect_unknown_trackers => {
                Decision::KeepPrivate {
                    grab_score,
                    current_score: current,
                    reason: "unknown tracker; treated as protected".to_string(),
                }
            }
            TrackerClass::Unknown => Decision::RemovePublic {
                grab_score,
                current_score: current,
                reason: "grab score materially lower; unknown tracker treated as public"
                    .to_string(),
            },
        };
    }

    Decision::NoAction {
        grab_score,
        current_score: current,
        reason: "score difference within tolerance".to_string(),
    }
}

fn format_force_import_reason(
    diff: i64,
    grab_formats: &BTreeSet<String>,
    current_formats: &BTreeSet<String>,
) -> String {
    let missing: Vec<&String> = grab_formats.difference(current_formats).collect();
    if missing.is_empty() {
        format!("grab score exceeds current by {diff} (>= threshold)")
    } else {
        let missing_list =
            missing.iter().map(std::string::ToString::to_string).collect::<Vec<_>>().join(", ");
        format!("grab score exceeds current by {diff}; missing format {missing_list}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formats(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn classify_tracker_matches_private_case_insensitively() {
        let private = vec!["BeyondHD".to_string()];
        let public = vec!["nyaa".to_string()];
        assert_eq!(classify_tracker("beyondhd", &private, &public), TrackerClass::Private);
    }

    #[test]
    fn classify_tracker_matches_public() {
        let private = vec!["BeyondHD".to_string()];
        let public = vec!["nyaa".to_string(), "AnimeTosho".to_string()];
        assert_eq!(classify_tracker("AnimeTosho", &private, &public), TrackerClass::Public);
    }

    #[test]
    fn classify_tracker_unmatched_is_unknown() {
        let private = vec!["BeyondHD".to_string()];
        let public = vec!["nyaa".to_string()];
        assert_eq!(classify_tracker("SomeNewIndexer", &private, &public), TrackerClass::Unknown);
    }

    #[test]
    fn scenario_force_import_straightforward() {
        let decision = analyze(
            3161,
            Some(2160),
            TrackerClass::Public,
            Thresholds::default(),
            &formats(&["A", "B", "C", "D", "E", "F", "G"]),
            &formats(&["A", "B", "D", "E", "F", "G"]),
        );
        match decision {
            Decision::ForceImport { reason, .. } => {
                assert!(reason.contains("1001"));
                assert!(reason.contains('C'));
            }
            other => panic!("expected force_import, got {other:?}"),
        }
    }

    #[test]
    fn scenario_private_tracker_keep() {
        let decision =
            analyze(80, Some(100), TrackerClass::Private, Thresholds::default(), &formats(&[]), &formats(&[]));
        assert!(matches!(decision, Decision::KeepPrivate { .. }));
    }

    #[test]
    fn scenario_public_removal() {
        let decision =
            analyze(80, Some(100), TrackerClass::Public, Thresholds::default(), &formats(&[]), &formats(&[]));
        assert!(matches!(decision, Decision::RemovePublic { .. }));
    }

    #[test]
    fn unknown_tracker_protected_by_default() {
        let decision =
            analyze(80, Some(100), TrackerClass::Unknown, Thresholds::default(), &formats(&[]), &formats(&[]));
        assert!(matches!(decision, Decision::KeepPrivate { .. }));
    }

    #[test]
    fn unknown_tracker_removed_when_protection_disabled() {
        let thresholds =
            Thresholds { force_import_threshold: 10, protect_unknown_trackers: false };
        let decision =
            analyze(80, Some(100), TrackerClass::Unknown, thresholds, &formats(&[]), &formats(&[]));
        assert!(matches!(decision, Decision::RemovePublic { .. }));
    }

    #[test]
    fn boundary_diff_exactly_threshold_forces_import() {
        let decision =
            analyze(110, Some(100), TrackerClass::Public, Thresholds::default(), &formats(&[]), &formats(&[]));
        assert!(matches!(decision, Decision::ForceImport { .. }));
    }

    #[test]
    fn boundary_diff_exactly_negative_threshold_removes() {
        let decision =
            analyze(90, Some(100), TrackerClass::Public, Thresholds::default(), &formats(&[]), &formats(&[]));
        assert!(matches!(decision, Decision::RemovePublic { .. }));
    }

    #[test]
    fn within_tolerance_is_no_action() {
        let decision =
            analyze(95, Some(100), TrackerClass::Public, Thresholds::default(), &formats(&[]), &formats(&[]));
        assert!(matches!(decision, Decision::NoAction { .. }));
    }

    #[test]
    fn missing_current_file_with_score_above_threshold_forces_import() {
        let decision =
            analyze(15, None, TrackerClass::Public, Thresholds::default(), &formats(&[]), &formats(&[]));
        assert!(matches!(decision, Decision::ForceImport { current_score: None, .. }));
    }

    #[test]
    fn missing_current_file_with_score_below_threshold_is_no_action() {
        let decision =
            analyze(5, None, TrackerClass::Public, Thresholds::default(), &formats(&[]), &formats(&[]));
        assert!(matches!(decision, Decision::NoAction { .. }));
    }

    #[test]
    fn decision_kind_matches_variant() {
        let decision =
            analyze(110, Some(100), TrackerClass::Public, Thresholds::default(), &formats(&[]), &formats(&[]));
        assert_eq!(decision.kind(), "force_import");
    }
}
