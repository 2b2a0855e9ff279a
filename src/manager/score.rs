//! Score computation over a file's matched custom formats.
//!
//! The manager already tells us which custom formats matched a release or an
//! imported file; we only sum their configured points against the quality
//! profile in force. We never re-derive which formats matched from the
//! release name or file metadata ourselves.

use super::models::QualityProfile;
use std::collections::BTreeSet;

/// Sums `format_scores` for every name in `custom_formats` against `profile`.
/// A format name the profile does not configure contributes zero rather than
/// erroring, since profiles are edited independently of history and can
/// legitimately lag behind what's in a queue item's matched-formats list.
#[must_use]
pub fn compute_score(profile: &QualityProfile, custom_formats: &BTreeSet<String>) -> i64 {
    custom_formats.iter().map(|name| profile.score_for(name)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::models::CustomFormatScore;

    fn profile() -> QualityProfile {
        QualityProfile {
            id: 1,
            name: "HD-1080p".into(),
            format_scores: vec![
                CustomFormatScore { format_id: 1, name: "HDR".into(), score: 50 },
                CustomFormatScore { format_id: 2, name: "Remux".into(), score: 100 },
                CustomFormatScore { format_id: 3, name: "x265".into(), score: -25 },
            ],
        }
    }

    #[test]
    fn sums_matched_formats() {
        let formats = BTreeSet::from(["HDR".to_string(), "Remux".to_string()]);
        assert_eq!(compute_score(&profile(), &formats), 150);
    }

    #[test]
    fn unknown_format_contributes_zero() {
        let formats = BTreeSet::from(["HDR".to_string(), "Unconfigured".to_string()]);
        assert_eq!(compute_score(&profile(), &formats), 50);
    }

    #[test]
    fn negative_scores_are_honored() {
        let formats = BTreeSet::from(["x265".to_string()]);
        assert_eq!(compute_score(&profile(), &formats), -25);
    }

    #[test]
    fn empty_formats_score_zero() {
        let formats = BTreeSet::new();
        assert_eq!(compute_score(&profile(), &formats), 0);
    }
}
