use crate::registry::{RecordingRecord, RecordingStatus};

/// Outcome of the duration/cancellation gate
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Eligibility {
    Eligible,
    /// Requested and actual durations differ by more than the threshold allows
    RejectedThreshold { ratio_percent: Option<f64> },
    /// Cancelled recording while cancelled recordings are excluded
    RejectedCancelled,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Symmetric duration match in percent: min/max * 100.
/// None when either side is zero.
pub fn duration_ratio_percent(requested_secs: u64, actual_secs: u64) -> Option<f64> {
    let longer = requested_secs.max(actual_secs);
    let shorter = requested_secs.min(actual_secs);
    if shorter == 0 {
        return None;
    }
    Some(shorter as f64 / longer as f64 * 100.0)
}

/// Decide whether a recording should be transcoded.
///
/// Cancelled recordings skip duration matching entirely when they are
/// included: ad-hoc recordings have no meaningful requested duration.
/// A threshold of 0 always passes. A missing actual duration counts as zero.
pub fn evaluate(record: &RecordingRecord, threshold_percent: u32, include_cancelled: bool) -> Eligibility {
    if record.status == RecordingStatus::Cancelled {
        return if include_cancelled {
            Eligibility::Eligible
        } else {
            Eligibility::RejectedCancelled
        };
    }

    if threshold_percent == 0 {
        return Eligibility::Eligible;
    }

    let actual = record.actual_duration_seconds.unwrap_or(0);
    match duration_ratio_percent(record.requested_duration_seconds, actual) {
        Some(ratio) if ratio >= threshold_percent as f64 => Eligibility::Eligible,
        ratio_percent => Eligibility::RejectedThreshold { ratio_percent },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(status: RecordingStatus, requested: u64, actual: u64) -> RecordingRecord {
        RecordingRecord {
            id: "rec-1".to_string(),
            title: "Test Show".to_string(),
            series_info: "Test Channel".to_string(),
            channel: None,
            scheduled_start: None,
            requested_duration_seconds: requested,
            actual_duration_seconds: Some(actual),
            status,
            file_path: None,
        }
    }

    fn any_status_but_cancelled() -> impl Strategy<Value = RecordingStatus> {
        prop_oneof![
            Just(RecordingStatus::Completed),
            Just(RecordingStatus::Failed),
            Just(RecordingStatus::InProgress),
        ]
    }

    #[test]
    fn test_threshold_boundary_example() {
        // 3200 / 3600 = 88.9%
        let rec = record(RecordingStatus::Completed, 3600, 3200);
        assert!(matches!(evaluate(&rec, 90, true), Eligibility::RejectedThreshold { .. }));
        assert_eq!(evaluate(&rec, 85, true), Eligibility::Eligible);
    }

    #[test]
    fn test_ratio_is_symmetric_for_overruns() {
        let short = record(RecordingStatus::Completed, 3600, 3200);
        let long = record(RecordingStatus::Completed, 3200, 3600);
        assert_eq!(evaluate(&short, 85, false), evaluate(&long, 85, false));
    }

    #[test]
    fn test_zero_durations_are_rejected_not_divided() {
        let rec = record(RecordingStatus::Completed, 0, 3600);
        assert_eq!(
            evaluate(&rec, 50, true),
            Eligibility::RejectedThreshold { ratio_percent: None }
        );
        let rec = record(RecordingStatus::Completed, 3600, 0);
        assert!(!evaluate(&rec, 1, true).is_eligible());
    }

    #[test]
    fn test_missing_actual_duration_counts_as_zero() {
        let mut rec = record(RecordingStatus::Completed, 3600, 0);
        rec.actual_duration_seconds = None;
        assert!(!evaluate(&rec, 30, true).is_eligible());
        assert!(evaluate(&rec, 0, true).is_eligible());
    }

    #[test]
    fn test_exact_threshold_passes() {
        let rec = record(RecordingStatus::Completed, 100, 90);
        assert_eq!(evaluate(&rec, 90, false), Eligibility::Eligible);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Included cancelled recordings pass whatever their durations
        #[test]
        fn test_cancellation_bypass(
            requested in 0u64..100_000,
            actual in 0u64..100_000,
            threshold in 0u32..=100,
        ) {
            let rec = record(RecordingStatus::Cancelled, requested, actual);
            prop_assert_eq!(evaluate(&rec, threshold, true), Eligibility::Eligible);
        }

        /// Excluded cancelled recordings are rejected whatever their durations
        #[test]
        fn test_cancellation_exclusion(
            requested in 0u64..100_000,
            actual in 0u64..100_000,
            threshold in 0u32..=100,
        ) {
            let rec = record(RecordingStatus::Cancelled, requested, actual);
            prop_assert_eq!(evaluate(&rec, threshold, false), Eligibility::RejectedCancelled);
        }

        /// Threshold 0 admits every non-cancelled recording
        #[test]
        fn test_zero_threshold_always_passes(
            status in any_status_but_cancelled(),
            requested in 0u64..100_000,
            actual in 0u64..100_000,
        ) {
            let rec = record(status, requested, actual);
            prop_assert!(evaluate(&rec, 0, false).is_eligible());
        }

        /// The ratio never exceeds 100% and matches the eligibility decision
        #[test]
        fn test_ratio_bounds_and_decision_agree(
            requested in 1u64..100_000,
            actual in 1u64..100_000,
            threshold in 1u32..=100,
        ) {
            let ratio = duration_ratio_percent(requested, actual).unwrap();
            prop_assert!(ratio > 0.0 && ratio <= 100.0);

            let rec = record(RecordingStatus::Completed, requested, actual);
            let eligible = evaluate(&rec, threshold, true).is_eligible();
            prop_assert_eq!(eligible, ratio >= threshold as f64);
        }

        /// Evaluation does not depend on the include flag for non-cancelled recordings
        #[test]
        fn test_include_flag_only_affects_cancelled(
            requested in 0u64..100_000,
            actual in 0u64..100_000,
            threshold in 0u32..=100,
        ) {
            let rec = record(RecordingStatus::Completed, requested, actual);
            prop_assert_eq!(evaluate(&rec, threshold, true), evaluate(&rec, threshold, false));
        }
    }
}
