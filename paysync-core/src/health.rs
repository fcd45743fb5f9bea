//! Subscription health scoring.
//!
//! Produces a 0..=100 score from recent failure and drift counts. The score
//! is a reporting signal only; alert dispatch is the caller's concern.

use serde::{Deserialize, Serialize};

const FAILED_WEBHOOK_PENALTY: u64 = 4;
const FAILED_WEBHOOK_PENALTY_CAP: u64 = 40;
const DISCREPANCY_PENALTY: u64 = 10;
const DISCREPANCY_PENALTY_CAP: u64 = 60;

/// Snapshot of subscription-pipeline health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub score: u8,
    pub failed_webhooks: u64,
    pub missing_records: u64,
    pub orphaned_records: u64,
}

impl HealthReport {
    /// Whether this report should be surfaced as an alert. Missing ledger
    /// rows are always alert-worthy regardless of the score.
    pub fn needs_attention(&self, threshold: u8) -> bool {
        self.score < threshold || self.failed_webhooks > 5 || self.missing_records > 0
    }
}

/// Score the pipeline: 100 minus a capped penalty per failed webhook minus a
/// larger capped penalty per reconciliation discrepancy, floored at 0.
pub fn score(failed_webhooks: u64, missing_records: u64, orphaned_records: u64) -> HealthReport {
    let webhook_penalty =
        (failed_webhooks.saturating_mul(FAILED_WEBHOOK_PENALTY)).min(FAILED_WEBHOOK_PENALTY_CAP);
    let discrepancies = missing_records.saturating_add(orphaned_records);
    let drift_penalty =
        (discrepancies.saturating_mul(DISCREPANCY_PENALTY)).min(DISCREPANCY_PENALTY_CAP);
    let score = 100u64.saturating_sub(webhook_penalty + drift_penalty) as u8;

    HealthReport {
        score,
        failed_webhooks,
        missing_records,
        orphaned_records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn clean_pipeline_scores_100() {
        let report = score(0, 0, 0);
        assert_eq!(report.score, 100);
        assert!(!report.needs_attention(80));
    }

    #[test]
    fn failed_webhooks_penalized_with_cap() {
        assert_eq!(score(1, 0, 0).score, 96);
        assert_eq!(score(10, 0, 0).score, 60);
        assert_eq!(score(1000, 0, 0).score, 60);
    }

    #[test]
    fn discrepancies_penalized_with_cap() {
        assert_eq!(score(0, 1, 0).score, 90);
        assert_eq!(score(0, 3, 3).score, 40);
        assert_eq!(score(0, 100, 0).score, 40);
    }

    #[test]
    fn worst_case_floors_at_zero() {
        assert_eq!(score(u64::MAX, u64::MAX, u64::MAX).score, 0);
    }

    #[test]
    fn missing_records_always_need_attention() {
        let report = score(0, 1, 0);
        assert!(report.score >= 80);
        assert!(report.needs_attention(80));
    }

    #[test]
    fn many_failures_need_attention_even_above_threshold() {
        let report = score(6, 0, 0);
        assert!(report.needs_attention(50));
    }

    proptest! {
        #[test]
        fn score_is_bounded(f in 0u64..10_000, m in 0u64..10_000, o in 0u64..10_000) {
            let report = score(f, m, o);
            prop_assert!(report.score <= 100);
        }

        #[test]
        fn score_never_improves_with_more_failures(
            f in 0u64..1000, m in 0u64..1000, o in 0u64..1000,
        ) {
            prop_assert!(score(f + 1, m, o).score <= score(f, m, o).score);
            prop_assert!(score(f, m + 1, o).score <= score(f, m, o).score);
            prop_assert!(score(f, m, o + 1).score <= score(f, m, o).score);
        }
    }
}
