//! Skip-logic classification of resolved candidates.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::redeem::types::{FailureLabel, PriorOutcomes, RedemptionCandidate, SkipReason};

/// Indices into the candidate list, split by whether a live attempt is needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub attempts: Vec<usize>,
    pub skipped: Vec<usize>,
}

/// Classify candidates in place and partition them, preserving order.
///
/// Precedence: a recorded success always skips; expiry skips unless bypassed
/// (and is recorded as a failure the first time); a recorded failure skips
/// unless bypassed. Everything else is attempted.
pub fn classify(
    candidates: &mut [RedemptionCandidate],
    prior: &PriorOutcomes,
    now: DateTime<Utc>,
    bypass_failures: bool,
) -> Partition {
    let mut partition = Partition::default();

    for (index, candidate) in candidates.iter_mut().enumerate() {
        let pair = candidate.pair();
        let failure = prior.failures.get(&pair);

        if let Some(failure) = failure {
            candidate.previously_failed = Some(failure.status.clone());
            candidate.failure_detail = failure.detail.clone();
        }

        if let Some(success) = prior.successes.get(&pair) {
            candidate.previously_redeemed = true;
            candidate.previously_redeemed_status = Some(success.status.clone());
            candidate.skip_reason = Some(SkipReason::Redeemed);
            partition.skipped.push(index);
            continue;
        }

        if candidate.is_expired_at(now) {
            candidate.preclassified_status = Some(FailureLabel::Expired);
            if !bypass_failures {
                candidate.skip_reason = Some(SkipReason::Expired);
                candidate.record_preclassification = failure.is_none();
                partition.skipped.push(index);
                continue;
            }
            candidate.record_preclassification = false;
        }

        if failure.is_some() && !bypass_failures {
            candidate.skip_reason = Some(SkipReason::Failed);
            partition.skipped.push(index);
            continue;
        }

        candidate.skip_reason = None;
        partition.attempts.push(index);
    }

    debug!(
        "Classified {} candidates: {} attempts, {} skipped",
        candidates.len(),
        partition.attempts.len(),
        partition.skipped.len()
    );

    partition
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redeem::types::{OutcomeKind, OutcomeRecord, Origin};
    use crate::types::{Game, NormalizedCode, Platform};
    use chrono::Duration;

    fn code() -> NormalizedCode {
        NormalizedCode::parse("ABCDE-FGHIJ-KLMNO-PQRST-UVWXY").unwrap()
    }

    fn candidates() -> Vec<RedemptionCandidate> {
        [Platform::Epic, Platform::Steam, Platform::Psn]
            .into_iter()
            .map(|p| RedemptionCandidate::new(code(), Game::Bl3, p, None, Origin::RemoteFeed))
            .collect()
    }

    fn outcome(platform: Platform, kind: OutcomeKind, status: &str) -> OutcomeRecord {
        OutcomeRecord {
            key_id: 1,
            code: code().to_string(),
            game: Game::Bl3,
            platform,
            kind,
            status: status.to_string(),
            detail: Some(format!("{} detail", status)),
            attempted_at: Utc::now(),
        }
    }

    #[test]
    fn test_partition_is_exhaustive_and_ordered() {
        let mut list = candidates();
        let prior = PriorOutcomes::from_records([
            outcome(Platform::Steam, OutcomeKind::Success, "SUCCESS"),
            outcome(Platform::Psn, OutcomeKind::Failure, "INVALID"),
        ]);

        let partition = classify(&mut list, &prior, Utc::now(), false);
        assert_eq!(partition.attempts, vec![0]);
        assert_eq!(partition.skipped, vec![1, 2]);
        assert_eq!(list[1].skip_reason, Some(SkipReason::Redeemed));
        assert_eq!(list[2].skip_reason, Some(SkipReason::Failed));
        assert_eq!(list[2].previously_failed.as_deref(), Some("INVALID"));
    }

    #[test]
    fn test_success_skips_even_with_bypass() {
        let mut list = candidates();
        let prior =
            PriorOutcomes::from_records([outcome(Platform::Epic, OutcomeKind::Success, "REDEEMED")]);

        let partition = classify(&mut list, &prior, Utc::now(), true);
        assert_eq!(partition.skipped, vec![0]);
        assert_eq!(partition.attempts, vec![1, 2]);
        assert_eq!(list[0].previously_redeemed_status.as_deref(), Some("REDEEMED"));
    }

    #[test]
    fn test_expiry_precedes_failure() {
        let now = Utc::now();
        let mut list = candidates();
        for c in list.iter_mut() {
            c.expires_at = Some(now - Duration::minutes(5));
        }
        let prior =
            PriorOutcomes::from_records([outcome(Platform::Steam, OutcomeKind::Failure, "INVALID")]);

        let partition = classify(&mut list, &prior, now, false);
        assert!(partition.attempts.is_empty());
        assert!(list.iter().all(|c| c.skip_reason == Some(SkipReason::Expired)));
        assert!(list.iter().all(|c| c.preclassified_status == Some(FailureLabel::Expired)));
        assert!(list[0].record_preclassification);
        assert!(!list[1].record_preclassification);
    }

    #[test]
    fn test_bypass_attempts_expired_and_failed() {
        let now = Utc::now();
        let mut list = candidates();
        list[0].expired_flag = true;
        let prior =
            PriorOutcomes::from_records([outcome(Platform::Psn, OutcomeKind::Failure, "INVALID")]);

        let partition = classify(&mut list, &prior, now, true);
        assert_eq!(partition.attempts, vec![0, 1, 2]);
        assert_eq!(list[0].preclassified_status, Some(FailureLabel::Expired));
        assert!(!list[0].record_preclassification);
        assert_eq!(list[0].skip_reason, None);
    }
}
