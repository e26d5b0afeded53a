//! Redemption plan: resolved candidates plus their attempt/skip partition.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nonempty::NonEmpty;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::error::RedeemError;
use crate::redeem::classifier::{classify, Partition};
use crate::redeem::feed::CodeFeed;
use crate::redeem::normalize::normalize_requested_platforms;
use crate::redeem::resolver::CandidateResolver;
use crate::redeem::storage::KeyStorage;
use crate::redeem::types::{RedemptionCandidate, UNKNOWN_REWARD};
use crate::types::{Game, NormalizedCode, Platform};

/// Where a candidate landed in its plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Attempt,
    Skip,
}

/// Planning result for one code.
///
/// The candidate set and its partition are fixed once built; only the
/// per-candidate outcome fields change as the execution loop reports back.
#[derive(Debug, Clone)]
pub struct RedemptionPlan {
    /// Code as the caller supplied it
    pub code: String,
    pub normalized_code: NormalizedCode,
    pub requested_platforms: NonEmpty<Platform>,
    pub games: Vec<Game>,
    pub reward_hint: String,
    pub store_had_code: bool,
    pub degraded_sources: Vec<RedeemError>,
    candidates: Vec<RedemptionCandidate>,
    partition: Partition,
}

impl RedemptionPlan {
    pub fn candidates(&self) -> &[RedemptionCandidate] {
        &self.candidates
    }

    pub fn attempts(&self) -> impl Iterator<Item = &RedemptionCandidate> {
        self.partition.attempts.iter().map(|&i| &self.candidates[i])
    }

    pub fn skipped(&self) -> impl Iterator<Item = &RedemptionCandidate> {
        self.partition.skipped.iter().map(|&i| &self.candidates[i])
    }

    pub fn attempt_count(&self) -> usize {
        self.partition.attempts.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.partition.skipped.len()
    }

    pub fn disposition(&self, game: Game, platform: Platform) -> Option<Disposition> {
        let index = self.index_of(game, platform)?;
        Some(if self.partition.attempts.contains(&index) {
            Disposition::Attempt
        } else {
            Disposition::Skip
        })
    }

    pub fn find_candidate(&self, game: Game, platform: Platform) -> Option<&RedemptionCandidate> {
        self.index_of(game, platform).map(|i| &self.candidates[i])
    }

    /// Mutable access for recording outcomes back onto the plan.
    pub fn find_candidate_mut(
        &mut self,
        game: Game,
        platform: Platform,
    ) -> Option<&mut RedemptionCandidate> {
        let index = self.index_of(game, platform)?;
        self.candidates.get_mut(index)
    }

    /// Candidates in the attempt partition, mutably, in plan order.
    pub fn attempts_mut(&mut self) -> Vec<&mut RedemptionCandidate> {
        let attempts = &self.partition.attempts;
        self.candidates
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| attempts.contains(i))
            .map(|(_, c)| c)
            .collect()
    }

    /// Candidates in the skip partition, mutably, in plan order.
    pub fn skipped_mut(&mut self) -> Vec<&mut RedemptionCandidate> {
        let skipped = &self.partition.skipped;
        self.candidates
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| skipped.contains(i))
            .map(|(_, c)| c)
            .collect()
    }

    fn index_of(&self, game: Game, platform: Platform) -> Option<usize> {
        self.candidates
            .iter()
            .position(|c| c.game == game && c.platform == platform)
    }

    /// JSON rendering for the CLI.
    pub fn to_json(&self) -> Value {
        let describe = |c: &RedemptionCandidate| {
            json!({
                "game": c.game,
                "platform": c.platform,
                "reward": c.reward,
                "origin": c.origin,
                "source": c.source,
                "expires_at": c.expires_at,
                "expired": c.expired_flag,
                "preclassified_status": c.preclassified_status,
                "skip_reason": c.skip_reason,
                "previously_redeemed_status": c.previously_redeemed_status,
                "previously_failed": c.previously_failed,
                "failure_detail": c.failure_detail,
            })
        };

        json!({
            "code": self.code,
            "normalized_code": self.normalized_code,
            "requested_platforms": self.requested_platforms.iter().collect::<Vec<_>>(),
            "games": self.games,
            "reward_hint": self.reward_hint,
            "store_had_code": self.store_had_code,
            "degraded_sources": self
                .degraded_sources
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>(),
            "attempts": self.attempts().map(describe).collect::<Vec<_>>(),
            "skipped": self.skipped().map(describe).collect::<Vec<_>>(),
        })
    }
}

/// First known reward label among the candidates.
pub fn reward_hint(candidates: &[RedemptionCandidate]) -> String {
    candidates
        .iter()
        .find(|c| c.has_known_reward())
        .map(|c| c.reward.clone())
        .unwrap_or_else(|| UNKNOWN_REWARD.to_string())
}

/// Builds [`RedemptionPlan`]s from the store and the feed.
pub struct RedemptionPlanner {
    resolver: CandidateResolver,
    store: Arc<dyn KeyStorage>,
    bypass_failures: bool,
}

impl RedemptionPlanner {
    pub fn new(store: Arc<dyn KeyStorage>, feed: Arc<dyn CodeFeed>, bypass_failures: bool) -> Self {
        Self {
            resolver: CandidateResolver::new(store.clone(), feed),
            store,
            bypass_failures,
        }
    }

    pub async fn plan<S: AsRef<str>>(&self, code: &str, platforms: &[S]) -> Result<RedemptionPlan> {
        self.plan_at(code, platforms, Utc::now()).await
    }

    /// Build a plan, judging expiry against `now`.
    #[instrument(skip(self, code, platforms, now), fields(code = %code))]
    pub async fn plan_at<S: AsRef<str>>(
        &self,
        code: &str,
        platforms: &[S],
        now: DateTime<Utc>,
    ) -> Result<RedemptionPlan> {
        let requested = normalize_requested_platforms(platforms)?;
        let resolution = self.resolver.resolve(code, &requested).await?;

        let prior = self
            .store
            .fetch_prior_outcomes(&resolution.code)
            .await
            .context("Failed to read prior outcomes")?;

        let mut candidates = resolution.candidates;
        let partition = classify(&mut candidates, &prior, now, self.bypass_failures);
        let reward_hint = reward_hint(&candidates);

        info!(
            "Plan for {}: {} attempts, {} skipped across {} games (reward: {})",
            resolution.code,
            partition.attempts.len(),
            partition.skipped.len(),
            resolution.games.len(),
            reward_hint
        );

        Ok(RedemptionPlan {
            code: code.to_string(),
            normalized_code: resolution.code,
            requested_platforms: requested,
            games: resolution.games,
            reward_hint,
            store_had_code: resolution.store_had_code,
            degraded_sources: resolution.degraded_sources,
            candidates,
            partition,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redeem::types::Origin;

    #[test]
    fn test_reward_hint_takes_first_known() {
        let code = NormalizedCode::parse("ABCDE-FGHIJ-KLMNO-PQRST-UVWXY").unwrap();
        let mut list = vec![
            RedemptionCandidate::new(code.clone(), Game::Bl4, Platform::Epic, None, Origin::Synthetic),
            RedemptionCandidate::new(code.clone(), Game::Bl3, Platform::Epic, Some("Skin"), Origin::RemoteFeed),
            RedemptionCandidate::new(code, Game::Bl2, Platform::Epic, Some("Golden Key"), Origin::RemoteFeed),
        ];
        assert_eq!(reward_hint(&list), "Skin");

        list.truncate(1);
        assert_eq!(reward_hint(&list), UNKNOWN_REWARD);
    }
}
