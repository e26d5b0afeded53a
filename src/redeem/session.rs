//! Run orchestration: single-code (manual) and mapping-driven (bulk) runs
//! sharing one plan cache, one execution loop and one throttle.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::RedeemConfig;
use crate::error::RedeemError;
use crate::redeem::executor::{ExecutionLoop, RedeemClient};
use crate::redeem::feed::{CachedFeed, CodeFeed};
use crate::redeem::plan::{Disposition, RedemptionPlan, RedemptionPlanner};
use crate::redeem::storage::KeyStorage;
use crate::redeem::types::{
    is_known_reward, AttemptResult, RedeemStatus, RedemptionCandidate, RewardCategory, SkipReason,
    StoredKey,
};
use crate::types::{Game, NormalizedCode, Platform};

/// A target that was resolved without a live attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedTarget {
    pub game: Game,
    pub platform: Platform,
    pub reason: SkipReason,
    /// Stored success status or failure label behind the skip
    pub label: Option<String>,
}

impl SkippedTarget {
    fn from_candidate(candidate: &RedemptionCandidate, reason: SkipReason) -> Self {
        let label = match reason {
            SkipReason::Redeemed => candidate.previously_redeemed_status.clone(),
            SkipReason::Failed => candidate.previously_failed.clone(),
            SkipReason::Expired => candidate.preclassified_status.map(|l| l.as_str().to_string()),
        };
        Self {
            game: candidate.game,
            platform: candidate.platform,
            reason,
            label,
        }
    }
}

/// Totals for a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub already_redeemed: usize,
    pub failed: usize,
    pub skipped_redeemed: usize,
    pub skipped_failed: usize,
    pub skipped_expired: usize,
    /// A try-again-later ended the run
    pub halted: bool,
    pub results: Vec<AttemptResult>,
}

impl RunSummary {
    fn record_result(&mut self, result: AttemptResult) {
        match result.status {
            RedeemStatus::Success => self.succeeded += 1,
            RedeemStatus::AlreadyRedeemed => self.already_redeemed += 1,
            _ => self.failed += 1,
        }
        self.results.push(result);
    }

    fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::Redeemed => self.skipped_redeemed += 1,
            SkipReason::Failed => self.skipped_failed += 1,
            SkipReason::Expired => self.skipped_expired += 1,
        }
    }

    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    pub fn skipped(&self) -> usize {
        self.skipped_redeemed + self.skipped_failed + self.skipped_expired
    }

    /// At least one success or already-redeemed outcome.
    pub fn is_successful(&self) -> bool {
        self.succeeded + self.already_redeemed > 0
    }
}

/// Outcome of a single-code run.
#[derive(Debug, Clone, Serialize)]
pub struct CodeReport {
    pub code: NormalizedCode,
    pub reward_hint: String,
    pub skipped: Vec<SkippedTarget>,
    pub summary: RunSummary,
}

/// `game:platform[,platform...]` targets for a bulk run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeemMapping {
    targets: Vec<(Game, Vec<Platform>)>,
}

impl RedeemMapping {
    /// Parse entries like `bl3:steam,epic`; a bare game means every platform.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, RedeemError> {
        let mut targets: Vec<(Game, Vec<Platform>)> = Vec::new();

        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            let (game_token, platform_list) = match entry.split_once(':') {
                Some((game, platforms)) => (game, Some(platforms)),
                None => (entry, None),
            };
            let game = Game::from_token(game_token)
                .ok_or_else(|| RedeemError::UnknownGame(game_token.trim().to_string()))?;

            let platforms = match platform_list {
                None => Platform::ALL.to_vec(),
                Some(list) => list
                    .split(',')
                    .map(str::trim)
                    .filter(|token| !token.is_empty())
                    .map(|token| {
                        Platform::from_token(token).ok_or_else(|| {
                            RedeemError::InvalidMapping(format!("unknown platform '{}' in '{}'", token, entry))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            };
            if platforms.is_empty() {
                return Err(RedeemError::InvalidMapping(format!("no platforms in '{}'", entry)));
            }

            match targets.iter_mut().find(|(g, _)| *g == game) {
                Some((_, existing)) => {
                    for platform in platforms {
                        if !existing.contains(&platform) {
                            existing.push(platform);
                        }
                    }
                }
                None => targets.push((game, platforms)),
            }
        }

        if targets.is_empty() {
            return Err(RedeemError::InvalidMapping("no targets given".to_string()));
        }
        Ok(Self { targets })
    }

    /// Every (game, platform) target in the order given.
    pub fn targets(&self) -> impl Iterator<Item = (Game, Platform)> + '_ {
        self.targets
            .iter()
            .flat_map(|(game, platforms)| platforms.iter().map(move |p| (*game, *p)))
    }
}

/// Which reward categories a bulk run includes. No flag set means all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewardFilter {
    pub golden: bool,
    pub non_golden: bool,
    pub other: bool,
}

impl RewardFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn includes(&self, category: RewardCategory) -> bool {
        if !self.golden && !self.non_golden && !self.other {
            return true;
        }
        match category {
            RewardCategory::GoldenKey => self.golden,
            RewardCategory::OtherKey => self.non_golden,
            RewardCategory::Code => self.other,
        }
    }
}

/// One run against a store, a feed and a redeem client.
pub struct RedemptionSession {
    store: Arc<dyn KeyStorage>,
    feed: Arc<dyn CodeFeed>,
    planner: RedemptionPlanner,
    executor: ExecutionLoop,
    plans: HashMap<NormalizedCode, RedemptionPlan>,
}

impl RedemptionSession {
    pub fn new(
        config: &RedeemConfig,
        store: Arc<dyn KeyStorage>,
        feed: Arc<dyn CodeFeed>,
        client: Arc<dyn RedeemClient>,
    ) -> Self {
        let feed: Arc<dyn CodeFeed> = Arc::new(CachedFeed::new(feed));
        Self {
            planner: RedemptionPlanner::new(store.clone(), feed.clone(), config.bypass_failures),
            executor: ExecutionLoop::new(client, store.clone(), config),
            store,
            feed,
            plans: HashMap::new(),
        }
    }

    /// Plan a code without executing anything.
    pub async fn plan<S: AsRef<str>>(&self, code: &str, platforms: &[S]) -> Result<RedemptionPlan> {
        self.planner.plan(code, platforms).await
    }

    /// Live attempts made so far in this run.
    pub fn attempted(&self) -> u32 {
        self.executor.attempted()
    }

    /// Redeem one code across the requested platforms.
    #[instrument(skip(self, code, platforms), fields(code = %code))]
    pub async fn redeem_code<S: AsRef<str>>(&mut self, code: &str, platforms: &[S]) -> Result<CodeReport> {
        let mut plan = self.planner.plan(code, platforms).await?;
        let mut summary = RunSummary::default();
        let mut skipped = Vec::new();

        info!(
            "Redeeming {} ({}): {} games, {} platforms",
            plan.normalized_code,
            plan.reward_hint,
            plan.games.len(),
            plan.requested_platforms.len()
        );

        for candidate in plan.skipped_mut() {
            let Some(reason) = candidate.skip_reason else {
                continue;
            };
            log_skip(candidate, reason);
            self.executor.record_preclassified(candidate).await?;
            self.executor.mark_seen(candidate);
            summary.record_skip(reason);
            skipped.push(SkippedTarget::from_candidate(candidate, reason));
        }

        let batch = self.executor.execute(plan.attempts_mut()).await?;
        summary.halted = batch.halted;
        for result in batch.results {
            summary.record_result(result);
        }

        if !plan.store_had_code && is_known_reward(&plan.reward_hint) {
            self.backfill_rewards(&plan, &summary.results).await;
        }

        info!(
            "{}: {} succeeded, {} already redeemed, {} failed, {} skipped{}",
            plan.normalized_code,
            summary.succeeded,
            summary.already_redeemed,
            summary.failed,
            summary.skipped(),
            if summary.halted { ", try-later encountered" } else { "" }
        );

        Ok(CodeReport {
            code: plan.normalized_code.clone(),
            reward_hint: plan.reward_hint.clone(),
            skipped,
            summary,
        })
    }

    /// Redeem stored codes for every target in the mapping.
    ///
    /// Codes are taken golden keys first, then other keys, then other codes.
    /// Only live attempts count against `limit`, which applies per target.
    #[instrument(skip(self, mapping))]
    pub async fn redeem_mapping(
        &mut self,
        mapping: &RedeemMapping,
        filter: RewardFilter,
        limit: usize,
    ) -> Result<RunSummary> {
        self.sync_feed().await;
        let mut summary = RunSummary::default();

        for (game, platform) in mapping.targets() {
            info!("Redeeming for {} on {}", game, platform);
            let keys = match self.store.list_keys_for_target(game, platform).await {
                Ok(keys) => keys,
                Err(err) => {
                    warn!("Could not list codes for {} on {}: {:#}", game, platform, err);
                    continue;
                }
            };

            let queue = prioritized_codes(&keys, filter);
            let mut live = 0usize;

            for code in queue {
                if live >= limit {
                    debug!("Limit of {} reached for {} on {}", limit, game, platform);
                    break;
                }

                if !self.plans.contains_key(&code) {
                    match self.planner.plan::<&str>(code.as_str(), &[]).await {
                        Ok(plan) => {
                            self.plans.insert(code.clone(), plan);
                        }
                        Err(err) => {
                            warn!("Could not plan {}: {:#}", code, err);
                            continue;
                        }
                    }
                }
                let Some(plan) = self.plans.get_mut(&code) else {
                    continue;
                };
                let disposition = plan.disposition(game, platform);
                let Some(candidate) = plan.find_candidate_mut(game, platform) else {
                    debug!("No candidate for {} on {}:{}", code, platform, game);
                    continue;
                };

                if disposition == Some(Disposition::Skip) {
                    if !self.executor.mark_seen(candidate) {
                        continue;
                    }
                    if let Some(reason) = candidate.skip_reason {
                        log_skip(candidate, reason);
                        self.executor.record_preclassified(candidate).await?;
                        summary.record_skip(reason);
                    }
                    continue;
                }

                let Some(result) = self.executor.attempt(candidate).await? else {
                    continue;
                };
                live += 1;
                let halt = result.status == RedeemStatus::TryLater;
                summary.record_result(result);
                if halt {
                    warn!("Remote platform asked to try again later; ending run");
                    summary.halted = true;
                    return Ok(summary);
                }
            }
        }

        info!(
            "Run finished: {} succeeded, {} already redeemed, {} failed, {} skipped",
            summary.succeeded,
            summary.already_redeemed,
            summary.failed,
            summary.skipped()
        );
        Ok(summary)
    }

    /// Copy feed entries into the store; a feed outage only costs new codes.
    async fn sync_feed(&self) {
        let records = match self.feed.fetch().await {
            Ok(records) => records,
            Err(err) => {
                warn!("Codes feed unavailable, using stored codes only: {:#}", err);
                return;
            }
        };
        match self.store.sync_feed(&records).await {
            Ok(0) => debug!("No new codes in feed"),
            Ok(inserted) => info!("Stored {} new codes from feed", inserted),
            Err(err) => warn!("Failed to store feed codes: {:#}", err),
        }
    }

    async fn backfill_rewards(&self, plan: &RedemptionPlan, results: &[AttemptResult]) {
        for result in results.iter().filter(|r| r.status.is_positive()) {
            let Some(key_id) = plan
                .find_candidate(result.game, result.platform)
                .and_then(|c| c.key_id)
            else {
                continue;
            };
            match self.store.backfill_reward(key_id, &plan.reward_hint).await {
                Ok(true) => debug!("Backfilled reward '{}' on key {}", plan.reward_hint, key_id),
                Ok(false) => {}
                Err(err) => warn!("Failed to backfill reward on key {}: {:#}", key_id, err),
            }
        }
    }
}

/// Distinct valid codes from stored rows, grouped by reward category.
fn prioritized_codes(keys: &[StoredKey], filter: RewardFilter) -> Vec<NormalizedCode> {
    let mut queue: Vec<(RewardCategory, usize, NormalizedCode)> = Vec::new();

    for (position, key) in keys.iter().enumerate() {
        let category = RewardCategory::of(&key.reward);
        if !filter.includes(category) {
            continue;
        }
        let Ok(code) = NormalizedCode::parse(&key.code) else {
            debug!("Ignoring malformed stored code '{}'", key.code);
            continue;
        };
        if queue.iter().any(|(_, _, queued)| *queued == code) {
            continue;
        }
        queue.push((category, position, code));
    }

    queue.sort_by_key(|(category, position, _)| (*category, *position));
    queue.into_iter().map(|(_, _, code)| code).collect()
}

fn log_skip(candidate: &RedemptionCandidate, reason: SkipReason) {
    match reason {
        SkipReason::Redeemed => info!(
            "Skipping {}: already redeemed ({})",
            candidate.label(),
            candidate.previously_redeemed_status.as_deref().unwrap_or("SUCCESS")
        ),
        SkipReason::Failed => info!(
            "Skipping {}: previously failed with {} ({})",
            candidate.label(),
            candidate.previously_failed.as_deref().unwrap_or("UNKNOWN_ERROR"),
            candidate.failure_detail.as_deref().unwrap_or("no detail")
        ),
        SkipReason::Expired => info!("Skipping {}: EXPIRED", candidate.label()),
    }
}
