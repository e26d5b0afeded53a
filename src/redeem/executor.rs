//! Throttled, retry-aware execution of attempt candidates.
//!
//! Attempts run strictly one after another. The loop suspends at exactly two
//! points: the same-target retry after a first rate limit, and the batch
//! throttle that pauses before an attempt when the attempt count reaches a
//! multiple of `throttle_every` or the previous call was rate limited.

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::RedeemConfig;
use crate::error::RedeemError;
use crate::redeem::resolver::identity_for;
use crate::redeem::storage::KeyStorage;
use crate::redeem::types::{
    AttemptResult, FailureLabel, RedeemResponse, RedeemStatus, RedemptionCandidate, SkipReason,
};
use crate::types::{Game, NormalizedCode, Platform};

/// The remote redemption call for one (code, game, platform).
///
/// Returning `Err` maps to [`RedeemStatus::Unknown`], except for
/// [`RedeemError::Cancelled`] which aborts the run.
#[async_trait]
pub trait RedeemClient: Send + Sync {
    async fn redeem(
        &self,
        code: &NormalizedCode,
        game: Game,
        platform: Platform,
    ) -> Result<RedeemResponse>;
}

/// Batch-level proactive throttle.
#[derive(Debug, Clone)]
pub struct BatchThrottle {
    cooldown: Duration,
    every: u32,
    attempted: u32,
    last_status: Option<RedeemStatus>,
}

impl BatchThrottle {
    pub fn new(cooldown: Duration, every: u32) -> Self {
        Self {
            cooldown,
            every,
            attempted: 0,
            last_status: None,
        }
    }

    pub fn attempted(&self) -> u32 {
        self.attempted
    }

    pub fn should_pause(&self) -> bool {
        if self.attempted == 0 {
            return false;
        }
        let periodic = self.every > 0 && self.attempted % self.every == 0;
        periodic || self.last_status == Some(RedeemStatus::RateLimited)
    }

    async fn pause_if_needed(&self) {
        if !self.should_pause() {
            return;
        }
        if self.last_status == Some(RedeemStatus::RateLimited) {
            info!("Slowing down for {:?} after a rate limit", self.cooldown);
        } else {
            info!(
                "Pausing {:?} after {} attempts to avoid a rate limit",
                self.cooldown, self.attempted
            );
        }
        tokio::time::sleep(self.cooldown).await;
    }

    fn record(&mut self, status: RedeemStatus) {
        self.attempted += 1;
        self.last_status = Some(status);
    }
}

/// Results of one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub results: Vec<AttemptResult>,
    /// A try-again-later ended the batch early
    pub halted: bool,
}

/// Runs attempts against a [`RedeemClient`] and persists every outcome.
pub struct ExecutionLoop {
    client: Arc<dyn RedeemClient>,
    store: Arc<dyn KeyStorage>,
    throttle: BatchThrottle,
    cooldown: Duration,
    seen: HashSet<(NormalizedCode, Game, Platform)>,
}

impl ExecutionLoop {
    pub fn new(client: Arc<dyn RedeemClient>, store: Arc<dyn KeyStorage>, config: &RedeemConfig) -> Self {
        Self {
            client,
            store,
            throttle: BatchThrottle::new(config.cooldown(), config.throttle_every),
            cooldown: config.cooldown(),
            seen: HashSet::new(),
        }
    }

    /// Live attempts made so far in this run.
    pub fn attempted(&self) -> u32 {
        self.throttle.attempted()
    }

    /// Mark a target as handled; returns `false` if it already was.
    pub fn mark_seen(&mut self, candidate: &RedemptionCandidate) -> bool {
        self.seen
            .insert((candidate.code.clone(), candidate.game, candidate.platform))
    }

    pub fn has_seen(&self, candidate: &RedemptionCandidate) -> bool {
        self.seen
            .contains(&(candidate.code.clone(), candidate.game, candidate.platform))
    }

    /// Attempt candidates in order, stopping at the first try-again-later.
    pub async fn execute(
        &mut self,
        attempts: Vec<&mut RedemptionCandidate>,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        for candidate in attempts {
            let Some(result) = self.attempt(candidate).await? else {
                continue;
            };
            let halt = result.status == RedeemStatus::TryLater;
            outcome.results.push(result);
            if halt {
                warn!("Remote platform asked to try again later; ending batch");
                outcome.halted = true;
                break;
            }
        }

        Ok(outcome)
    }

    /// Attempt one candidate; `None` if this target was already handled this run.
    #[instrument(skip(self, candidate), fields(target = %candidate.label()))]
    pub async fn attempt(
        &mut self,
        candidate: &mut RedemptionCandidate,
    ) -> Result<Option<AttemptResult>> {
        if !self.mark_seen(candidate) {
            debug!("Already handled in this run");
            return Ok(None);
        }

        self.throttle.pause_if_needed().await;

        let mut response = self.call(candidate).await?;
        let mut retried = false;
        if response.status == RedeemStatus::RateLimited {
            info!("Rate limited; sleeping {:?} before retrying", self.cooldown);
            tokio::time::sleep(self.cooldown).await;
            retried = true;
            response = self.call(candidate).await?;
        }

        // The throttle sees what the platform last answered, before the
        // second rate limit is reported as try-again-later.
        self.throttle.record(response.status);
        if retried && response.status == RedeemStatus::RateLimited {
            info!("Rate limited twice; treating as try-again-later");
            response = RedeemResponse::new(RedeemStatus::TryLater);
        }

        let status = response.status;

        let detail = response
            .message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| status.default_detail(&candidate.reward, candidate.platform));

        self.persist(candidate, status, &detail).await?;

        if status.is_positive() {
            info!("{}: {}", status, detail);
        } else {
            warn!(
                "Failed on {}:{} with {}: {}",
                candidate.platform, candidate.game, status, detail
            );
        }

        Ok(Some(AttemptResult {
            code: candidate.code.clone(),
            game: candidate.game,
            platform: candidate.platform,
            reward: candidate.reward.clone(),
            status,
            detail,
            retried,
        }))
    }

    /// Persist a pending expiry preclassification as a failure outcome.
    pub async fn record_preclassified(&self, candidate: &mut RedemptionCandidate) -> Result<bool> {
        if candidate.skip_reason != Some(SkipReason::Expired) || !candidate.record_preclassification {
            return Ok(false);
        }

        let label = candidate.preclassified_status.unwrap_or(FailureLabel::Expired);
        let detail = format!("Preclassified expiry from source metadata ({})", candidate.reward);
        let key_id = self.key_id_for(candidate).await?;
        self.store
            .record_failure(key_id, candidate.platform, label, &detail)
            .await?;

        candidate.record_preclassification = false;
        candidate.previously_failed = Some(label.as_str().to_string());
        candidate.failure_detail = Some(detail);
        Ok(true)
    }

    async fn call(&self, candidate: &RedemptionCandidate) -> Result<RedeemResponse> {
        match self
            .client
            .redeem(&candidate.code, candidate.game, candidate.platform)
            .await
        {
            Ok(response) => Ok(response),
            Err(err) if matches!(err.downcast_ref::<RedeemError>(), Some(RedeemError::Cancelled)) => {
                Err(err)
            }
            Err(err) => {
                warn!("Redeem call failed: {:#}", err);
                Ok(RedeemResponse::with_message(
                    RedeemStatus::Unknown,
                    format!("Unknown error: {}", err),
                ))
            }
        }
    }

    async fn key_id_for(&self, candidate: &mut RedemptionCandidate) -> Result<i64> {
        if let Some(id) = candidate.key_id {
            return Ok(id);
        }
        let id = self.store.ensure_key(&identity_for(candidate)).await?;
        candidate.key_id = Some(id);
        Ok(id)
    }

    async fn persist(
        &self,
        candidate: &mut RedemptionCandidate,
        status: RedeemStatus,
        detail: &str,
    ) -> Result<()> {
        let key_id = self.key_id_for(candidate).await?;

        match status.failure_label() {
            None => {
                self.store
                    .record_success(key_id, candidate.platform, status.label(), detail)
                    .await?;
                candidate.previously_redeemed = true;
                candidate.previously_redeemed_status = Some(status.label().to_string());
                candidate.previously_failed = None;
                candidate.failure_detail = None;
            }
            Some(label) => {
                self.store
                    .record_failure(key_id, candidate.platform, label, detail)
                    .await?;
                candidate.previously_failed = Some(label.as_str().to_string());
                candidate.failure_detail = Some(detail.to_string());
            }
        }

        Ok(())
    }
}

/// Offline client drawing outcomes at random.
///
/// 55% success, 15% already redeemed, 15% invalid, 10% expired, 5% rate limited.
#[derive(Debug, Default, Clone)]
pub struct SimulatedRedeemClient;

#[async_trait]
impl RedeemClient for SimulatedRedeemClient {
    async fn redeem(
        &self,
        code: &NormalizedCode,
        game: Game,
        platform: Platform,
    ) -> Result<RedeemResponse> {
        let roll: f64 = rand::thread_rng().gen_range(0.0..1.0);

        let status = if roll < 0.55 {
            RedeemStatus::Success
        } else if roll < 0.70 {
            RedeemStatus::AlreadyRedeemed
        } else if roll < 0.85 {
            RedeemStatus::Invalid
        } else if roll < 0.95 {
            RedeemStatus::Expired
        } else {
            RedeemStatus::RateLimited
        };

        debug!("Simulated {} on {}:{} -> {}", code, platform, game, status);
        Ok(RedeemResponse::new(status))
    }
}
