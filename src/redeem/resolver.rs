//! Candidate resolution: merge store rows, feed entries and synthetic
//! placeholders into one candidate per (game, platform).

use anyhow::Result;
use nonempty::NonEmpty;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::error::RedeemError;
use crate::redeem::feed::CodeFeed;
use crate::redeem::storage::KeyStorage;
use crate::redeem::types::{is_known_reward, NewKey, Origin, RedemptionCandidate, SourceRecord};
use crate::types::{Game, NormalizedCode, Platform, PlatformScope};

/// Output of [`CandidateResolver::resolve`].
#[derive(Debug, Clone)]
pub struct Resolution {
    pub code: NormalizedCode,
    /// Games probed, in canonical order
    pub games: Vec<Game>,
    /// One candidate per (game, platform), ordered by game then platform rank
    pub candidates: Vec<RedemptionCandidate>,
    /// The store had at least one row for this code
    pub store_had_code: bool,
    /// Sources that could not be read; planning continued without them
    pub degraded_sources: Vec<RedeemError>,
}

/// Resolves a code against the store and the feed.
pub struct CandidateResolver {
    store: Arc<dyn KeyStorage>,
    feed: Arc<dyn CodeFeed>,
}

impl CandidateResolver {
    pub fn new(store: Arc<dyn KeyStorage>, feed: Arc<dyn CodeFeed>) -> Self {
        Self { store, feed }
    }

    #[instrument(skip(self, raw_code, requested), fields(code = %raw_code))]
    pub async fn resolve(
        &self,
        raw_code: &str,
        requested: &NonEmpty<Platform>,
    ) -> Result<Resolution> {
        let code = NormalizedCode::parse(raw_code)?;
        let mut degraded_sources = Vec::new();

        let persisted: Vec<SourceRecord> = match self.store.fetch_keys_for_code(&code).await {
            Ok(rows) => rows.iter().map(|row| row.to_source_record()).collect(),
            Err(err) => {
                warn!("Store unavailable while resolving {}: {:#}", code, err);
                degraded_sources.push(RedeemError::source_unavailable("store", &err));
                Vec::new()
            }
        };

        let from_feed: Vec<SourceRecord> = match self.feed.fetch().await {
            Ok(records) => records
                .into_iter()
                .filter(|record| {
                    NormalizedCode::parse(&record.code).is_ok_and(|parsed| parsed == code)
                })
                .collect(),
            Err(err) => {
                warn!("Codes feed unavailable, continuing without it: {:#}", err);
                degraded_sources.push(RedeemError::source_unavailable(self.feed.name(), &err));
                Vec::new()
            }
        };

        let store_had_code = !persisted.is_empty();
        let matched = matched_games(persisted.iter().chain(&from_feed));
        let games = if matched.is_empty() {
            Game::ALL.to_vec()
        } else {
            matched.into_iter().collect()
        };

        let mut merged: HashMap<(Game, Platform), RedemptionCandidate> = HashMap::new();
        for record in persisted.iter().chain(&from_feed) {
            for candidate in expand_record(&code, record, requested) {
                let pair = candidate.pair();
                let existing = merged.remove(&pair);
                merged.insert(pair, merge_candidate(existing, candidate));
            }
        }

        if merged.is_empty() {
            debug!("No source knows {}; synthesizing placeholders", code);
            for &game in &games {
                for &platform in requested.iter() {
                    let mut candidate =
                        RedemptionCandidate::new(code.clone(), game, platform, None, Origin::Synthetic);
                    candidate.source = Some(Origin::Synthetic.as_str().to_string());
                    merged.insert((game, platform), candidate);
                }
            }
        }

        let mut candidates: Vec<RedemptionCandidate> = merged.into_values().collect();
        candidates.sort_by_key(|c| (c.game.rank(), c.platform.rank()));

        for candidate in candidates.iter_mut() {
            match self.store.ensure_key(&identity_for(candidate)).await {
                Ok(id) => candidate.key_id = Some(id),
                Err(err) => warn!(
                    "Could not ensure identity row for {}: {:#}",
                    candidate.label(),
                    err
                ),
            }
        }

        Ok(Resolution {
            code,
            games,
            candidates,
            store_had_code,
            degraded_sources,
        })
    }
}

/// Identity row for a candidate; always platform-specific.
pub fn identity_for(candidate: &RedemptionCandidate) -> NewKey {
    NewKey {
        code: candidate.code.clone(),
        game: candidate.game,
        platform: PlatformScope::Specific(candidate.platform),
        reward: candidate.reward.clone(),
        source: candidate.source.clone(),
        expires_at: candidate.expires_at,
        expired: candidate.expired_flag,
    }
}

/// Known games mentioned by any record, in canonical order.
fn matched_games<'a>(records: impl Iterator<Item = &'a SourceRecord>) -> BTreeSet<Game> {
    records
        .filter_map(|record| Game::from_token(&record.game))
        .collect()
}

/// Candidates a single record contributes, restricted to requested platforms.
fn expand_record(
    code: &NormalizedCode,
    record: &SourceRecord,
    requested: &NonEmpty<Platform>,
) -> Vec<RedemptionCandidate> {
    let Some(game) = Game::from_token(&record.game) else {
        debug!("Skipping {} record with unknown game '{}'", record.origin, record.game);
        return Vec::new();
    };

    let platforms: Vec<Platform> = match record.platform {
        PlatformScope::Universal => requested.iter().copied().collect(),
        PlatformScope::Specific(platform) if requested.contains(&platform) => vec![platform],
        PlatformScope::Specific(_) => Vec::new(),
    };

    platforms
        .into_iter()
        .map(|platform| {
            let mut candidate = RedemptionCandidate::new(
                code.clone(),
                game,
                platform,
                record.reward.as_deref(),
                record.origin,
            );
            candidate.source = Some(
                record
                    .source
                    .clone()
                    .unwrap_or_else(|| record.origin.as_str().to_string()),
            );
            candidate.expires_at = record.expires_at;
            candidate.expired_flag = record.expired;
            candidate
        })
        .collect()
}

/// Merge reducer for two candidates targeting the same (game, platform).
///
/// The higher-priority origin wins outright. On equal priority the existing
/// candidate is kept and only its gaps are filled: an unknown reward, missing
/// expiry (together with its flag), a missing preclassification or source.
pub fn merge_candidate(
    existing: Option<RedemptionCandidate>,
    incoming: RedemptionCandidate,
) -> RedemptionCandidate {
    let Some(mut current) = existing else {
        return incoming;
    };

    match incoming.origin.priority().cmp(&current.origin.priority()) {
        std::cmp::Ordering::Less => incoming,
        std::cmp::Ordering::Greater => current,
        std::cmp::Ordering::Equal => {
            if !current.has_known_reward() && is_known_reward(&incoming.reward) {
                current.reward = incoming.reward;
            }
            if current.expires_at.is_none() && incoming.expires_at.is_some() {
                current.expires_at = incoming.expires_at;
                current.expired_flag = incoming.expired_flag;
            }
            if current.preclassified_status.is_none() {
                current.preclassified_status = incoming.preclassified_status;
            }
            let placeholder_source = current.source.is_none()
                || current.source.as_deref() == Some(Origin::Synthetic.as_str());
            if placeholder_source && incoming.source.is_some() {
                current.source = incoming.source;
            }
            current
        }
    }
}
