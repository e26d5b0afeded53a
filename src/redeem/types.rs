//! Types for redemption planning and execution.

use crate::types::{Game, NormalizedCode, Platform, PlatformScope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Reward label used when no source knows what a code grants.
pub const UNKNOWN_REWARD: &str = "Unknown";

/// Where a source record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Row already in the local store
    Persisted,
    /// Entry from the remote codes feed
    RemoteFeed,
    /// Placeholder synthesized when no source knows the code
    Synthetic,
}

impl Origin {
    /// Merge priority; lower wins.
    pub fn priority(&self) -> u8 {
        match self {
            Origin::Persisted => 0,
            Origin::RemoteFeed => 1,
            Origin::Synthetic => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Persisted => "persisted",
            Origin::RemoteFeed => "remote-feed",
            Origin::Synthetic => "synthetic",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw observation of a code from the store or the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Code as observed (not necessarily normalized)
    pub code: String,
    /// Reward label, if the source knows it
    pub reward: Option<String>,
    /// Game token as observed (short id or display name)
    pub game: String,
    pub platform: PlatformScope,
    pub expires_at: Option<DateTime<Utc>>,
    /// Explicit "expired" marker from the source
    pub expired: bool,
    pub origin: Origin,
    /// Provenance label persisted with identity rows
    pub source: Option<String>,
}

/// Identity row in the store, one per (code, game, platform scope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredKey {
    pub id: i64,
    pub code: String,
    pub reward: String,
    pub game: String,
    pub platform: PlatformScope,
    pub source: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired: bool,
}

impl StoredKey {
    pub fn to_source_record(&self) -> SourceRecord {
        SourceRecord {
            code: self.code.clone(),
            reward: Some(self.reward.clone()),
            game: self.game.clone(),
            platform: self.platform,
            expires_at: self.expires_at,
            expired: self.expired,
            origin: Origin::Persisted,
            source: self.source.clone(),
        }
    }
}

/// Input to the store's create-if-absent operation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewKey {
    pub code: NormalizedCode,
    pub game: Game,
    pub platform: PlatformScope,
    pub reward: String,
    pub source: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired: bool,
}

/// Whether a persisted outcome row records a success or a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Success,
    Failure,
}

/// A persisted outcome for one (code, game, platform).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub key_id: i64,
    pub code: String,
    pub game: Game,
    pub platform: Platform,
    pub kind: OutcomeKind,
    /// `SUCCESS`/`REDEEMED` for successes, a [`FailureLabel`] for failures
    pub status: String,
    pub detail: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Recorded outcomes for one code, keyed by target.
#[derive(Debug, Clone, Default)]
pub struct PriorOutcomes {
    pub successes: HashMap<(Game, Platform), OutcomeRecord>,
    pub failures: HashMap<(Game, Platform), OutcomeRecord>,
}

impl PriorOutcomes {
    pub fn from_records(records: impl IntoIterator<Item = OutcomeRecord>) -> Self {
        let mut outcomes = Self::default();
        for record in records {
            let pair = (record.game, record.platform);
            match record.kind {
                OutcomeKind::Success => outcomes.successes.insert(pair, record),
                OutcomeKind::Failure => outcomes.failures.insert(pair, record),
            };
        }
        outcomes
    }

    pub fn is_empty(&self) -> bool {
        self.successes.is_empty() && self.failures.is_empty()
    }
}

/// Why a candidate was resolved without a network call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipReason {
    Redeemed,
    Failed,
    Expired,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Redeemed => "redeemed",
            SkipReason::Failed => "failed",
            SkipReason::Expired => "expired",
        }
    }
}

/// Status of one remote redemption call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedeemStatus {
    Success,
    AlreadyRedeemed,
    Invalid,
    Expired,
    RateLimited,
    TryLater,
    /// Redirected or failed at the network level
    NetworkError,
    Unknown,
}

impl RedeemStatus {
    /// Success and already-redeemed both count as positive.
    pub fn is_positive(&self) -> bool {
        matches!(self, RedeemStatus::Success | RedeemStatus::AlreadyRedeemed)
    }

    /// Label persisted for this status.
    pub fn label(&self) -> &'static str {
        match self {
            RedeemStatus::Success => "SUCCESS",
            RedeemStatus::AlreadyRedeemed => "REDEEMED",
            other => other.failure_label().map(|l| l.as_str()).unwrap_or("UNKNOWN_ERROR"),
        }
    }

    /// Failure label for negative outcomes; `None` for positive ones.
    pub fn failure_label(&self) -> Option<FailureLabel> {
        match self {
            RedeemStatus::Success | RedeemStatus::AlreadyRedeemed => None,
            RedeemStatus::Expired => Some(FailureLabel::Expired),
            RedeemStatus::Invalid => Some(FailureLabel::Invalid),
            RedeemStatus::RateLimited => Some(FailureLabel::RateLimit),
            RedeemStatus::TryLater => Some(FailureLabel::TryLater),
            RedeemStatus::NetworkError => Some(FailureLabel::NetworkError),
            RedeemStatus::Unknown => Some(FailureLabel::UnknownError),
        }
    }

    /// Human-readable detail used when the remote call gave no message.
    pub fn default_detail(&self, reward: &str, platform: Platform) -> String {
        match self {
            RedeemStatus::Success => format!("Redeemed {}", reward),
            RedeemStatus::AlreadyRedeemed => format!("Already redeemed {}", reward),
            RedeemStatus::Invalid => format!("Cannot redeem on {}", platform),
            RedeemStatus::Expired => "This code expired".to_string(),
            RedeemStatus::RateLimited => "Too many requests".to_string(),
            RedeemStatus::TryLater => "Try again later".to_string(),
            RedeemStatus::NetworkError => "Redirected or network error".to_string(),
            RedeemStatus::Unknown => "Unknown error".to_string(),
        }
    }
}

impl fmt::Display for RedeemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Fixed labels persisted for negative outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureLabel {
    Expired,
    Invalid,
    #[serde(rename = "RATELIMIT")]
    RateLimit,
    #[serde(rename = "TRYLATER")]
    TryLater,
    NetworkError,
    UnknownError,
}

impl FailureLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureLabel::Expired => "EXPIRED",
            FailureLabel::Invalid => "INVALID",
            FailureLabel::RateLimit => "RATELIMIT",
            FailureLabel::TryLater => "TRYLATER",
            FailureLabel::NetworkError => "NETWORK_ERROR",
            FailureLabel::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for FailureLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the remote redemption call returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemResponse {
    pub status: RedeemStatus,
    pub message: Option<String>,
}

impl RedeemResponse {
    pub fn new(status: RedeemStatus) -> Self {
        Self { status, message: None }
    }

    pub fn with_message(status: RedeemStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }
}

/// The unit of planning: one code on one (game, platform).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionCandidate {
    pub code: NormalizedCode,
    pub game: Game,
    pub platform: Platform,
    pub reward: String,
    pub origin: Origin,
    pub source: Option<String>,
    /// Identity row in the store, once ensured
    pub key_id: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired_flag: bool,
    /// Status assigned before any network call (expiry)
    pub preclassified_status: Option<FailureLabel>,
    pub skip_reason: Option<SkipReason>,
    pub previously_redeemed: bool,
    pub previously_redeemed_status: Option<String>,
    pub previously_failed: Option<String>,
    pub failure_detail: Option<String>,
    /// The expiry preclassification still has to be persisted as a failure
    pub record_preclassification: bool,
}

impl RedemptionCandidate {
    pub fn new(
        code: NormalizedCode,
        game: Game,
        platform: Platform,
        reward: Option<&str>,
        origin: Origin,
    ) -> Self {
        Self {
            code,
            game,
            platform,
            reward: clean_reward(reward),
            origin,
            source: None,
            key_id: None,
            expires_at: None,
            expired_flag: false,
            preclassified_status: None,
            skip_reason: None,
            previously_redeemed: false,
            previously_redeemed_status: None,
            previously_failed: None,
            failure_detail: None,
            record_preclassification: false,
        }
    }

    pub fn pair(&self) -> (Game, Platform) {
        (self.game, self.platform)
    }

    pub fn has_known_reward(&self) -> bool {
        is_known_reward(&self.reward)
    }

    /// Expired by explicit flag or by an expiry at or before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expired_flag || self.expires_at.is_some_and(|expiry| expiry <= now)
    }

    /// `code -> platform:game`, the label used in logs.
    pub fn label(&self) -> String {
        format!("{} -> {}:{}", self.code, self.platform, self.game)
    }
}

/// Trimmed reward label, or [`UNKNOWN_REWARD`] when empty.
pub fn clean_reward(reward: Option<&str>) -> String {
    match reward.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => UNKNOWN_REWARD.to_string(),
    }
}

pub fn is_known_reward(reward: &str) -> bool {
    let reward = reward.trim();
    !reward.is_empty() && !reward.eq_ignore_ascii_case(UNKNOWN_REWARD)
}

/// Result of one executed candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptResult {
    pub code: NormalizedCode,
    pub game: Game,
    pub platform: Platform,
    pub reward: String,
    pub status: RedeemStatus,
    pub detail: String,
    /// The call was repeated once after a rate limit
    pub retried: bool,
}

/// Reward buckets used to order and filter bulk runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RewardCategory {
    GoldenKey,
    OtherKey,
    Code,
}

impl RewardCategory {
    pub fn of(reward: &str) -> Self {
        let lowered = reward.to_ascii_lowercase();
        if lowered.contains("golden key") {
            RewardCategory::GoldenKey
        } else if lowered.contains("key") {
            RewardCategory::OtherKey
        } else {
            RewardCategory::Code
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candidate() -> RedemptionCandidate {
        RedemptionCandidate::new(
            NormalizedCode::parse("ABCDE-FGHIJ-KLMNO-PQRST-UVWXY").unwrap(),
            Game::Bl3,
            Platform::Steam,
            None,
            Origin::Synthetic,
        )
    }

    #[test]
    fn test_failure_labels() {
        assert_eq!(RedeemStatus::Expired.failure_label(), Some(FailureLabel::Expired));
        assert_eq!(RedeemStatus::RateLimited.failure_label(), Some(FailureLabel::RateLimit));
        assert_eq!(RedeemStatus::TryLater.label(), "TRYLATER");
        assert_eq!(RedeemStatus::NetworkError.label(), "NETWORK_ERROR");
        assert_eq!(RedeemStatus::Unknown.label(), "UNKNOWN_ERROR");
        assert_eq!(RedeemStatus::Success.failure_label(), None);
        assert_eq!(RedeemStatus::AlreadyRedeemed.label(), "REDEEMED");
    }

    #[test]
    fn test_reward_defaults_to_unknown() {
        let c = candidate();
        assert_eq!(c.reward, UNKNOWN_REWARD);
        assert!(!c.has_known_reward());
        assert_eq!(clean_reward(Some("  3 Golden Keys ")), "3 Golden Keys");
        assert!(!is_known_reward("unknown"));
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let mut c = candidate();
        assert!(!c.is_expired_at(now));

        c.expires_at = Some(now);
        assert!(c.is_expired_at(now));

        c.expires_at = Some(now + Duration::hours(1));
        assert!(!c.is_expired_at(now));

        c.expired_flag = true;
        assert!(c.is_expired_at(now));
    }

    #[test]
    fn test_reward_category() {
        assert_eq!(RewardCategory::of("5 Golden Keys"), RewardCategory::GoldenKey);
        assert_eq!(RewardCategory::of("Diamond Key"), RewardCategory::OtherKey);
        assert_eq!(RewardCategory::of("Unknown"), RewardCategory::Code);
    }
}
