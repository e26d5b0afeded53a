//! Redemption engine: planning (resolver, classifier, plan) and execution
//! (throttled loop, session orchestration) over a persistent key store and
//! a remote codes feed.

pub mod types;
pub mod normalize;
pub mod storage;
pub mod feed;
pub mod resolver;
pub mod classifier;
pub mod plan;
pub mod executor;
pub mod session;

// Re-export main types
pub use types::{
    AttemptResult, FailureLabel, NewKey, Origin, OutcomeKind, OutcomeRecord, PriorOutcomes,
    RedeemResponse, RedeemStatus, RedemptionCandidate, RewardCategory, SkipReason, SourceRecord,
    StoredKey, UNKNOWN_REWARD,
};

// Re-export key components
pub use classifier::{classify, Partition};
pub use executor::{BatchOutcome, BatchThrottle, ExecutionLoop, RedeemClient, SimulatedRedeemClient};
pub use feed::{parse_feed_document, CachedFeed, CodeFeed, HttpCodeFeed, StaticFeed};
pub use normalize::{normalize_requested_platforms, parse_expired_flag, parse_expiry};
pub use plan::{Disposition, RedemptionPlan, RedemptionPlanner};
pub use resolver::{merge_candidate, CandidateResolver, Resolution};
pub use session::{CodeReport, RedeemMapping, RedemptionSession, RewardFilter, RunSummary, SkippedTarget};
pub use storage::{KeyStorage, SqliteKeyStore};
