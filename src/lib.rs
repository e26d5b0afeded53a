//! shift-redeemer - planning and execution engine for promotional code redemption
//!
//! Reconciles code metadata from a local SQLite store and a remote codes feed,
//! decides which (game, platform) targets still need a live attempt, and drives
//! a throttled, retry-aware redemption loop that records every outcome.

pub mod config;
pub mod error;
pub mod types;
pub mod redeem;

// Re-export main types for convenience
pub use config::{RedeemConfig, RedeemConfigBuilder};
pub use error::RedeemError;
pub use types::{Game, NormalizedCode, Platform, PlatformScope};
