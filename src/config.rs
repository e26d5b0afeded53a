//! Runtime configuration for a redemption run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable selecting a named profile (separate database).
pub const PROFILE_ENV: &str = "AUTOSHIFT_PROFILE";
/// Environment variable overriding the codes feed location.
pub const SHIFT_SOURCE_ENV: &str = "SHIFT_SOURCE";

const DEFAULT_DATA_DIR: &str = "data";
const DB_FILE_NAME: &str = "keys.db";

/// Configuration shared by the planner, the feed and the execution loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemConfig {
    /// Explicit database path; derived from the profile when unset
    pub database_path: Option<PathBuf>,
    /// Named profile, stored under `data/<profile>/`
    pub profile: Option<String>,
    /// Codes feed location (URL or local JSON file)
    pub feed_source: Option<String>,
    /// Feed HTTP timeout in seconds
    pub feed_timeout_seconds: u64,
    /// Feed fetch attempts before giving up
    pub feed_retry_attempts: usize,
    /// Cooldown applied on rate limits and by the proactive throttle
    pub cooldown_seconds: u64,
    /// Proactive pause after this many attempts
    pub throttle_every: u32,
    /// Re-attempt recorded failures and expired codes
    pub bypass_failures: bool,
    /// Live attempts per (game, platform) target in bulk runs
    pub default_limit: usize,
}

impl Default for RedeemConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            profile: None,
            feed_source: None,
            feed_timeout_seconds: 10,
            feed_retry_attempts: 3,
            cooldown_seconds: 60,
            throttle_every: 15,
            bypass_failures: false,
            default_limit: 200,
        }
    }
}

impl RedeemConfig {
    /// Defaults overlaid with `AUTOSHIFT_PROFILE` and `SHIFT_SOURCE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(profile) = non_empty_env(PROFILE_ENV) {
            config.profile = Some(profile);
        }
        if let Some(source) = non_empty_env(SHIFT_SOURCE_ENV) {
            config.feed_source = Some(source);
        }
        config
    }

    /// Database location: the explicit path, else `data[/<profile>]/keys.db`.
    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.database_path {
            return path.clone();
        }
        let mut dir = PathBuf::from(DEFAULT_DATA_DIR);
        if let Some(profile) = &self.profile {
            dir.push(profile);
        }
        dir.join(DB_FILE_NAME)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_timeout_seconds)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Builder for [`RedeemConfig`] with the defaults above.
pub struct RedeemConfigBuilder {
    config: RedeemConfig,
}

impl RedeemConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RedeemConfig::default(),
        }
    }

    /// Start from an existing configuration (e.g. [`RedeemConfig::from_env`]).
    pub fn from_config(config: RedeemConfig) -> Self {
        Self { config }
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.database_path = Some(path.into());
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.config.profile = Some(profile.into());
        self
    }

    pub fn with_feed_source(mut self, source: impl Into<String>) -> Self {
        self.config.feed_source = Some(source.into());
        self
    }

    pub fn with_feed_retry(mut self, attempts: usize, timeout_seconds: u64) -> Self {
        self.config.feed_retry_attempts = attempts;
        self.config.feed_timeout_seconds = timeout_seconds;
        self
    }

    /// Set the cooldown and the proactive throttle interval.
    pub fn with_throttle(mut self, cooldown_seconds: u64, every: u32) -> Self {
        self.config.cooldown_seconds = cooldown_seconds;
        self.config.throttle_every = every;
        self
    }

    pub fn with_bypass_failures(mut self, bypass: bool) -> Self {
        self.config.bypass_failures = bypass;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.config.default_limit = limit;
        self
    }

    pub fn build(self) -> RedeemConfig {
        self.config
    }
}

impl Default for RedeemConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RedeemConfigBuilder::new().build();

        assert_eq!(config.cooldown_seconds, 60);
        assert_eq!(config.throttle_every, 15);
        assert_eq!(config.feed_retry_attempts, 3);
        assert_eq!(config.default_limit, 200);
        assert!(!config.bypass_failures);
        assert_eq!(config.database_path(), PathBuf::from("data/keys.db"));
    }

    #[test]
    fn test_profile_database_path() {
        let config = RedeemConfigBuilder::new().with_profile("alt").build();
        assert_eq!(config.database_path(), PathBuf::from("data/alt/keys.db"));

        let config = RedeemConfigBuilder::new()
            .with_profile("alt")
            .with_database_path("/tmp/other.db")
            .build();
        assert_eq!(config.database_path(), PathBuf::from("/tmp/other.db"));
    }

    #[test]
    fn test_builder_overrides() {
        let config = RedeemConfigBuilder::new()
            .with_throttle(0, 3)
            .with_bypass_failures(true)
            .with_limit(5)
            .build();

        assert_eq!(config.cooldown(), Duration::ZERO);
        assert_eq!(config.throttle_every, 3);
        assert!(config.bypass_failures);
        assert_eq!(config.default_limit, 5);
    }
}
