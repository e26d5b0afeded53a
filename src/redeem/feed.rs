//! Remote codes feed.
//!
//! The feed is read at most once per process: [`CachedFeed`] keeps the parsed
//! records for the lifetime of the run so every planned code sees the same
//! snapshot.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use moka::future::Cache;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::{strategy::ExponentialBackoff, Retry};
use tracing::{debug, info, instrument, warn};

use crate::config::RedeemConfig;
use crate::redeem::normalize::{parse_expired_flag, parse_expiry};
use crate::redeem::types::{Origin, SourceRecord};
use crate::types::PlatformScope;

/// A source of feed-origin [`SourceRecord`]s.
#[async_trait]
pub trait CodeFeed: Send + Sync {
    /// Short name used when reporting the feed as unavailable.
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<Vec<SourceRecord>>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedDocument {
    Blocks(Vec<FeedBlock>),
    Single(FeedBlock),
}

#[derive(Debug, Default, Deserialize)]
struct FeedBlock {
    #[serde(default)]
    codes: Vec<FeedEntry>,
}

#[derive(Debug, Deserialize)]
struct FeedEntry {
    code: String,
    #[serde(default)]
    game: String,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    reward: Option<String>,
    #[serde(default)]
    expires: Option<String>,
    #[serde(default)]
    expired: Value,
    #[serde(default)]
    source: Option<String>,
}

impl FeedEntry {
    fn into_record(self, default_source: &str) -> SourceRecord {
        SourceRecord {
            code: self.code,
            reward: self.reward,
            game: self.game,
            platform: PlatformScope::from_token(self.platform.as_deref()),
            expires_at: self.expires.as_deref().and_then(parse_expiry),
            expired: parse_expired_flag(&self.expired),
            origin: Origin::RemoteFeed,
            source: Some(self.source.unwrap_or_else(|| default_source.to_string())),
        }
    }
}

/// Parse a feed document into source records.
///
/// Accepts either a list of `{"codes": [...]}` blocks or a single block.
pub fn parse_feed_document(text: &str, source_label: &str) -> Result<Vec<SourceRecord>> {
    let document: FeedDocument =
        serde_json::from_str(text).context("Failed to parse codes feed document")?;

    let blocks = match document {
        FeedDocument::Blocks(blocks) => blocks,
        FeedDocument::Single(block) => vec![block],
    };

    Ok(blocks
        .into_iter()
        .flat_map(|block| block.codes)
        .map(|entry| entry.into_record(source_label))
        .collect())
}

/// Feed read from a URL or a local JSON file.
pub struct HttpCodeFeed {
    location: String,
    http_client: Client,
    retry_attempts: usize,
}

impl HttpCodeFeed {
    pub fn new(location: impl Into<String>, timeout: Duration, retry_attempts: usize) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build feed HTTP client")?;

        Ok(Self {
            location: location.into(),
            http_client,
            retry_attempts,
        })
    }

    /// Feed configured by `feed_source`, if any.
    pub fn from_config(config: &RedeemConfig) -> Result<Option<Self>> {
        config
            .feed_source
            .as_deref()
            .map(|location| {
                Self::new(location, config.feed_timeout(), config.feed_retry_attempts)
            })
            .transpose()
    }

    fn is_remote(&self) -> bool {
        self.location.starts_with("http://") || self.location.starts_with("https://")
    }

    async fn download(&self) -> Result<String> {
        let response = self
            .http_client
            .get(&self.location)
            .send()
            .await
            .with_context(|| format!("Failed to request {}", self.location))?
            .error_for_status()
            .context("Codes feed returned an error status")?;

        response.text().await.context("Failed to read codes feed body")
    }
}

#[async_trait]
impl CodeFeed for HttpCodeFeed {
    fn name(&self) -> &str {
        "remote-feed"
    }

    #[instrument(skip(self), fields(location = %self.location))]
    async fn fetch(&self) -> Result<Vec<SourceRecord>> {
        let text = if self.is_remote() {
            let retry_strategy = ExponentialBackoff::from_millis(100)
                .max_delay(Duration::from_secs(5))
                .take(self.retry_attempts);

            Retry::spawn(retry_strategy, || self.download()).await?
        } else {
            tokio::fs::read_to_string(&self.location)
                .await
                .with_context(|| format!("Failed to read codes feed file {}", self.location))?
        };

        let records = parse_feed_document(&text, "shift_source")?;
        info!("Loaded {} entries from codes feed", records.len());
        Ok(records)
    }
}

/// Feed with a fixed set of records.
#[derive(Debug, Clone, Default)]
pub struct StaticFeed {
    records: Vec<SourceRecord>,
}

impl StaticFeed {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self { records }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CodeFeed for StaticFeed {
    fn name(&self) -> &str {
        "static-feed"
    }

    async fn fetch(&self) -> Result<Vec<SourceRecord>> {
        Ok(self.records.clone())
    }
}

type FeedSnapshot = std::result::Result<Arc<Vec<SourceRecord>>, Arc<anyhow::Error>>;

/// Process-lifetime cache in front of another feed.
///
/// Concurrent callers share one in-flight fetch. The outcome is kept either
/// way: once the feed has failed, every later caller sees the same failure
/// without touching the network until [`CachedFeed::invalidate`].
pub struct CachedFeed {
    inner: Arc<dyn CodeFeed>,
    cache: Cache<(), FeedSnapshot>,
}

impl CachedFeed {
    pub fn new(inner: Arc<dyn CodeFeed>) -> Self {
        let cache = Cache::builder().max_capacity(1).build();
        Self { inner, cache }
    }

    pub async fn invalidate(&self) {
        self.cache.invalidate(&()).await;
    }
}

#[async_trait]
impl CodeFeed for CachedFeed {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch(&self) -> Result<Vec<SourceRecord>> {
        let snapshot = self
            .cache
            .get_with((), async {
                debug!("Fetching codes feed '{}'", self.inner.name());
                let fetched = self.inner.fetch().await;
                if let Err(err) = &fetched {
                    warn!(
                        "Codes feed '{}' failed; keeping the failure for this run: {:#}",
                        self.inner.name(),
                        err
                    );
                }
                fetched.map(Arc::new).map_err(Arc::new)
            })
            .await;

        match snapshot {
            Ok(records) => Ok(records.as_ref().clone()),
            Err(err) => Err(anyhow!("{:#}", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Platform;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFeed {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl CodeFeed for CountingFeed {
        fn name(&self) -> &str {
            "counting"
        }

        async fn fetch(&self) -> Result<Vec<SourceRecord>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(anyhow!("feed offline"));
            }
            parse_feed_document(
                r#"{"codes": [{"code": "ABCDE-FGHIJ-KLMNO-PQRST-UVWXY", "game": "bl3"}]}"#,
                "test",
            )
        }
    }

    #[test]
    fn test_parse_block_list() {
        let text = r#"[
            {"codes": [
                {"code": "ABCDE-FGHIJ-KLMNO-PQRST-UVWXY", "game": "Borderlands 3",
                 "platform": "Universal", "reward": "Golden Key",
                 "expires": "2024-01-01T00:00:00Z", "expired": "yes"},
                {"code": "BBBBB-FGHIJ-KLMNO-PQRST-UVWXY", "game": "bl2", "platform": "steam"}
            ]},
            {"codes": []}
        ]"#;

        let records = parse_feed_document(text, "shift_source").unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.platform, PlatformScope::Universal);
        assert_eq!(first.reward.as_deref(), Some("Golden Key"));
        assert!(first.expires_at.is_some());
        assert!(first.expired);
        assert_eq!(first.origin, Origin::RemoteFeed);
        assert_eq!(first.source.as_deref(), Some("shift_source"));

        assert_eq!(records[1].platform, PlatformScope::Specific(Platform::Steam));
        assert!(!records[1].expired);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_feed_document("<html>", "x").is_err());
    }

    #[tokio::test]
    async fn test_cached_feed_fetches_once() {
        let inner = Arc::new(CountingFeed {
            calls: AtomicUsize::new(0),
            fail_first: false,
        });
        let feed = CachedFeed::new(inner.clone());

        assert_eq!(feed.fetch().await.unwrap().len(), 1);
        assert_eq!(feed.fetch().await.unwrap().len(), 1);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_feed_keeps_failure_until_invalidated() {
        let inner = Arc::new(CountingFeed {
            calls: AtomicUsize::new(0),
            fail_first: true,
        });
        let feed = CachedFeed::new(inner.clone());

        let first = feed.fetch().await.unwrap_err();
        assert!(first.to_string().contains("feed offline"));
        assert!(feed.fetch().await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        feed.invalidate().await;
        assert_eq!(feed.fetch().await.unwrap().len(), 1);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
