//! Bulk runs over stored codes for game:platform targets

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shift_redeemer::redeem::{
    CodeFeed, KeyStorage, NewKey, Origin, RedeemClient, RedeemMapping, RedeemResponse, RedeemStatus,
    RedemptionSession, RewardFilter, SourceRecord, SqliteKeyStore, StaticFeed,
};
use shift_redeemer::{Game, NormalizedCode, Platform, PlatformScope, RedeemConfigBuilder};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const GOLDEN: &str = "GGGGG-GGGGG-GGGGG-GGGGG-GGGGG";
const DIAMOND: &str = "NNNNN-NNNNN-NNNNN-NNNNN-NNNNN";
const SKIN: &str = "CCCCC-CCCCC-CCCCC-CCCCC-CCCCC";

struct RecordingClient {
    script: Mutex<VecDeque<RedeemStatus>>,
    calls: Mutex<Vec<(String, Platform)>>,
}

impl RecordingClient {
    fn new(script: Vec<RedeemStatus>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn codes(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }
}

#[async_trait]
impl RedeemClient for RecordingClient {
    async fn redeem(
        &self,
        code: &NormalizedCode,
        _game: Game,
        platform: Platform,
    ) -> Result<RedeemResponse> {
        self.calls.lock().unwrap().push((code.to_string(), platform));
        let status = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RedeemStatus::Success);
        Ok(RedeemResponse::new(status))
    }
}

/// Feed that is always down and counts how often it was asked.
#[derive(Default)]
struct OfflineFeed {
    fetches: AtomicUsize,
}

#[async_trait]
impl CodeFeed for OfflineFeed {
    fn name(&self) -> &str {
        "remote-feed"
    }

    async fn fetch(&self) -> Result<Vec<SourceRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("connection timed out"))
    }
}

async fn seeded_store() -> Result<Arc<SqliteKeyStore>> {
    let store = SqliteKeyStore::in_memory().await?;
    for (code, reward) in [(SKIN, "Weapon Skin"), (DIAMOND, "Diamond Key"), (GOLDEN, "3 Golden Keys")] {
        store
            .ensure_key(&NewKey {
                code: NormalizedCode::parse(code)?,
                game: Game::Bl3,
                platform: PlatformScope::Universal,
                reward: reward.to_string(),
                source: Some("database".to_string()),
                expires_at: None,
                expired: false,
            })
            .await?;
    }
    Ok(store)
}

fn session(store: &Arc<SqliteKeyStore>, feed: StaticFeed, client: &Arc<RecordingClient>) -> RedemptionSession {
    let config = RedeemConfigBuilder::new().with_throttle(0, 2).build();
    RedemptionSession::new(&config, store.clone(), Arc::new(feed), client.clone())
}

#[tokio::test]
async fn test_golden_keys_first_and_limit_per_target() -> Result<()> {
    let store = seeded_store().await?;
    let client = RecordingClient::new(Vec::new());
    let mut session = session(&store, StaticFeed::empty(), &client);

    let mapping = RedeemMapping::parse(&["bl3:steam"])?;
    let summary = session.redeem_mapping(&mapping, RewardFilter::all(), 2).await?;

    assert_eq!(client.codes(), vec![GOLDEN.to_string(), DIAMOND.to_string()]);
    assert_eq!(summary.succeeded, 2);
    assert!(summary.is_successful());
    assert!(!summary.halted);
    Ok(())
}

#[tokio::test]
async fn test_skips_do_not_consume_limit() -> Result<()> {
    let store = seeded_store().await?;
    let golden_steam = store
        .ensure_key(&NewKey {
            code: NormalizedCode::parse(GOLDEN)?,
            game: Game::Bl3,
            platform: PlatformScope::Specific(Platform::Steam),
            reward: "3 Golden Keys".to_string(),
            source: None,
            expires_at: None,
            expired: false,
        })
        .await?;
    store
        .record_success(golden_steam, Platform::Steam, "SUCCESS", "Redeemed 3 Golden Keys")
        .await?;

    let client = RecordingClient::new(Vec::new());
    let mut session = session(&store, StaticFeed::empty(), &client);

    let mapping = RedeemMapping::parse(&["bl3:steam"])?;
    let summary = session.redeem_mapping(&mapping, RewardFilter::all(), 1).await?;

    assert_eq!(summary.skipped_redeemed, 1);
    assert_eq!(client.codes(), vec![DIAMOND.to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_reward_filter_selects_categories() -> Result<()> {
    let store = seeded_store().await?;
    let client = RecordingClient::new(Vec::new());
    let mut session = session(&store, StaticFeed::empty(), &client);

    let mapping = RedeemMapping::parse(&["bl3:epic"])?;
    let filter = RewardFilter {
        other: true,
        ..RewardFilter::default()
    };
    session.redeem_mapping(&mapping, filter, 10).await?;

    assert_eq!(client.codes(), vec![SKIN.to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_try_later_ends_whole_run() -> Result<()> {
    let store = seeded_store().await?;
    let client = RecordingClient::new(vec![RedeemStatus::TryLater]);
    let mut session = session(&store, StaticFeed::empty(), &client);

    let mapping = RedeemMapping::parse(&["bl3:steam,epic"])?;
    let summary = session.redeem_mapping(&mapping, RewardFilter::all(), 10).await?;

    assert!(summary.halted);
    assert_eq!(summary.failed, 1);
    assert!(!summary.is_successful());
    assert_eq!(client.codes().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_feed_codes_are_synced_before_run() -> Result<()> {
    let store = SqliteKeyStore::in_memory().await?;
    let feed = StaticFeed::new(vec![
        SourceRecord {
            code: "fffff fffff fffff fffff fffff".to_string(),
            reward: Some("Golden Key".to_string()),
            game: "Borderlands 2".to_string(),
            platform: PlatformScope::Specific(Platform::Steam),
            expires_at: None,
            expired: false,
            origin: Origin::RemoteFeed,
            source: Some("shift_source".to_string()),
        },
        SourceRecord {
            code: "not a code".to_string(),
            reward: None,
            game: "bl2".to_string(),
            platform: PlatformScope::Universal,
            expires_at: None,
            expired: false,
            origin: Origin::RemoteFeed,
            source: None,
        },
    ]);
    let client = RecordingClient::new(Vec::new());
    let mut session = session(&store, feed, &client);

    let mapping = RedeemMapping::parse(&["bl2:steam,psn"])?;
    let summary = session.redeem_mapping(&mapping, RewardFilter::all(), 10).await?;

    assert_eq!(client.codes(), vec!["FFFFF-FFFFF-FFFFF-FFFFF-FFFFF".to_string()]);
    assert_eq!(summary.succeeded, 1);

    let stored = store.list_keys_for_target(Game::Bl2, Platform::Steam).await?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].source.as_deref(), Some("shift_source"));
    Ok(())
}

#[tokio::test]
async fn test_offline_feed_is_fetched_once_per_run() -> Result<()> {
    let store = seeded_store().await?;
    let feed = Arc::new(OfflineFeed::default());
    let client = RecordingClient::new(Vec::new());
    let config = RedeemConfigBuilder::new().with_throttle(0, 15).build();
    let mut session = RedemptionSession::new(&config, store.clone(), feed.clone(), client.clone());

    let mapping = RedeemMapping::parse(&["bl3:steam,epic"])?;
    let summary = session.redeem_mapping(&mapping, RewardFilter::all(), 10).await?;

    assert_eq!(summary.succeeded, 6);
    assert_eq!(client.codes().len(), 6);
    assert_eq!(feed.fetches.load(Ordering::SeqCst), 1);
    Ok(())
}
