//! End-to-end run against an in-memory store and the simulated client.
//!
//! Seeds a few codes through the feed, plans one of them, then runs two bulk
//! passes; the second pass skips whatever the first one recorded. All
//! sessions share one cached feed, so it is read once for the whole process.

use anyhow::Result;
use chrono::{Duration, Utc};
use shift_redeemer::redeem::{
    CachedFeed, CodeFeed, Origin, RedeemMapping, RedemptionSession, RewardFilter,
    SimulatedRedeemClient, SourceRecord, SqliteKeyStore, StaticFeed,
};
use shift_redeemer::{PlatformScope, RedeemConfigBuilder};
use std::sync::Arc;

fn feed_entry(code: &str, game: &str, reward: &str, expired: bool) -> SourceRecord {
    SourceRecord {
        code: code.to_string(),
        reward: Some(reward.to_string()),
        game: game.to_string(),
        platform: PlatformScope::Universal,
        expires_at: expired.then(|| Utc::now() - Duration::days(3)),
        expired: false,
        origin: Origin::RemoteFeed,
        source: Some("demo".to_string()),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let store = SqliteKeyStore::in_memory().await?;
    let feed: Arc<dyn CodeFeed> = Arc::new(CachedFeed::new(Arc::new(StaticFeed::new(vec![
        feed_entry("K9X3T-H2W5B-JJ3TB-3JBBT-9B3BZ", "bl3", "3 Golden Keys", false),
        feed_entry("W5KBB-XRZ3F-39B9F-3T3TJ-RR6CC", "bl3", "Diamond Key", false),
        feed_entry("CHKBJ-TXJ3T-RWC3B-3BTBJ-HBSXZ", "bl3", "Weapon Skin", false),
        feed_entry("ZZZZZ-TXJ3T-RWC3B-3BTBJ-HBSXZ", "bl3", "Golden Key", true),
    ]))));
    let config = RedeemConfigBuilder::new().with_throttle(0, 15).build();

    let session = RedemptionSession::new(
        &config,
        store.clone(),
        feed.clone(),
        Arc::new(SimulatedRedeemClient),
    );

    println!("Plan for a single code:");
    let plan = session
        .plan("k9x3t h2w5b jj3tb 3jbbt 9b3bz", &["steam", "epic"])
        .await?;
    println!("{}", serde_json::to_string_pretty(&plan.to_json())?);

    let mapping = RedeemMapping::parse(&["bl3:steam,epic"])?;
    for pass in 1..=2 {
        let mut session = RedemptionSession::new(
            &config,
            store.clone(),
            feed.clone(),
            Arc::new(SimulatedRedeemClient),
        );
        let summary = session
            .redeem_mapping(&mapping, RewardFilter::all(), config.default_limit)
            .await?;
        println!(
            "Pass {}: {} succeeded, {} already redeemed, {} failed, {} skipped{}",
            pass,
            summary.succeeded,
            summary.already_redeemed,
            summary.failed,
            summary.skipped(),
            if summary.halted { " (stopped early)" } else { "" }
        );
    }

    Ok(())
}
