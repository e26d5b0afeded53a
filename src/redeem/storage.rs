//! Storage abstraction for codes and redemption outcomes.
//!
//! The store is the system of record across runs: one identity row per
//! (code, game, platform scope) in `keys`, and per-platform outcome rows in
//! `redeemed_keys` and `failed_keys`. Every write commits before returning.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite, Transaction};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::redeem::normalize::parse_expiry;
use crate::redeem::types::{
    clean_reward, FailureLabel, NewKey, OutcomeKind, OutcomeRecord, PriorOutcomes, SourceRecord,
    StoredKey, UNKNOWN_REWARD,
};
use crate::types::{Game, NormalizedCode, Platform, PlatformScope};

/// Contract the planner and the execution loop need from persistence.
#[async_trait]
pub trait KeyStorage: Send + Sync {
    /// All identity rows for a code.
    async fn fetch_keys_for_code(&self, code: &NormalizedCode) -> Result<Vec<StoredKey>>;

    /// Recorded successes for a code.
    async fn fetch_successes_for_code(&self, code: &NormalizedCode) -> Result<Vec<OutcomeRecord>>;

    /// Recorded failures for a code.
    async fn fetch_failures_for_code(&self, code: &NormalizedCode) -> Result<Vec<OutcomeRecord>>;

    /// Create the identity row if absent and return its id.
    async fn ensure_key(&self, key: &NewKey) -> Result<i64>;

    /// Record a positive outcome and drop any failure row for the same target.
    async fn record_success(
        &self,
        key_id: i64,
        platform: Platform,
        status: &str,
        detail: &str,
    ) -> Result<()>;

    /// Record (or overwrite) a negative outcome.
    async fn record_failure(
        &self,
        key_id: i64,
        platform: Platform,
        label: FailureLabel,
        detail: &str,
    ) -> Result<()>;

    /// Identity rows for a game on a platform, including universal rows.
    async fn list_keys_for_target(&self, game: Game, platform: Platform) -> Result<Vec<StoredKey>>;

    /// Insert feed records that are not stored yet; returns how many were new.
    async fn sync_feed(&self, records: &[SourceRecord]) -> Result<usize>;

    /// Replace an `Unknown` reward on an identity row; returns whether it changed.
    async fn backfill_reward(&self, key_id: i64, reward: &str) -> Result<bool>;

    /// Health check for the storage backend.
    async fn health_check(&self) -> Result<bool>;

    /// Successes and failures for a code, keyed by target.
    async fn fetch_prior_outcomes(&self, code: &NormalizedCode) -> Result<PriorOutcomes> {
        let mut records = self.fetch_successes_for_code(code).await?;
        records.extend(self.fetch_failures_for_code(code).await?);
        Ok(PriorOutcomes::from_records(records))
    }
}

#[derive(FromRow)]
struct KeyRow {
    id: i64,
    code: String,
    reward: String,
    game: String,
    platform: String,
    source: Option<String>,
    expires: Option<String>,
    expired: bool,
}

impl From<KeyRow> for StoredKey {
    fn from(row: KeyRow) -> Self {
        StoredKey {
            id: row.id,
            code: row.code,
            reward: row.reward,
            game: row.game,
            platform: PlatformScope::from_token(Some(&row.platform)),
            source: row.source,
            expires_at: row.expires.as_deref().and_then(parse_expiry),
            expired: row.expired,
        }
    }
}

#[derive(FromRow)]
struct OutcomeRow {
    key_id: i64,
    code: String,
    game: String,
    platform: String,
    status: String,
    detail: Option<String>,
    attempted_at: i64,
}

impl OutcomeRow {
    /// Rows naming a game or platform this build does not know are dropped.
    fn into_record(self, kind: OutcomeKind) -> Option<OutcomeRecord> {
        let (Some(game), Some(platform)) =
            (Game::from_token(&self.game), Platform::from_token(&self.platform))
        else {
            warn!(
                "Ignoring outcome row for unknown target {}:{} (key {})",
                self.platform, self.game, self.key_id
            );
            return None;
        };

        Some(OutcomeRecord {
            key_id: self.key_id,
            code: self.code,
            game,
            platform,
            kind,
            status: self.status,
            detail: self.detail,
            attempted_at: DateTime::from_timestamp_millis(self.attempted_at).unwrap_or_default(),
        })
    }
}

/// SQLite implementation of [`KeyStorage`].
pub struct SqliteKeyStore {
    pool: Pool<Sqlite>,
}

impl SqliteKeyStore {
    /// Open (creating if needed) a file-backed store.
    pub async fn open(path: &Path) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::create_schema(&pool).await?;

        info!("SqliteKeyStore initialized and connected to {}", path.display());

        Ok(Arc::new(Self { pool }))
    }

    /// Private in-memory store; lives as long as its single connection.
    pub async fn in_memory() -> Result<Arc<Self>> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::create_schema(&pool).await?;

        debug!("SqliteKeyStore initialized in memory");

        Ok(Arc::new(Self { pool }))
    }

    async fn create_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL,
                reward TEXT NOT NULL DEFAULT 'Unknown',
                game TEXT NOT NULL,
                platform TEXT NOT NULL,
                source TEXT,
                expires TEXT,
                expired BOOLEAN NOT NULL DEFAULT FALSE,
                UNIQUE (code, game, platform)
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create keys table")?;

        for table in ["redeemed_keys", "failed_keys"] {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    key_id INTEGER NOT NULL,
                    platform TEXT NOT NULL,
                    status TEXT NOT NULL,
                    detail TEXT,
                    attempted_at INTEGER NOT NULL,
                    PRIMARY KEY (key_id, platform),
                    FOREIGN KEY (key_id) REFERENCES keys (id)
                );
                "#
            ))
            .execute(pool)
            .await
            .with_context(|| format!("Failed to create {} table", table))?;
        }

        Ok(())
    }

    pub fn get_db_pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn insert_key_tx(tx: &mut Transaction<'_, Sqlite>, key: &NewKey) -> Result<u64> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO keys (code, reward, game, platform, source, expires, expired)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (code, game, platform) DO NOTHING
            "#,
        )
        .bind(key.code.as_str())
        .bind(clean_reward(Some(key.reward.as_str())))
        .bind(key.game.short())
        .bind(key.platform.as_str())
        .bind(&key.source)
        .bind(key.expires_at.map(|t| t.to_rfc3339()))
        .bind(key.expired)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("Failed to insert key {} for {}", key.code, key.game))?
        .rows_affected();

        Ok(inserted)
    }

    async fn fetch_outcomes(
        &self,
        table: &str,
        kind: OutcomeKind,
        code: &NormalizedCode,
    ) -> Result<Vec<OutcomeRecord>> {
        let rows: Vec<OutcomeRow> = sqlx::query_as(&format!(
            r#"
            SELECT o.key_id, k.code, k.game, o.platform, o.status, o.detail, o.attempted_at
            FROM {table} o
            JOIN keys k ON k.id = o.key_id
            WHERE k.code = ?
            ORDER BY o.attempted_at ASC
            "#
        ))
        .bind(code.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to fetch {} for {}", table, code))?;

        Ok(rows.into_iter().filter_map(|row| row.into_record(kind)).collect())
    }
}

#[async_trait]
impl KeyStorage for SqliteKeyStore {
    #[instrument(skip(self, code), fields(code = %code))]
    async fn fetch_keys_for_code(&self, code: &NormalizedCode) -> Result<Vec<StoredKey>> {
        let rows: Vec<KeyRow> = sqlx::query_as(
            r#"
            SELECT id, code, reward, game, platform, source, expires, expired
            FROM keys
            WHERE code = ?
            ORDER BY id ASC
            "#,
        )
        .bind(code.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch keys for code")?;

        Ok(rows.into_iter().map(StoredKey::from).collect())
    }

    async fn fetch_successes_for_code(&self, code: &NormalizedCode) -> Result<Vec<OutcomeRecord>> {
        self.fetch_outcomes("redeemed_keys", OutcomeKind::Success, code).await
    }

    async fn fetch_failures_for_code(&self, code: &NormalizedCode) -> Result<Vec<OutcomeRecord>> {
        self.fetch_outcomes("failed_keys", OutcomeKind::Failure, code).await
    }

    #[instrument(skip(self, key), fields(code = %key.code, game = %key.game, platform = key.platform.as_str()))]
    async fn ensure_key(&self, key: &NewKey) -> Result<i64> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        if Self::insert_key_tx(&mut tx, key).await? > 0 {
            debug!("Created identity row");
        }

        let (id,): (i64,) =
            sqlx::query_as("SELECT id FROM keys WHERE code = ? AND game = ? AND platform = ?")
                .bind(key.code.as_str())
                .bind(key.game.short())
                .bind(key.platform.as_str())
                .fetch_one(&mut *tx)
                .await
                .context("Failed to read back identity row")?;

        tx.commit().await.context("Failed to commit identity row")?;
        Ok(id)
    }

    #[instrument(skip(self, detail))]
    async fn record_success(
        &self,
        key_id: i64,
        platform: Platform,
        status: &str,
        detail: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            r#"
            INSERT INTO redeemed_keys (key_id, platform, status, detail, attempted_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (key_id, platform) DO UPDATE SET
                status = excluded.status,
                detail = excluded.detail,
                attempted_at = excluded.attempted_at
            "#,
        )
        .bind(key_id)
        .bind(platform.short())
        .bind(status)
        .bind(detail)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await
        .context("Failed to record success")?;

        sqlx::query("DELETE FROM failed_keys WHERE key_id = ? AND platform = ?")
            .bind(key_id)
            .bind(platform.short())
            .execute(&mut *tx)
            .await
            .context("Failed to clear stale failure")?;

        tx.commit().await.context("Failed to commit success")?;
        Ok(())
    }

    #[instrument(skip(self, detail))]
    async fn record_failure(
        &self,
        key_id: i64,
        platform: Platform,
        label: FailureLabel,
        detail: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            r#"
            INSERT INTO failed_keys (key_id, platform, status, detail, attempted_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (key_id, platform) DO UPDATE SET
                status = excluded.status,
                detail = excluded.detail,
                attempted_at = excluded.attempted_at
            "#,
        )
        .bind(key_id)
        .bind(platform.short())
        .bind(label.as_str())
        .bind(detail)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await
        .context("Failed to record failure")?;

        tx.commit().await.context("Failed to commit failure")?;
        Ok(())
    }

    async fn list_keys_for_target(&self, game: Game, platform: Platform) -> Result<Vec<StoredKey>> {
        let rows: Vec<KeyRow> = sqlx::query_as(
            r#"
            SELECT id, code, reward, game, platform, source, expires, expired
            FROM keys
            WHERE game = ? AND (platform = ? OR platform = 'universal')
            ORDER BY id ASC
            "#,
        )
        .bind(game.short())
        .bind(platform.short())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to list keys for {} on {}", game, platform))?;

        Ok(rows.into_iter().map(StoredKey::from).collect())
    }

    async fn sync_feed(&self, records: &[SourceRecord]) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let mut inserted = 0usize;

        for record in records {
            let (Ok(code), Some(game)) = (
                NormalizedCode::parse(&record.code),
                Game::from_token(&record.game),
            ) else {
                debug!("Skipping feed entry {} ({}) during sync", record.code, record.game);
                continue;
            };

            let key = NewKey {
                code,
                game,
                platform: record.platform,
                reward: clean_reward(record.reward.as_deref()),
                source: record.source.clone(),
                expires_at: record.expires_at,
                expired: record.expired,
            };
            inserted += Self::insert_key_tx(&mut tx, &key).await? as usize;
        }

        tx.commit().await.context("Failed to commit feed sync")?;
        Ok(inserted)
    }

    async fn backfill_reward(&self, key_id: i64, reward: &str) -> Result<bool> {
        let updated = sqlx::query("UPDATE keys SET reward = ? WHERE id = ? AND reward = ?")
            .bind(reward.trim())
            .bind(key_id)
            .bind(UNKNOWN_REWARD)
            .execute(&self.pool)
            .await
            .context("Failed to backfill reward")?
            .rows_affected();

        Ok(updated > 0)
    }

    async fn health_check(&self) -> Result<bool> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code() -> NormalizedCode {
        NormalizedCode::parse("ABCDE-FGHIJ-KLMNO-PQRST-UVWXY").unwrap()
    }

    fn new_key(game: Game, platform: PlatformScope, reward: &str) -> NewKey {
        NewKey {
            code: code(),
            game,
            platform,
            reward: reward.to_string(),
            source: Some("test".to_string()),
            expires_at: None,
            expired: false,
        }
    }

    #[tokio::test]
    async fn test_ensure_key_is_idempotent() -> Result<()> {
        let store = SqliteKeyStore::in_memory().await?;
        let key = new_key(Game::Bl3, PlatformScope::Specific(Platform::Steam), "Golden Key");

        let first = store.ensure_key(&key).await?;
        let second = store.ensure_key(&key).await?;
        assert_eq!(first, second);

        let rows = store.fetch_keys_for_code(&code()).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reward, "Golden Key");
        assert_eq!(rows[0].platform, PlatformScope::Specific(Platform::Steam));
        Ok(())
    }

    #[tokio::test]
    async fn test_success_clears_failure() -> Result<()> {
        let store = SqliteKeyStore::in_memory().await?;
        let id = store
            .ensure_key(&new_key(Game::Bl3, PlatformScope::Specific(Platform::Epic), "Unknown"))
            .await?;

        store
            .record_failure(id, Platform::Epic, FailureLabel::NetworkError, "timeout")
            .await?;
        let outcomes = store.fetch_prior_outcomes(&code()).await?;
        assert!(outcomes.failures.contains_key(&(Game::Bl3, Platform::Epic)));

        store.record_success(id, Platform::Epic, "SUCCESS", "Redeemed").await?;
        let outcomes = store.fetch_prior_outcomes(&code()).await?;
        assert!(outcomes.failures.is_empty());
        let success = &outcomes.successes[&(Game::Bl3, Platform::Epic)];
        assert_eq!(success.status, "SUCCESS");
        assert_eq!(success.kind, OutcomeKind::Success);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_is_overwritten() -> Result<()> {
        let store = SqliteKeyStore::in_memory().await?;
        let id = store
            .ensure_key(&new_key(Game::Bl2, PlatformScope::Specific(Platform::Psn), "Unknown"))
            .await?;

        store.record_failure(id, Platform::Psn, FailureLabel::RateLimit, "slow").await?;
        store.record_failure(id, Platform::Psn, FailureLabel::Invalid, "nope").await?;

        let failures = store.fetch_failures_for_code(&code()).await?;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].status, "INVALID");
        assert_eq!(failures[0].detail.as_deref(), Some("nope"));
        Ok(())
    }

    #[tokio::test]
    async fn test_backfill_only_replaces_unknown() -> Result<()> {
        let store = SqliteKeyStore::in_memory().await?;
        let unknown = store
            .ensure_key(&new_key(Game::Bl3, PlatformScope::Universal, ""))
            .await?;
        let known = store
            .ensure_key(&new_key(Game::Bl2, PlatformScope::Universal, "Skin"))
            .await?;

        assert!(store.backfill_reward(unknown, "3 Golden Keys").await?);
        assert!(!store.backfill_reward(known, "3 Golden Keys").await?);

        let rows = store.fetch_keys_for_code(&code()).await?;
        let rewards: Vec<&str> = rows.iter().map(|r| r.reward.as_str()).collect();
        assert_eq!(rewards, vec!["3 Golden Keys", "Skin"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_keys_includes_universal_rows() -> Result<()> {
        let store = SqliteKeyStore::in_memory().await?;
        store.ensure_key(&new_key(Game::Bl3, PlatformScope::Universal, "A")).await?;
        store
            .ensure_key(&new_key(Game::Bl3, PlatformScope::Specific(Platform::Psn), "B"))
            .await?;
        store
            .ensure_key(&new_key(Game::Bl3, PlatformScope::Specific(Platform::Steam), "C"))
            .await?;

        let rows = store.list_keys_for_target(Game::Bl3, Platform::Steam).await?;
        let rewards: Vec<&str> = rows.iter().map(|r| r.reward.as_str()).collect();
        assert_eq!(rewards, vec!["A", "C"]);
        assert!(store.health_check().await?);
        Ok(())
    }
}
