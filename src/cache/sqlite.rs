//! SQLite-backed cache implementation.
//!
//! One table, `request_cache`, stored by default in a `batchling`
//! directory under the platform user-data dir (`~/.local/share/batchling`
//! on Linux, the equivalent app-data dirs on macOS and Windows). The pool
//! serializes writes, so concurrent submit/poll/close sequences need no
//! extra locking here.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use platform_dirs::AppDirs;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::{BatchlingError, Result};

use super::{retention, CacheRow, RequestCache};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS request_cache (
    fingerprint TEXT PRIMARY KEY,
    provider    TEXT NOT NULL,
    host        TEXT NOT NULL,
    batch_id    TEXT NOT NULL,
    custom_id   TEXT NOT NULL,
    created_at  TIMESTAMP NOT NULL
)
"#;

#[derive(sqlx::FromRow)]
struct DbRow {
    fingerprint: String,
    provider: String,
    host: String,
    batch_id: String,
    custom_id: String,
    created_at: DateTime<Utc>,
}

impl From<DbRow> for CacheRow {
    fn from(row: DbRow) -> Self {
        CacheRow {
            fingerprint: row.fingerprint,
            provider: row.provider,
            host: row.host,
            batch_id: row.batch_id,
            custom_id: row.custom_id,
            created_at: row.created_at,
        }
    }
}

/// SQLite implementation of the cache trait.
#[derive(Clone)]
pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    /// Open (creating if missing) the cache database at the default
    /// platform location.
    pub async fn open_default() -> Result<Self> {
        Self::open(&Self::default_path()?).await
    }

    /// Open (creating if missing) a cache database at an explicit path.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BatchlingError::Internal(format!(
                    "failed to create cache directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        tracing::debug!(path = %path.display(), "Opened request cache");
        Ok(Self { pool })
    }

    /// The per-user default location of the cache database.
    pub fn default_path() -> Result<PathBuf> {
        let dirs = AppDirs::new(Some("batchling"), false).ok_or_else(|| {
            BatchlingError::Internal("could not resolve a user data directory".to_string())
        })?;
        Ok(dirs.data_dir.join("request_cache.sqlite"))
    }
}

#[async_trait]
impl RequestCache for SqliteCache {
    async fn lookup(&self, fingerprint: &str, now: DateTime<Utc>) -> Result<Option<CacheRow>> {
        let cutoff = now - retention();
        let row = sqlx::query_as::<_, DbRow>(
            r#"
            SELECT fingerprint, provider, host, batch_id, custom_id, created_at
            FROM request_cache
            WHERE fingerprint = ? AND created_at > ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(fingerprint)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CacheRow::from))
    }

    async fn record(&self, row: CacheRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO request_cache (fingerprint, provider, host, batch_id, custom_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                provider = excluded.provider,
                host = excluded.host,
                batch_id = excluded.batch_id,
                custom_id = excluded.custom_id,
                created_at = excluded.created_at
            "#,
        )
        .bind(&row.fingerprint)
        .bind(&row.provider)
        .bind(&row.host)
        .bind(&row.batch_id)
        .bind(&row.custom_id)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - retention();
        let result = sqlx::query("DELETE FROM request_cache WHERE created_at <= ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::debug!(deleted, "Pruned expired cache rows");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, SqliteCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = SqliteCache::open(&dir.path().join("cache.sqlite"))
            .await
            .unwrap();
        (dir, cache)
    }

    fn row(fingerprint: &str, age_days: i64) -> CacheRow {
        CacheRow {
            fingerprint: fingerprint.to_string(),
            provider: "openai".to_string(),
            host: "api.openai.com".to_string(),
            batch_id: "batch_abc".to_string(),
            custom_id: "req-3".to_string(),
            created_at: Utc::now() - chrono::Duration::days(age_days),
        }
    }

    #[tokio::test]
    async fn round_trips_a_row() {
        let (_dir, cache) = open_temp().await;
        cache.record(row("fp1", 0)).await.unwrap();

        let hit = cache.lookup("fp1", Utc::now()).await.unwrap().unwrap();
        assert_eq!(hit.provider, "openai");
        assert_eq!(hit.batch_id, "batch_abc");
        assert_eq!(hit.custom_id, "req-3");
    }

    #[tokio::test]
    async fn upsert_replaces_the_existing_row() {
        let (_dir, cache) = open_temp().await;
        cache.record(row("fp1", 0)).await.unwrap();

        let mut updated = row("fp1", 0);
        updated.batch_id = "batch_def".to_string();
        cache.record(updated).await.unwrap();

        let hit = cache.lookup("fp1", Utc::now()).await.unwrap().unwrap();
        assert_eq!(hit.batch_id, "batch_def");
    }

    #[tokio::test]
    async fn expired_rows_are_invisible_and_prunable() {
        let (_dir, cache) = open_temp().await;
        cache.record(row("old", 31)).await.unwrap();
        cache.record(row("new", 1)).await.unwrap();

        assert!(cache.lookup("old", Utc::now()).await.unwrap().is_none());
        assert!(cache.lookup("new", Utc::now()).await.unwrap().is_some());

        let deleted = cache.prune(Utc::now()).await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.sqlite");

        {
            let cache = SqliteCache::open(&path).await.unwrap();
            cache.record(row("fp1", 0)).await.unwrap();
        }

        let cache = SqliteCache::open(&path).await.unwrap();
        let hit = cache.lookup("fp1", Utc::now()).await.unwrap();
        assert!(hit.is_some());
    }
}
