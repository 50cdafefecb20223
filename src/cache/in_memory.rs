//! In-memory cache implementation.
//!
//! Rows are lost on restart, so cross-run resumption does not work with
//! this backend. It exists for tests and for embedders that want the
//! in-run deduplication behavior without touching disk.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::Result;

use super::{retention, CacheRow, RequestCache};

/// In-memory implementation of the cache trait.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    rows: Arc<RwLock<HashMap<String, CacheRow>>>,
}

impl InMemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live rows, for tests.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// True when no rows are stored.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl RequestCache for InMemoryCache {
    async fn lookup(&self, fingerprint: &str, now: DateTime<Utc>) -> Result<Option<CacheRow>> {
        let rows = self.rows.read();
        Ok(rows
            .get(fingerprint)
            .filter(|row| row.created_at > now - retention())
            .cloned())
    }

    async fn record(&self, row: CacheRow) -> Result<()> {
        self.rows.write().insert(row.fingerprint.clone(), row);
        Ok(())
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|_, row| row.created_at > now - retention());
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fingerprint: &str, age_days: i64) -> CacheRow {
        CacheRow {
            fingerprint: fingerprint.to_string(),
            provider: "openai".to_string(),
            host: "api.openai.com".to_string(),
            batch_id: "batch_1".to_string(),
            custom_id: "req-0".to_string(),
            created_at: Utc::now() - chrono::Duration::days(age_days),
        }
    }

    #[tokio::test]
    async fn lookup_returns_recorded_row() {
        let cache = InMemoryCache::new();
        cache.record(row("fp1", 0)).await.unwrap();

        let hit = cache.lookup("fp1", Utc::now()).await.unwrap();
        assert_eq!(hit.unwrap().batch_id, "batch_1");
    }

    #[tokio::test]
    async fn expired_rows_are_not_hits() {
        let cache = InMemoryCache::new();
        cache.record(row("fp1", 31)).await.unwrap();

        assert!(cache.lookup("fp1", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_upserts_by_fingerprint() {
        let cache = InMemoryCache::new();
        cache.record(row("fp1", 0)).await.unwrap();
        let mut updated = row("fp1", 0);
        updated.batch_id = "batch_2".to_string();
        cache.record(updated).await.unwrap();

        assert_eq!(cache.len(), 1);
        let hit = cache.lookup("fp1", Utc::now()).await.unwrap().unwrap();
        assert_eq!(hit.batch_id, "batch_2");
    }

    #[tokio::test]
    async fn prune_deletes_only_expired_rows() {
        let cache = InMemoryCache::new();
        cache.record(row("old", 31)).await.unwrap();
        cache.record(row("new", 1)).await.unwrap();

        let deleted = cache.prune(Utc::now()).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(cache.len(), 1);
    }
}
