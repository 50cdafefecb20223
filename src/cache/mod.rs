//! Persistent map from request fingerprints to submitted batches.
//!
//! A cache row records where a canonical request was submitted: which
//! provider, which host, which provider-side batch, and under which
//! custom-id. A later process (or a later duplicate in the same process)
//! re-attaches to that batch's poll instead of submitting again.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Result;

pub mod in_memory;
pub mod sqlite;

pub use in_memory::InMemoryCache;
pub use sqlite::SqliteCache;

/// Rows older than this are never returned as hits and are eligible for
/// deletion; provider batch artifacts are long expired by then.
pub fn retention() -> Duration {
    Duration::days(30)
}

/// One persisted fingerprint → batch mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRow {
    pub fingerprint: String,
    pub provider: String,
    pub host: String,
    pub batch_id: String,
    pub custom_id: String,
    pub created_at: DateTime<Utc>,
}

/// Storage trait for the request cache.
///
/// Implementations synchronize their own writes; the engine may call these
/// methods from concurrent intake and submission tasks.
#[async_trait]
pub trait RequestCache: Send + Sync {
    /// Return the most recent non-expired row for a fingerprint.
    async fn lookup(&self, fingerprint: &str, now: DateTime<Utc>) -> Result<Option<CacheRow>>;

    /// Upsert a row. Identical requests in one run share a single row.
    async fn record(&self, row: CacheRow) -> Result<()>;

    /// Delete rows whose `created_at` is older than the retention window.
    /// Returns the number of rows deleted.
    async fn prune(&self, now: DateTime<Utc>) -> Result<u64>;
}
