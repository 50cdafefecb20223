//! Configuration for the batching scope.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::RequestCache;
use crate::http::HttpClient;
use crate::providers::ProviderRegistry;

/// Configuration accepted by [`crate::batched`].
///
/// The defaults trade a small intake delay for large batches: requests are
/// held for up to `batch_window` (or until `batch_size` accumulate) before
/// one provider batch is submitted per `(provider, endpoint, model)` queue.
#[derive(Clone)]
pub struct BatchConfig {
    /// Queue drain threshold. A queue reaching this length is submitted
    /// immediately without waiting for the window timer.
    pub batch_size: usize,

    /// Queue drain timer, measured from the first enqueue into an empty queue.
    pub batch_window: Duration,

    /// Gap between poll attempts per submitted batch.
    pub poll_interval: Duration,

    /// Skip provider submission and polling; resolve every intercepted
    /// request with a synthetic 200 response carrying `x-batchling-dry-run: 1`.
    pub dry_run: bool,

    /// Enable cache lookup and writeback. When disabled the engine never
    /// touches persistent state and every request is submitted fresh.
    pub cache: bool,

    /// Permit idle-based early exit: when only polling activity has happened
    /// for `deferred_idle`, the scope resolves with `DeferredExit` and a
    /// later run re-attaches to the outstanding batches through the cache.
    pub deferred: bool,

    /// Idle threshold for deferred exit.
    pub deferred_idle: Duration,

    /// Override for the cache database location. `None` resolves a
    /// `batchling` directory under the platform user-data dir.
    pub cache_path: Option<PathBuf>,

    /// Override for the outbound HTTP transport used for provider
    /// submission and polling. `None` uses a process-wide reqwest client.
    pub transport: Option<Arc<dyn HttpClient>>,

    /// Override for the cache backend. Takes precedence over `cache_path`.
    pub cache_store: Option<Arc<dyn RequestCache>>,

    /// Override for the provider adapter registry. `None` registers the
    /// built-in adapters with their production hostnames.
    pub providers: Option<Arc<ProviderRegistry>>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_window: Duration::from_secs(2),
            poll_interval: Duration::from_secs(10),
            dry_run: false,
            cache: true,
            deferred: false,
            deferred_idle: Duration::from_secs(60),
            cache_path: None,
            transport: None,
            cache_store: None,
            providers: None,
        }
    }
}
