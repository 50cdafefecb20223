//! The batching engine: per-key queues, window/size triggers, submission,
//! polling, and fan-out of per-request results.
//!
//! One engine exists per batching scope. Intake never blocks on provider
//! I/O under the engine lock: the queues map is guarded by a single mutex
//! held only across map updates, and all submission and polling happens on
//! spawned tasks tracked for shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::cache::{CacheRow, RequestCache, SqliteCache};
use crate::config::BatchConfig;
use crate::error::{BatchlingError, Result};
use crate::fingerprint::fingerprint;
use crate::http::{HttpClient, HttpRequest, HttpResponse, ReqwestHttpClient, DRY_RUN_HEADER};
use crate::providers::{Provider, ProviderRegistry};
use crate::types::{BatchKey, PendingRequest, QueueKey};

pub(crate) mod batch;
pub(crate) mod poller;

use batch::ActiveBatch;
use poller::poll_batch;

/// Why a queue was drained, for logging.
#[derive(Debug, Clone, Copy)]
enum DrainReason {
    /// The window timer elapsed
    Window,
    /// The queue reached `batch_size`
    Size,
    /// The engine is closing and flushes all queues
    Close,
}

/// Pending requests for one `(provider, endpoint, model)` key.
///
/// A queue exists only while non-empty, and exactly one window timer is
/// scheduled for it for its whole lifetime.
struct Queue {
    provider: Arc<dyn Provider>,
    host: String,
    requests: Vec<PendingRequest>,
    window_start: Instant,
    timer: AbortHandle,
}

/// Body of the synthetic response produced in dry-run mode.
#[derive(Serialize)]
struct DryRunReceipt<'a> {
    object: &'static str,
    provider: &'a str,
    endpoint: &'a str,
    model: &'a str,
    custom_id: &'a str,
    fingerprint: &'a str,
}

/// The batching engine. Constructed by the scope and never handed to
/// callers directly; the interception hook reaches it through the scoped
/// context.
pub(crate) struct Engine {
    config: BatchConfig,
    registry: Arc<ProviderRegistry>,
    cache: Option<Arc<dyn RequestCache>>,
    http: Arc<dyn HttpClient>,
    queues: Mutex<HashMap<QueueKey, Queue>>,
    batches: DashMap<BatchKey, Arc<ActiveBatch>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    deferred: CancellationToken,
    closed: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl Engine {
    /// Build an engine from a scope configuration, opening (and pruning)
    /// the cache when enabled.
    pub(crate) async fn new(config: BatchConfig) -> Result<Arc<Self>> {
        let registry = config
            .providers
            .clone()
            .unwrap_or_else(|| Arc::new(ProviderRegistry::with_default_providers()));

        let cache: Option<Arc<dyn RequestCache>> = if config.cache {
            let cache: Arc<dyn RequestCache> = match &config.cache_store {
                Some(store) => store.clone(),
                None => {
                    let path = match &config.cache_path {
                        Some(path) => path.clone(),
                        None => SqliteCache::default_path()?,
                    };
                    Arc::new(SqliteCache::open(&path).await?)
                }
            };
            if let Err(e) = cache.prune(Utc::now()).await {
                tracing::warn!(error = %e, "Cache prune failed");
            }
            Some(cache)
        } else {
            None
        };

        let http = config
            .transport
            .clone()
            .unwrap_or_else(|| Arc::new(ReqwestHttpClient::new()));

        let engine = Arc::new(Self {
            config,
            registry,
            cache,
            http,
            queues: Mutex::new(HashMap::new()),
            batches: DashMap::new(),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            deferred: CancellationToken::new(),
            closed: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        });

        if engine.config.deferred {
            engine.tracker.spawn(deferred_watcher(engine.clone()));
        }

        Ok(engine)
    }

    /// Intercept one request. Resolves with the provider's per-request
    /// response once the batch completes, a synthetic dry-run response, or
    /// an engine error; never fails synchronously for provider reasons.
    pub(crate) async fn submit(self: Arc<Self>, request: HttpRequest) -> Result<HttpResponse> {
        submit_inner(&self, request).await
    }

    /// Flush all queues and wait for outstanding work (submissions and
    /// pollers) to finish. Idempotent.
    pub(crate) async fn close(self: Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let keys: Vec<QueueKey> = self.queues.lock().keys().cloned().collect();
        for key in &keys {
            drain(&self, key, DrainReason::Close);
        }
        tracing::debug!(flushed = keys.len(), "Engine closing, awaiting workers");
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!("Engine closed");
    }

    /// Stop immediately: cancel pollers and timers without waiting for
    /// outstanding batches. Used on deferred exit, where the next run
    /// re-attaches through the cache.
    pub(crate) async fn abort(self: Arc<Self>) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!("Engine aborted");
    }

    /// True when this engine's registry would batch the request.
    pub(crate) fn owns(&self, request: &HttpRequest) -> bool {
        Url::parse(&request.url)
            .ok()
            .and_then(|url| self.registry.match_request(&request.method, &url))
            .is_some()
    }

    /// Token cancelled when only polling work remains for longer than the
    /// configured idle threshold.
    pub(crate) fn deferred_signal(&self) -> CancellationToken {
        self.deferred.clone()
    }

    pub(crate) fn shutdown_signal(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    pub(crate) fn http(&self) -> &dyn HttpClient {
        self.http.as_ref()
    }

    /// Record non-polling activity (intake, submission, terminal results)
    /// for the deferred-idle watcher.
    pub(crate) fn touch_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn forget_batch(&self, batch: &Arc<ActiveBatch>) {
        self.batches
            .remove_if(&batch.key, |_, value| Arc::ptr_eq(value, batch));
    }

    fn has_unresolved_batches(&self) -> bool {
        self.batches.iter().any(|entry| !entry.value().is_resolved())
    }
}

/// Intake: resolve the adapter, try the cache fast-path, otherwise enqueue
/// and let the window or size trigger submit.
#[tracing::instrument(skip(engine, request), fields(method = %request.method, url = %request.url))]
async fn submit_inner(engine: &Arc<Engine>, request: HttpRequest) -> Result<HttpResponse> {
    if engine.closed.load(Ordering::SeqCst) {
        return Err(BatchlingError::EngineClosed);
    }

    let url = Url::parse(&request.url)
        .map_err(|e| BatchlingError::InvalidRequest(format!("invalid URL: {e}")))?;
    let matched = engine
        .registry
        .match_request(&request.method, &url)
        .ok_or_else(|| {
            BatchlingError::InvalidRequest(format!("no batchable endpoint for {}", request.url))
        })?;

    let body = request.json_body()?;
    let model = matched.provider.extract_model(&url, Some(&body))?;
    let key = QueueKey {
        provider: matched.provider.name(),
        endpoint: matched.endpoint.clone(),
        model,
    };
    let fp = fingerprint(key.provider, &key.endpoint, &request.method, &key.model, &body);

    engine.touch_activity();

    if let Some(cache) = &engine.cache {
        match cache.lookup(&fp, Utc::now()).await {
            Ok(Some(row)) => {
                if engine.config.dry_run {
                    tracing::info!(key = %key, batch_id = %row.batch_id, "Cache hit (dry run)");
                } else if row.provider == matched.provider.name()
                    && matched.provider.hostnames().iter().any(|h| h == &row.host)
                {
                    tracing::info!(key = %key, batch_id = %row.batch_id, "Cache hit, resuming poll");
                    return attach_resumed(engine, matched.provider.clone(), row, request, fp)
                        .await;
                } else {
                    tracing::debug!(key = %key, "Stale cache row ignored");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Cache lookup failed"),
        }
    }

    let (pending, rx) = PendingRequest::new(request, fp);

    let should_drain = {
        let mut queues = engine.queues.lock();
        if engine.closed.load(Ordering::SeqCst) {
            return Err(BatchlingError::EngineClosed);
        }
        let queue = queues.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(key = %key, "Opening queue, scheduling window timer");
            Queue {
                provider: matched.provider.clone(),
                host: matched.host.clone(),
                requests: Vec::new(),
                window_start: Instant::now(),
                timer: spawn_window_timer(engine, key.clone()),
            }
        });
        queue.requests.push(pending);
        queue.requests.len() >= engine.config.batch_size
    };

    if should_drain {
        drain(engine, &key, DrainReason::Size);
    }

    await_handle(rx).await
}

/// Attach a cache-hit request to the batch it was originally submitted in,
/// starting a poller only if none is running for that batch key.
async fn attach_resumed(
    engine: &Arc<Engine>,
    provider: Arc<dyn Provider>,
    row: CacheRow,
    request: HttpRequest,
    fp: String,
) -> Result<HttpResponse> {
    let (pending, rx) = PendingRequest::new(request, fp);

    let api_key = match provider.api_key() {
        Ok(api_key) => api_key,
        Err(e) => {
            pending.fail(e);
            return await_handle(rx).await;
        }
    };

    let batch_key = BatchKey {
        provider: provider.name(),
        host: row.host.clone(),
        batch_id: row.batch_id.clone(),
    };

    use dashmap::mapref::entry::Entry;
    match engine.batches.entry(batch_key.clone()) {
        Entry::Occupied(mut entry) => {
            if let Some(pending) = entry.get().attach(row.custom_id.clone(), pending) {
                // The running poller is already handing out results;
                // replace the record and poll the batch afresh.
                let batch = new_resumed_batch(&provider, &row, &batch_key, &api_key);
                let _ = batch.attach(row.custom_id, pending);
                entry.insert(batch.clone());
                engine
                    .tracker
                    .spawn(poll_batch(engine.clone(), provider, batch, api_key));
            }
        }
        Entry::Vacant(vacant) => {
            let batch = new_resumed_batch(&provider, &row, &batch_key, &api_key);
            let _ = batch.attach(row.custom_id, pending);
            vacant.insert(batch.clone());
            engine
                .tracker
                .spawn(poll_batch(engine.clone(), provider, batch, api_key));
        }
    }

    await_handle(rx).await
}

fn new_resumed_batch(
    provider: &Arc<dyn Provider>,
    row: &CacheRow,
    batch_key: &BatchKey,
    api_key: &str,
) -> Arc<ActiveBatch> {
    let poll = provider.poll_target(&row.host, &row.batch_id, api_key);
    Arc::new(ActiveBatch::new(batch_key.clone(), poll))
}

async fn await_handle(
    rx: oneshot::Receiver<Result<HttpResponse>>,
) -> Result<HttpResponse> {
    match rx.await {
        Ok(result) => result,
        // Every producer dropped without completing the handle; only
        // happens when the engine is torn down mid-flight.
        Err(_) => Err(BatchlingError::Canceled),
    }
}

/// One-shot window timer for a queue. Held as an abort handle so the size
/// trigger and close can cancel it.
fn spawn_window_timer(engine: &Arc<Engine>, key: QueueKey) -> AbortHandle {
    let window = engine.config.batch_window;
    let tracker = engine.tracker.clone();
    let engine = engine.clone();
    let handle = tracker.spawn(async move {
        tokio::time::sleep(window).await;
        drain(&engine, &key, DrainReason::Window);
    });
    handle.abort_handle()
}

/// Move a queue's requests into a new active batch and hand them to a
/// submission task. Canceled callers are swept here, before custom-ids are
/// assigned, so they never produce cache rows.
fn drain(engine: &Arc<Engine>, key: &QueueKey, reason: DrainReason) {
    let queue = {
        let mut queues = engine.queues.lock();
        queues.remove(key)
    };
    let Some(mut queue) = queue else {
        return;
    };
    queue.timer.abort();
    queue.requests.retain(|pending| !pending.is_canceled());

    if queue.requests.is_empty() {
        tracing::debug!(key = %key, "Queue drained empty after cancellations");
        return;
    }

    tracing::info!(
        key = %key,
        count = queue.requests.len(),
        ?reason,
        window_ms = queue.window_start.elapsed().as_millis() as u64,
        "Draining queue for submission"
    );

    let engine = engine.clone();
    let key = key.clone();
    engine.tracker.clone().spawn(async move {
        submit_batch(engine, key, queue).await;
    });
}

/// Submission task for one drained queue: build the artifact, submit it,
/// record cache rows, and start the poller. In dry-run mode every handle
/// resolves immediately with a synthetic response instead.
async fn submit_batch(engine: Arc<Engine>, key: QueueKey, queue: Queue) {
    engine.touch_activity();

    let provider = queue.provider;
    let host = queue.host;
    let entries: Vec<(String, PendingRequest)> = queue
        .requests
        .into_iter()
        .enumerate()
        .map(|(index, pending)| (format!("req-{index}"), pending))
        .collect();

    if engine.config.dry_run {
        tracing::info!(key = %key, count = entries.len(), "Dry run, synthesizing responses");
        for (custom_id, pending) in entries {
            let receipt = DryRunReceipt {
                object: "batchling.dry_run",
                provider: key.provider,
                endpoint: &key.endpoint,
                model: &key.model,
                custom_id: &custom_id,
                fingerprint: &pending.fingerprint,
            };
            let body = match serde_json::to_value(&receipt) {
                Ok(body) => body,
                Err(e) => {
                    pending.fail(BatchlingError::Json(e));
                    continue;
                }
            };
            pending.complete(HttpResponse::json_ok(&body).header(DRY_RUN_HEADER, "1"));
        }
        return;
    }

    let api_key = match provider.api_key() {
        Ok(api_key) => api_key,
        Err(e) => {
            tracing::error!(key = %key, error = %e, "No credential, failing batch");
            let message = e.to_string();
            for (_, pending) in entries {
                pending.fail(BatchlingError::Auth(message.clone()));
            }
            return;
        }
    };

    let mut lines: Vec<Value> = Vec::with_capacity(entries.len());
    let mut kept: Vec<(String, PendingRequest)> = Vec::with_capacity(entries.len());
    for (custom_id, pending) in entries {
        let body = match pending.request.json_body() {
            Ok(body) => body,
            Err(e) => {
                pending.fail(e);
                continue;
            }
        };
        match provider.build_line(&custom_id, &key.endpoint, &body) {
            Ok(line) => {
                lines.push(line);
                kept.push((custom_id, pending));
            }
            Err(e) => pending.fail(e),
        }
    }
    if kept.is_empty() {
        return;
    }

    match provider
        .submit(engine.http(), &key, &host, lines, &api_key)
        .await
    {
        Ok(outcome) => {
            engine.touch_activity();

            if let Some(cache) = &engine.cache {
                let now = Utc::now();
                let writes = kept.iter().map(|(custom_id, pending)| {
                    cache.record(CacheRow {
                        fingerprint: pending.fingerprint.clone(),
                        provider: key.provider.to_string(),
                        host: host.clone(),
                        batch_id: outcome.batch_id.clone(),
                        custom_id: custom_id.clone(),
                        created_at: now,
                    })
                });
                for result in futures::future::join_all(writes).await {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "Cache write failed");
                    }
                }
            }

            let batch_key = BatchKey {
                provider: key.provider,
                host: host.clone(),
                batch_id: outcome.batch_id.clone(),
            };
            let batch = Arc::new(ActiveBatch::new(batch_key.clone(), outcome.poll));
            for (custom_id, pending) in kept {
                // A freshly created batch is never sealed.
                let _ = batch.attach(custom_id, pending);
            }
            engine.batches.insert(batch_key, batch.clone());
            engine
                .tracker
                .clone()
                .spawn(poll_batch(engine.clone(), provider, batch, api_key));
        }
        Err(e) => {
            tracing::error!(key = %key, error = %e, "Batch submission failed");
            let is_auth = matches!(e, BatchlingError::Auth(_));
            let message = e.to_string();
            for (_, pending) in kept {
                pending.fail(if is_auth {
                    BatchlingError::Auth(message.clone())
                } else {
                    BatchlingError::Provider(message.clone())
                });
            }
        }
    }
}

/// Watcher for deferred mode: when only polling activity has happened for
/// the configured idle period and batches are still unresolved, signal the
/// scope to exit early.
async fn deferred_watcher(engine: Arc<Engine>) {
    let check_interval = Duration::from_millis(250);
    loop {
        tokio::select! {
            _ = engine.shutdown.cancelled() => return,
            _ = tokio::time::sleep(check_interval) => {}
        }
        if engine.closed.load(Ordering::SeqCst) {
            return;
        }
        let idle = engine.last_activity.lock().elapsed();
        if idle >= engine.config.deferred_idle && engine.has_unresolved_batches() {
            tracing::info!(
                idle_secs = idle.as_secs_f64(),
                "Only polling activity for the idle period, signaling deferred exit"
            );
            engine.deferred.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::MockHttpClient;
    use serde_json::json;

    fn config(mock: &MockHttpClient) -> BatchConfig {
        BatchConfig {
            batch_window: Duration::from_millis(50),
            poll_interval: Duration::from_millis(20),
            cache: false,
            transport: Some(Arc::new(mock.clone())),
            ..BatchConfig::default()
        }
    }

    fn chat_request(model: &str, content: &str) -> HttpRequest {
        HttpRequest::post_json(
            "https://api.openai.com/v1/chat/completions",
            &json!({"model": model, "messages": [{"role": "user", "content": content}]}),
        )
    }

    #[tokio::test]
    async fn intake_after_close_is_rejected() {
        let mock = MockHttpClient::new();
        let engine = Engine::new(config(&mock)).await.unwrap();
        engine.clone().close().await;

        let err = engine.submit(chat_request("m", "late")).await.unwrap_err();
        assert!(matches!(err, BatchlingError::EngineClosed));
    }

    #[tokio::test]
    async fn unknown_endpoint_is_invalid_for_direct_intake() {
        let mock = MockHttpClient::new();
        let engine = Engine::new(config(&mock)).await.unwrap();

        let request =
            HttpRequest::post_json("https://example.com/v1/other", &json!({"model": "m"}));
        assert!(!engine.owns(&request));
        let err = engine.clone().submit(request).await.unwrap_err();
        assert!(matches!(err, BatchlingError::InvalidRequest(_)));

        engine.close().await;
    }

    #[tokio::test]
    async fn missing_model_is_an_invalid_request() {
        let mock = MockHttpClient::new();
        let engine = Engine::new(config(&mock)).await.unwrap();

        let request = HttpRequest::post_json(
            "https://api.openai.com/v1/chat/completions",
            &json!({"messages": []}),
        );
        let err = engine.clone().submit(request).await.unwrap_err();
        assert!(matches!(err, BatchlingError::InvalidRequest(_)));

        engine.close().await;
    }

    #[tokio::test]
    async fn missing_credential_fails_the_whole_batch() {
        std::env::remove_var("MISTRAL_API_KEY");
        let mock = MockHttpClient::new();
        let engine = Engine::new(config(&mock)).await.unwrap();

        let request = HttpRequest::post_json(
            "https://api.mistral.ai/v1/chat/completions",
            &json!({"model": "mistral-small-latest", "messages": []}),
        );
        let err = engine.clone().submit(request).await.unwrap_err();
        assert!(matches!(err, BatchlingError::Auth(_)));
        assert_eq!(mock.call_count(), 0);

        engine.close().await;
    }

    #[tokio::test]
    async fn window_drain_submits_and_resolves_in_enqueue_order() {
        std::env::set_var("OPENAI_API_KEY", "sk-test");

        let mock = MockHttpClient::new();
        mock.add_json_response("POST /v1/files", json!({"id": "file-1"}));
        mock.add_json_response(
            "POST /v1/batches",
            json!({"id": "batch-1", "status": "validating"}),
        );
        mock.add_json_response(
            "GET /v1/batches/batch-1",
            json!({"status": "completed", "output_file_id": "out-1"}),
        );
        let lines = [
            json!({"custom_id": "req-0", "response": {"status_code": 200, "body": {"n": 0}}}),
            json!({"custom_id": "req-1", "response": {"status_code": 200, "body": {"n": 1}}}),
        ]
        .map(|l| l.to_string())
        .join("\n");
        mock.add_response(
            "GET /v1/files/out-1/content",
            HttpResponse {
                status: 200,
                headers: vec![("content-type".to_string(), "application/jsonl".to_string())],
                body: lines.into_bytes(),
            },
        );

        let engine = Engine::new(config(&mock)).await.unwrap();

        let (a, b) = tokio::join!(
            engine.clone().submit(chat_request("m1", "zero")),
            engine.clone().submit(chat_request("m1", "one")),
        );
        assert_eq!(a.unwrap().json().unwrap()["n"], 0);
        assert_eq!(b.unwrap().json().unwrap()["n"], 1);

        engine.clone().close().await;

        // The poller deregistered its batch once resolved.
        assert!(engine.batches.is_empty());
        assert!(engine.queues.lock().is_empty());
    }

    #[tokio::test]
    async fn incomplete_results_name_the_terminal_state() {
        std::env::set_var("OPENAI_API_KEY", "sk-test");

        let mock = MockHttpClient::new();
        mock.add_json_response("POST /v1/files", json!({"id": "file-1"}));
        mock.add_json_response(
            "POST /v1/batches",
            json!({"id": "batch-x", "status": "validating"}),
        );
        // Terminal without any result line for the pending request.
        mock.add_json_response(
            "GET /v1/batches/batch-x",
            json!({"status": "expired", "output_file_id": "out-1"}),
        );
        mock.add_response(
            "GET /v1/files/out-1/content",
            HttpResponse {
                status: 200,
                headers: Vec::new(),
                body: Vec::new(),
            },
        );

        let engine = Engine::new(config(&mock)).await.unwrap();

        let err = engine
            .clone()
            .submit(chat_request("m1", "lost"))
            .await
            .unwrap_err();
        match err {
            BatchlingError::ProviderIncomplete { batch_id, state } => {
                assert_eq!(batch_id, "batch-x");
                assert_eq!(state, "expired");
            }
            other => panic!("expected ProviderIncomplete, got {other}"),
        }

        engine.close().await;
    }

    #[tokio::test]
    async fn dry_run_synthesizes_deterministic_receipts() {
        let mock = MockHttpClient::new();
        let engine = Engine::new(BatchConfig {
            dry_run: true,
            ..config(&mock)
        })
        .await
        .unwrap();

        let response = engine
            .clone()
            .submit(chat_request("m1", "pretend"))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.get_header(DRY_RUN_HEADER), Some("1"));
        let body = response.json().unwrap();
        assert_eq!(body["object"], "batchling.dry_run");
        assert_eq!(body["provider"], "openai");
        assert_eq!(body["custom_id"], "req-0");
        assert_eq!(mock.call_count(), 0);

        engine.close().await;
    }

    #[tokio::test]
    async fn submission_failure_fails_every_handle() {
        std::env::set_var("OPENAI_API_KEY", "sk-test");

        let mock = MockHttpClient::new();
        mock.add_response(
            "POST /v1/files",
            HttpResponse::json_with_status(500, &json!({"error": "storage down"})),
        );

        let engine = Engine::new(config(&mock)).await.unwrap();

        let (a, b) = tokio::join!(
            engine.clone().submit(chat_request("m1", "x")),
            engine.clone().submit(chat_request("m1", "y")),
        );
        assert!(matches!(a.unwrap_err(), BatchlingError::Provider(_)));
        assert!(matches!(b.unwrap_err(), BatchlingError::Provider(_)));

        engine.close().await;
    }

    #[tokio::test]
    async fn in_run_duplicate_attaches_to_the_submitted_batch() {
        std::env::set_var("OPENAI_API_KEY", "sk-test");

        let mock = MockHttpClient::new();
        mock.add_json_response("POST /v1/files", json!({"id": "file-1"}));
        mock.add_json_response(
            "POST /v1/batches",
            json!({"id": "batch-1", "status": "validating"}),
        );
        mock.add_json_response(
            "GET /v1/batches/batch-1",
            json!({"status": "completed", "output_file_id": "out-1"}),
        );
        mock.add_response(
            "GET /v1/files/out-1/content",
            HttpResponse {
                status: 200,
                headers: Vec::new(),
                body: json!({"custom_id": "req-0", "response": {"status_code": 200, "body": {"n": 7}}})
                    .to_string()
                    .into_bytes(),
            },
        );

        let engine = Engine::new(BatchConfig {
            cache: true,
            cache_store: Some(Arc::new(crate::cache::InMemoryCache::new())),
            batch_window: Duration::from_millis(30),
            poll_interval: Duration::from_millis(100),
            transport: Some(Arc::new(mock.clone())),
            ..BatchConfig::default()
        })
        .await
        .unwrap();

        // First request submits a batch and, once its cache row exists, a
        // second identical request attaches to the same poll.
        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.submit(chat_request("m1", "same")).await }
        });
        tokio::time::sleep(Duration::from_millis(60)).await;

        let second = engine.clone().submit(chat_request("m1", "same")).await;

        assert_eq!(first.await.unwrap().unwrap().json().unwrap()["n"], 7);
        assert_eq!(second.unwrap().json().unwrap()["n"], 7);

        engine.close().await;
        assert_eq!(batch_creates(&mock), 1);
    }

    fn batch_creates(mock: &MockHttpClient) -> usize {
        mock.get_calls()
            .iter()
            .filter(|c| c.method == "POST" && c.url.ends_with("/v1/batches"))
            .count()
    }
}
