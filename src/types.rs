//! Core identifier and request types shared across the engine.

use tokio::sync::oneshot;

use crate::error::{BatchlingError, Result};
use crate::http::{HttpRequest, HttpResponse};

/// Partition key for pending-request queues.
///
/// Provider batch APIs refuse mixed models or endpoints in a single batch,
/// so queues are keyed by all three.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    /// Registered name of the owning provider adapter
    pub provider: &'static str,

    /// Canonical endpoint path (model-parameterized paths keep a `{model}`
    /// placeholder, e.g. `/v1beta/models/{model}:generateContent`)
    pub endpoint: String,

    /// Model identifier extracted from the request body or URL path
    pub model: String,
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.provider, self.endpoint, self.model)
    }
}

/// Identity of a submitted batch. Shared by batches created in this process
/// and batches re-attached from the cache, so that one poller exists per
/// provider-side batch regardless of how requests arrived.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub provider: &'static str,
    pub host: String,
    pub batch_id: String,
}

impl std::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.host, self.batch_id)
    }
}

/// A request captured by the interception hook, holding the caller's
/// completion handle.
///
/// Exactly one producer completes the handle: the poller that finds the
/// request's custom-id in batch results, the dry-run path, or an error path.
/// A caller that drops its receiver is treated as canceled.
#[derive(Debug)]
pub struct PendingRequest {
    /// The intercepted request as the caller issued it
    pub request: HttpRequest,

    /// Deterministic hash identifying the canonical request
    pub fingerprint: String,

    completer: oneshot::Sender<Result<HttpResponse>>,
}

impl PendingRequest {
    /// Pair a pending request with the receiver the intake caller awaits.
    pub fn new(
        request: HttpRequest,
        fingerprint: String,
    ) -> (Self, oneshot::Receiver<Result<HttpResponse>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                fingerprint,
                completer: tx,
            },
            rx,
        )
    }

    /// True when the caller has dropped its receiver.
    pub fn is_canceled(&self) -> bool {
        self.completer.is_closed()
    }

    /// Resolve the caller with a response. A no-op if the caller canceled.
    pub fn complete(self, response: HttpResponse) {
        let _ = self.completer.send(Ok(response));
    }

    /// Resolve the caller with an error. A no-op if the caller canceled.
    pub fn fail(self, error: BatchlingError) {
        let _ = self.completer.send(Err(error));
    }
}
