//! Record of a submitted batch and its unresolved requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::BatchlingError;
use crate::http::HttpResponse;
use crate::providers::{PollStatus, PollTarget};
use crate::types::{BatchKey, PendingRequest};

/// A batch with unresolved requests, either submitted by this process or
/// re-attached from the cache.
///
/// The custom-id map holds a list per id: when several intercepted
/// requests share a fingerprint they attach to the same submitted row and
/// all resolve from the one result line.
pub(crate) struct ActiveBatch {
    pub key: BatchKey,
    pub poll: PollTarget,
    pub created_at: DateTime<Utc>,
    pending: Mutex<HashMap<String, Vec<PendingRequest>>>,
    last_status: Mutex<Option<PollStatus>>,
    sealed: AtomicBool,
}

impl ActiveBatch {
    pub fn new(key: BatchKey, poll: PollTarget) -> Self {
        Self {
            key,
            poll,
            created_at: Utc::now(),
            pending: Mutex::new(HashMap::new()),
            last_status: Mutex::new(None),
            sealed: AtomicBool::new(false),
        }
    }

    /// Register a pending request under a custom-id. A sealed batch (one
    /// whose poller is already handing out results) rejects the request
    /// and returns it, so the caller can start a replacement batch.
    pub fn attach(&self, custom_id: String, pending: PendingRequest) -> Option<PendingRequest> {
        let mut map = self.pending.lock();
        if self.sealed.load(Ordering::SeqCst) {
            return Some(pending);
        }
        map.entry(custom_id).or_default().push(pending);
        None
    }

    /// Stop accepting attachments. Called once results are in hand. Takes
    /// the pending lock so no attach can interleave with the flag.
    pub fn seal(&self) {
        let _map = self.pending.lock();
        self.sealed.store(true, Ordering::SeqCst);
    }

    /// Number of custom-ids still waiting for a result.
    pub fn unresolved(&self) -> usize {
        self.pending.lock().len()
    }

    /// True once every attached request has been completed.
    pub fn is_resolved(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn set_status(&self, status: PollStatus) {
        *self.last_status.lock() = Some(status);
    }

    pub fn last_status(&self) -> Option<PollStatus> {
        self.last_status.lock().clone()
    }

    /// Resolve every waiter of a custom-id with a response. Returns false
    /// when the id is unknown to this batch (e.g. a result line for a
    /// sibling request submitted by an earlier run).
    pub fn complete(&self, custom_id: &str, response: HttpResponse) -> bool {
        let waiters = self.pending.lock().remove(custom_id);
        match waiters {
            Some(waiters) => {
                for pending in waiters {
                    pending.complete(response.clone());
                }
                true
            }
            None => false,
        }
    }

    /// Fail every remaining waiter, constructing a fresh error per handle.
    pub fn fail_remaining(&self, make_error: impl Fn() -> BatchlingError) {
        let remaining: Vec<(String, Vec<PendingRequest>)> =
            self.pending.lock().drain().collect();
        for (custom_id, waiters) in remaining {
            tracing::warn!(
                batch = %self.key,
                custom_id = %custom_id,
                "No result line for pending request"
            );
            for pending in waiters {
                pending.fail(make_error());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpRequest;

    fn batch() -> ActiveBatch {
        ActiveBatch::new(
            BatchKey {
                provider: "openai",
                host: "api.openai.com".to_string(),
                batch_id: "batch_1".to_string(),
            },
            PollTarget {
                url: "https://api.openai.com/v1/batches/batch_1".to_string(),
                headers: Vec::new(),
            },
        )
    }

    fn pending() -> (PendingRequest, tokio::sync::oneshot::Receiver<crate::error::Result<HttpResponse>>) {
        PendingRequest::new(
            HttpRequest::post_json("https://api.openai.com/v1/chat/completions", &serde_json::json!({})),
            "fp".to_string(),
        )
    }

    #[tokio::test]
    async fn complete_resolves_all_waiters_of_an_id() {
        let batch = batch();
        let (p1, rx1) = pending();
        let (p2, rx2) = pending();
        assert!(batch.attach("req-0".to_string(), p1).is_none());
        assert!(batch.attach("req-0".to_string(), p2).is_none());
        assert_eq!(batch.unresolved(), 1);

        let resolved = batch.complete("req-0", HttpResponse::json_ok(&serde_json::json!({"n": 1})));
        assert!(resolved);
        assert!(batch.is_resolved());

        assert_eq!(rx1.await.unwrap().unwrap().status, 200);
        assert_eq!(rx2.await.unwrap().unwrap().status, 200);
    }

    #[tokio::test]
    async fn unknown_custom_id_is_reported() {
        let batch = batch();
        assert!(!batch.complete("req-9", HttpResponse::json_ok(&serde_json::json!({}))));
    }

    #[tokio::test]
    async fn sealed_batch_rejects_new_attachments() {
        let batch = batch();
        let (p1, _rx1) = pending();
        assert!(batch.attach("req-0".to_string(), p1).is_none());

        batch.seal();
        let (p2, _rx2) = pending();
        assert!(batch.attach("req-1".to_string(), p2).is_some());
        assert_eq!(batch.unresolved(), 1);
    }

    #[tokio::test]
    async fn fail_remaining_errors_every_leftover() {
        let batch = batch();
        let (p1, rx1) = pending();
        assert!(batch.attach("req-0".to_string(), p1).is_none());

        batch.fail_remaining(|| BatchlingError::ProviderIncomplete {
            batch_id: "batch_1".to_string(),
            state: "expired".to_string(),
        });

        let err = rx1.await.unwrap().unwrap_err();
        assert!(matches!(err, BatchlingError::ProviderIncomplete { .. }));
        assert!(batch.is_resolved());
    }
}
