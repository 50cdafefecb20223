//! The HTTP interception hook.
//!
//! [`BatchingClient`] wraps an inner client and implements the same
//! `HttpClient` trait, which is the Rust rendition of replacing the
//! ambient client's request primitive: application code holds the wrapper
//! and every request flows through [`BatchingClient::execute`]. Requests
//! are delegated unchanged unless a scope is active, the request matches a
//! registered provider's batchable endpoint, and the engine-internal
//! sentinel header is absent.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::error::Result;
use crate::http::{HttpClient, HttpRequest, HttpResponse, ReqwestHttpClient, INTERNAL_HEADER};

/// Wrapper around an HTTP client that routes batchable requests through
/// the active engine.
#[derive(Clone)]
pub struct BatchingClient<H> {
    inner: H,
}

impl<H: HttpClient> BatchingClient<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }

    /// The wrapped client.
    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<H: HttpClient> HttpClient for BatchingClient<H> {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        // Engine-originated traffic (uploads, polls, result downloads)
        // carries the sentinel and must not be re-intercepted.
        if request.get_header(INTERNAL_HEADER).is_some() {
            return self.inner.execute(request).await;
        }

        let Some(engine) = crate::context::current() else {
            return self.inner.execute(request).await;
        };

        if !engine.owns(&request) {
            return self.inner.execute(request).await;
        }

        tracing::debug!(method = %request.method, url = %request.url, "Intercepted batchable request");
        engine.submit(request).await
    }
}

static GLOBAL: OnceLock<Arc<BatchingClient<ReqwestHttpClient>>> = OnceLock::new();

/// The process-wide hooked HTTP client. Application code that wants its
/// requests batched issues them through this client; outside a scope it
/// behaves exactly like a plain reqwest-backed client.
pub fn client() -> Arc<BatchingClient<ReqwestHttpClient>> {
    GLOBAL
        .get_or_init(|| Arc::new(BatchingClient::new(ReqwestHttpClient::new())))
        .clone()
}

/// Install the global hook client. Idempotent; called on first scope entry.
pub(crate) fn install() {
    let _ = client();
}
