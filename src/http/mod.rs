//! HTTP client abstraction for making requests.
//!
//! This module defines the `HttpClient` trait to abstract HTTP request
//! execution, enabling testability with mock implementations. Both the
//! intercepted application traffic and the engine's own provider calls
//! (uploads, batch creation, polls) flow through this trait.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{BatchlingError, Result};

/// Header set on every HTTP call the engine itself originates, so the
/// interception hook lets uploads and polls pass through untouched.
pub const INTERNAL_HEADER: &str = "x-batchling-internal";

/// Header carried by synthetic responses produced in dry-run mode.
pub const DRY_RUN_HEADER: &str = "x-batchling-dry-run";

/// An HTTP request as seen by the hook and the engine.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method (e.g. "POST", "GET")
    pub method: String,
    /// Absolute URL
    pub url: String,
    /// Header name/value pairs, in insertion order
    pub headers: Vec<(String, String)>,
    /// Raw body bytes (empty for body-less methods)
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Build a GET request with no body.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Build a POST request carrying a JSON body.
    pub fn post_json(url: impl Into<String>, body: &Value) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: body.to_string().into_bytes(),
        }
    }

    /// Build a POST request with a prebuilt body and content type.
    pub fn post_raw(url: impl Into<String>, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: vec![("content-type".to_string(), content_type.to_string())],
            body,
        }
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Append several headers.
    pub fn headers(mut self, headers: &[(String, String)]) -> Self {
        self.headers.extend(headers.iter().cloned());
        self
    }

    /// Mark this request as engine-originated so the hook ignores it.
    pub fn internal(self) -> Self {
        self.header(INTERNAL_HEADER, "1")
    }

    /// Case-insensitive header lookup.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parse the body as JSON.
    pub fn json_body(&self) -> Result<Value> {
        if self.body.is_empty() {
            return Err(BatchlingError::InvalidRequest(
                "request has no body".to_string(),
            ));
        }
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Response from an HTTP request.
///
/// Synthetic responses decoded from batch results use the same type as
/// passthrough responses, so callers cannot tell the two apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Header name/value pairs
    pub headers: Vec<(String, String)>,
    /// Raw body bytes
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Build a 200 response with a JSON body.
    pub fn json_ok(body: &Value) -> Self {
        Self::json_with_status(200, body)
    }

    /// Build a response with the given status and a JSON body.
    pub fn json_with_status(status: u16, body: &Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: body.to_string().into_bytes(),
        }
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body as UTF-8 text (lossy).
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Parse the body as JSON.
    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Trait for executing HTTP requests.
///
/// This abstraction allows for different implementations (production vs.
/// testing) and makes the engine logic testable without real HTTP calls.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Execute an HTTP request and materialize the full response.
    ///
    /// Streaming responses are collected before returning; batch results
    /// are never streamed per token.
    ///
    /// # Errors
    /// Returns an error if the request fails at the transport level
    /// (network, timeout, invalid URL). Non-2xx responses are returned
    /// as responses, not errors.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

/// Production HTTP client using reqwest.
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Create a client with a generous timeout suitable for batch
    /// management calls (uploads, polls).
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method: reqwest::Method = request.method.parse().map_err(|_| {
            BatchlingError::InvalidRequest(format!("invalid HTTP method '{}'", request.method))
        })?;

        let mut req = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            req = req.header(name, value);
        }
        if !request.body.is_empty() {
            req = req.body(request.body.clone());
        }

        let response = req.send().await.map_err(|e| {
            tracing::error!(url = %request.url, error = %e, "HTTP request failed");
            BatchlingError::from(e)
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).to_string(),
                )
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        tracing::debug!(status, body_len = body.len(), "HTTP request completed");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

// ============================================================================
// Test/mock implementation
// ============================================================================

/// One canned mock response, optionally gated on a trigger channel.
struct MockResponse {
    response: HttpResponse,
    trigger: Option<tokio::sync::oneshot::Receiver<()>>,
}

/// Mock HTTP client for testing.
///
/// Allows configuring predetermined responses for specific requests without
/// making actual HTTP calls. Responses are keyed by "{METHOD} {path}" and
/// returned in FIFO order; the last untriggered response for a key is
/// repeated once the queue is down to one entry, which keeps pollers
/// supplied. Triggered responses block until their trigger fires, for
/// tests that pin down in-flight behavior.
#[derive(Clone)]
pub struct MockHttpClient {
    responses: Arc<Mutex<HashMap<String, Vec<MockResponse>>>>,
    calls: Arc<Mutex<Vec<HttpRequest>>>,
    in_flight: Arc<std::sync::atomic::AtomicUsize>,
}

impl MockHttpClient {
    /// Create a new mock HTTP client.
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    /// Add a response for "{METHOD} {path}". Multiple responses for the
    /// same key are returned in FIFO order.
    pub fn add_response(&self, key: &str, response: HttpResponse) {
        self.responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(MockResponse {
                response,
                trigger: None,
            });
    }

    /// Add a 200 JSON response for "{METHOD} {path}".
    pub fn add_json_response(&self, key: &str, body: Value) {
        self.add_response(key, HttpResponse::json_ok(&body));
    }

    /// Add a response that is only returned once the returned sender
    /// fires. The request stays in flight until then.
    pub fn add_response_with_trigger(
        &self,
        key: &str,
        response: HttpResponse,
    ) -> tokio::sync::oneshot::Sender<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.responses
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(MockResponse {
                response,
                trigger: Some(rx),
            });
        tx
    }

    /// All requests executed against this mock, in order.
    pub fn get_calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().clone()
    }

    /// Number of requests executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of requests currently blocked on a trigger.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Number of requests whose path starts with the given prefix.
    pub fn calls_to(&self, path_prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|r| {
                url::Url::parse(&r.url)
                    .map(|u| u.path().starts_with(path_prefix))
                    .unwrap_or(false)
            })
            .count()
    }
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.calls.lock().push(request.clone());

        let path = url::Url::parse(&request.url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| request.url.clone());
        let key = format!("{} {}", request.method, path);

        let entry = {
            let mut responses = self.responses.lock();
            match responses.get_mut(&key) {
                Some(queue) if !queue.is_empty() => {
                    if queue.len() == 1 && queue[0].trigger.is_none() {
                        Some(MockResponse {
                            response: queue[0].response.clone(),
                            trigger: None,
                        })
                    } else {
                        Some(queue.remove(0))
                    }
                }
                _ => None,
            }
        };

        let Some(entry) = entry else {
            return Err(BatchlingError::Internal(format!(
                "no mock response configured for {key}"
            )));
        };

        if let Some(trigger) = entry.trigger {
            use std::sync::atomic::Ordering;
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let in_flight = self.in_flight.clone();
            let _guard = scopeguard::guard((), move |_| {
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });
            let _ = trigger.await;
        }

        Ok(entry.response)
    }
}
