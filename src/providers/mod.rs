//! Provider adapters and the registry that routes requests to them.
//!
//! Each adapter describes one provider's batch API: which hostnames it
//! owns, which synchronous endpoints have a batch counterpart, how to
//! assemble and submit the batch artifact, how to read poll payloads, and
//! how to turn each result line back into a synchronous-shaped response.
//! The engine only ever talks to the [`Provider`] trait.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::error::{BatchlingError, Result};
use crate::http::{HttpClient, HttpResponse};
use crate::types::QueueKey;

pub mod anthropic;
pub mod gemini;
pub mod mistral;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use mistral::MistralProvider;
pub use openai::OpenAiCompatProvider;

/// Method + path pattern of one batchable endpoint.
#[derive(Debug, Clone)]
pub struct BatchEndpoint {
    pub method: &'static str,
    pub path: PathPattern,
}

impl BatchEndpoint {
    pub fn post(path: PathPattern) -> Self {
        Self {
            method: "POST",
            path,
        }
    }

    pub fn matches(&self, method: &str, path: &str) -> bool {
        method.eq_ignore_ascii_case(self.method) && self.path.matches(path)
    }
}

/// Path shape of a batchable endpoint.
#[derive(Debug, Clone)]
pub enum PathPattern {
    /// Fixed path, e.g. `/v1/chat/completions`
    Exact(&'static str),

    /// Model appears as a path segment between a fixed prefix and suffix,
    /// e.g. `/v1beta/models/{model}:generateContent`
    ModelInPath {
        prefix: &'static str,
        suffix: &'static str,
    },
}

impl PathPattern {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(exact) => path == *exact,
            PathPattern::ModelInPath { prefix, suffix } => path
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(suffix))
                .is_some_and(|model| !model.is_empty() && !model.contains('/')),
        }
    }

    /// The model segment, for model-in-path endpoints.
    pub fn extract_model<'a>(&self, path: &'a str) -> Option<&'a str> {
        match self {
            PathPattern::Exact(_) => None,
            PathPattern::ModelInPath { prefix, suffix } => path
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(suffix))
                .filter(|model| !model.is_empty() && !model.contains('/')),
        }
    }

    /// Canonical form used in queue keys, with a `{model}` placeholder for
    /// model-parameterized paths.
    pub fn canonical(&self) -> String {
        match self {
            PathPattern::Exact(exact) => (*exact).to_string(),
            PathPattern::ModelInPath { prefix, suffix } => format!("{prefix}{{model}}{suffix}"),
        }
    }
}

/// Where and how to poll a submitted batch.
#[derive(Debug, Clone)]
pub struct PollTarget {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// Result of a provider-specific batch submission.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    /// Provider-assigned batch identifier
    pub batch_id: String,

    /// Poll instructions for this batch
    pub poll: PollTarget,

    /// Results location when it is fixed at submission time instead of
    /// carried by the poll payload
    pub results_url_template: Option<String>,
}

/// Normalized batch status derived from an arbitrary poll payload shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Queued provider-side, not yet processing
    Pending,

    /// Processing (includes provider refinements like validating or
    /// finalizing that still require further polling)
    Running,

    /// Stopped, carrying the provider's terminal refinement
    /// ("completed", "failed", "expired", "cancelled", ...)
    Terminal(String),
}

impl PollStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PollStatus::Terminal(_))
    }
}

/// A provider's batch API surface.
///
/// Implementations are stateless apart from their hostname configuration;
/// credentials are read from the environment at submission time and passed
/// back in for every outbound call.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registered provider name, also the queue-key provider component.
    fn name(&self) -> &'static str;

    /// Authorities (host, or host:port) this adapter owns.
    fn hostnames(&self) -> &[String];

    /// Synchronous endpoints with a batch counterpart.
    fn endpoints(&self) -> &[BatchEndpoint];

    /// Poll statuses after which the batch will make no further progress.
    fn terminal_states(&self) -> &'static [&'static str];

    /// True when submission uploads a JSONL file; false for inline APIs.
    fn is_file_based(&self) -> bool;

    /// Environment variable consulted for credentials at submission time.
    fn api_key_env(&self) -> String {
        format!("{}_API_KEY", self.name().to_uppercase())
    }

    /// Read the credential from the environment.
    fn api_key(&self) -> Result<String> {
        std::env::var(self.api_key_env())
            .map_err(|_| BatchlingError::Auth(format!("{} is not set", self.api_key_env())))
    }

    /// The model a request targets, from the body or the URL path.
    fn extract_model(&self, url: &Url, body: Option<&Value>) -> Result<String>;

    /// One entry of the batch-input artifact for a single request.
    fn build_line(&self, custom_id: &str, endpoint: &str, body: &Value) -> Result<Value>;

    /// Perform the provider-specific submission (file upload + job
    /// creation, or one inline POST).
    async fn submit(
        &self,
        http: &dyn HttpClient,
        key: &QueueKey,
        host: &str,
        lines: Vec<Value>,
        api_key: &str,
    ) -> Result<SubmitOutcome>;

    /// Reconstruct poll instructions from a cached `(host, batch_id)`.
    fn poll_target(&self, host: &str, batch_id: &str, api_key: &str) -> PollTarget;

    /// Normalize a poll payload into a status.
    fn extract_status(&self, poll_payload: &Value) -> PollStatus;

    /// Retrieve the raw result lines of a terminal batch. Error-file lines
    /// are included; `decode_line` handles both.
    async fn fetch_results(
        &self,
        http: &dyn HttpClient,
        host: &str,
        poll_payload: &Value,
        api_key: &str,
    ) -> Result<Vec<String>>;

    /// Decode one result line into the custom-id it answers and a
    /// response shaped like the synchronous endpoint's.
    fn decode_line(&self, line: &str) -> Result<(String, HttpResponse)>;
}

/// The set of known adapters, looked up by hostname first and batchable
/// endpoint second. A request matching a known host but no endpoint is
/// non-batchable and passes through.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

/// A request matched to the adapter that owns it.
#[derive(Clone)]
pub struct MatchedEndpoint {
    pub provider: Arc<dyn Provider>,
    /// Canonical endpoint path for the queue key
    pub endpoint: String,
    /// Authority of the intercepted URL
    pub host: String,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self { providers }
    }

    /// Registry with the built-in adapters on their production hostnames.
    pub fn with_default_providers() -> Self {
        Self::new(vec![
            Arc::new(OpenAiCompatProvider::openai()),
            Arc::new(OpenAiCompatProvider::groq()),
            Arc::new(MistralProvider::new()),
            Arc::new(AnthropicProvider::new()),
            Arc::new(GeminiProvider::new()),
        ])
    }

    /// Match a request against the registered adapters. Conservative:
    /// unknown hosts and unknown paths never match.
    pub fn match_request(&self, method: &str, url: &Url) -> Option<MatchedEndpoint> {
        let host = authority(url)?;
        let provider = self
            .providers
            .iter()
            .find(|p| p.hostnames().iter().any(|h| h == &host))?;

        let path = url.path();
        let endpoint = provider
            .endpoints()
            .iter()
            .find(|e| e.matches(method, path))?;

        Some(MatchedEndpoint {
            provider: provider.clone(),
            endpoint: endpoint.path.canonical(),
            host,
        })
    }

    /// Look an adapter up by its registered name.
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_default_providers()
    }
}

/// `host` or `host:port` of a URL.
pub(crate) fn authority(url: &Url) -> Option<String> {
    url.host_str().map(|host| match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Scheme + authority for building provider URLs from a cached host.
/// Loopback hosts are plain HTTP so local fixtures work.
pub(crate) fn base_url(host: &str) -> String {
    if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
        format!("http://{host}")
    } else {
        format!("https://{host}")
    }
}

/// Parse a 2xx response body as JSON, or surface the provider's error.
pub(crate) fn expect_success(response: HttpResponse, what: &str) -> Result<Value> {
    if response.status == 401 || response.status == 403 {
        return Err(BatchlingError::Auth(format!(
            "{what} rejected the credential ({})",
            response.status
        )));
    }
    if !response.is_success() {
        return Err(BatchlingError::Provider(format!(
            "{what} returned {}: {}",
            response.status,
            response.text()
        )));
    }
    response.json()
}

/// Required string field of a provider payload.
pub(crate) fn str_field<'a>(payload: &'a Value, field: &str, what: &str) -> Result<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| BatchlingError::Provider(format!("missing '{field}' in {what} response")))
}

/// Required `model` field of a request body.
pub(crate) fn model_from_body(body: Option<&Value>) -> Result<String> {
    body.and_then(|b| b.get("model"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            BatchlingError::InvalidRequest("request body has no 'model' field".to_string())
        })
}

/// Encode a `purpose` + `file` multipart form the way batch file-upload
/// endpoints expect it.
pub(crate) fn multipart_form(boundary: &str, purpose: &str, filename: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 512);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"purpose\"\r\n\r\n");
    body.extend_from_slice(purpose.as_bytes());
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/jsonl\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}

/// Decode one line of a file-based provider's output or error artifact
/// (`{custom_id, response: {status_code, body}, error}`).
pub(crate) fn decode_file_result_line(line: &str) -> Result<(String, HttpResponse)> {
    let value: Value = serde_json::from_str(line)?;
    let custom_id = str_field(&value, "custom_id", "result line")?.to_string();

    if let Some(response) = value.get("response").filter(|r| !r.is_null()) {
        let status = response
            .get("status_code")
            .and_then(Value::as_u64)
            .unwrap_or(200) as u16;
        let body = response.get("body").cloned().unwrap_or(Value::Null);
        return Ok((custom_id, HttpResponse::json_with_status(status, &body)));
    }

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let body = serde_json::json!({ "error": error });
        return Ok((custom_id, HttpResponse::json_with_status(500, &body)));
    }

    Err(BatchlingError::Provider(format!(
        "result line for '{custom_id}' has neither response nor error"
    )))
}

/// Split a results artifact into its non-empty lines.
pub(crate) fn jsonl_lines(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_matches_only_its_path() {
        let pattern = PathPattern::Exact("/v1/chat/completions");
        assert!(pattern.matches("/v1/chat/completions"));
        assert!(!pattern.matches("/v1/chat/completions/extra"));
        assert!(!pattern.matches("/v1/embeddings"));
    }

    #[test]
    fn model_in_path_pattern_extracts_the_model() {
        let pattern = PathPattern::ModelInPath {
            prefix: "/v1beta/models/",
            suffix: ":generateContent",
        };
        assert!(pattern.matches("/v1beta/models/gemini-2.0-flash:generateContent"));
        assert_eq!(
            pattern.extract_model("/v1beta/models/gemini-2.0-flash:generateContent"),
            Some("gemini-2.0-flash")
        );
        assert!(!pattern.matches("/v1beta/models/:generateContent"));
        assert!(!pattern.matches("/v1beta/models/a/b:generateContent"));
    }

    #[test]
    fn registry_matches_host_then_endpoint() {
        let registry = ProviderRegistry::with_default_providers();

        let url = Url::parse("https://api.openai.com/v1/chat/completions").unwrap();
        let matched = registry.match_request("POST", &url).unwrap();
        assert_eq!(matched.provider.name(), "openai");
        assert_eq!(matched.endpoint, "/v1/chat/completions");
        assert_eq!(matched.host, "api.openai.com");

        // Known host, unknown path: non-batchable.
        let url = Url::parse("https://api.openai.com/v1/models").unwrap();
        assert!(registry.match_request("GET", &url).is_none());

        // Unknown host: non-batchable.
        let url = Url::parse("https://example.com/v1/chat/completions").unwrap();
        assert!(registry.match_request("POST", &url).is_none());
    }

    #[test]
    fn registry_keeps_ports_in_the_authority() {
        let url = Url::parse("http://127.0.0.1:9999/v1/chat/completions").unwrap();
        assert_eq!(authority(&url).unwrap(), "127.0.0.1:9999");
    }

    #[test]
    fn base_url_uses_http_for_loopback() {
        assert_eq!(base_url("127.0.0.1:9999"), "http://127.0.0.1:9999");
        assert_eq!(base_url("api.openai.com"), "https://api.openai.com");
    }

    #[test]
    fn decode_file_result_line_success_and_error() {
        let (id, response) = decode_file_result_line(
            r#"{"custom_id":"req-0","response":{"status_code":200,"body":{"ok":true}}}"#,
        )
        .unwrap();
        assert_eq!(id, "req-0");
        assert_eq!(response.status, 200);
        assert_eq!(response.json().unwrap()["ok"], true);

        let (id, response) = decode_file_result_line(
            r#"{"custom_id":"req-1","error":{"code":"server_error","message":"boom"}}"#,
        )
        .unwrap();
        assert_eq!(id, "req-1");
        assert_eq!(response.status, 500);
        assert_eq!(response.json().unwrap()["error"]["code"], "server_error");
    }

    #[test]
    fn multipart_form_is_well_formed() {
        let body = multipart_form("bnd", "batch", "input.jsonl", b"{\"a\":1}\n{\"b\":2}");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("--bnd\r\n"));
        assert!(text.contains("name=\"purpose\"\r\n\r\nbatch"));
        assert!(text.contains("filename=\"input.jsonl\""));
        assert!(text.ends_with("--bnd--\r\n"));
    }
}
