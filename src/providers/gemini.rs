//! Gemini inline batch adapter.
//!
//! The model is a path segment (`/v1beta/models/{model}:generateContent`),
//! batches are created with `:batchGenerateContent` carrying the requests
//! inline, and the response is a long-running operation polled at
//! `/v1beta/{operation_name}`. Once `done`, results come back inlined in
//! the operation response, each tagged with the metadata key assigned at
//! submission.

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;
use uuid::Uuid;

use crate::error::{BatchlingError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::types::QueueKey;

use super::{
    base_url, expect_success, str_field, BatchEndpoint, PathPattern, PollStatus, PollTarget,
    Provider, SubmitOutcome,
};

/// Adapter for the Gemini batch mode API.
pub struct GeminiProvider {
    hosts: Vec<String>,
    endpoints: Vec<BatchEndpoint>,
}

impl GeminiProvider {
    pub fn new() -> Self {
        Self {
            hosts: vec!["generativelanguage.googleapis.com".to_string()],
            endpoints: vec![BatchEndpoint::post(PathPattern::ModelInPath {
                prefix: "/v1beta/models/",
                suffix: ":generateContent",
            })],
        }
    }

    /// Add an authority this adapter should own, for local fixtures.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.hosts.push(host.into());
        self
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)> {
        vec![("x-goog-api-key".to_string(), api_key.to_string())]
    }

    fn terminal_refinement(payload: &Value) -> String {
        match payload
            .pointer("/metadata/state")
            .and_then(Value::as_str)
        {
            Some("BATCH_STATE_SUCCEEDED") => "succeeded".to_string(),
            Some("BATCH_STATE_FAILED") => "failed".to_string(),
            Some("BATCH_STATE_CANCELLED") => "cancelled".to_string(),
            Some("BATCH_STATE_EXPIRED") => "expired".to_string(),
            _ => {
                if payload.get("error").is_some() {
                    "failed".to_string()
                } else {
                    "succeeded".to_string()
                }
            }
        }
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn hostnames(&self) -> &[String] {
        &self.hosts
    }

    fn endpoints(&self) -> &[BatchEndpoint] {
        &self.endpoints
    }

    fn terminal_states(&self) -> &'static [&'static str] {
        &["succeeded", "failed", "cancelled", "expired"]
    }

    fn is_file_based(&self) -> bool {
        false
    }

    fn extract_model(&self, url: &Url, _body: Option<&Value>) -> Result<String> {
        self.endpoints
            .iter()
            .find_map(|e| e.path.extract_model(url.path()))
            .map(str::to_string)
            .ok_or_else(|| {
                BatchlingError::InvalidRequest(format!(
                    "no model segment in path '{}'",
                    url.path()
                ))
            })
    }

    fn build_line(&self, custom_id: &str, _endpoint: &str, body: &Value) -> Result<Value> {
        Ok(json!({
            "request": body,
            "metadata": { "key": custom_id },
        }))
    }

    #[tracing::instrument(skip(self, http, lines, api_key), fields(provider = "gemini", key = %key, count = lines.len()))]
    async fn submit(
        &self,
        http: &dyn HttpClient,
        key: &QueueKey,
        host: &str,
        lines: Vec<Value>,
        api_key: &str,
    ) -> Result<SubmitOutcome> {
        let display_name = format!("batchling-{}", Uuid::new_v4().simple());
        let create = HttpRequest::post_json(
            format!(
                "{}/v1beta/models/{}:batchGenerateContent",
                base_url(host),
                key.model
            ),
            &json!({
                "batch": {
                    "display_name": display_name,
                    "input_config": { "requests": { "requests": lines } },
                }
            }),
        )
        .headers(&self.auth_headers(api_key))
        .internal();

        let payload = expect_success(http.execute(create).await?, "batch create")?;
        let operation_name = str_field(&payload, "name", "batch create")?.to_string();

        tracing::info!(operation = %operation_name, "Created batch operation");

        Ok(SubmitOutcome {
            poll: self.poll_target(host, &operation_name, api_key),
            batch_id: operation_name,
            results_url_template: None,
        })
    }

    fn poll_target(&self, host: &str, batch_id: &str, api_key: &str) -> PollTarget {
        PollTarget {
            url: format!("{}/v1beta/{batch_id}", base_url(host)),
            headers: self.auth_headers(api_key),
        }
    }

    fn extract_status(&self, poll_payload: &Value) -> PollStatus {
        if poll_payload
            .get("done")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return PollStatus::Terminal(Self::terminal_refinement(poll_payload));
        }
        match poll_payload
            .pointer("/metadata/state")
            .and_then(Value::as_str)
        {
            Some("BATCH_STATE_PENDING") => PollStatus::Pending,
            _ => PollStatus::Running,
        }
    }

    async fn fetch_results(
        &self,
        _http: &dyn HttpClient,
        _host: &str,
        poll_payload: &Value,
        _api_key: &str,
    ) -> Result<Vec<String>> {
        // Results are inlined in the operation response; each inlined item
        // becomes one line for decode_line.
        let items = poll_payload
            .pointer("/response/inlinedResponses/inlinedResponses")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(items.iter().map(Value::to_string).collect())
    }

    fn decode_line(&self, line: &str) -> Result<(String, HttpResponse)> {
        let value: Value = serde_json::from_str(line)?;
        let custom_id = value
            .pointer("/metadata/key")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BatchlingError::Provider("inlined response has no metadata key".to_string())
            })?
            .to_string();

        if let Some(response) = value.get("response").filter(|r| !r.is_null()) {
            return Ok((custom_id, HttpResponse::json_ok(response)));
        }

        if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
            let code = error.get("code").and_then(Value::as_u64).unwrap_or(0);
            let status = if (400..600).contains(&code) {
                code as u16
            } else {
                500
            };
            let body = json!({ "error": error });
            return Ok((custom_id, HttpResponse::json_with_status(status, &body)));
        }

        Err(BatchlingError::Provider(format!(
            "inlined response for '{custom_id}' has neither response nor error"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_is_extracted_from_the_path() {
        let provider = GeminiProvider::new();
        let url = Url::parse(
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent",
        )
        .unwrap();
        assert_eq!(provider.extract_model(&url, None).unwrap(), "gemini-2.0-flash");

        let url = Url::parse("https://generativelanguage.googleapis.com/v1beta/models").unwrap();
        assert!(provider.extract_model(&url, None).is_err());
    }

    #[test]
    fn status_follows_done_and_state() {
        let provider = GeminiProvider::new();
        assert_eq!(
            provider.extract_status(
                &json!({"done": false, "metadata": {"state": "BATCH_STATE_PENDING"}})
            ),
            PollStatus::Pending
        );
        assert_eq!(
            provider.extract_status(
                &json!({"done": false, "metadata": {"state": "BATCH_STATE_RUNNING"}})
            ),
            PollStatus::Running
        );
        assert_eq!(
            provider.extract_status(
                &json!({"done": true, "metadata": {"state": "BATCH_STATE_SUCCEEDED"}})
            ),
            PollStatus::Terminal("succeeded".to_string())
        );
        assert_eq!(
            provider.extract_status(&json!({"done": true, "error": {"code": 13}})),
            PollStatus::Terminal("failed".to_string())
        );
    }

    #[test]
    fn decode_inlined_success_and_error() {
        let provider = GeminiProvider::new();

        let (id, response) = provider
            .decode_line(r#"{"metadata":{"key":"req-0"},"response":{"candidates":[]}}"#)
            .unwrap();
        assert_eq!(id, "req-0");
        assert_eq!(response.status, 200);

        let (id, response) = provider
            .decode_line(r#"{"metadata":{"key":"req-1"},"error":{"code":429,"message":"quota"}}"#)
            .unwrap();
        assert_eq!(id, "req-1");
        assert_eq!(response.status, 429);
    }

    #[tokio::test]
    async fn submit_inlines_requests_under_the_model_path() {
        let http = crate::http::MockHttpClient::new();
        http.add_json_response(
            "POST /v1beta/models/gemini-2.0-flash:batchGenerateContent",
            json!({"name": "batches/abc123", "metadata": {"state": "BATCH_STATE_PENDING"}}),
        );

        let provider = GeminiProvider::new();
        let key = QueueKey {
            provider: "gemini",
            endpoint: "/v1beta/models/{model}:generateContent".to_string(),
            model: "gemini-2.0-flash".to_string(),
        };
        let line = provider
            .build_line("req-0", &key.endpoint, &json!({"contents": []}))
            .unwrap();

        let outcome = provider
            .submit(
                &http,
                &key,
                "generativelanguage.googleapis.com",
                vec![line],
                "g-key",
            )
            .await
            .unwrap();

        assert_eq!(outcome.batch_id, "batches/abc123");
        assert!(outcome.poll.url.ends_with("/v1beta/batches/abc123"));

        let body = http.get_calls()[0].json_body().unwrap();
        assert_eq!(
            body["batch"]["input_config"]["requests"]["requests"][0]["metadata"]["key"],
            "req-0"
        );
    }
}
