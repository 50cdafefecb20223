//! Anthropic inline batch adapter.
//!
//! The Messages batch API takes the request entries inline (no file
//! upload): `POST /v1/messages/batches` with `{custom_id, params}` pairs.
//! The poll payload exposes `processing_status` and, once ended, a
//! `results_url` serving JSONL lines whose `result.type` distinguishes
//! succeeded, errored, canceled, and expired entries.

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;

use crate::error::{BatchlingError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::types::QueueKey;

use super::{
    base_url, expect_success, jsonl_lines, model_from_body, str_field, BatchEndpoint, PathPattern,
    PollStatus, PollTarget, Provider, SubmitOutcome,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Adapter for the Anthropic Messages batch API.
pub struct AnthropicProvider {
    hosts: Vec<String>,
    endpoints: Vec<BatchEndpoint>,
}

impl AnthropicProvider {
    pub fn new() -> Self {
        Self {
            hosts: vec!["api.anthropic.com".to_string()],
            endpoints: vec![BatchEndpoint::post(PathPattern::Exact("/v1/messages"))],
        }
    }

    /// Add an authority this adapter should own, for local fixtures.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.hosts.push(host.into());
        self
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)> {
        vec![
            ("x-api-key".to_string(), api_key.to_string()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        ]
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn hostnames(&self) -> &[String] {
        &self.hosts
    }

    fn endpoints(&self) -> &[BatchEndpoint] {
        &self.endpoints
    }

    fn terminal_states(&self) -> &'static [&'static str] {
        &["ended"]
    }

    fn is_file_based(&self) -> bool {
        false
    }

    fn extract_model(&self, _url: &Url, body: Option<&Value>) -> Result<String> {
        model_from_body(body)
    }

    fn build_line(&self, custom_id: &str, _endpoint: &str, body: &Value) -> Result<Value> {
        Ok(json!({
            "custom_id": custom_id,
            "params": body,
        }))
    }

    #[tracing::instrument(skip(self, http, lines, api_key), fields(provider = "anthropic", key = %key, count = lines.len()))]
    async fn submit(
        &self,
        http: &dyn HttpClient,
        key: &QueueKey,
        host: &str,
        lines: Vec<Value>,
        api_key: &str,
    ) -> Result<SubmitOutcome> {
        let create = HttpRequest::post_json(
            format!("{}/v1/messages/batches", base_url(host)),
            &json!({ "requests": lines }),
        )
        .headers(&self.auth_headers(api_key))
        .internal();

        let payload = expect_success(http.execute(create).await?, "batch create")?;
        let batch_id = str_field(&payload, "id", "batch create")?.to_string();

        tracing::info!(batch_id = %batch_id, "Created message batch");

        Ok(SubmitOutcome {
            poll: self.poll_target(host, &batch_id, api_key),
            batch_id,
            results_url_template: None,
        })
    }

    fn poll_target(&self, host: &str, batch_id: &str, api_key: &str) -> PollTarget {
        PollTarget {
            url: format!("{}/v1/messages/batches/{batch_id}", base_url(host)),
            headers: self.auth_headers(api_key),
        }
    }

    fn extract_status(&self, poll_payload: &Value) -> PollStatus {
        match poll_payload.get("processing_status").and_then(Value::as_str) {
            Some("ended") => PollStatus::Terminal("ended".to_string()),
            // in_progress and canceling keep the poller going; canceling
            // still transitions to ended with canceled result lines.
            _ => PollStatus::Running,
        }
    }

    async fn fetch_results(
        &self,
        http: &dyn HttpClient,
        _host: &str,
        poll_payload: &Value,
        api_key: &str,
    ) -> Result<Vec<String>> {
        let results_url = str_field(poll_payload, "results_url", "batch poll")?;
        let request = HttpRequest::get(results_url)
            .headers(&self.auth_headers(api_key))
            .internal();
        let response = http.execute(request).await?;
        if !response.is_success() {
            return Err(BatchlingError::Provider(format!(
                "results download returned {}: {}",
                response.status,
                response.text()
            )));
        }
        Ok(jsonl_lines(&response.text()))
    }

    fn decode_line(&self, line: &str) -> Result<(String, HttpResponse)> {
        let value: Value = serde_json::from_str(line)?;
        let custom_id = str_field(&value, "custom_id", "result line")?.to_string();
        let result = value
            .get("result")
            .ok_or_else(|| BatchlingError::Provider("result line has no 'result'".to_string()))?;

        let response = match result.get("type").and_then(Value::as_str) {
            Some("succeeded") => {
                let message = result.get("message").cloned().unwrap_or(Value::Null);
                HttpResponse::json_ok(&message)
            }
            Some("errored") => {
                let error = result.get("error").cloned().unwrap_or(Value::Null);
                let status = if error.to_string().contains("invalid_request") {
                    400
                } else {
                    500
                };
                HttpResponse::json_with_status(status, &error)
            }
            Some(other @ ("canceled" | "expired")) => HttpResponse::json_with_status(
                500,
                &json!({
                    "type": "error",
                    "error": {
                        "type": format!("request_{other}"),
                        "message": format!("batch request was {other} before completion"),
                    }
                }),
            ),
            other => {
                return Err(BatchlingError::Provider(format!(
                    "unknown result type {other:?} for '{custom_id}'"
                )))
            }
        };

        Ok((custom_id, response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_line_wraps_params() {
        let provider = AnthropicProvider::new();
        let body = json!({"model": "claude-sonnet-4-20250514", "max_tokens": 1024});
        let line = provider.build_line("req-2", "/v1/messages", &body).unwrap();
        assert_eq!(line["custom_id"], "req-2");
        assert_eq!(line["params"], body);
    }

    #[test]
    fn only_ended_is_terminal() {
        let provider = AnthropicProvider::new();
        assert_eq!(
            provider.extract_status(&json!({"processing_status": "in_progress"})),
            PollStatus::Running
        );
        assert_eq!(
            provider.extract_status(&json!({"processing_status": "canceling"})),
            PollStatus::Running
        );
        assert_eq!(
            provider.extract_status(&json!({"processing_status": "ended"})),
            PollStatus::Terminal("ended".to_string())
        );
    }

    #[test]
    fn decode_succeeded_line() {
        let provider = AnthropicProvider::new();
        let line = r#"{"custom_id":"req-0","result":{"type":"succeeded","message":{"id":"msg_1","role":"assistant"}}}"#;
        let (id, response) = provider.decode_line(line).unwrap();
        assert_eq!(id, "req-0");
        assert_eq!(response.status, 200);
        assert_eq!(response.json().unwrap()["id"], "msg_1");
    }

    #[test]
    fn decode_errored_line_keeps_the_error_envelope() {
        let provider = AnthropicProvider::new();
        let line = r#"{"custom_id":"req-1","result":{"type":"errored","error":{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}}}"#;
        let (id, response) = provider.decode_line(line).unwrap();
        assert_eq!(id, "req-1");
        assert_eq!(response.status, 400);
    }

    #[test]
    fn decode_expired_line_synthesizes_an_error() {
        let provider = AnthropicProvider::new();
        let line = r#"{"custom_id":"req-9","result":{"type":"expired"}}"#;
        let (id, response) = provider.decode_line(line).unwrap();
        assert_eq!(id, "req-9");
        assert_eq!(response.status, 500);
        assert_eq!(response.json().unwrap()["error"]["type"], "request_expired");
    }

    #[tokio::test]
    async fn submit_is_one_inline_post() {
        let http = crate::http::MockHttpClient::new();
        http.add_json_response(
            "POST /v1/messages/batches",
            json!({"id": "msgbatch_1", "processing_status": "in_progress"}),
        );

        let provider = AnthropicProvider::new();
        let key = QueueKey {
            provider: "anthropic",
            endpoint: "/v1/messages".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
        };
        let line = provider
            .build_line("req-0", &key.endpoint, &json!({"model": "claude-sonnet-4-20250514"}))
            .unwrap();

        let outcome = provider
            .submit(&http, &key, "api.anthropic.com", vec![line], "sk-ant")
            .await
            .unwrap();

        assert_eq!(outcome.batch_id, "msgbatch_1");
        assert_eq!(http.call_count(), 1);

        let call = &http.get_calls()[0];
        assert_eq!(call.get_header("x-api-key"), Some("sk-ant"));
        assert_eq!(call.json_body().unwrap()["requests"][0]["custom_id"], "req-0");
    }
}
