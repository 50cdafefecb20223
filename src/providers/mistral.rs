//! Mistral file-based batch adapter.
//!
//! Same upload-then-create shape as OpenAI but with its own job endpoint
//! (`/v1/batch/jobs`), SCREAMING_SNAKE_CASE statuses, and `output_file` /
//! `error_file` fields on the poll payload.

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;
use uuid::Uuid;

use crate::error::{BatchlingError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::types::QueueKey;

use super::{
    base_url, decode_file_result_line, expect_success, jsonl_lines, model_from_body,
    multipart_form, str_field, BatchEndpoint, PathPattern, PollStatus, PollTarget, Provider,
    SubmitOutcome,
};

/// Adapter for the Mistral batch API.
pub struct MistralProvider {
    hosts: Vec<String>,
    endpoints: Vec<BatchEndpoint>,
}

impl MistralProvider {
    pub fn new() -> Self {
        Self {
            hosts: vec!["api.mistral.ai".to_string()],
            endpoints: vec![
                BatchEndpoint::post(PathPattern::Exact("/v1/chat/completions")),
                BatchEndpoint::post(PathPattern::Exact("/v1/embeddings")),
            ],
        }
    }

    /// Add an authority this adapter should own, for local fixtures.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.hosts.push(host.into());
        self
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)> {
        vec![("authorization".to_string(), format!("Bearer {api_key}"))]
    }

    async fn fetch_file(
        &self,
        http: &dyn HttpClient,
        host: &str,
        file_id: &str,
        api_key: &str,
    ) -> Result<Vec<String>> {
        let url = format!("{}/v1/files/{file_id}/content", base_url(host));
        let request = HttpRequest::get(url)
            .headers(&self.auth_headers(api_key))
            .internal();
        let response = http.execute(request).await?;
        if !response.is_success() {
            return Err(BatchlingError::Provider(format!(
                "file download returned {}: {}",
                response.status,
                response.text()
            )));
        }
        Ok(jsonl_lines(&response.text()))
    }
}

impl Default for MistralProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MistralProvider {
    fn name(&self) -> &'static str {
        "mistral"
    }

    fn hostnames(&self) -> &[String] {
        &self.hosts
    }

    fn endpoints(&self) -> &[BatchEndpoint] {
        &self.endpoints
    }

    fn terminal_states(&self) -> &'static [&'static str] {
        &["SUCCESS", "FAILED", "TIMEOUT_EXCEEDED", "CANCELLED"]
    }

    fn is_file_based(&self) -> bool {
        true
    }

    fn extract_model(&self, _url: &Url, body: Option<&Value>) -> Result<String> {
        model_from_body(body)
    }

    fn build_line(&self, custom_id: &str, endpoint: &str, body: &Value) -> Result<Value> {
        Ok(json!({
            "custom_id": custom_id,
            "method": "POST",
            "url": endpoint,
            "body": body,
        }))
    }

    #[tracing::instrument(skip(self, http, lines, api_key), fields(provider = "mistral", key = %key, count = lines.len()))]
    async fn submit(
        &self,
        http: &dyn HttpClient,
        key: &QueueKey,
        host: &str,
        lines: Vec<Value>,
        api_key: &str,
    ) -> Result<SubmitOutcome> {
        let jsonl = lines
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n")
            .into_bytes();

        let boundary = format!("batchling{}", Uuid::new_v4().simple());
        let upload = HttpRequest::post_raw(
            format!("{}/v1/files", base_url(host)),
            &format!("multipart/form-data; boundary={boundary}"),
            multipart_form(&boundary, "batch", "batch_input.jsonl", &jsonl),
        )
        .headers(&self.auth_headers(api_key))
        .internal();

        let payload = expect_success(http.execute(upload).await?, "file upload")?;
        let input_file_id = str_field(&payload, "id", "file upload")?.to_string();

        let create = HttpRequest::post_json(
            format!("{}/v1/batch/jobs", base_url(host)),
            &json!({
                "input_files": [input_file_id],
                "endpoint": key.endpoint,
                "model": key.model,
            }),
        )
        .headers(&self.auth_headers(api_key))
        .internal();

        let payload = expect_success(http.execute(create).await?, "batch job create")?;
        let batch_id = str_field(&payload, "id", "batch job create")?.to_string();

        tracing::info!(batch_id = %batch_id, "Created batch job");

        Ok(SubmitOutcome {
            poll: self.poll_target(host, &batch_id, api_key),
            batch_id,
            results_url_template: None,
        })
    }

    fn poll_target(&self, host: &str, batch_id: &str, api_key: &str) -> PollTarget {
        PollTarget {
            url: format!("{}/v1/batch/jobs/{batch_id}", base_url(host)),
            headers: self.auth_headers(api_key),
        }
    }

    fn extract_status(&self, poll_payload: &Value) -> PollStatus {
        match poll_payload.get("status").and_then(Value::as_str) {
            Some("QUEUED") => PollStatus::Pending,
            Some(status) if self.terminal_states().contains(&status) => {
                PollStatus::Terminal(status.to_string())
            }
            // RUNNING and CANCELLATION_REQUESTED keep the poller going.
            _ => PollStatus::Running,
        }
    }

    async fn fetch_results(
        &self,
        http: &dyn HttpClient,
        host: &str,
        poll_payload: &Value,
        api_key: &str,
    ) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for field in ["output_file", "error_file"] {
            if let Some(file_id) = poll_payload.get(field).and_then(Value::as_str) {
                lines.extend(self.fetch_file(http, host, file_id, api_key).await?);
            }
        }
        Ok(lines)
    }

    fn decode_line(&self, line: &str) -> Result<(String, HttpResponse)> {
        decode_file_result_line(line)
    }
}
