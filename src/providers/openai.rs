//! OpenAI-compatible file-based batch adapter.
//!
//! Covers OpenAI itself and providers that replicate its batch API under a
//! path prefix (Groq serves the same surface under `/openai/v1`). The flow
//! is upload-then-create: a JSONL artifact goes to the files endpoint with
//! `purpose=batch`, a batch job references the uploaded file, and results
//! arrive as output and error files downloaded line by line.

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;
use uuid::Uuid;

use crate::error::Result;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::types::QueueKey;

use super::{
    base_url, decode_file_result_line, expect_success, jsonl_lines, model_from_body,
    multipart_form, str_field, BatchEndpoint, PathPattern, PollStatus, PollTarget, Provider,
    SubmitOutcome,
};

/// File-based adapter for OpenAI and OpenAI-compatible batch APIs.
pub struct OpenAiCompatProvider {
    name: &'static str,
    hosts: Vec<String>,
    endpoints: Vec<BatchEndpoint>,
    /// Path prefix in front of `/v1/...` (empty for OpenAI, `/openai`
    /// for Groq). Stripped when talking to the batch API, which expects
    /// unprefixed endpoint names.
    prefix: &'static str,
}

impl OpenAiCompatProvider {
    /// The OpenAI adapter on its production hostname.
    pub fn openai() -> Self {
        Self {
            name: "openai",
            hosts: vec!["api.openai.com".to_string()],
            endpoints: vec![
                BatchEndpoint::post(PathPattern::Exact("/v1/chat/completions")),
                BatchEndpoint::post(PathPattern::Exact("/v1/completions")),
                BatchEndpoint::post(PathPattern::Exact("/v1/embeddings")),
                BatchEndpoint::post(PathPattern::Exact("/v1/responses")),
            ],
            prefix: "",
        }
    }

    /// The Groq adapter, which serves the OpenAI surface under `/openai`.
    pub fn groq() -> Self {
        Self {
            name: "groq",
            hosts: vec!["api.groq.com".to_string()],
            endpoints: vec![BatchEndpoint::post(PathPattern::Exact(
                "/openai/v1/chat/completions",
            ))],
            prefix: "/openai",
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

    /// Endpoint name as the batch API expects it, without the path prefix.
    fn api_endpoint<'a>(&self, endpoint: &'a str) -> &'a str {
        endpoint.strip_prefix(self.prefix).unwrap_or(endpoint)
    }

    async fn fetch_file(
        &self,
        http: &dyn HttpClient,
        host: &str,
        file_id: &str,
        api_key: &str,
    ) -> Result<Vec<String>> {
        let url = format!(
            "{}{}/v1/files/{file_id}/content",
            base_url(host),
            self.prefix
        );
        let request = HttpRequest::get(url)
            .headers(&self.auth_headers(api_key))
            .internal();
        let response = http.execute(request).await?;
        if !response.is_success() {
            return Err(crate::error::BatchlingError::Provider(format!(
                "file download returned {}: {}",
                response.status,
                response.text()
            )));
        }
        Ok(jsonl_lines(&response.text()))
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn hostnames(&self) -> &[String] {
        &self.hosts
    }

    fn endpoints(&self) -> &[BatchEndpoint] {
        &self.endpoints
    }

    fn terminal_states(&self) -> &'static [&'static str] {
        &["completed", "failed", "expired", "cancelled"]
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
            "url": self.api_endpoint(endpoint),
            "body": body,
        }))
    }

    #[tracing::instrument(skip(self, http, lines, api_key), fields(provider = self.name, key = %key, count = lines.len()))]
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
            format!("{}{}/v1/files", base_url(host), self.prefix),
            &format!("multipart/form-data; boundary={boundary}"),
            multipart_form(&boundary, "batch", "batch_input.jsonl", &jsonl),
        )
        .headers(&self.auth_headers(api_key))
        .internal();

        let payload = expect_success(http.execute(upload).await?, "file upload")?;
        let input_file_id = str_field(&payload, "id", "file upload")?.to_string();

        tracing::debug!(file_id = %input_file_id, "Uploaded batch input file");

        let create = HttpRequest::post_json(
            format!("{}{}/v1/batches", base_url(host), self.prefix),
            &json!({
                "input_file_id": input_file_id,
                "endpoint": self.api_endpoint(&key.endpoint),
                "completion_window": "24h",
            }),
        )
        .headers(&self.auth_headers(api_key))
        .internal();

        let payload = expect_success(http.execute(create).await?, "batch create")?;
        let batch_id = str_field(&payload, "id", "batch create")?.to_string();

        tracing::info!(batch_id = %batch_id, "Created provider batch");

        Ok(SubmitOutcome {
            poll: self.poll_target(host, &batch_id, api_key),
            batch_id,
            results_url_template: None,
        })
    }

    fn poll_target(&self, host: &str, batch_id: &str, api_key: &str) -> PollTarget {
        PollTarget {
            url: format!("{}{}/v1/batches/{batch_id}", base_url(host), self.prefix),
            headers: self.auth_headers(api_key),
        }
    }

    fn extract_status(&self, poll_payload: &Value) -> PollStatus {
        match poll_payload.get("status").and_then(Value::as_str) {
            Some("validating") => PollStatus::Pending,
            Some(status) if self.terminal_states().contains(&status) => {
                PollStatus::Terminal(status.to_string())
            }
            // in_progress, finalizing, cancelling, and anything new keep
            // the poller going.
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
        for field in ["output_file_id", "error_file_id"] {
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
