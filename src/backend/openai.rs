//! OpenAI Batch API client
//!
//! Uploads requests as a JSONL file, creates a batch against the chat
//! completions endpoint, polls `/batches/{id}`, and downloads the output and
//! error files. Rate limits, server errors, and transport failures map to
//! `BackendError::Transient`; the submitter decides whether to retry.

use super::traits::InferenceBackend;
use super::types::{
    BackendError, BackendResult, BatchMetadata, BatchRequest, BatchResult, RemoteStatus,
    RequestCounts, StatusReport, CHAT_COMPLETIONS_URL,
};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const COMPLETION_WINDOW: &str = "24h";

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchObject {
    id: String,
    status: RemoteStatus,
    #[serde(default)]
    request_counts: Option<RequestCounts>,
    #[serde(default)]
    output_file_id: Option<String>,
    #[serde(default)]
    error_file_id: Option<String>,
}

/// Client for the OpenAI Batch API
#[derive(Debug, Clone)]
pub struct OpenAiBatchClient {
    http: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiBatchClient {
    pub fn new(api_key: impl Into<String>) -> BackendResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| BackendError::Rejected(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Build from `OPENAI_API_KEY` (and optional `OPENAI_BASE_URL`).
    pub fn from_env() -> BackendResult<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| BackendError::Rejected("OPENAI_API_KEY is not set".to_string()))?;
        let client = Self::new(api_key)?;
        Ok(match std::env::var("OPENAI_BASE_URL") {
            Ok(url) if !url.trim().is_empty() => client.with_base_url(url),
            _ => client,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn transport(e: reqwest::Error) -> BackendError {
        BackendError::Transient(e.to_string())
    }

    fn classify(status: StatusCode, body: &str) -> BackendError {
        let snippet: String = body.chars().take(500).collect();
        let detail = format!("HTTP {}: {}", status.as_u16(), snippet);
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            BackendError::Transient(detail)
        } else if status == StatusCode::NOT_FOUND {
            BackendError::NotFound(detail)
        } else {
            BackendError::Rejected(detail)
        }
    }

    async fn checked(response: Response) -> BackendResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify(status, &body))
    }

    async fn json<T: DeserializeOwned>(response: Response) -> BackendResult<T> {
        let response = Self::checked(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }

    async fn get_batch(&self, batch_id: &str) -> BackendResult<BatchObject> {
        let response = self
            .http
            .get(self.url(&format!("/batches/{}", batch_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(Self::transport)?;
        Self::json(response).await
    }

    async fn file_lines(&self, file_id: &str) -> BackendResult<Vec<BatchResult>> {
        let response = self
            .http
            .get(self.url(&format!("/files/{}/content", file_id)))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(Self::transport)?;
        let text = Self::checked(response)
            .await?
            .text()
            .await
            .map_err(Self::transport)?;
        parse_jsonl(&text)
    }
}

/// Parse a batch output/error file.
fn parse_jsonl(text: &str) -> BackendResult<Vec<BatchResult>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(|e| BackendError::Parse(e.to_string())))
        .collect()
}

#[async_trait]
impl InferenceBackend for OpenAiBatchClient {
    async fn create_batch(
        &self,
        requests: &[BatchRequest],
        metadata: &BatchMetadata,
    ) -> BackendResult<String> {
        let mut jsonl = String::new();
        for request in requests {
            let line = serde_json::to_string(request).map_err(|e| BackendError::Parse(e.to_string()))?;
            jsonl.push_str(&line);
            jsonl.push('\n');
        }

        let part = Part::bytes(jsonl.into_bytes())
            .file_name("batch.jsonl")
            .mime_str("application/jsonl")
            .map_err(|e| BackendError::Rejected(e.to_string()))?;
        let form = Form::new().text("purpose", "batch").part("file", part);

        let response = self
            .http
            .post(self.url("/files"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(Self::transport)?;
        let file: FileObject = Self::json(response).await?;
        debug!(file_id = %file.id, requests = requests.len(), "uploaded batch input file");

        let body = serde_json::json!({
            "input_file_id": file.id,
            "endpoint": CHAT_COMPLETIONS_URL,
            "completion_window": COMPLETION_WINDOW,
            "metadata": metadata,
        });
        let response = self
            .http
            .post(self.url("/batches"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(Self::transport)?;
        let batch: BatchObject = Self::json(response).await?;
        Ok(batch.id)
    }

    async fn batch_status(&self, batch_id: &str) -> BackendResult<StatusReport> {
        let batch = self.get_batch(batch_id).await?;
        Ok(StatusReport {
            status: batch.status,
            request_counts: batch.request_counts.unwrap_or_default(),
        })
    }

    async fn batch_results(&self, batch_id: &str) -> BackendResult<Vec<BatchResult>> {
        let batch = self.get_batch(batch_id).await?;
        let mut results = Vec::new();
        for file_id in [batch.output_file_id, batch.error_file_id].into_iter().flatten() {
            results.extend(self.file_lines(&file_id).await?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        assert!(OpenAiBatchClient::classify(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(OpenAiBatchClient::classify(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!OpenAiBatchClient::classify(StatusCode::BAD_REQUEST, "bad").is_transient());
        assert!(matches!(
            OpenAiBatchClient::classify(StatusCode::NOT_FOUND, ""),
            BackendError::NotFound(_)
        ));
    }

    #[test]
    fn parses_batch_object() {
        let raw = r#"{
            "id": "batch_abc",
            "object": "batch",
            "status": "in_progress",
            "request_counts": {"total": 10, "completed": 4, "failed": 1},
            "output_file_id": null
        }"#;
        let batch: BatchObject = serde_json::from_str(raw).unwrap();
        assert_eq!(batch.id, "batch_abc");
        assert_eq!(batch.status, RemoteStatus::InProgress);
        assert_eq!(batch.request_counts.unwrap().completed, 4);
    }

    #[test]
    fn parse_jsonl_skips_blank_lines() {
        let text = "{\"custom_id\":\"a\",\"response\":null,\"error\":null}\n\n{\"custom_id\":\"b\"}\n";
        let results = parse_jsonl(text).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].custom_id, "b");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = OpenAiBatchClient::new("sk-test")
            .unwrap()
            .with_base_url("http://localhost:8080/v1/");
        assert_eq!(client.url("/batches"), "http://localhost:8080/v1/batches");
    }
}
