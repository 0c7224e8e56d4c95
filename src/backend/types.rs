//! Wire types shared by every inference backend
//!
//! Requests and results follow the Batch API JSONL line shapes, so the
//! OpenAI client can serialize them directly and the mock can produce
//! byte-identical results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Endpoint every request in a batch targets
pub const CHAT_COMPLETIONS_URL: &str = "/v1/chat/completions";

/// String metadata attached to a backend batch
pub type BatchMetadata = BTreeMap<String, String>;

/// One chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Chat-completion request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
}

/// One line of a batch input file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub custom_id: String,
    pub method: String,
    pub url: String,
    pub body: ChatBody,
}

impl BatchRequest {
    /// A JSON-mode chat completion with a system and a user message.
    pub fn json_chat(
        custom_id: impl Into<String>,
        model: impl Into<String>,
        system: impl Into<String>,
        user: impl Into<String>,
        temperature: f32,
    ) -> Self {
        Self {
            custom_id: custom_id.into(),
            method: "POST".to_string(),
            url: CHAT_COMPLETIONS_URL.to_string(),
            body: ChatBody {
                model: model.into(),
                messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
                temperature,
                response_format: Some(serde_json::json!({ "type": "json_object" })),
            },
        }
    }

    /// The user message content, if any.
    pub fn user_content(&self) -> Option<&str> {
        self.body
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }

    /// Structural checks a request must pass before submission.
    pub fn validate(&self) -> Result<(), String> {
        if self.custom_id.trim().is_empty() {
            return Err("empty custom_id".to_string());
        }
        if self.body.model.trim().is_empty() {
            return Err(format!("{}: empty model", self.custom_id));
        }
        if self.body.messages.is_empty() {
            return Err(format!("{}: no messages", self.custom_id));
        }
        if self.body.messages.iter().any(|m| m.content.trim().is_empty()) {
            return Err(format!("{}: empty message content", self.custom_id));
        }
        Ok(())
    }
}

/// HTTP-level response recorded for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultResponse {
    pub status_code: u16,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Error recorded for one request that never produced a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// One line of a batch output (or error) file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub custom_id: String,
    #[serde(default)]
    pub response: Option<ResultResponse>,
    #[serde(default)]
    pub error: Option<ResultError>,
}

impl BatchResult {
    /// A successful chat completion whose message content is `content`.
    pub fn completion(custom_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            custom_id: custom_id.into(),
            response: Some(ResultResponse {
                status_code: 200,
                body: serde_json::json!({
                    "choices": [
                        { "index": 0, "message": { "role": "assistant", "content": content.into() } }
                    ]
                }),
            }),
            error: None,
        }
    }

    /// A request that failed at the HTTP level.
    pub fn http_failure(custom_id: impl Into<String>, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            custom_id: custom_id.into(),
            response: Some(ResultResponse {
                status_code,
                body: serde_json::json!({ "error": { "message": message.into() } }),
            }),
            error: None,
        }
    }

    /// Extract the assistant message content.
    ///
    /// Errors describe why the request produced no usable completion.
    pub fn content(&self) -> Result<&str, String> {
        if let Some(err) = &self.error {
            return Err(format!(
                "request error{}: {}",
                err.code.as_deref().map(|c| format!(" ({})", c)).unwrap_or_default(),
                err.message
            ));
        }
        let response = self
            .response
            .as_ref()
            .ok_or_else(|| "no response recorded".to_string())?;
        if response.status_code != 200 {
            return Err(format!("HTTP status {}", response.status_code));
        }
        response
            .body
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "response has no message content".to_string())
    }
}

/// Status reported by the backend for a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Expired,
    Cancelling,
    Cancelled,
}

impl RemoteStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteStatus::Completed | RemoteStatus::Failed | RemoteStatus::Expired | RemoteStatus::Cancelled
        )
    }
}

/// Per-request progress counts reported by the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub completed: u32,
    #[serde(default)]
    pub failed: u32,
}

/// Result of polling one batch
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: RemoteStatus,
    pub request_counts: RequestCounts,
}

/// Errors from inference backend operations
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Network failure, rate limit, or server error. Worth retrying.
    #[error("transient backend error: {0}")]
    Transient(String),
    /// The backend refused the request. Retrying will not help.
    #[error("backend rejected request: {0}")]
    Rejected(String),
    #[error("batch not found: {0}")]
    NotFound(String),
    #[error("backend response parse error: {0}")]
    Parse(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_as_batch_line() {
        let req = BatchRequest::json_chat("unit_7", "gpt-4o-mini", "sys", "hello", 0.3);
        let line = serde_json::to_value(&req).unwrap();

        assert_eq!(line["custom_id"], "unit_7");
        assert_eq!(line["method"], "POST");
        assert_eq!(line["url"], CHAT_COMPLETIONS_URL);
        assert_eq!(line["body"]["messages"][1]["content"], "hello");
        assert_eq!(line["body"]["response_format"]["type"], "json_object");
    }

    #[test]
    fn validate_rejects_blank_fields() {
        let mut req = BatchRequest::json_chat("unit_1", "m", "sys", "user", 0.0);
        assert!(req.validate().is_ok());

        req.custom_id = " ".into();
        assert!(req.validate().is_err());

        let req = BatchRequest::json_chat("unit_1", "m", "sys", "   ", 0.0);
        assert!(req.validate().is_err());
    }

    #[test]
    fn content_of_completion() {
        let result = BatchResult::completion("unit_1", "{\"a\":1}");
        assert_eq!(result.content().unwrap(), "{\"a\":1}");
    }

    #[test]
    fn content_of_failures_explains_why() {
        let http = BatchResult::http_failure("unit_1", 500, "boom");
        assert!(http.content().unwrap_err().contains("500"));

        let errored: BatchResult = serde_json::from_str(
            r#"{"custom_id":"unit_2","response":null,"error":{"code":"batch_expired","message":"expired"}}"#,
        )
        .unwrap();
        assert!(errored.content().unwrap_err().contains("batch_expired"));
    }

    #[test]
    fn parses_output_line_from_batch_file() {
        let line = r#"{"id":"batch_req_1","custom_id":"score_3_1","response":{"status_code":200,"request_id":"r","body":{"choices":[{"index":0,"message":{"role":"assistant","content":"{\"stance_score\":7}"}}]}},"error":null}"#;
        let result: BatchResult = serde_json::from_str(line).unwrap();
        assert_eq!(result.content().unwrap(), "{\"stance_score\":7}");
    }

    #[test]
    fn terminal_statuses() {
        assert!(RemoteStatus::Completed.is_terminal());
        assert!(RemoteStatus::Expired.is_terminal());
        assert!(!RemoteStatus::InProgress.is_terminal());
        assert!(!RemoteStatus::Cancelling.is_terminal());
    }
}
