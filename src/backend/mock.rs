//! Mock backend for testing: answers requests from a scripted responder
//!
//! Batches complete after a configurable number of polls. Submission and
//! poll failures, and failed/expired terminal states, can be queued to
//! exercise the submitter's retry and partial-result paths.

use super::traits::InferenceBackend;
use super::types::{
    BackendError, BackendResult, BatchMetadata, BatchRequest, BatchResult, RemoteStatus,
    RequestCounts, ResultError, StatusReport,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// What the mock returns for one request
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    /// A successful completion with this message content
    Content(String),
    /// A non-200 response for this request only
    HttpError(u16),
    /// No result line at all
    Dropped,
}

impl MockReply {
    pub fn json(value: serde_json::Value) -> Self {
        MockReply::Content(value.to_string())
    }
}

type Responder = dyn Fn(&BatchRequest) -> MockReply + Send + Sync;

/// A batch accepted by the mock
#[derive(Debug, Clone)]
pub struct SubmittedBatch {
    pub batch_id: String,
    pub custom_ids: Vec<String>,
    pub metadata: BatchMetadata,
}

struct MockBatch {
    requests: Vec<BatchRequest>,
    polls_remaining: u32,
    terminal: RemoteStatus,
    /// How many requests (from the front) finish before a failed/expired end
    completed_before_end: usize,
}

#[derive(Default)]
struct MockState {
    batches: HashMap<String, MockBatch>,
    submitted: Vec<SubmittedBatch>,
    submit_failures: VecDeque<BackendError>,
    poll_failures: usize,
    terminal_overrides: VecDeque<(RemoteStatus, usize)>,
    accept_limit: Option<(usize, BackendError)>,
    create_calls: usize,
    status_calls: usize,
}

/// Scripted in-process inference backend
pub struct MockBackend {
    responder: Box<Responder>,
    polls_before_done: u32,
    state: Mutex<MockState>,
}

impl MockBackend {
    /// Answer every request with `responder`.
    pub fn new(responder: impl Fn(&BatchRequest) -> MockReply + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            polls_before_done: 0,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Report `in_progress` this many times before the terminal status.
    pub fn with_polls_before_done(mut self, polls: u32) -> Self {
        self.polls_before_done = polls;
        self
    }

    /// Fail the next `count` batch submissions with `error`.
    pub fn with_submit_failures(self, count: usize, error: BackendError) -> Self {
        {
            let mut state = self.state();
            for _ in 0..count {
                state.submit_failures.push_back(error.clone());
            }
        }
        self
    }

    /// Accept `limit` batches, then refuse every later submission with
    /// `error`.
    pub fn with_accept_limit(self, limit: usize, error: BackendError) -> Self {
        self.state().accept_limit = Some((limit, error));
        self
    }

    /// Fail the next `count` status polls with a transient error.
    pub fn with_poll_failures(self, count: usize) -> Self {
        self.state().poll_failures += count;
        self
    }

    /// End the next created batch in `status`, with only the first
    /// `completed` requests producing results.
    pub fn with_terminal(self, status: RemoteStatus, completed: usize) -> Self {
        self.state().terminal_overrides.push_back((status, completed));
        self
    }

    /// Every batch accepted so far, in submission order.
    pub fn submitted(&self) -> Vec<SubmittedBatch> {
        self.state().submitted.clone()
    }

    /// Every custom id accepted so far, in submission order.
    pub fn submitted_custom_ids(&self) -> Vec<String> {
        self.state()
            .submitted
            .iter()
            .flat_map(|b| b.custom_ids.iter().cloned())
            .collect()
    }

    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }

    pub fn status_calls(&self) -> usize {
        self.state().status_calls
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn counts(batch: &MockBatch) -> RequestCounts {
        let total = batch.requests.len() as u32;
        match batch.terminal {
            RemoteStatus::Completed => RequestCounts { total, completed: total, failed: 0 },
            _ => {
                let completed = batch.completed_before_end.min(batch.requests.len()) as u32;
                RequestCounts { total, completed, failed: total - completed }
            }
        }
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn create_batch(
        &self,
        requests: &[BatchRequest],
        metadata: &BatchMetadata,
    ) -> BackendResult<String> {
        let mut state = self.state();
        state.create_calls += 1;
        if let Some(err) = state.submit_failures.pop_front() {
            return Err(err);
        }
        if let Some((limit, err)) = &state.accept_limit {
            if state.submitted.len() >= *limit {
                return Err(err.clone());
            }
        }
        if requests.is_empty() {
            return Err(BackendError::Rejected("batch has no requests".to_string()));
        }

        let batch_id = format!("batch_{}", Uuid::new_v4().simple());
        let (terminal, completed_before_end) = state
            .terminal_overrides
            .pop_front()
            .unwrap_or((RemoteStatus::Completed, requests.len()));

        state.batches.insert(
            batch_id.clone(),
            MockBatch {
                requests: requests.to_vec(),
                polls_remaining: self.polls_before_done,
                terminal,
                completed_before_end,
            },
        );
        state.submitted.push(SubmittedBatch {
            batch_id: batch_id.clone(),
            custom_ids: requests.iter().map(|r| r.custom_id.clone()).collect(),
            metadata: metadata.clone(),
        });
        Ok(batch_id)
    }

    async fn batch_status(&self, batch_id: &str) -> BackendResult<StatusReport> {
        let mut state = self.state();
        state.status_calls += 1;
        if state.poll_failures > 0 {
            state.poll_failures -= 1;
            return Err(BackendError::Transient("mock poll failure".to_string()));
        }
        let batch = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| BackendError::NotFound(batch_id.to_string()))?;

        if batch.polls_remaining > 0 {
            batch.polls_remaining -= 1;
            let total = batch.requests.len() as u32;
            return Ok(StatusReport {
                status: RemoteStatus::InProgress,
                request_counts: RequestCounts { total, completed: 0, failed: 0 },
            });
        }
        Ok(StatusReport {
            status: batch.terminal,
            request_counts: Self::counts(batch),
        })
    }

    async fn batch_results(&self, batch_id: &str) -> BackendResult<Vec<BatchResult>> {
        let state = self.state();
        let batch = state
            .batches
            .get(batch_id)
            .ok_or_else(|| BackendError::NotFound(batch_id.to_string()))?;

        let finished = match batch.terminal {
            RemoteStatus::Completed => batch.requests.len(),
            _ => batch.completed_before_end,
        };

        let mut results = Vec::with_capacity(batch.requests.len());
        for (idx, request) in batch.requests.iter().enumerate() {
            if idx >= finished {
                results.push(BatchResult {
                    custom_id: request.custom_id.clone(),
                    response: None,
                    error: Some(ResultError {
                        code: Some(format!("batch_{:?}", batch.terminal).to_lowercase()),
                        message: "request did not complete before the batch ended".to_string(),
                    }),
                });
                continue;
            }
            match (self.responder)(request) {
                MockReply::Content(content) => {
                    results.push(BatchResult::completion(request.custom_id.clone(), content))
                }
                MockReply::HttpError(code) => results.push(BatchResult::http_failure(
                    request.custom_id.clone(),
                    code,
                    "mock request failure",
                )),
                MockReply::Dropped => {}
            }
        }
        Ok(results)
    }
}
