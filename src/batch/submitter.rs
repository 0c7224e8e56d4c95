//! Chunked submission, polling, and result retrieval against an
//! `InferenceBackend`

use super::failures::{FailureKind, FailureLog, FailureRecord};
use super::jobs::{BatchJob, BatchJobRegistry, BatchJobStatus};
use crate::backend::{
    BackendError, BackendResult, BatchMetadata, BatchRequest, BatchResult, InferenceBackend,
    RemoteStatus,
};
use crate::ledger::{Pair, Phase};
use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Backend metadata values are capped at this many characters.
const METADATA_VALUE_LIMIT: usize = 512;

/// Errors that stop a submission
#[derive(Debug, Error)]
pub enum SubmitError {
    /// A request failed local validation. Nothing was sent.
    #[error("invalid request {custom_id}: {reason}")]
    InvalidRequest { custom_id: String, reason: String },

    /// The backend kept refusing a chunk. Chunks before it were submitted;
    /// they stay in the registry marked failed.
    #[error("batch submission failed after {attempts} attempt(s) ({submitted} chunk(s) already submitted): {source}")]
    Exhausted {
        attempts: u32,
        submitted: usize,
        #[source]
        source: BackendError,
    },
}

/// Knobs for chunking, polling, and retry
#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    pub max_batch_size: usize,
    pub poll_interval: Duration,
    /// Total attempts per backend call, including the first
    pub retry_attempts: u32,
    /// Delay before the first retry; doubles on each further retry
    pub retry_backoff: Duration,
    /// Give up waiting after this long. `None` waits for a terminal state.
    pub poll_timeout: Option<Duration>,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10_000,
            poll_interval: Duration::from_secs(30),
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            poll_timeout: None,
        }
    }
}

impl SubmitterConfig {
    /// Zero-wait polling and retry, for tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            poll_interval: Duration::ZERO,
            retry_backoff: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Why a batch did not deliver a full result set
#[derive(Debug, Clone, Error)]
pub enum BatchFailure {
    #[error("batch ended {0}")]
    Terminal(BatchJobStatus),
    #[error("polling failed: {0}")]
    PollFailed(BackendError),
    #[error("result retrieval failed: {0}")]
    ResultsUnavailable(BackendError),
    #[error("gave up waiting after {0:?}")]
    TimedOut(Duration),
}

/// What `await_completion` hands back: whatever results exist, plus a
/// failure signal when the batch did not complete cleanly
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub job: BatchJob,
    pub results: Vec<BatchResult>,
    pub failure: Option<BatchFailure>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// Drives batches through submit → poll → retrieve
pub struct BatchSubmitter {
    backend: Arc<dyn InferenceBackend>,
    config: SubmitterConfig,
    registry: BatchJobRegistry,
    failures: FailureLog,
}

impl std::fmt::Debug for BatchSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSubmitter")
            .field("config", &self.config)
            .field("registry", &self.registry.len())
            .field("failures", &self.failures.len())
            .finish()
    }
}

impl BatchSubmitter {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        config: SubmitterConfig,
        registry: BatchJobRegistry,
        failures: FailureLog,
    ) -> Self {
        Self {
            backend,
            config,
            registry,
            failures,
        }
    }

    /// In-memory registry and failure log.
    pub fn ephemeral(backend: Arc<dyn InferenceBackend>, config: SubmitterConfig) -> Self {
        Self::new(backend, config, BatchJobRegistry::in_memory(), FailureLog::in_memory())
    }

    pub fn config(&self) -> &SubmitterConfig {
        &self.config
    }

    pub fn registry(&self) -> &BatchJobRegistry {
        &self.registry
    }

    pub fn failures(&self) -> &FailureLog {
        &self.failures
    }

    /// Record a failure found by a caller (request, parse, persistence).
    pub fn record_failure(&mut self, record: FailureRecord) {
        warn!(
            kind = ?record.kind,
            phase = %record.phase,
            batch = record.batch_id.as_deref().unwrap_or("-"),
            reason = %record.reason,
            "recorded failure"
        );
        self.failures.record_or_log(record);
    }

    /// Validate every request, split into chunks of at most
    /// `max_batch_size`, and create one backend batch per chunk.
    ///
    /// Validation happens before anything is sent. If a chunk cannot be
    /// submitted after retries, its requests and every later chunk's are
    /// recorded as a submission failure, chunks already accepted are marked
    /// failed, and the error is returned.
    pub async fn submit(
        &mut self,
        requests: &[BatchRequest],
        phase: Phase,
        pairs: &[Pair],
        metadata: &BatchMetadata,
    ) -> Result<Vec<BatchJob>, SubmitError> {
        validate_requests(requests)?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let chunk_size = self.config.max_batch_size.max(1);
        let chunks: Vec<&[BatchRequest]> = requests.chunks(chunk_size).collect();
        let chunk_count = chunks.len();
        let mut jobs: Vec<BatchJob> = Vec::with_capacity(chunk_count);

        for (index, chunk) in chunks.iter().enumerate() {
            let chunk_meta = chunk_metadata(metadata, phase, index, chunk_count);
            let backend = Arc::clone(&self.backend);
            let attempt = retry(&self.config, "create_batch", || {
                backend.create_batch(chunk, &chunk_meta)
            })
            .await;

            let batch_id = match attempt {
                Ok(id) => id,
                Err((source, attempts)) => {
                    let unsent = chunks[index..]
                        .iter()
                        .flat_map(|c| c.iter().map(|r| r.custom_id.clone()));
                    self.record_failure(
                        FailureRecord::new(FailureKind::Submission, phase, source.to_string())
                            .with_pairs(pairs.iter().cloned())
                            .with_custom_ids(unsent),
                    );
                    if !jobs.is_empty() {
                        warn!(
                            submitted = jobs.len(),
                            chunks = chunk_count,
                            "submission stopped part way; abandoning earlier batches"
                        );
                    }
                    let reason = format!(
                        "abandoned: chunk {}/{} could not be submitted: {}",
                        index + 1,
                        chunk_count,
                        source
                    );
                    for job in &mut jobs {
                        job.status = BatchJobStatus::Failed;
                        job.completed_at = Some(Utc::now());
                        self.save_job(job);
                        self.record_failure(
                            FailureRecord::new(FailureKind::Batch, phase, reason.clone())
                                .with_pairs(job.pairs.iter().cloned())
                                .with_custom_ids(job.custom_ids.iter().cloned())
                                .with_batch(job.batch_id.clone()),
                        );
                    }
                    return Err(SubmitError::Exhausted {
                        attempts,
                        submitted: jobs.len(),
                        source,
                    });
                }
            };

            let job = BatchJob {
                batch_id,
                phase,
                pairs: pairs.to_vec(),
                status: BatchJobStatus::Submitted,
                request_count: chunk.len(),
                chunk_index: index,
                submitted_at: Utc::now(),
                completed_at: None,
                request_counts: None,
                custom_ids: chunk.iter().map(|r| r.custom_id.clone()).collect(),
            };
            info!(
                batch = %job.batch_id,
                phase = %phase,
                requests = job.request_count,
                chunk = index + 1,
                chunks = chunk_count,
                "batch submitted"
            );
            self.save_job(&job);
            jobs.push(job);
        }

        Ok(jobs)
    }

    /// Poll until `job` reaches a terminal state, then fetch its results.
    ///
    /// Never returns an error: a failed or expired batch still yields
    /// whatever results the backend has, with `failure` set so the caller
    /// can decide per item. Every failure is also written to the log.
    pub async fn await_completion(&mut self, job: &BatchJob) -> BatchOutcome {
        let mut job = job.clone();
        let started = Instant::now();

        let terminal = loop {
            let backend = Arc::clone(&self.backend);
            let batch_id = job.batch_id.clone();
            let report = retry(&self.config, "batch_status", || backend.batch_status(&batch_id)).await;

            let report = match report {
                Ok(report) => report,
                Err((e, attempts)) => {
                    error!(batch = %job.batch_id, attempts, error = %e, "polling gave up");
                    return self.fail(job, Vec::new(), BatchFailure::PollFailed(e));
                }
            };

            job.request_counts = Some(report.request_counts);
            if report.status.is_terminal() {
                break report.status;
            }

            if job.status == BatchJobStatus::Submitted {
                job.status = BatchJobStatus::Polling;
                self.save_job(&job);
            }
            debug!(
                batch = %job.batch_id,
                status = ?report.status,
                completed = report.request_counts.completed,
                total = report.request_counts.total,
                "batch still running"
            );

            if let Some(limit) = self.config.poll_timeout {
                if started.elapsed() >= limit {
                    return self.fail(job, Vec::new(), BatchFailure::TimedOut(limit));
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        };

        job.status = match terminal {
            RemoteStatus::Completed => BatchJobStatus::Completed,
            RemoteStatus::Expired => BatchJobStatus::Expired,
            _ => BatchJobStatus::Failed,
        };
        job.completed_at = Some(Utc::now());
        self.save_job(&job);
        info!(batch = %job.batch_id, status = %job.status, "batch reached terminal state");

        let backend = Arc::clone(&self.backend);
        let batch_id = job.batch_id.clone();
        let results = retry(&self.config, "batch_results", || backend.batch_results(&batch_id)).await;

        match (results, job.status) {
            (Ok(results), BatchJobStatus::Completed) => BatchOutcome {
                job,
                results,
                failure: None,
            },
            (Ok(results), status) => {
                warn!(
                    batch = %job.batch_id,
                    status = %status,
                    partial = results.len(),
                    "batch did not complete; returning partial results"
                );
                self.fail(job, results, BatchFailure::Terminal(status))
            }
            (Err((e, _)), _) => self.fail(job, Vec::new(), BatchFailure::ResultsUnavailable(e)),
        }
    }

    /// Drop a job from the registry once its outputs are written.
    pub fn retire(&mut self, job: &BatchJob) {
        match self.registry.retire(&job.batch_id) {
            Ok(true) => debug!(batch = %job.batch_id, "batch retired"),
            Ok(false) => {}
            Err(e) => error!(batch = %job.batch_id, error = %e, "failed to update batch registry"),
        }
    }

    /// Drop every registered job matching `settled`. Returns how many went.
    pub fn retire_where(&mut self, settled: impl Fn(&BatchJob) -> bool) -> usize {
        match self.registry.retire_where(settled) {
            Ok(removed) => {
                for job in &removed {
                    debug!(batch = %job.batch_id, status = %job.status, "batch retired");
                }
                removed.len()
            }
            Err(e) => {
                error!(error = %e, "failed to update batch registry");
                0
            }
        }
    }

    fn fail(&mut self, job: BatchJob, results: Vec<BatchResult>, failure: BatchFailure) -> BatchOutcome {
        let answered: HashSet<&str> = results
            .iter()
            .filter(|r| r.content().is_ok())
            .map(|r| r.custom_id.as_str())
            .collect();
        let unanswered: Vec<String> = job
            .custom_ids
            .iter()
            .filter(|id| !answered.contains(id.as_str()))
            .cloned()
            .collect();

        self.record_failure(
            FailureRecord::new(FailureKind::Batch, job.phase, failure.to_string())
                .with_pairs(job.pairs.iter().cloned())
                .with_custom_ids(unanswered)
                .with_batch(job.batch_id.clone()),
        );
        self.save_job(&job);
        BatchOutcome {
            job,
            results,
            failure: Some(failure),
        }
    }

    /// The registry is bookkeeping; a write failure is logged, not fatal.
    fn save_job(&mut self, job: &BatchJob) {
        if let Err(e) = self.registry.upsert(job) {
            error!(batch = %job.batch_id, error = %e, "failed to update batch registry");
        }
    }
}

fn validate_requests(requests: &[BatchRequest]) -> Result<(), SubmitError> {
    let mut seen = HashSet::with_capacity(requests.len());
    for request in requests {
        request.validate().map_err(|reason| SubmitError::InvalidRequest {
            custom_id: request.custom_id.clone(),
            reason,
        })?;
        if !seen.insert(request.custom_id.as_str()) {
            return Err(SubmitError::InvalidRequest {
                custom_id: request.custom_id.clone(),
                reason: "duplicate custom_id".to_string(),
            });
        }
    }
    Ok(())
}

fn chunk_metadata(base: &BatchMetadata, phase: Phase, index: usize, count: usize) -> BatchMetadata {
    let mut meta: BatchMetadata = base
        .iter()
        .map(|(k, v)| (k.clone(), v.chars().take(METADATA_VALUE_LIMIT).collect()))
        .collect();
    meta.insert("phase".to_string(), phase.as_str().to_string());
    meta.insert("chunk".to_string(), format!("{}/{}", index + 1, count));
    meta
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
/// On failure returns the last error and the number of attempts made.
async fn retry<T, F, Fut>(config: &SubmitterConfig, what: &str, mut op: F) -> Result<T, (BackendError, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let max_attempts = config.retry_attempts.max(1);
    let mut delay = config.retry_backoff;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!(op = what, attempt, max_attempts, error = %e, "transient backend error, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => return Err((e, attempt)),
        }
    }
}
