//! Batch submission and polling
//!
//! `BatchSubmitter` turns an unbounded request list into bounded backend
//! batches, waits for each to finish, and hands back results plus a failure
//! signal. Outstanding jobs are tracked in `batch_jobs.json`; everything that
//! fails is appended to `failed_requests.json`.

mod failures;
mod jobs;
mod submitter;

pub use failures::{FailureKind, FailureLog, FailureRecord};
pub use jobs::{BatchJob, BatchJobRegistry, BatchJobStatus};
pub use submitter::{BatchFailure, BatchOutcome, BatchSubmitter, SubmitError, SubmitterConfig};
