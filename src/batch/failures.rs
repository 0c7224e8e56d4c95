//! Failure log (`failed_requests.json`)
//!
//! Nothing that fails is dropped silently: submission exhaustion, failed or
//! expired batches, per-request errors, parse failures, and output write
//! failures all land here for later inspection.

use crate::ledger::{Pair, Phase};
use crate::persist::{JsonDocument, PersistResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::error;

/// Which layer a failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The backend never accepted the batch
    Submission,
    /// The batch ended failed/expired, or could not be polled or fetched
    Batch,
    /// One request inside a batch returned an error
    Request,
    /// A completion did not have the expected structure
    Parse,
    /// A phase output could not be written
    Persistence,
}

/// One recorded failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub phase: Phase,
    #[serde(default)]
    pub pairs: Vec<Pair>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(kind: FailureKind, phase: Phase, reason: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            pairs: Vec::new(),
            custom_ids: Vec::new(),
            batch_id: None,
            reason: reason.into(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_pairs(mut self, pairs: impl IntoIterator<Item = Pair>) -> Self {
        self.pairs = pairs.into_iter().collect();
        self
    }

    pub fn with_custom_ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.custom_ids = ids.into_iter().collect();
        self
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }
}

/// Append-only log of failures
#[derive(Debug)]
pub struct FailureLog {
    doc: JsonDocument<Vec<FailureRecord>>,
}

impl FailureLog {
    pub fn open(path: impl Into<PathBuf>) -> PersistResult<Self> {
        Ok(Self {
            doc: JsonDocument::open(path)?,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            doc: JsonDocument::in_memory(),
        }
    }

    /// Append and flush.
    pub fn record(&mut self, record: FailureRecord) -> PersistResult<()> {
        self.doc.get_mut().push(record);
        self.doc.save()
    }

    /// Append and flush, logging (not returning) a write error.
    ///
    /// The record stays in memory either way, so the run summary still
    /// reports it.
    pub fn record_or_log(&mut self, record: FailureRecord) {
        if let Err(e) = self.record(record) {
            error!(error = %e, "failed to write failure log");
        }
    }

    pub fn records(&self) -> &[FailureRecord] {
        self.doc.get()
    }

    pub fn len(&self) -> usize {
        self.doc.get().len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.get().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn log_appends_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failed_requests.json");
        {
            let mut log = FailureLog::open(&path).unwrap();
            log.record(
                FailureRecord::new(FailureKind::Parse, Phase::Score, "stance_score out of range")
                    .with_pairs([Pair::new(3, "economy")])
                    .with_custom_ids(["score_9_0".to_string()]),
            )
            .unwrap();
        }

        let mut log = FailureLog::open(&path).unwrap();
        log.record(FailureRecord::new(FailureKind::Submission, Phase::Filter, "503"))
            .unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(log.records()[0].custom_ids, vec!["score_9_0".to_string()]);
        assert_eq!(log.records()[1].kind, FailureKind::Submission);
    }
}
