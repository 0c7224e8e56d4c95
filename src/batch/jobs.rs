//! BatchJob records and the registry of unresolved jobs (`batch_jobs.json`)

use crate::backend::RequestCounts;
use crate::ledger::{Pair, Phase};
use crate::persist::{JsonDocument, PersistResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Local view of a backend batch's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchJobStatus {
    Submitted,
    Polling,
    Completed,
    Failed,
    Expired,
}

impl BatchJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchJobStatus::Completed | BatchJobStatus::Failed | BatchJobStatus::Expired
        )
    }
}

impl std::fmt::Display for BatchJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchJobStatus::Submitted => "submitted",
            BatchJobStatus::Polling => "polling",
            BatchJobStatus::Completed => "completed",
            BatchJobStatus::Failed => "failed",
            BatchJobStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// One backend batch created by the submitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    /// Backend-assigned id
    pub batch_id: String,
    pub phase: Phase,
    /// Pairs whose work is (partly) carried by this batch
    pub pairs: Vec<Pair>,
    pub status: BatchJobStatus,
    pub request_count: usize,
    /// Position of this chunk within its submission
    pub chunk_index: usize,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_counts: Option<RequestCounts>,
    /// Custom ids of the requests in this batch. Kept out of the registry
    /// file to keep it readable; failure records carry them instead.
    #[serde(skip)]
    pub custom_ids: Vec<String>,
}

/// Jobs that have been submitted but not yet retired
///
/// A job is retired once its results are retrieved and the outputs that
/// depend on them are durably written. Whatever remains in the file after
/// a run is either still running on the backend or failed.
#[derive(Debug)]
pub struct BatchJobRegistry {
    doc: JsonDocument<BTreeMap<String, BatchJob>>,
}

impl BatchJobRegistry {
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

    /// Insert or replace a job and flush.
    pub fn upsert(&mut self, job: &BatchJob) -> PersistResult<()> {
        self.doc.get_mut().insert(job.batch_id.clone(), job.clone());
        self.doc.save()
    }

    /// Remove a job and flush. Returns whether it was present.
    pub fn retire(&mut self, batch_id: &str) -> PersistResult<bool> {
        let removed = self.doc.get_mut().remove(batch_id).is_some();
        if removed {
            self.doc.save()?;
        }
        Ok(removed)
    }

    /// Remove every job matching `settled` and flush once. Returns the
    /// removed jobs; on a write error nothing is removed.
    pub fn retire_where(&mut self, settled: impl Fn(&BatchJob) -> bool) -> PersistResult<Vec<BatchJob>> {
        let ids: Vec<String> = self
            .doc
            .get()
            .values()
            .filter(|job| settled(*job))
            .map(|job| job.batch_id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let removed: Vec<BatchJob> = ids.iter().filter_map(|id| self.doc.get_mut().remove(id)).collect();
        if let Err(e) = self.doc.save() {
            for job in &removed {
                self.doc.get_mut().insert(job.batch_id.clone(), job.clone());
            }
            return Err(e);
        }
        Ok(removed)
    }

    pub fn get(&self, batch_id: &str) -> Option<&BatchJob> {
        self.doc.get().get(batch_id)
    }

    /// Every job still in the registry, oldest first.
    pub fn jobs(&self) -> Vec<&BatchJob> {
        let mut jobs: Vec<_> = self.doc.get().values().collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }

    pub fn len(&self) -> usize {
        self.doc.get().len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.get().is_empty()
    }
}
