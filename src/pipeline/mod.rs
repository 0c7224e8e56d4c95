//! Phase pipelines and the workspace they run in
//!
//! A `Workspace` owns the persisted state of one data directory: the
//! ledger, the batch registry and failure log (through the submitter), and
//! the aggregates. `FilterPipeline` and `ScorePipeline` borrow from it for
//! the duration of a run.

mod filter;
mod parse;
mod records;
mod report;
mod score;

pub use filter::FilterPipeline;
pub use parse::{
    extract_json, filter_custom_id, parse_filter_custom_id, parse_relevance, parse_score_custom_id, parse_stance,
    score_custom_id, ParseError,
};
pub use records::{read_filtered, read_scored, write_filtered, write_scored, FilteredRecord, ScoredRecord};
pub use report::{PairFailure, RunReport};
pub use score::ScorePipeline;

use crate::aggregate::{Aggregator, ReportWriter};
use crate::backend::InferenceBackend;
use crate::batch::{BatchJobRegistry, BatchSubmitter, FailureLog};
use crate::config::{ConfigError, DataLayout, PipelineConfig};
use crate::ledger::{JobLedger, JsonLedgerStore, LedgerError, Pair, Phase, PhaseState};
use crate::persist::PersistError;
use crate::resolver::ResolveError;
use crate::source::SourceError;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Errors that stop a run outright. Per-pair and per-record problems are
/// reported in `RunReport` instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("source unavailable: {0}")]
    Source(#[from] SourceError),

    #[error("ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),

    #[error("state file error: {0}")]
    Persist(#[from] PersistError),

    #[error("entity resolution failed: {0}")]
    Resolve(#[from] ResolveError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Persisted state of one data directory
pub struct Workspace {
    layout: DataLayout,
    pub ledger: JobLedger,
    pub submitter: BatchSubmitter,
    pub aggregator: Aggregator,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("root", &self.layout.root())
            .field("ledger", &self.ledger)
            .field("submitter", &self.submitter)
            .finish()
    }
}

impl Workspace {
    /// Open (creating directories as needed) the state under `layout`.
    pub fn open(layout: DataLayout, config: &PipelineConfig, backend: Arc<dyn InferenceBackend>) -> PipelineResult<Self> {
        layout.ensure_dirs()?;
        let ledger = JobLedger::open(Arc::new(JsonLedgerStore::new(layout.ledger_path())))?;
        let registry = BatchJobRegistry::open(layout.batch_jobs_path())?;
        let failures = FailureLog::open(layout.failures_path())?;
        let aggregator = Aggregator::open(layout.aggregates_path())?;

        let mut workspace = Self {
            submitter: BatchSubmitter::new(backend, config.submitter(), registry, failures),
            layout,
            ledger,
            aggregator,
        };
        workspace.prune_settled_jobs();

        let stale = workspace.submitter.registry().len();
        if stale > 0 {
            warn!(
                jobs = stale,
                "batch jobs from earlier runs are still registered; their pairs will be resubmitted"
            );
        }
        Ok(workspace)
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn reports(&self) -> ReportWriter {
        ReportWriter::new(self.layout.clone())
    }

    pub fn seed(&mut self, pairs: &[Pair]) -> PipelineResult<usize> {
        Ok(self.ledger.seed(pairs)?)
    }

    /// Move `pairs` back so `phase` runs again for them. Filter goes back to
    /// pending, score back to filter-complete.
    ///
    /// Score needs the intermediate file. A pair whose filtered file is gone
    /// (removed by cleanup, or never written) goes back to pending so the
    /// filter phase recreates it.
    pub fn force_reprocess(&mut self, phase: Phase, pairs: &[Pair]) -> PipelineResult<usize> {
        if phase == Phase::Filter {
            let reset = self.ledger.reset_all(pairs, PhaseState::Pending)?;
            info!(phase = %phase, reset, "forced reprocessing");
            return Ok(reset);
        }

        let (ready, missing): (Vec<Pair>, Vec<Pair>) = pairs
            .iter()
            .cloned()
            .partition(|pair| self.layout.filtered_path(pair).exists());
        let mut reset = self.ledger.reset_all(&ready, phase.input_state())?;
        if !missing.is_empty() {
            let refiltered = self.ledger.reset_all(&missing, PhaseState::Pending)?;
            warn!(
                phase = %phase,
                pairs = missing.len(),
                reset = refiltered,
                "filtered files missing; pairs go back to the filter phase"
            );
            reset += refiltered;
        }
        info!(phase = %phase, reset, "forced reprocessing");
        Ok(reset)
    }

    /// Retire registry jobs whose pairs have all moved past the job's
    /// phase. Such jobs are leftovers of aborted or failed runs whose pairs
    /// were finished by a later submission.
    pub fn prune_settled_jobs(&mut self) -> usize {
        let ledger = &self.ledger;
        let pruned = self.submitter.retire_where(|job| {
            !job.pairs.is_empty()
                && job
                    .pairs
                    .iter()
                    .all(|pair| ledger.state(pair).is_some_and(|s| s >= job.phase.output_state()))
        });
        if pruned > 0 {
            info!(pruned, remaining = self.submitter.registry().len(), "settled batch jobs retired");
        }
        pruned
    }

    pub fn cleanup_intermediate(&self) -> PipelineResult<Vec<PathBuf>> {
        cleanup_intermediate(&self.ledger, &self.layout)
    }

    pub fn cleanup_candidates(&self) -> Vec<PathBuf> {
        cleanup_candidates(&self.ledger, &self.layout)
    }
}

/// Intermediate files whose pair finished scoring
pub fn cleanup_candidates(ledger: &JobLedger, layout: &DataLayout) -> Vec<PathBuf> {
    ledger
        .entries_in(PhaseState::ScoreComplete)
        .into_iter()
        .map(|e| layout.filtered_path(&e.pair))
        .filter(|p| p.exists())
        .collect()
}

/// Delete intermediate filtered files whose pair finished scoring.
/// Returns the removed paths.
pub fn cleanup_intermediate(ledger: &JobLedger, layout: &DataLayout) -> PipelineResult<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for entry in ledger.entries_in(PhaseState::ScoreComplete) {
        let path = layout.filtered_path(&entry.pair);
        match std::fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PersistError::io(&path, e).into()),
        }
    }
    info!(removed = removed.len(), "intermediate files cleaned up");
    Ok(removed)
}

/// Cartesian product of entities and topics, in input order
pub fn pairs_for(entities: &[crate::ledger::EntityId], topics: &[String]) -> Vec<Pair> {
    entities
        .iter()
        .flat_map(|&entity| topics.iter().map(move |topic| Pair::new(entity, topic.clone())))
        .collect()
}
