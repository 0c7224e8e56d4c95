//! Knessight: resumable two-phase LLM batch analysis of parliamentary speeches
//!
//! Every (member, topic) pair moves through two phases, each driven through
//! an asynchronous batch inference service:
//!
//! - **Filter**: rate each speech's relevance (1-5) to the member's topics
//!   and keep those at or above a threshold
//! - **Score**: rate the member's stance (1-10) in each kept speech, with a
//!   sampled one-sentence reasoning
//!
//! Progress is recorded per pair in a persisted ledger, and a pair only
//! advances after its phase output has been written, so an interrupted run
//! picks up where it stopped.
//!
//! # Example
//!
//! ```
//! use knessight::{JobLedger, Pair, Phase, PhaseState};
//!
//! let mut ledger = JobLedger::in_memory();
//! let pair = Pair::new(42, "economy");
//! ledger.seed(&[pair.clone()]).unwrap();
//! assert_eq!(ledger.get_pending(Phase::Filter), vec![pair.clone()]);
//!
//! ledger.advance(&pair, PhaseState::FilterComplete, &[]).unwrap();
//! assert_eq!(ledger.get_pending(Phase::Score), vec![pair]);
//! ```

pub mod aggregate;
pub mod backend;
pub mod batch;
pub mod config;
pub mod ledger;
pub mod persist;
pub mod pipeline;
pub mod resolver;
pub mod source;

pub use aggregate::{Aggregate, Aggregator, ReportWriter};
pub use backend::{BackendError, BatchRequest, BatchResult, InferenceBackend, MockBackend, MockReply};
pub use batch::{BatchJob, BatchJobStatus, BatchSubmitter, FailureKind, FailureRecord, SubmitterConfig};
pub use config::{ConfigError, DataLayout, PipelineConfig, PromptSet};
pub use ledger::{EntityId, JobLedger, LedgerError, Pair, Phase, PhaseState};
pub use persist::{PersistError, PersistResult};
pub use pipeline::{FilterPipeline, PipelineError, PipelineResult, RunReport, ScorePipeline, Workspace};
pub use resolver::{Chooser, EntityResolution, EntityResolver, ResolutionCache, ResolutionMethod, ResolveError};
pub use source::{InMemorySource, SourceError, SourceProvider, SqliteSource, WorkUnit};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
