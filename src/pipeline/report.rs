//! Run summary returned by each phase

use crate::ledger::{Pair, Phase};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairFailure {
    pub pair: Pair,
    pub reason: String,
}

/// What one phase run did. Always produced, even when pairs failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub phase: Phase,
    /// Pairs that were pending when the run started
    pub considered: usize,
    pub advanced: Vec<Pair>,
    pub failed: Vec<PairFailure>,
    /// Individual requests or completions excluded from output
    pub record_failures: usize,
    pub batches_submitted: usize,
    pub records_written: usize,
}

impl RunReport {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            considered: 0,
            advanced: Vec::new(),
            failed: Vec::new(),
            record_failures: 0,
            batches_submitted: 0,
            records_written: 0,
        }
    }

    pub fn fail(&mut self, pair: &Pair, reason: impl Into<String>) {
        self.failed.push(PairFailure {
            pair: pair.clone(),
            reason: reason.into(),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.record_failures == 0
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} phase summary", self.phase)?;
        writeln!(f, "  pending at start:  {}", self.considered)?;
        writeln!(f, "  advanced:          {}", self.advanced.len())?;
        writeln!(f, "  failed pairs:      {}", self.failed.len())?;
        writeln!(f, "  failed records:    {}", self.record_failures)?;
        writeln!(f, "  batches submitted: {}", self.batches_submitted)?;
        write!(f, "  records written:   {}", self.records_written)?;
        for failure in &self.failed {
            write!(f, "\n    {}: {}", failure.pair, failure.reason)?;
        }
        Ok(())
    }
}
