//! JobLedger: the single source of truth for what work remains
//!
//! Every mutation goes through `advance` or `reset` and is persisted
//! before the call returns. `advance` never moves a pair backwards and is a
//! no-op for a pair already at or past the target state.

use super::pair::{Pair, Phase, PhaseState};
use super::store::{LedgerError, LedgerRecord, LedgerResult, LedgerStore};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A pair's progress as seen by callers
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub pair: Pair,
    pub phase_state: PhaseState,
    pub last_updated: Option<DateTime<Utc>>,
    pub filter_batch_ids: Vec<String>,
    pub score_batch_ids: Vec<String>,
}

impl LedgerEntry {
    fn from_record(pair: Pair, record: LedgerRecord) -> Self {
        Self {
            pair,
            phase_state: record.status,
            last_updated: record.last_updated,
            filter_batch_ids: record.filter_batch_ids,
            score_batch_ids: record.score_batch_ids,
        }
    }

    fn to_record(&self) -> LedgerRecord {
        LedgerRecord {
            status: self.phase_state,
            last_updated: self.last_updated,
            filter_batch_ids: self.filter_batch_ids.clone(),
            score_batch_ids: self.score_batch_ids.clone(),
        }
    }
}

/// Counts of pairs per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub pending: usize,
    pub filter_complete: usize,
    pub score_complete: usize,
}

impl LedgerStats {
    pub fn total(&self) -> usize {
        self.pending + self.filter_complete + self.score_complete
    }

    pub fn count(&self, state: PhaseState) -> usize {
        match state {
            PhaseState::Pending => self.pending,
            PhaseState::FilterComplete => self.filter_complete,
            PhaseState::ScoreComplete => self.score_complete,
        }
    }
}

/// Persistent mapping of (entity, topic) → phase state
pub struct JobLedger {
    store: Arc<dyn LedgerStore>,
    entries: BTreeMap<Pair, LedgerEntry>,
}

impl std::fmt::Debug for JobLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLedger")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl JobLedger {
    /// Load the ledger from `store`.
    pub fn open(store: Arc<dyn LedgerStore>) -> LedgerResult<Self> {
        let mut entries = BTreeMap::new();
        for (key, record) in store.load()? {
            let pair = Pair::from_key(&key).ok_or_else(|| LedgerError::InvalidKey(key.clone()))?;
            entries.insert(pair.clone(), LedgerEntry::from_record(pair, record));
        }
        debug!(entries = entries.len(), "ledger loaded");
        Ok(Self { store, entries })
    }

    /// A ledger backed by a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(super::store::MemoryLedgerStore::new()),
            entries: BTreeMap::new(),
        }
    }

    /// Create pending entries for pairs seen for the first time.
    ///
    /// Returns the number of new entries.
    pub fn seed(&mut self, pairs: &[Pair]) -> LedgerResult<usize> {
        let mut added = Vec::new();
        for pair in pairs {
            if !self.entries.contains_key(pair) {
                self.entries.insert(
                    pair.clone(),
                    LedgerEntry::from_record(pair.clone(), LedgerRecord::new(PhaseState::Pending)),
                );
                added.push(pair.clone());
            }
        }
        if added.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.persist() {
            for pair in &added {
                self.entries.remove(pair);
            }
            return Err(e);
        }
        info!(added = added.len(), "seeded new pairs");
        Ok(added.len())
    }

    pub fn state(&self, pair: &Pair) -> Option<PhaseState> {
        self.entries.get(pair).map(|e| e.phase_state)
    }

    pub fn entry(&self, pair: &Pair) -> Option<&LedgerEntry> {
        self.entries.get(pair)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All pairs whose state qualifies as input to `phase`.
    pub fn get_pending(&self, phase: Phase) -> Vec<Pair> {
        let wanted = phase.input_state();
        self.entries
            .values()
            .filter(|e| e.phase_state == wanted)
            .map(|e| e.pair.clone())
            .collect()
    }

    /// Pending pairs for `phase`, restricted to `scope`.
    ///
    /// A pair in scope that the ledger has never seen counts as pending for
    /// the Filter phase.
    pub fn get_pending_within(&self, phase: Phase, scope: &[Pair]) -> Vec<Pair> {
        let wanted = phase.input_state();
        let mut seen = HashSet::new();
        scope
            .iter()
            .filter(|pair| seen.insert((*pair).clone()))
            .filter(|pair| match self.entries.get(*pair) {
                Some(entry) => entry.phase_state == wanted,
                None => wanted == PhaseState::Pending,
            })
            .cloned()
            .collect()
    }

    /// Move `pair` forward to `to`, recording the batches that produced it.
    ///
    /// Returns `Ok(false)` without touching storage if the pair is already
    /// at or past `to`.
    pub fn advance(&mut self, pair: &Pair, to: PhaseState, batch_ids: &[String]) -> LedgerResult<bool> {
        let previous = self.entries.get(pair).cloned();
        if let Some(entry) = &previous {
            if entry.phase_state >= to {
                debug!(pair = %pair, state = %entry.phase_state, target = %to, "advance is a no-op");
                return Ok(false);
            }
        }

        let mut entry = previous.clone().unwrap_or_else(|| {
            LedgerEntry::from_record(pair.clone(), LedgerRecord::new(PhaseState::Pending))
        });
        entry.phase_state = to;
        entry.last_updated = Some(Utc::now());
        match to {
            PhaseState::FilterComplete => entry.filter_batch_ids = batch_ids.to_vec(),
            PhaseState::ScoreComplete => entry.score_batch_ids = batch_ids.to_vec(),
            PhaseState::Pending => {}
        }
        self.entries.insert(pair.clone(), entry);

        if let Err(e) = self.persist() {
            self.restore(pair, previous);
            return Err(e);
        }
        info!(pair = %pair, state = %to, "pair advanced");
        Ok(true)
    }

    /// Explicitly move `pair` back to `to` for forced reprocessing.
    ///
    /// Pairs already at or before `to` are left alone. An unknown pair is
    /// only created when resetting to `pending`.
    pub fn reset(&mut self, pair: &Pair, to: PhaseState) -> LedgerResult<bool> {
        let changed = self.reset_in_memory(pair, to);
        if changed.is_none() {
            return Ok(false);
        }
        if let Err(e) = self.persist() {
            self.restore(pair, changed.flatten());
            return Err(e);
        }
        warn!(pair = %pair, state = %to, "pair reset");
        Ok(true)
    }

    /// Reset many pairs with a single write.
    pub fn reset_all(&mut self, pairs: &[Pair], to: PhaseState) -> LedgerResult<usize> {
        let mut undo = Vec::new();
        for pair in pairs {
            if let Some(previous) = self.reset_in_memory(pair, to) {
                undo.push((pair.clone(), previous));
            }
        }
        if undo.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.persist() {
            for (pair, previous) in undo {
                self.restore(&pair, previous);
            }
            return Err(e);
        }
        warn!(count = undo.len(), state = %to, "pairs reset");
        Ok(undo.len())
    }

    /// Counts of pairs per state
    pub fn statistics(&self) -> LedgerStats {
        let mut stats = LedgerStats::default();
        for entry in self.entries.values() {
            match entry.phase_state {
                PhaseState::Pending => stats.pending += 1,
                PhaseState::FilterComplete => stats.filter_complete += 1,
                PhaseState::ScoreComplete => stats.score_complete += 1,
            }
        }
        stats
    }

    /// Entries currently in `state`
    pub fn entries_in(&self, state: PhaseState) -> Vec<&LedgerEntry> {
        self.entries
            .values()
            .filter(|e| e.phase_state == state)
            .collect()
    }

    /// Apply a reset without persisting. Returns `Some(previous)` if the
    /// entry changed, where `previous` is `None` for a newly created entry.
    fn reset_in_memory(&mut self, pair: &Pair, to: PhaseState) -> Option<Option<LedgerEntry>> {
        match self.entries.get(pair).cloned() {
            Some(existing) if existing.phase_state > to => {
                let mut entry = existing.clone();
                entry.phase_state = to;
                entry.last_updated = Some(Utc::now());
                if to < PhaseState::ScoreComplete {
                    entry.score_batch_ids.clear();
                }
                if to < PhaseState::FilterComplete {
                    entry.filter_batch_ids.clear();
                }
                self.entries.insert(pair.clone(), entry);
                Some(Some(existing))
            }
            Some(_) => None,
            None if to == PhaseState::Pending => {
                self.entries.insert(
                    pair.clone(),
                    LedgerEntry::from_record(pair.clone(), LedgerRecord::new(PhaseState::Pending)),
                );
                Some(None)
            }
            None => None,
        }
    }

    fn restore(&mut self, pair: &Pair, previous: Option<LedgerEntry>) {
        match previous {
            Some(entry) => {
                self.entries.insert(pair.clone(), entry);
            }
            None => {
                self.entries.remove(pair);
            }
        }
    }

    fn persist(&self) -> LedgerResult<()> {
        let records: BTreeMap<String, LedgerRecord> = self
            .entries
            .values()
            .map(|e| (e.pair.key(), e.to_record()))
            .collect();
        self.store.save(&records)
    }
}
