//! Ledger storage backends
//!
//! The ledger is persisted as a flat map of pair key → record. The
//! `LedgerStore` trait is the injected accessor: `JsonLedgerStore` writes
//! `job_status.json`, `MemoryLedgerStore` keeps the map in process for tests.

use super::pair::PhaseState;
use crate::persist::{self, PersistError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Errors from ledger storage
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger persistence failed: {0}")]
    Persist(#[from] PersistError),

    #[error("invalid ledger key: {0}")]
    InvalidKey(String),

    #[error("ledger store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// The persisted form of one ledger entry.
///
/// Everything except `status` is optional so operators can hand-write
/// `{"status": "pending"}` to force a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub status: PhaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_batch_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub score_batch_ids: Vec<String>,
}

impl LedgerRecord {
    pub fn new(status: PhaseState) -> Self {
        Self {
            status,
            last_updated: Some(Utc::now()),
            filter_batch_ids: Vec::new(),
            score_batch_ids: Vec::new(),
        }
    }
}

/// Storage backend for the job ledger
pub trait LedgerStore: Send + Sync {
    /// Load every persisted record, keyed by pair key.
    fn load(&self) -> LedgerResult<BTreeMap<String, LedgerRecord>>;

    /// Replace the persisted state with `records`.
    fn save(&self, records: &BTreeMap<String, LedgerRecord>) -> LedgerResult<()>;
}

/// JSON-file ledger store (`job_status.json`)
#[derive(Debug, Clone)]
pub struct JsonLedgerStore {
    path: PathBuf,
}

impl JsonLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerStore for JsonLedgerStore {
    fn load(&self) -> LedgerResult<BTreeMap<String, LedgerRecord>> {
        Ok(persist::read_json(&self.path)?.unwrap_or_default())
    }

    fn save(&self, records: &BTreeMap<String, LedgerRecord>) -> LedgerResult<()> {
        persist::write_json(&self.path, records)?;
        Ok(())
    }
}

/// In-process ledger store
///
/// Share it behind an `Arc` to simulate a process restart: drop the ledger,
/// reopen it on the same store, and the committed records are still there.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    records: Mutex<BTreeMap<String, LedgerRecord>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of what has been committed so far.
    pub fn committed(&self) -> BTreeMap<String, LedgerRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> LedgerResult<BTreeMap<String, LedgerRecord>> {
        self.records
            .lock()
            .map(|r| r.clone())
            .map_err(|e| LedgerError::Unavailable(e.to_string()))
    }

    fn save(&self, records: &BTreeMap<String, LedgerRecord>) -> LedgerResult<()> {
        let mut guard = self
            .records
            .lock()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        *guard = records.clone();
        Ok(())
    }
}
