//! Job ledger: persistent (entity, topic) → phase state tracking

mod job_ledger;
mod pair;
mod store;

pub use job_ledger::{JobLedger, LedgerEntry, LedgerStats};
pub use pair::{EntityId, Pair, Phase, PhaseState};
pub use store::{JsonLedgerStore, LedgerError, LedgerRecord, LedgerResult, LedgerStore, MemoryLedgerStore};
