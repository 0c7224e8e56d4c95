//! Source-record provider: work units and reference names
//!
//! The pipelines treat the source as read-only.

mod memory;
mod sqlite;
mod traits;
mod types;

pub use memory::InMemorySource;
pub use sqlite::SqliteSource;
pub use traits::SourceProvider;
pub use types::{EntityProfile, ReferenceEntity, SourceError, SourceResult, WorkUnit};
