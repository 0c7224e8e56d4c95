//! Source-record provider trait

use super::types::{EntityProfile, ReferenceEntity, SourceResult, WorkUnit};
use crate::ledger::EntityId;

/// Read-only access to source records
///
/// Queried once per entity per pipeline run.
pub trait SourceProvider: Send + Sync {
    /// All work units owned by `entity`, ordered by date then id.
    fn work_units(&self, entity: EntityId) -> SourceResult<Vec<WorkUnit>>;

    /// Every canonical name the resolver may match against.
    fn reference_entities(&self) -> SourceResult<Vec<ReferenceEntity>>;

    /// Display details for `entity`, if it exists.
    fn entity_profile(&self, entity: EntityId) -> SourceResult<Option<EntityProfile>>;
}
