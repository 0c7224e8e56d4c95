//! In-memory source for tests and demos

use super::traits::SourceProvider;
use super::types::{EntityProfile, ReferenceEntity, SourceResult, WorkUnit};
use crate::ledger::EntityId;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Source records held in memory
///
/// Counts `work_units` calls per entity so tests can check the
/// query-once-per-run contract.
#[derive(Debug, Default)]
pub struct InMemorySource {
    units: BTreeMap<EntityId, Vec<WorkUnit>>,
    entities: Vec<ReferenceEntity>,
    profiles: BTreeMap<EntityId, EntityProfile>,
    queries: Mutex<BTreeMap<EntityId, usize>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity: ReferenceEntity) -> Self {
        self.profiles.insert(
            entity.entity_id,
            EntityProfile {
                entity_id: entity.entity_id,
                name: entity.name.clone(),
                faction: entity.affiliation.clone(),
                party: None,
            },
        );
        self.entities.push(entity);
        self
    }

    pub fn with_unit(mut self, unit: WorkUnit) -> Self {
        self.units.entry(unit.entity_id).or_default().push(unit);
        self
    }

    pub fn with_units(self, units: impl IntoIterator<Item = WorkUnit>) -> Self {
        units.into_iter().fold(self, |source, unit| source.with_unit(unit))
    }

    /// Number of `work_units` calls made for `entity`.
    pub fn queries_for(&self, entity: EntityId) -> usize {
        let queries = self.queries.lock().unwrap_or_else(|p| p.into_inner());
        queries.get(&entity).copied().unwrap_or(0)
    }
}

impl SourceProvider for InMemorySource {
    fn work_units(&self, entity: EntityId) -> SourceResult<Vec<WorkUnit>> {
        *self
            .queries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(entity)
            .or_default() += 1;

        let mut units = self.units.get(&entity).cloned().unwrap_or_default();
        units.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
        Ok(units)
    }

    fn reference_entities(&self) -> SourceResult<Vec<ReferenceEntity>> {
        Ok(self.entities.clone())
    }

    fn entity_profile(&self, entity: EntityId) -> SourceResult<Option<EntityProfile>> {
        Ok(self.profiles.get(&entity).cloned())
    }
}
