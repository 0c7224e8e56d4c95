//! SQLite source backed by the speeches database

use super::traits::SourceProvider;
use super::types::{EntityProfile, ReferenceEntity, SourceError, SourceResult, WorkUnit};
use crate::ledger::EntityId;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

const SPEECHES_VIEW: &str = "knesset_speeches_view";

/// Read-only view over the speeches database
///
/// Expects a `knesset_speeches_view` view (id, text, date, person_id, ...)
/// and a `people` table (person_id, first_name, surname, faction,
/// party_name).
#[derive(Debug)]
pub struct SqliteSource {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteSource {
    /// Open read-only and verify the speeches view exists.
    pub fn open(path: impl AsRef<Path>) -> SourceResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SourceError::NotFound(path.to_path_buf()));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
        )?;

        let has_view: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'view' AND name = ?1",
                params![SPEECHES_VIEW],
                |row| row.get(0),
            )
            .optional()?;
        if has_view.is_none() {
            return Err(SourceError::Schema {
                path: path.to_path_buf(),
                object: SPEECHES_VIEW.to_string(),
            });
        }

        debug!(path = %path.display(), "opened source database");
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn full_name(first: Option<String>, surname: Option<String>) -> String {
    format!("{} {}", first.unwrap_or_default(), surname.unwrap_or_default())
        .trim()
        .to_string()
}

impl SourceProvider for SqliteSource {
    fn work_units(&self, entity: EntityId) -> SourceResult<Vec<WorkUnit>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, text, date, person_id
             FROM knesset_speeches_view
             WHERE person_id = ?1
             ORDER BY date, id",
        )?;
        let rows = stmt.query_map(params![entity.get()], |row| {
            Ok(WorkUnit {
                id: row.get(0)?,
                text: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                date: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                entity_id: EntityId(row.get(3)?),
            })
        })?;

        let mut units = Vec::new();
        for row in rows {
            units.push(row?);
        }
        debug!(entity = %entity, units = units.len(), "loaded work units");
        Ok(units)
    }

    fn reference_entities(&self) -> SourceResult<Vec<ReferenceEntity>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT person_id, first_name, surname, faction, party_name
             FROM people
             ORDER BY person_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        // people has one row per term; keep the first row for each person
        let mut entities: Vec<ReferenceEntity> = Vec::new();
        for row in rows {
            let (id, first, surname, faction, party) = row?;
            if entities.last().map(|e| e.entity_id.get()) == Some(id) {
                continue;
            }
            entities.push(ReferenceEntity {
                entity_id: EntityId(id),
                name: full_name(first, surname),
                affiliation: faction.or(party).filter(|s| !s.trim().is_empty()),
            });
        }
        Ok(entities)
    }

    fn entity_profile(&self, entity: EntityId) -> SourceResult<Option<EntityProfile>> {
        let conn = self.conn();
        let profile = conn
            .query_row(
                "SELECT first_name, surname, faction, party_name
                 FROM people
                 WHERE person_id = ?1
                 LIMIT 1",
                params![entity.get()],
                |row| {
                    Ok(EntityProfile {
                        entity_id: entity,
                        name: full_name(row.get(0)?, row.get(1)?),
                        faction: row.get(2)?,
                        party: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("speeches.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE speeches (id INTEGER PRIMARY KEY, text TEXT, date TEXT, person_id INTEGER, knesset INTEGER);
             CREATE VIEW knesset_speeches_view AS SELECT id, text, date, person_id, knesset FROM speeches;
             CREATE TABLE people (person_id INTEGER, first_name TEXT, surname TEXT, faction TEXT, party_name TEXT);
             INSERT INTO speeches VALUES (3, 'third', '2020-01-02', 1, 24);
             INSERT INTO speeches VALUES (1, 'first', '2020-01-01', 1, 24);
             INSERT INTO speeches VALUES (2, NULL, '2020-01-01', 1, 24);
             INSERT INTO speeches VALUES (4, 'other', '2020-01-01', 2, 24);
             INSERT INTO people VALUES (1, 'Dana', 'Levi', 'Blue', 'Blue Party');
             INSERT INTO people VALUES (1, 'Dana', 'Levi', 'Green', NULL);
             INSERT INTO people VALUES (2, 'Avi', 'Cohen', NULL, 'Red Party');",
        )
        .unwrap();
        path
    }

    #[test]
    fn work_units_are_ordered_by_date_then_id() {
        let dir = TempDir::new().unwrap();
        let source = SqliteSource::open(fixture(&dir)).unwrap();

        let units = source.work_units(EntityId(1)).unwrap();
        let ids: Vec<i64> = units.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(units[1].is_blank());
    }

    #[test]
    fn reference_entities_are_deduplicated() {
        let dir = TempDir::new().unwrap();
        let source = SqliteSource::open(fixture(&dir)).unwrap();

        let entities = source.reference_entities().unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].name, "Dana Levi");
        assert_eq!(entities[1].affiliation.as_deref(), Some("Red Party"));
    }

    #[test]
    fn profile_describes_faction_and_party() {
        let dir = TempDir::new().unwrap();
        let source = SqliteSource::open(fixture(&dir)).unwrap();

        let profile = source.entity_profile(EntityId(2)).unwrap().unwrap();
        assert_eq!(profile.description(), "Faction: N/A, Party: Red Party");
        assert!(source.entity_profile(EntityId(99)).unwrap().is_none());
    }

    #[test]
    fn missing_view_is_a_schema_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE people (person_id INTEGER);")
            .unwrap();

        assert!(matches!(SqliteSource::open(&path), Err(SourceError::Schema { .. })));
        assert!(matches!(
            SqliteSource::open(dir.path().join("absent.db")),
            Err(SourceError::NotFound(_))
        ));
    }
}
