//! Records read from the source database

use crate::ledger::EntityId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// One source text record (a speech). Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: i64,
    pub text: String,
    /// Timestamp as stored by the source, passed through untouched
    pub date: String,
    pub entity_id: EntityId,
}

impl WorkUnit {
    pub fn new(id: i64, entity_id: impl Into<EntityId>, date: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            date: date.into(),
            entity_id: entity_id.into(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// A canonical name the resolver can match against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntity {
    pub entity_id: EntityId,
    pub name: String,
    /// Faction or party, shown when asking the operator to choose
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<String>,
}

impl ReferenceEntity {
    pub fn new(entity_id: impl Into<EntityId>, name: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            name: name.into(),
            affiliation: None,
        }
    }

    pub fn with_affiliation(mut self, affiliation: impl Into<String>) -> Self {
        self.affiliation = Some(affiliation.into());
        self
    }
}

/// Display details for report headers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityProfile {
    pub entity_id: EntityId,
    pub name: String,
    pub faction: Option<String>,
    pub party: Option<String>,
}

impl EntityProfile {
    /// One-line description used in `main.json`.
    pub fn description(&self) -> String {
        format!(
            "Faction: {}, Party: {}",
            self.faction.as_deref().unwrap_or("N/A"),
            self.party.as_deref().unwrap_or("N/A")
        )
    }
}

/// Errors from the source-record provider
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("database not found at {0}")]
    NotFound(PathBuf),

    #[error("database at {path} is missing {object}")]
    Schema { path: PathBuf, object: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

pub type SourceResult<T> = Result<T, SourceError>;
