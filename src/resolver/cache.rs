//! Persistent resolution cache (`entity_resolution_cache.json`)

use crate::ledger::EntityId;
use crate::persist::{JsonDocument, PersistResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// How a name was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Exact,
    Fuzzy,
    Manual,
}

/// A resolved name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityResolution {
    pub input_name: String,
    pub entity_id: EntityId,
    /// Similarity of the accepted match, in `[0, 1]`
    pub confidence: f64,
    pub method: ResolutionMethod,
    #[serde(default = "Utc::now")]
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResolution {
    entity_id: EntityId,
    confidence: f64,
    method: ResolutionMethod,
    #[serde(default = "Utc::now")]
    resolved_at: DateTime<Utc>,
}

/// Name → resolution, keyed by the exact input string
///
/// Entries are authoritative: a cached name is never re-matched until it is
/// removed with `forget`.
#[derive(Debug)]
pub struct ResolutionCache {
    doc: JsonDocument<BTreeMap<String, CachedResolution>>,
}

impl ResolutionCache {
    pub fn open(path: impl Into<PathBuf>) -> PersistResult<Self> {
        Ok(Self {
            doc: JsonDocument::open(path)?,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            doc: JsonDocument::in_memory(),
        }
    }

    pub fn get(&self, name: &str) -> Option<EntityResolution> {
        self.doc.get().get(name).map(|c| EntityResolution {
            input_name: name.to_string(),
            entity_id: c.entity_id,
            confidence: c.confidence,
            method: c.method,
            resolved_at: c.resolved_at,
        })
    }

    /// Cache a resolution and flush. If the write fails the cache is left
    /// as it was.
    pub fn insert(&mut self, resolution: &EntityResolution) -> PersistResult<()> {
        let name = resolution.input_name.clone();
        let previous = self.doc.get_mut().insert(
            name.clone(),
            CachedResolution {
                entity_id: resolution.entity_id,
                confidence: resolution.confidence,
                method: resolution.method,
                resolved_at: resolution.resolved_at,
            },
        );
        if let Err(e) = self.doc.save() {
            match previous {
                Some(previous) => self.doc.get_mut().insert(name, previous),
                None => self.doc.get_mut().remove(&name),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Remove a cached name. Returns whether it was present.
    pub fn forget(&mut self, name: &str) -> PersistResult<bool> {
        let Some(removed) = self.doc.get_mut().remove(name) else {
            return Ok(false);
        };
        if let Err(e) = self.doc.save() {
            self.doc.get_mut().insert(name.to_string(), removed);
            return Err(e);
        }
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.doc.get().len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.get().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn cache_survives_reopen_and_accepts_hand_edits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entity_resolution_cache.json");
        std::fs::write(
            &path,
            r#"{ "Dana Levi": { "entity_id": 12, "confidence": 1.0, "method": "manual" } }"#,
        )
        .unwrap();

        let mut cache = ResolutionCache::open(&path).unwrap();
        assert_eq!(cache.get("Dana Levi").unwrap().entity_id, EntityId(12));

        cache.forget("Dana Levi").unwrap();
        let reopened = ResolutionCache::open(&path).unwrap();
        assert!(reopened.get("Dana Levi").is_none());
    }

    #[test]
    fn failed_write_leaves_cache_unchanged() {
        let dir = TempDir::new().unwrap();
        let mut cache = ResolutionCache::open(dir.path().join("state").join("cache.json")).unwrap();
        let kept = EntityResolution {
            input_name: "Dana Levi".to_string(),
            entity_id: EntityId(12),
            confidence: 1.0,
            method: ResolutionMethod::Exact,
            resolved_at: Utc::now(),
        };
        cache.insert(&kept).unwrap();

        // Replace the directory with a file so every later write fails
        std::fs::remove_dir_all(dir.path().join("state")).unwrap();
        std::fs::write(dir.path().join("state"), "not a directory").unwrap();

        let new = EntityResolution {
            input_name: "Y. Mizrahi".to_string(),
            entity_id: EntityId(10),
            ..kept.clone()
        };
        assert!(cache.insert(&new).is_err());
        assert!(cache.get("Y. Mizrahi").is_none());

        let changed = EntityResolution {
            entity_id: EntityId(99),
            ..kept.clone()
        };
        assert!(cache.insert(&changed).is_err());
        assert_eq!(cache.get("Dana Levi").unwrap().entity_id, EntityId(12));

        assert!(cache.forget("Dana Levi").is_err());
        assert!(cache.get("Dana Levi").is_some());
        assert_eq!(cache.len(), 1);
    }
}
