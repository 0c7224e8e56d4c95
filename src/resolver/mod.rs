//! Entity resolution: free-text names to canonical entity ids
//!
//! Lookup order is cache, exact match, fuzzy auto-accept, then the
//! `Chooser`. Whatever is decided is cached, and cached names are never
//! re-matched.

mod cache;
mod chooser;
mod fuzzy;

pub use cache::{EntityResolution, ResolutionCache, ResolutionMethod};
pub use chooser::{Candidate, Choice, Chooser, DeferringChooser, TerminalChooser};
pub use fuzzy::{normalize, partial_ratio, ratio, similarity, token_sort_ratio};

use crate::persist::PersistError;
use crate::source::{ReferenceEntity, SourceError, SourceProvider};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Top score needed to accept a fuzzy match without asking
pub const DEFAULT_ACCEPTANCE: f64 = 0.90;
/// Candidates scoring below this are not offered
pub const CANDIDATE_FLOOR: f64 = 0.5;
/// At most this many candidates are offered
pub const MAX_CANDIDATES: usize = 10;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("empty name")]
    EmptyName,

    #[error("no candidates for '{0}'")]
    NoCandidates(String),

    #[error("resolution of '{0}' deferred")]
    Deferred(String),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("cache error: {0}")]
    Persist(#[from] PersistError),
}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Outcome of resolving a list of names
#[derive(Debug, Default)]
pub struct ResolutionSummary {
    pub resolved: Vec<EntityResolution>,
    pub unresolved: Vec<(String, ResolveError)>,
}

pub struct EntityResolver {
    cache: ResolutionCache,
    source: Arc<dyn SourceProvider>,
    references: Option<Vec<ReferenceEntity>>,
    acceptance: f64,
    match_calls: usize,
}

impl std::fmt::Debug for EntityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityResolver")
            .field("cached", &self.cache.len())
            .field("acceptance", &self.acceptance)
            .finish()
    }
}

impl EntityResolver {
    pub fn new(cache: ResolutionCache, source: Arc<dyn SourceProvider>) -> Self {
        Self {
            cache,
            source,
            references: None,
            acceptance: DEFAULT_ACCEPTANCE,
            match_calls: 0,
        }
    }

    pub fn with_acceptance(mut self, threshold: f64) -> Self {
        self.acceptance = threshold;
        self
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    /// How many times names were matched against the reference set.
    pub fn match_calls(&self) -> usize {
        self.match_calls
    }

    /// Resolve one name.
    pub fn resolve(&mut self, name: &str, chooser: &mut dyn Chooser) -> ResolveResult<EntityResolution> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ResolveError::EmptyName);
        }
        if let Some(hit) = self.cache.get(name) {
            debug!(name, entity = %hit.entity_id, "resolved from cache");
            return Ok(hit);
        }

        let ranked = self.rank(name)?;
        let wanted = normalize(name);

        let exact: Vec<&Candidate> = ranked
            .iter()
            .filter(|c| normalize(&c.entity.name) == wanted)
            .collect();
        let decided = match exact.as_slice() {
            [only] => Some((only.entity.entity_id, 1.0, ResolutionMethod::Exact)),
            [] => self.auto_accept(&ranked),
            _ => None,
        };

        let resolution = match decided {
            Some((entity_id, confidence, method)) => EntityResolution {
                input_name: name.to_string(),
                entity_id,
                confidence,
                method,
                resolved_at: Utc::now(),
            },
            None => self.ask(name, &ranked, chooser)?,
        };

        self.cache.insert(&resolution)?;
        info!(
            name,
            entity = %resolution.entity_id,
            method = ?resolution.method,
            confidence = resolution.confidence,
            "name resolved"
        );
        Ok(resolution)
    }

    /// Resolve every name, collecting failures instead of stopping.
    pub fn resolve_all(&mut self, names: &[String], chooser: &mut dyn Chooser) -> ResolutionSummary {
        let mut summary = ResolutionSummary::default();
        for name in names {
            match self.resolve(name, chooser) {
                Ok(resolution) => summary.resolved.push(resolution),
                Err(e) => {
                    warn!(name = %name, error = %e, "name not resolved");
                    summary.unresolved.push((name.clone(), e));
                }
            }
        }
        summary
    }

    /// Drop a cached name so the next run matches it again.
    pub fn forget(&mut self, name: &str) -> ResolveResult<bool> {
        Ok(self.cache.forget(name.trim())?)
    }

    /// Score every reference entity against `name`, best first.
    fn rank(&mut self, name: &str) -> ResolveResult<Vec<Candidate>> {
        self.match_calls += 1;
        if self.references.is_none() {
            self.references = Some(self.source.reference_entities()?);
        }
        let references = self.references.as_deref().unwrap_or_default();

        let mut ranked: Vec<Candidate> = references
            .iter()
            .map(|entity| Candidate {
                entity: entity.clone(),
                score: similarity(name, &entity.name),
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.entity.entity_id.cmp(&b.entity.entity_id))
        });
        Ok(ranked)
    }

    /// Accept the top candidate when it clears the threshold and no other
    /// entity ties it.
    fn auto_accept(&self, ranked: &[Candidate]) -> Option<(crate::ledger::EntityId, f64, ResolutionMethod)> {
        let top = ranked.first()?;
        if top.score < self.acceptance {
            return None;
        }
        let tied = ranked[1..]
            .iter()
            .any(|c| c.entity.entity_id != top.entity.entity_id && (top.score - c.score).abs() < f64::EPSILON);
        if tied {
            return None;
        }
        Some((top.entity.entity_id, top.score, ResolutionMethod::Fuzzy))
    }

    fn ask(&self, name: &str, ranked: &[Candidate], chooser: &mut dyn Chooser) -> ResolveResult<EntityResolution> {
        let offered: Vec<Candidate> = ranked
            .iter()
            .filter(|c| c.score >= CANDIDATE_FLOOR)
            .take(MAX_CANDIDATES)
            .cloned()
            .collect();
        if offered.is_empty() {
            return Err(ResolveError::NoCandidates(name.to_string()));
        }

        match chooser.choose(name, &offered) {
            Choice::Select(idx) => {
                let picked = offered
                    .get(idx)
                    .ok_or_else(|| ResolveError::Deferred(name.to_string()))?;
                Ok(EntityResolution {
                    input_name: name.to_string(),
                    entity_id: picked.entity.entity_id,
                    confidence: picked.score,
                    method: ResolutionMethod::Manual,
                    resolved_at: Utc::now(),
                })
            }
            Choice::Skip => Err(ResolveError::Deferred(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::EntityId;
    use crate::source::InMemorySource;

    struct Pick(Option<usize>, usize);

    impl Chooser for Pick {
        fn choose(&mut self, _name: &str, _candidates: &[Candidate]) -> Choice {
            self.1 += 1;
            match self.0 {
                Some(i) => Choice::Select(i),
                None => Choice::Skip,
            }
        }
    }

    fn source() -> Arc<dyn SourceProvider> {
        Arc::new(
            InMemorySource::new()
                .with_entity(ReferenceEntity::new(1, "Dana Levi"))
                .with_entity(ReferenceEntity::new(2, "Avi Cohen"))
                .with_entity(ReferenceEntity::new(3, "Yossi Cohen"))
                .with_entity(ReferenceEntity::new(4, "Miri Peretz")),
        )
    }

    fn resolver() -> EntityResolver {
        EntityResolver::new(ResolutionCache::in_memory(), source())
    }

    #[test]
    fn exact_match_ignores_case_and_spacing() {
        let mut r = resolver();
        let res = r.resolve("  dana   LEVI", &mut DeferringChooser).unwrap();
        assert_eq!(res.entity_id, EntityId(1));
        assert_eq!(res.method, ResolutionMethod::Exact);
        assert_eq!(res.confidence, 1.0);
    }

    #[test]
    fn close_spelling_is_accepted_as_fuzzy() {
        let mut r = resolver();
        // one substitution in eleven characters
        let res = r.resolve("Miri Perets", &mut DeferringChooser).unwrap();
        assert_eq!(res.entity_id, EntityId(4));
        assert_eq!(res.method, ResolutionMethod::Fuzzy);
    }

    #[test]
    fn tie_between_entities_goes_to_the_chooser() {
        let mut r = resolver();
        let mut pick = Pick(Some(1), 0);
        let res = r.resolve("Cohen", &mut pick).unwrap();

        assert_eq!(pick.1, 1);
        assert_eq!(res.method, ResolutionMethod::Manual);
        assert_eq!(res.entity_id, EntityId(3));
    }

    #[test]
    fn skipped_choice_is_deferred_and_not_cached() {
        let mut r = resolver();
        let err = r.resolve("Cohen", &mut DeferringChooser).unwrap_err();
        assert!(matches!(err, ResolveError::Deferred(_)));
        assert!(r.cache().is_empty());
    }

    #[test]
    fn no_plausible_match_is_no_candidates() {
        let mut r = resolver();
        let err = r.resolve("Xq", &mut Pick(Some(0), 0)).unwrap_err();
        assert!(matches!(err, ResolveError::NoCandidates(_)));
    }

    #[test]
    fn resolution_is_sticky() {
        let mut r = resolver();
        let mut pick = Pick(Some(0), 0);
        let first = r.resolve("Cohen", &mut pick).unwrap();
        let calls = r.match_calls();

        let second = r.resolve("Cohen", &mut pick).unwrap();
        assert_eq!(first.entity_id, second.entity_id);
        assert_eq!(r.match_calls(), calls);
        assert_eq!(pick.1, 1);
    }

    #[test]
    fn forget_allows_rematching() {
        let mut r = resolver();
        r.resolve("Dana Levi", &mut DeferringChooser).unwrap();
        assert!(r.forget("Dana Levi").unwrap());

        r.resolve("Dana Levi", &mut DeferringChooser).unwrap();
        assert_eq!(r.match_calls(), 2);
    }

    #[test]
    fn resolve_all_collects_failures() {
        let mut r = resolver();
        let names = vec!["Dana Levi".to_string(), "Cohen".to_string(), "".to_string()];
        let summary = r.resolve_all(&names, &mut DeferringChooser);

        assert_eq!(summary.resolved.len(), 1);
        assert_eq!(summary.unresolved.len(), 2);
    }
}
