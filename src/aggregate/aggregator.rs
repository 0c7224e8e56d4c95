//! Running per-(entity, topic) stance statistics

use crate::ledger::{EntityId, Pair};
use crate::persist::{read_json, write_json, PersistResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Count and running mean of stance scores
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub count: u64,
    pub average: f64,
}

impl Aggregate {
    /// Fold one score into the running mean.
    pub fn push(&mut self, score: f64) {
        self.count += 1;
        self.average += (score - self.average) / self.count as f64;
    }

    /// Full recompute over `scores`.
    pub fn from_scores(scores: &[u8]) -> Self {
        if scores.is_empty() {
            return Self::default();
        }
        let sum: f64 = scores.iter().map(|&s| f64::from(s)).sum();
        Self {
            count: scores.len() as u64,
            average: sum / scores.len() as f64,
        }
    }
}

/// Derived summaries keyed by pair. Never the source of truth for raw
/// scores; the scored CSVs are.
#[derive(Debug, Default)]
pub struct Aggregator {
    path: Option<PathBuf>,
    cells: BTreeMap<Pair, Aggregate>,
}

impl Aggregator {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load `aggregates.json`, starting empty if it is absent.
    pub fn open(path: impl Into<PathBuf>) -> PersistResult<Self> {
        let path = path.into();
        let stored: BTreeMap<String, Aggregate> = read_json(&path)?.unwrap_or_default();
        let mut cells = BTreeMap::new();
        for (key, aggregate) in stored {
            match Pair::from_key(&key) {
                Some(pair) => {
                    cells.insert(pair, aggregate);
                }
                None => warn!(key = %key, path = %path.display(), "ignoring malformed aggregate key"),
            }
        }
        Ok(Self {
            path: Some(path),
            cells,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Incremental mean update for one new score.
    pub fn update(&mut self, entity: EntityId, topic: &str, score: u8) -> Aggregate {
        let cell = self.cells.entry(Pair::new(entity, topic)).or_default();
        cell.push(f64::from(score));
        *cell
    }

    pub fn reset_pair(&mut self, pair: &Pair) {
        self.cells.remove(pair);
    }

    /// Replace a pair's statistics with exactly `scores`, so re-scoring a
    /// pair never double counts.
    pub fn replace_pair(&mut self, pair: &Pair, scores: &[u8]) -> Option<Aggregate> {
        self.reset_pair(pair);
        for &score in scores {
            self.update(pair.entity_id, &pair.topic, score);
        }
        self.get(pair)
    }

    pub fn get(&self, pair: &Pair) -> Option<Aggregate> {
        self.cells.get(pair).copied()
    }

    /// Per-topic statistics for one entity.
    pub fn snapshot_entity(&self, entity: EntityId) -> BTreeMap<String, Aggregate> {
        self.cells
            .iter()
            .filter(|(pair, _)| pair.entity_id == entity)
            .map(|(pair, agg)| (pair.topic.clone(), *agg))
            .collect()
    }

    /// Per-entity statistics for one topic.
    pub fn snapshot_topic(&self, topic: &str) -> BTreeMap<EntityId, Aggregate> {
        self.cells
            .iter()
            .filter(|(pair, _)| pair.topic == topic)
            .map(|(pair, agg)| (pair.entity_id, *agg))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn save(&self) -> PersistResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let flat: BTreeMap<String, Aggregate> = self
            .cells
            .iter()
            .map(|(pair, agg)| (pair.key(), *agg))
            .collect();
        write_json(path, &flat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    #[test]
    fn incremental_mean_matches_recompute() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let len = rng.gen_range(1..40);
            let scores: Vec<u8> = (0..len).map(|_| rng.gen_range(1..=10)).collect();

            let mut agg = Aggregator::in_memory();
            for (i, &s) in scores.iter().enumerate() {
                let running = agg.update(EntityId(1), "economy", s);
                let expected = Aggregate::from_scores(&scores[..=i]);
                assert_eq!(running.count, expected.count);
                assert!((running.average - expected.average).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn repeats_are_counted() {
        let mut agg = Aggregator::in_memory();
        for _ in 0..3 {
            agg.update(EntityId(1), "economy", 7);
        }
        let cell = agg.get(&Pair::new(1, "economy")).unwrap();
        assert_eq!(cell.count, 3);
        assert_eq!(cell.average, 7.0);
    }

    #[test]
    fn replace_pair_does_not_double_count() {
        let mut agg = Aggregator::in_memory();
        let pair = Pair::new(1, "economy");
        agg.replace_pair(&pair, &[2, 4]);
        let cell = agg.replace_pair(&pair, &[2, 4]).unwrap();
        assert_eq!(cell.count, 2);
        assert_eq!(cell.average, 3.0);
        assert!(agg.replace_pair(&pair, &[]).is_none());
    }

    #[test]
    fn snapshots_slice_by_entity_and_topic() {
        let mut agg = Aggregator::in_memory();
        agg.update(EntityId(1), "economy", 2);
        agg.update(EntityId(1), "housing", 8);
        agg.update(EntityId(2), "economy", 6);

        let by_entity = agg.snapshot_entity(EntityId(1));
        assert_eq!(by_entity.keys().collect::<Vec<_>>(), vec!["economy", "housing"]);

        let by_topic = agg.snapshot_topic("economy");
        assert_eq!(by_topic.len(), 2);
        assert_eq!(by_topic[&EntityId(2)].average, 6.0);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aggregates.json");
        let mut agg = Aggregator::open(&path).unwrap();
        agg.update(EntityId(3), "economy", 5);
        agg.save().unwrap();

        let reopened = Aggregator::open(&path).unwrap();
        assert_eq!(reopened.get(&Pair::new(3, "economy")).unwrap().count, 1);
        assert!(std::fs::read_to_string(&path).unwrap().contains("\"3_economy\""));
    }
}
