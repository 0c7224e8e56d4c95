//! Progress-tracking identifiers: entities, pairs, phases, and phase states

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical identifier of a tracked entity (a speaker's `person_id`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl EntityId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// The unit of progress tracking: one entity analysed on one topic
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pair {
    pub entity_id: EntityId,
    pub topic: String,
}

impl Pair {
    pub fn new(entity_id: impl Into<EntityId>, topic: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            topic: topic.into(),
        }
    }

    /// Flat key used in persisted state files (`<entity>_<topic>`).
    pub fn key(&self) -> String {
        format!("{}_{}", self.entity_id, self.topic)
    }

    /// Parse a key produced by [`Pair::key`].
    ///
    /// Entity ids are numeric, so the first underscore always separates
    /// the entity from the topic even when the topic contains underscores.
    pub fn from_key(key: &str) -> Option<Self> {
        let (entity, topic) = key.split_once('_')?;
        let entity = entity.parse::<i64>().ok()?;
        if topic.is_empty() {
            return None;
        }
        Some(Self::new(entity, topic))
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.entity_id, self.topic)
    }
}

/// One of the two sequential processing stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Filter,
    Score,
}

impl Phase {
    /// The ledger state a pair must be in to be input to this phase.
    pub fn input_state(&self) -> PhaseState {
        match self {
            Phase::Filter => PhaseState::Pending,
            Phase::Score => PhaseState::FilterComplete,
        }
    }

    /// The ledger state a pair reaches when this phase completes.
    pub fn output_state(&self) -> PhaseState {
        match self {
            Phase::Filter => PhaseState::FilterComplete,
            Phase::Score => PhaseState::ScoreComplete,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Filter => "filter",
            Phase::Score => "score",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase progress of a pair. Ordered: states only advance forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Pending,
    FilterComplete,
    ScoreComplete,
}

impl PhaseState {
    pub const ALL: [PhaseState; 3] = [
        PhaseState::Pending,
        PhaseState::FilterComplete,
        PhaseState::ScoreComplete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseState::Pending => "pending",
            PhaseState::FilterComplete => "filter_complete",
            PhaseState::ScoreComplete => "score_complete",
        }
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_round_trips_topic_with_underscores() {
        let pair = Pair::new(30_749, "judicial_reform");
        assert_eq!(pair.key(), "30749_judicial_reform");
        assert_eq!(Pair::from_key(&pair.key()), Some(pair));
    }

    #[test]
    fn pair_key_rejects_non_numeric_entity() {
        assert_eq!(Pair::from_key("abc_topic"), None);
        assert_eq!(Pair::from_key("12_"), None);
        assert_eq!(Pair::from_key("12"), None);
    }

    #[test]
    fn states_are_ordered_by_progress() {
        assert!(PhaseState::Pending < PhaseState::FilterComplete);
        assert!(PhaseState::FilterComplete < PhaseState::ScoreComplete);
    }

    #[test]
    fn state_serializes_as_snake_case() {
        let json = serde_json::to_string(&PhaseState::FilterComplete).unwrap();
        assert_eq!(json, "\"filter_complete\"");
    }

    #[test]
    fn phase_maps_to_input_and_output_states() {
        assert_eq!(Phase::Filter.input_state(), PhaseState::Pending);
        assert_eq!(Phase::Filter.output_state(), PhaseState::FilterComplete);
        assert_eq!(Phase::Score.input_state(), PhaseState::FilterComplete);
        assert_eq!(Phase::Score.output_state(), PhaseState::ScoreComplete);
    }
}
