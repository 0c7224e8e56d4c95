//! Shared fixtures for the pipeline integration tests
//!
//! A `Harness` is a temp data directory plus a config with zero waits. The
//! scripted backends answer filter and score requests from per-unit tables.

#![allow(dead_code)]

use knessight::backend::{MockBackend, MockReply};
use knessight::batch::SubmitterConfig;
use knessight::config::{DataLayout, PipelineConfig, PromptSet};
use knessight::pipeline::{parse_filter_custom_id, parse_score_custom_id};
use knessight::source::{InMemorySource, ReferenceEntity, WorkUnit};
use knessight::{Aggregator, FilterPipeline, RunReport, ScorePipeline, Workspace};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const TOPICS: &[&str] = &["economy", "security"];

pub fn topics() -> Vec<String> {
    TOPICS.iter().map(|t| t.to_string()).collect()
}

pub fn prompts() -> PromptSet {
    let descriptions: BTreeMap<String, String> = TOPICS
        .iter()
        .map(|t| (t.to_string(), format!("Speeches about {}", t)))
        .collect();
    let scoring: BTreeMap<String, String> = TOPICS
        .iter()
        .map(|t| (t.to_string(), format!("Score the speaker's stance on {}.", t)))
        .collect();
    PromptSet::new("Rate each topic:\n{topic_descriptions}", descriptions, scoring)
}

pub fn config() -> PipelineConfig {
    PipelineConfig {
        poll_interval: Duration::ZERO,
        retry_backoff: Duration::ZERO,
        reasoning_rate: 0.0,
        ..PipelineConfig::default()
    }
}

pub fn immediate() -> SubmitterConfig {
    SubmitterConfig::immediate()
}

/// `count` units for `entity`, ids starting at `first_id`
pub fn units(entity: i64, first_id: i64, count: i64) -> Vec<WorkUnit> {
    (0..count)
        .map(|i| {
            let id = first_id + i;
            WorkUnit::new(id, entity, format!("2021-03-{:02}", (i % 28) + 1), format!("Speech number {}", id))
        })
        .collect()
}

pub fn source(units: Vec<WorkUnit>) -> InMemorySource {
    InMemorySource::new()
        .with_entity(ReferenceEntity::new(1, "Dana Levi").with_affiliation("Blue"))
        .with_entity(ReferenceEntity::new(2, "Avi Cohen").with_affiliation("Green"))
        .with_units(units)
}

/// Per-unit answers for both phases. Units missing from `relevance` get 1
/// for every topic; units missing from `stance` get 5.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub relevance: HashMap<i64, u8>,
    pub stance: HashMap<i64, u8>,
    /// Units whose score completion is not valid JSON
    pub malformed_score: Vec<i64>,
}

impl Script {
    pub fn relevance(mut self, unit: i64, score: u8) -> Self {
        self.relevance.insert(unit, score);
        self
    }

    pub fn stance(mut self, unit: i64, score: u8) -> Self {
        self.stance.insert(unit, score);
        self
    }

    pub fn malformed(mut self, unit: i64) -> Self {
        self.malformed_score.push(unit);
        self
    }

    pub fn backend(self) -> MockBackend {
        MockBackend::new(move |req| {
            if let Some(id) = parse_filter_custom_id(&req.custom_id) {
                let score = self.relevance.get(&id).copied().unwrap_or(1);
                let body: serde_json::Map<String, serde_json::Value> = TOPICS
                    .iter()
                    .map(|t| (t.to_string(), serde_json::json!({ "relevance": score })))
                    .collect();
                return MockReply::json(serde_json::Value::Object(body));
            }
            match parse_score_custom_id(&req.custom_id) {
                Some((id, _)) if self.malformed_score.contains(&id) => {
                    MockReply::Content("I would rather not say.".to_string())
                }
                Some((id, with_reasoning)) => {
                    let score = self.stance.get(&id).copied().unwrap_or(5);
                    if with_reasoning {
                        MockReply::json(serde_json::json!({ "stance_score": score, "reasoning": "Stated plainly." }))
                    } else {
                        MockReply::json(serde_json::json!({ "stance_score": score }))
                    }
                }
                None => MockReply::Dropped,
            }
        })
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub layout: DataLayout,
    pub config: PipelineConfig,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path().join("data"));
        Self {
            dir,
            layout,
            config: config(),
        }
    }

    pub fn workspace(&self, backend: Arc<MockBackend>) -> Workspace {
        Workspace::open(self.layout.clone(), &self.config, backend).unwrap()
    }

    pub async fn filter(&self, ws: &mut Workspace, source: Arc<InMemorySource>) -> RunReport {
        let pipeline = FilterPipeline::new(source, prompts(), self.layout.clone(), &self.config);
        pipeline.run(&mut ws.ledger, &mut ws.submitter, None).await
    }

    pub async fn score(&self, ws: &mut Workspace, source: Arc<InMemorySource>, seed: u64) -> RunReport {
        let mut pipeline = ScorePipeline::new(source, prompts(), self.layout.clone(), &self.config)
            .with_rng(StdRng::seed_from_u64(seed));
        let reports = ws.reports();
        pipeline
            .run(&mut ws.ledger, &mut ws.submitter, &mut ws.aggregator, &reports, None)
            .await
    }

    /// Aggregates as persisted on disk
    pub fn stored_aggregates(&self) -> Aggregator {
        Aggregator::open(self.layout.aggregates_path()).unwrap()
    }
}
