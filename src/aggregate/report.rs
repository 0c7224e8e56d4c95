//! JSON report files consumed by the client

use super::aggregator::{Aggregate, Aggregator};
use crate::config::DataLayout;
use crate::ledger::{EntityId, Pair};
use crate::persist::{write_json, PersistResult};
use crate::source::EntityProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicSummary {
    #[serde(rename = "topicName")]
    pub topic_name: String,
    pub count: u64,
    pub average: f64,
}

/// `mk_data/<entity>/main.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityReport {
    pub id: EntityId,
    #[serde(rename = "knessetSiteId")]
    pub site_id: EntityId,
    pub name: String,
    #[serde(rename = "imageUrl")]
    pub image_url: String,
    pub description: String,
    #[serde(rename = "Topics")]
    pub topics: Vec<TopicSummary>,
}

impl EntityReport {
    pub fn build(entity: EntityId, profile: Option<&EntityProfile>, topics: &BTreeMap<String, Aggregate>) -> Self {
        let (name, description) = match profile {
            Some(p) => (p.name.clone(), p.description()),
            None => (entity.to_string(), EntityProfile::default().description()),
        };
        Self {
            id: entity,
            site_id: entity,
            name,
            image_url: String::new(),
            description,
            topics: topics
                .iter()
                .map(|(topic, agg)| TopicSummary {
                    topic_name: topic.clone(),
                    count: agg.count,
                    average: round2(agg.average),
                })
                .collect(),
        }
    }
}

/// `topics/<topic>.json`: entity id → `[count, average]`
pub type TopicReport = BTreeMap<String, (u64, f64)>;

pub fn topic_report(entities: &BTreeMap<EntityId, Aggregate>) -> TopicReport {
    entities
        .iter()
        .map(|(id, agg)| (id.to_string(), (agg.count, round2(agg.average))))
        .collect()
}

/// Renders aggregator snapshots into the client report files
#[derive(Debug, Clone)]
pub struct ReportWriter {
    layout: DataLayout,
}

impl ReportWriter {
    pub fn new(layout: DataLayout) -> Self {
        Self { layout }
    }

    /// Rewrite both reports a pair contributes to.
    pub fn write_pair(
        &self,
        aggregator: &Aggregator,
        pair: &Pair,
        profile: Option<&EntityProfile>,
    ) -> PersistResult<()> {
        let entity = EntityReport::build(pair.entity_id, profile, &aggregator.snapshot_entity(pair.entity_id));
        write_json(&self.layout.entity_report_path(pair.entity_id), &entity)?;

        let topic = topic_report(&aggregator.snapshot_topic(&pair.topic));
        write_json(&self.layout.topic_report_path(&pair.topic), &topic)
    }
}
