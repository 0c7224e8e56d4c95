//! Filter phase: relevance of every work unit to every pending topic
//!
//! One request per work unit covers all of that entity's pending topics.
//! Advancement is still per pair: each topic's intermediate file is written
//! and its pair advanced on its own, so one topic failing to persist never
//! holds back the others.

use super::parse::{filter_custom_id, parse_filter_custom_id, parse_relevance};
use super::records::{write_filtered, FilteredRecord};
use super::report::RunReport;
use crate::backend::{BatchMetadata, BatchRequest};
use crate::batch::{BatchJob, BatchSubmitter, FailureKind, FailureRecord};
use crate::config::{DataLayout, PipelineConfig, PromptSet};
use crate::ledger::{EntityId, JobLedger, Pair, Phase, PhaseState};
use crate::source::{SourceProvider, WorkUnit};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You are a political speech analyst. Rate speech relevance to topics \
on a scale of 1-5. Respond with JSON only.";

/// Work submitted for one entity, awaiting results
struct Submitted {
    entity: EntityId,
    topics: Vec<String>,
    units: Vec<WorkUnit>,
    jobs: Vec<BatchJob>,
}

impl Submitted {
    fn pairs(&self) -> Vec<Pair> {
        self.topics.iter().map(|t| Pair::new(self.entity, t.clone())).collect()
    }
}

pub struct FilterPipeline {
    source: Arc<dyn SourceProvider>,
    prompts: PromptSet,
    layout: DataLayout,
    model: String,
    temperature: f32,
    threshold: u8,
}

impl FilterPipeline {
    pub fn new(source: Arc<dyn SourceProvider>, prompts: PromptSet, layout: DataLayout, config: &PipelineConfig) -> Self {
        Self {
            source,
            prompts,
            layout,
            model: config.filter_model.clone(),
            temperature: config.temperature,
            threshold: config.relevance_threshold,
        }
    }

    /// Build the request for one unit against `topics`.
    pub fn request(&self, unit: &WorkUnit, topics: &[String], instructions: &str) -> BatchRequest {
        let user = format!(
            "Speech Text:\n{}\n\nTopics to evaluate:\n{}\n\n{}\n\nRespond with JSON only, format:\n\
             {{\n  \"<topic>\": {{\"relevance\": 1-5}},\n  ...\n}}",
            unit.text,
            topics.join(", "),
            instructions
        );
        BatchRequest::json_chat(filter_custom_id(unit.id), &self.model, SYSTEM_PROMPT, user, self.temperature)
    }

    /// Filter every pending pair, restricted to `scope` when given.
    pub async fn run(
        &self,
        ledger: &mut JobLedger,
        submitter: &mut BatchSubmitter,
        scope: Option<&[Pair]>,
    ) -> RunReport {
        let pending = match scope {
            Some(scope) => ledger.get_pending_within(Phase::Filter, scope),
            None => ledger.get_pending(Phase::Filter),
        };
        let mut report = RunReport::new(Phase::Filter);
        report.considered = pending.len();
        if pending.is_empty() {
            info!("no pairs pending filter");
            return report;
        }

        let mut by_entity: BTreeMap<EntityId, Vec<String>> = BTreeMap::new();
        for pair in &pending {
            by_entity.entry(pair.entity_id).or_default().push(pair.topic.clone());
        }
        info!(pairs = pending.len(), entities = by_entity.len(), "starting filter phase");

        // Submit everything first so the backend works on all entities at once.
        let mut submitted = Vec::new();
        for (entity, topics) in by_entity {
            if let Some(work) = self.submit_entity(entity, topics, ledger, submitter, &mut report).await {
                submitted.push(work);
            }
        }

        for work in submitted {
            self.collect_entity(work, ledger, submitter, &mut report).await;
        }

        info!(
            advanced = report.advanced.len(),
            failed = report.failed.len(),
            record_failures = report.record_failures,
            "filter phase finished"
        );
        report
    }

    async fn submit_entity(
        &self,
        entity: EntityId,
        topics: Vec<String>,
        ledger: &mut JobLedger,
        submitter: &mut BatchSubmitter,
        report: &mut RunReport,
    ) -> Option<Submitted> {
        let pairs: Vec<Pair> = topics.iter().map(|t| Pair::new(entity, t.clone())).collect();

        let units = match self.source.work_units(entity) {
            Ok(units) => units,
            Err(e) => {
                warn!(entity = %entity, error = %e, "could not load work units");
                for pair in &pairs {
                    report.fail(pair, format!("source error: {}", e));
                }
                return None;
            }
        };
        let total = units.len();
        let units: Vec<WorkUnit> = units.into_iter().filter(|u| !u.is_blank()).collect();
        if units.len() < total {
            debug!(entity = %entity, skipped = total - units.len(), "skipping blank work units");
        }

        let work = Submitted {
            entity,
            topics,
            units,
            jobs: Vec::new(),
        };
        if work.units.is_empty() {
            info!(entity = %entity, "no work units; writing empty outputs");
            self.finish(&work, &HashMap::new(), &[], ledger, submitter, report);
            return None;
        }

        let instructions = self.prompts.filter_instructions(&work.topics);
        let requests: Vec<BatchRequest> = work
            .units
            .iter()
            .map(|u| self.request(u, &work.topics, &instructions))
            .collect();

        let mut metadata = BatchMetadata::new();
        metadata.insert("entity".to_string(), entity.to_string());
        metadata.insert("topics".to_string(), work.topics.join(","));

        match submitter.submit(&requests, Phase::Filter, &pairs, &metadata).await {
            Ok(jobs) => {
                report.batches_submitted += jobs.len();
                Some(Submitted { jobs, ..work })
            }
            Err(e) => {
                for pair in &pairs {
                    report.fail(pair, format!("submission failed: {}", e));
                }
                None
            }
        }
    }

    async fn collect_entity(
        &self,
        work: Submitted,
        ledger: &mut JobLedger,
        submitter: &mut BatchSubmitter,
        report: &mut RunReport,
    ) {
        let pairs = work.pairs();
        let mut results = Vec::new();
        let mut batch_failure = None;
        let mut finished_jobs = Vec::new();

        for job in &work.jobs {
            let outcome = submitter.await_completion(job).await;
            match &outcome.failure {
                Some(failure) => batch_failure = Some(failure.to_string()),
                None => finished_jobs.push(outcome.job.clone()),
            }
            results.extend(outcome.results);
        }

        if let Some(reason) = batch_failure {
            // every topic shares these batches, so none of them can advance
            for pair in &pairs {
                report.fail(pair, format!("batch failed: {}", reason));
            }
            for job in &finished_jobs {
                submitter.retire(job);
            }
            return;
        }

        let batch_ids: Vec<String> = work.jobs.iter().map(|j| j.batch_id.clone()).collect();
        let known: HashSet<i64> = work.units.iter().map(|u| u.id).collect();
        let mut answered: HashSet<i64> = HashSet::new();
        let mut scores: HashMap<i64, BTreeMap<String, u8>> = HashMap::new();

        for result in &results {
            let Some(unit_id) = parse_filter_custom_id(&result.custom_id).filter(|id| known.contains(id)) else {
                warn!(custom_id = %result.custom_id, "result for an unknown request");
                continue;
            };
            answered.insert(unit_id);

            let content = match result.content() {
                Ok(content) => content,
                Err(reason) => {
                    report.record_failures += 1;
                    submitter.record_failure(
                        FailureRecord::new(FailureKind::Request, Phase::Filter, reason)
                            .with_pairs(pairs.iter().cloned())
                            .with_custom_ids([result.custom_id.clone()]),
                    );
                    continue;
                }
            };

            match parse_relevance(content, &work.topics) {
                Ok(per_topic) => {
                    let unit_scores = scores.entry(unit_id).or_default();
                    for (topic, parsed) in per_topic {
                        match parsed {
                            Ok(score) => {
                                unit_scores.insert(topic, score);
                            }
                            Err(e) => {
                                report.record_failures += 1;
                                submitter.record_failure(
                                    FailureRecord::new(FailureKind::Parse, Phase::Filter, e.to_string())
                                        .with_pairs([Pair::new(work.entity, topic)])
                                        .with_custom_ids([result.custom_id.clone()]),
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    report.record_failures += 1;
                    submitter.record_failure(
                        FailureRecord::new(FailureKind::Parse, Phase::Filter, e.to_string())
                            .with_pairs(pairs.iter().cloned())
                            .with_custom_ids([result.custom_id.clone()]),
                    );
                }
            }
        }

        let missing: Vec<String> = work
            .units
            .iter()
            .filter(|u| !answered.contains(&u.id))
            .map(|u| filter_custom_id(u.id))
            .collect();
        if !missing.is_empty() {
            report.record_failures += missing.len();
            submitter.record_failure(
                FailureRecord::new(FailureKind::Request, Phase::Filter, "no result returned")
                    .with_pairs(pairs.iter().cloned())
                    .with_custom_ids(missing),
            );
        }

        self.finish(&work, &scores, &batch_ids, ledger, submitter, report);
        for job in &work.jobs {
            submitter.retire(job);
        }
    }

    /// Write each topic's intermediate file, then advance its pair.
    fn finish(
        &self,
        work: &Submitted,
        scores: &HashMap<i64, BTreeMap<String, u8>>,
        batch_ids: &[String],
        ledger: &mut JobLedger,
        submitter: &mut BatchSubmitter,
        report: &mut RunReport,
    ) {
        for topic in &work.topics {
            let pair = Pair::new(work.entity, topic.clone());
            let records: Vec<FilteredRecord> = work
                .units
                .iter()
                .filter_map(|unit| {
                    let score = *scores.get(&unit.id)?.get(topic)?;
                    (score >= self.threshold).then(|| FilteredRecord {
                        id: unit.id,
                        text: unit.text.clone(),
                        relevance_score: score,
                        date: unit.date.clone(),
                    })
                })
                .collect();

            let path = self.layout.filtered_path(&pair);
            if let Err(e) = write_filtered(&path, &records) {
                persistence_failure(&pair, e.to_string(), submitter, report);
                continue;
            }
            match ledger.advance(&pair, PhaseState::FilterComplete, batch_ids) {
                Ok(_) => {
                    debug!(pair = %pair, kept = records.len(), "filtered records written");
                    report.records_written += records.len();
                    report.advanced.push(pair);
                }
                Err(e) => persistence_failure(&pair, e.to_string(), submitter, report),
            }
        }
    }
}

pub(crate) fn persistence_failure(pair: &Pair, reason: String, submitter: &mut BatchSubmitter, report: &mut RunReport) {
    submitter.record_failure(
        FailureRecord::new(FailureKind::Persistence, report.phase, reason.clone()).with_pairs([pair.clone()]),
    );
    report.fail(pair, format!("persistence failed: {}", reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockReply};
    use crate::batch::SubmitterConfig;
    use crate::pipeline::records::read_filtered;
    use crate::source::InMemorySource;
    use tempfile::TempDir;

    fn prompts() -> PromptSet {
        PromptSet::new(
            "Topics:\n{topic_descriptions}",
            [("economy", "Economic policy"), ("housing", "Housing")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            BTreeMap::new(),
        )
    }

    fn source() -> Arc<dyn SourceProvider> {
        Arc::new(InMemorySource::new().with_units([
            WorkUnit::new(1, 7, "2020-01-01", "budget speech"),
            WorkUnit::new(2, 7, "2020-01-02", "rent speech"),
            WorkUnit::new(3, 7, "2020-01-03", "   "),
        ]))
    }

    /// unit 1 is about the economy, unit 2 about housing
    fn backend() -> Arc<MockBackend> {
        Arc::new(MockBackend::new(|req| {
            let text = req.user_content().unwrap_or_default();
            let (economy, housing) = if text.contains("budget") { (5, 1) } else { (2, 4) };
            MockReply::json(serde_json::json!({
                "economy": {"relevance": economy},
                "housing": {"relevance": housing},
            }))
        }))
    }

    #[tokio::test]
    async fn one_request_per_unit_covers_all_topics() {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path());
        let backend = backend();
        let mut submitter = BatchSubmitter::ephemeral(backend.clone(), SubmitterConfig::immediate());
        let mut ledger = JobLedger::in_memory();
        let pairs = vec![Pair::new(7, "economy"), Pair::new(7, "housing")];
        ledger.seed(&pairs).unwrap();

        let pipeline = FilterPipeline::new(source(), prompts(), layout.clone(), &PipelineConfig::default());
        let report = pipeline.run(&mut ledger, &mut submitter, None).await;

        // blank unit 3 is never sent
        assert_eq!(backend.submitted_custom_ids(), vec!["unit_1", "unit_2"]);
        assert_eq!(report.advanced.len(), 2);
        assert!(report.is_clean());

        let economy = read_filtered(&layout.filtered_path(&pairs[0])).unwrap().unwrap();
        assert_eq!(economy.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1]);
        let housing = read_filtered(&layout.filtered_path(&pairs[1])).unwrap().unwrap();
        assert_eq!(housing[0].id, 2);
        assert_eq!(housing[0].date, "2020-01-02");
        assert_eq!(ledger.state(&pairs[0]), Some(PhaseState::FilterComplete));
        assert!(submitter.registry().is_empty());
    }

    #[tokio::test]
    async fn missing_topic_in_completion_only_drops_that_topic() {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path());
        let backend = Arc::new(MockBackend::new(|_| {
            MockReply::json(serde_json::json!({"economy": {"relevance": 4}}))
        }));
        let mut submitter = BatchSubmitter::ephemeral(backend, SubmitterConfig::immediate());
        let mut ledger = JobLedger::in_memory();
        let pairs = vec![Pair::new(7, "economy"), Pair::new(7, "housing")];

        let pipeline = FilterPipeline::new(source(), prompts(), layout.clone(), &PipelineConfig::default());
        let report = pipeline.run(&mut ledger, &mut submitter, Some(pairs.as_slice())).await;

        assert_eq!(report.advanced.len(), 2);
        assert_eq!(report.record_failures, 2);
        assert_eq!(read_filtered(&layout.filtered_path(&pairs[0])).unwrap().unwrap().len(), 2);
        assert!(read_filtered(&layout.filtered_path(&pairs[1])).unwrap().unwrap().is_empty());
        assert!(submitter
            .failures()
            .records()
            .iter()
            .all(|r| r.kind == FailureKind::Parse && r.pairs == vec![pairs[1].clone()]));
    }

    #[tokio::test]
    async fn failed_batch_holds_back_every_topic() {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path());
        let backend = Arc::new(
            MockBackend::new(|_| MockReply::json(serde_json::json!({"economy": 5, "housing": 5})))
                .with_terminal(crate::backend::RemoteStatus::Failed, 1),
        );
        let mut submitter = BatchSubmitter::ephemeral(backend, SubmitterConfig::immediate());
        let mut ledger = JobLedger::in_memory();
        let pairs = vec![Pair::new(7, "economy"), Pair::new(7, "housing")];
        ledger.seed(&pairs).unwrap();

        let pipeline = FilterPipeline::new(source(), prompts(), layout.clone(), &PipelineConfig::default());
        let report = pipeline.run(&mut ledger, &mut submitter, None).await;

        assert!(report.advanced.is_empty());
        assert_eq!(report.failed.len(), 2);
        assert_eq!(ledger.get_pending(Phase::Filter).len(), 2);
        assert!(!layout.filtered_path(&pairs[0]).exists());
        // the failed batch stays registered for inspection
        assert_eq!(submitter.registry().len(), 1);
    }

    #[tokio::test]
    async fn entity_without_units_advances_with_empty_output() {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path());
        let backend = backend();
        let mut submitter = BatchSubmitter::ephemeral(backend.clone(), SubmitterConfig::immediate());
        let mut ledger = JobLedger::in_memory();
        let pair = Pair::new(99, "economy");

        let pipeline = FilterPipeline::new(source(), prompts(), layout.clone(), &PipelineConfig::default());
        let report = pipeline.run(&mut ledger, &mut submitter, Some(std::slice::from_ref(&pair))).await;

        assert_eq!(report.advanced, vec![pair.clone()]);
        assert_eq!(backend.create_calls(), 0);
        assert!(read_filtered(&layout.filtered_path(&pair)).unwrap().unwrap().is_empty());
    }
}
