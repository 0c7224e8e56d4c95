//! Score phase: stance of every filtered record, with sampled reasoning
//!
//! Each pair is submitted on its own. For a pair whose batches all complete,
//! the scored CSV is written first, then the aggregates and client reports,
//! and only then is the pair advanced.

use super::filter::persistence_failure;
use super::parse::{parse_score_custom_id, parse_stance, score_custom_id};
use super::records::{read_filtered, write_scored, FilteredRecord, ScoredRecord};
use super::report::RunReport;
use crate::aggregate::{Aggregator, ReportWriter};
use crate::backend::{BatchMetadata, BatchRequest};
use crate::batch::{BatchJob, BatchSubmitter, FailureKind, FailureRecord};
use crate::config::{DataLayout, PipelineConfig, PromptSet};
use crate::ledger::{EntityId, JobLedger, Pair, Phase, PhaseState};
use crate::source::{EntityProfile, SourceProvider};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "You are a political speech analyst. Score stance on topics from 1 \
(strongly opposes) to 10 (strongly supports). Respond with JSON only.";

struct Submitted {
    pair: Pair,
    records: Vec<FilteredRecord>,
    /// Whether reasoning was requested, per record id
    sampled: HashMap<i64, bool>,
    jobs: Vec<BatchJob>,
}

pub struct ScorePipeline {
    source: Arc<dyn SourceProvider>,
    prompts: PromptSet,
    layout: DataLayout,
    model: String,
    temperature: f32,
    reasoning_rate: f64,
    rng: StdRng,
}

impl ScorePipeline {
    /// Reasoning sampling draws from OS entropy; use `with_rng` for a
    /// reproducible run.
    pub fn new(source: Arc<dyn SourceProvider>, prompts: PromptSet, layout: DataLayout, config: &PipelineConfig) -> Self {
        Self {
            source,
            prompts,
            layout,
            model: config.score_model.clone(),
            temperature: config.temperature,
            reasoning_rate: config.reasoning_rate,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_reasoning_rate(mut self, rate: f64) -> Self {
        self.reasoning_rate = rate;
        self
    }

    /// Build the request for one record. The custom id records whether
    /// reasoning was asked for.
    pub fn request(&self, record: &FilteredRecord, topic: &str, prompt: &str, with_reasoning: bool) -> BatchRequest {
        let (instruction, format) = if with_reasoning {
            (
                "\nAlso provide a one-sentence reasoning for your score.",
                ", \"reasoning\": \"one sentence\"",
            )
        } else {
            ("", "")
        };
        let user = format!(
            "Speech Text:\n{}\n\nTopic: {}\n\n{}{}\n\nRespond with JSON only, format:\n{{\n  \"stance_score\": 1-10{}\n}}",
            record.text, topic, prompt, instruction, format
        );
        BatchRequest::json_chat(
            score_custom_id(record.id, with_reasoning),
            &self.model,
            SYSTEM_PROMPT,
            user,
            self.temperature,
        )
    }

    /// Score every pair that finished filtering, restricted to `scope` when
    /// given.
    pub async fn run(
        &mut self,
        ledger: &mut JobLedger,
        submitter: &mut BatchSubmitter,
        aggregator: &mut Aggregator,
        reports: &ReportWriter,
        scope: Option<&[Pair]>,
    ) -> RunReport {
        let pending = match scope {
            Some(scope) => ledger.get_pending_within(Phase::Score, scope),
            None => ledger.get_pending(Phase::Score),
        };
        let mut report = RunReport::new(Phase::Score);
        report.considered = pending.len();
        if pending.is_empty() {
            info!("no pairs pending score");
            return report;
        }
        info!(pairs = pending.len(), rate = self.reasoning_rate, "starting score phase");

        let mut submitted = Vec::new();
        for pair in pending {
            if let Some(work) = self.submit_pair(pair, submitter, &mut report).await {
                submitted.push(work);
            }
        }

        let mut profiles: HashMap<EntityId, Option<EntityProfile>> = HashMap::new();
        for work in submitted {
            let profile = self.profile(work.pair.entity_id, &mut profiles);
            self.collect_pair(work, profile, ledger, submitter, aggregator, reports, &mut report)
                .await;
        }

        info!(
            advanced = report.advanced.len(),
            failed = report.failed.len(),
            record_failures = report.record_failures,
            "score phase finished"
        );
        report
    }

    fn profile(&self, entity: EntityId, cache: &mut HashMap<EntityId, Option<EntityProfile>>) -> Option<EntityProfile> {
        cache
            .entry(entity)
            .or_insert_with(|| match self.source.entity_profile(entity) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(entity = %entity, error = %e, "could not load entity profile");
                    None
                }
            })
            .clone()
    }

    async fn submit_pair(&mut self, pair: Pair, submitter: &mut BatchSubmitter, report: &mut RunReport) -> Option<Submitted> {
        let Some(prompt) = self.prompts.scoring_prompt(&pair.topic).map(str::to_string) else {
            warn!(pair = %pair, "no scoring prompt for topic");
            report.fail(&pair, format!("no scoring prompt for topic '{}'", pair.topic));
            return None;
        };

        let path = self.layout.filtered_path(&pair);
        let records = match read_filtered(&path) {
            Ok(Some(records)) => records,
            Ok(None) => {
                persistence_failure(&pair, format!("intermediate file {} is missing", path.display()), submitter, report);
                return None;
            }
            Err(e) => {
                persistence_failure(&pair, e.to_string(), submitter, report);
                return None;
            }
        };

        if records.is_empty() {
            debug!(pair = %pair, "nothing passed the filter; writing empty outputs");
            return Some(Submitted {
                pair,
                records,
                sampled: HashMap::new(),
                jobs: Vec::new(),
            });
        }

        let mut requests = Vec::with_capacity(records.len());
        let mut sampled = HashMap::with_capacity(records.len());
        for record in &records {
            let with_reasoning = self.rng.gen::<f64>() < self.reasoning_rate;
            sampled.insert(record.id, with_reasoning);
            requests.push(self.request(record, &pair.topic, &prompt, with_reasoning));
        }

        let mut metadata = BatchMetadata::new();
        metadata.insert("pair".to_string(), pair.key());

        match submitter
            .submit(&requests, Phase::Score, std::slice::from_ref(&pair), &metadata)
            .await
        {
            Ok(jobs) => {
                report.batches_submitted += jobs.len();
                Some(Submitted {
                    pair,
                    records,
                    sampled,
                    jobs,
                })
            }
            Err(e) => {
                report.fail(&pair, format!("submission failed: {}", e));
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn collect_pair(
        &self,
        work: Submitted,
        profile: Option<EntityProfile>,
        ledger: &mut JobLedger,
        submitter: &mut BatchSubmitter,
        aggregator: &mut Aggregator,
        reports: &ReportWriter,
        report: &mut RunReport,
    ) {
        let pair = work.pair.clone();
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
            report.fail(&pair, format!("batch failed: {}", reason));
            for job in &finished_jobs {
                submitter.retire(job);
            }
            return;
        }

        let known: HashSet<i64> = work.records.iter().map(|r| r.id).collect();
        let mut answered = HashSet::new();
        let mut stances: HashMap<i64, (u8, String)> = HashMap::new();

        for result in &results {
            let Some((id, with_reasoning)) = parse_score_custom_id(&result.custom_id).filter(|(id, _)| known.contains(id))
            else {
                warn!(custom_id = %result.custom_id, "result for an unknown request");
                continue;
            };
            answered.insert(id);

            let parsed = result
                .content()
                .map_err(|reason| (FailureKind::Request, reason))
                .and_then(|content| parse_stance(content).map_err(|e| (FailureKind::Parse, e.to_string())));
            match parsed {
                Ok((score, reasoning)) => {
                    let reasoning = if with_reasoning { reasoning.unwrap_or_default() } else { String::new() };
                    stances.insert(id, (score, reasoning));
                }
                Err((kind, reason)) => {
                    report.record_failures += 1;
                    submitter.record_failure(
                        FailureRecord::new(kind, Phase::Score, reason)
                            .with_pairs([pair.clone()])
                            .with_custom_ids([result.custom_id.clone()])
                            .with_batch(work.jobs.iter().map(|j| j.batch_id.as_str()).collect::<Vec<_>>().join(",")),
                    );
                }
            }
        }

        let missing: Vec<String> = work
            .records
            .iter()
            .filter(|r| !answered.contains(&r.id))
            .map(|r| score_custom_id(r.id, work.sampled.get(&r.id).copied().unwrap_or(false)))
            .collect();
        if !missing.is_empty() {
            report.record_failures += missing.len();
            submitter.record_failure(
                FailureRecord::new(FailureKind::Request, Phase::Score, "no result returned")
                    .with_pairs([pair.clone()])
                    .with_custom_ids(missing),
            );
        }

        let scored: Vec<ScoredRecord> = work
            .records
            .iter()
            .filter_map(|record| {
                let (score, reasoning) = stances.get(&record.id)?;
                Some(ScoredRecord {
                    id: record.id,
                    date: record.date.clone(),
                    topic: pair.topic.clone(),
                    text: record.text.clone(),
                    stance_score: *score,
                    reasoning: reasoning.clone(),
                })
            })
            .collect();

        if let Err(e) = write_scored(&self.layout.scored_path(&pair), &scored) {
            persistence_failure(&pair, e.to_string(), submitter, report);
            return;
        }

        let scores: Vec<u8> = scored.iter().map(|r| r.stance_score).collect();
        aggregator.replace_pair(&pair, &scores);
        let written = aggregator
            .save()
            .and_then(|_| reports.write_pair(aggregator, &pair, profile.as_ref()));
        if let Err(e) = written {
            persistence_failure(&pair, e.to_string(), submitter, report);
            return;
        }

        let batch_ids: Vec<String> = work.jobs.iter().map(|j| j.batch_id.clone()).collect();
        if advance(ledger, &pair, &batch_ids, scored.len(), submitter, report) {
            for job in &work.jobs {
                submitter.retire(job);
            }
        }
    }
}

fn advance(
    ledger: &mut JobLedger,
    pair: &Pair,
    batch_ids: &[String],
    written: usize,
    submitter: &mut BatchSubmitter,
    report: &mut RunReport,
) -> bool {
    match ledger.advance(pair, PhaseState::ScoreComplete, batch_ids) {
        Ok(_) => {
            report.records_written += written;
            report.advanced.push(pair.clone());
            true
        }
        Err(e) => {
            persistence_failure(pair, e.to_string(), submitter, report);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockReply};
    use crate::batch::SubmitterConfig;
    use crate::pipeline::records::{read_scored, write_filtered};
    use crate::source::InMemorySource;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        layout: DataLayout,
        ledger: JobLedger,
        aggregator: Aggregator,
        reports: ReportWriter,
        pair: Pair,
    }

    fn fixture(records: &[(i64, &str)]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path());
        let pair = Pair::new(7, "economy");
        let rows: Vec<FilteredRecord> = records
            .iter()
            .map(|(id, text)| FilteredRecord {
                id: *id,
                text: text.to_string(),
                relevance_score: 5,
                date: format!("2020-01-{:02}", id),
            })
            .collect();
        write_filtered(&layout.filtered_path(&pair), &rows).unwrap();

        let mut ledger = JobLedger::in_memory();
        ledger.advance(&pair, PhaseState::FilterComplete, &[]).unwrap();
        Fixture {
            reports: ReportWriter::new(layout.clone()),
            _dir: dir,
            layout,
            ledger,
            aggregator: Aggregator::in_memory(),
            pair,
        }
    }

    fn prompts() -> PromptSet {
        let mut scoring = BTreeMap::new();
        scoring.insert("economy".to_string(), "Score economic stance.".to_string());
        PromptSet::new("{topic_descriptions}", BTreeMap::new(), scoring)
    }

    fn pipeline(layout: &DataLayout, rate: f64, seed: u64) -> ScorePipeline {
        ScorePipeline::new(Arc::new(InMemorySource::new()), prompts(), layout.clone(), &PipelineConfig::default())
            .with_reasoning_rate(rate)
            .with_rng(StdRng::seed_from_u64(seed))
    }

    fn reasoning_backend() -> Arc<MockBackend> {
        Arc::new(MockBackend::new(|req| {
            if req.custom_id.ends_with("_1") {
                MockReply::json(serde_json::json!({"stance_score": 6, "reasoning": "Because."}))
            } else {
                MockReply::json(serde_json::json!({"stance_score": 6}))
            }
        }))
    }

    #[tokio::test]
    async fn writes_scores_updates_aggregates_then_advances() {
        let mut fx = fixture(&[(1, "a"), (2, "b")]);
        let backend = Arc::new(MockBackend::new(|req| {
            let score = if req.custom_id.starts_with("score_1_") { 3 } else { 8 };
            MockReply::json(serde_json::json!({"stance_score": score}))
        }));
        let mut submitter = BatchSubmitter::ephemeral(backend, SubmitterConfig::immediate());

        let report = pipeline(&fx.layout, 0.0, 1)
            .run(
                &mut fx.ledger,
                &mut submitter,
                &mut fx.aggregator,
                &fx.reports,
                None,
            )
            .await;

        assert_eq!(report.advanced, vec![fx.pair.clone()]);
        let scored = read_scored(&fx.layout.scored_path(&fx.pair)).unwrap().unwrap();
        assert_eq!(scored.iter().map(|r| r.stance_score).collect::<Vec<_>>(), vec![3, 8]);
        assert!(scored.iter().all(|r| r.reasoning.is_empty()));

        let agg = fx.aggregator.get(&fx.pair).unwrap();
        assert_eq!(agg.count, 2);
        assert_eq!(agg.average, 5.5);
        assert!(fx.layout.entity_report_path(EntityId(7)).exists());
        assert_eq!(fx.ledger.state(&fx.pair), Some(PhaseState::ScoreComplete));
    }

    #[tokio::test]
    async fn reasoning_sample_is_reproducible_from_the_seed() {
        let records: Vec<(i64, &str)> = (1..=40).map(|i| (i, "text")).collect();

        let mut sampled = Vec::new();
        for _ in 0..2 {
            let mut fx = fixture(&records);
            let backend = reasoning_backend();
            let mut submitter = BatchSubmitter::ephemeral(backend.clone(), SubmitterConfig::immediate());
            pipeline(&fx.layout, 0.5, 42)
                .run(
                    &mut fx.ledger,
                    &mut submitter,
                    &mut fx.aggregator,
                    &fx.reports,
                    None,
                )
                .await;

            let scored = read_scored(&fx.layout.scored_path(&fx.pair)).unwrap().unwrap();
            let with: Vec<i64> = scored.iter().filter(|r| !r.reasoning.is_empty()).map(|r| r.id).collect();
            let asked: Vec<String> = backend
                .submitted_custom_ids()
                .into_iter()
                .filter(|id| id.ends_with("_1"))
                .collect();
            assert_eq!(with.len(), asked.len());
            sampled.push(with);
        }

        assert_eq!(sampled[0], sampled[1]);
        assert!(!sampled[0].is_empty() && sampled[0].len() < 40);
    }

    #[tokio::test]
    async fn malformed_score_is_excluded_but_pair_advances() {
        let mut fx = fixture(&[(1, "a"), (2, "b"), (3, "c")]);
        let backend = Arc::new(MockBackend::new(|req| {
            if req.custom_id.starts_with("score_2_") {
                MockReply::json(serde_json::json!({"stance_score": 42}))
            } else {
                MockReply::json(serde_json::json!({"stance_score": 4}))
            }
        }));
        let mut submitter = BatchSubmitter::ephemeral(backend, SubmitterConfig::immediate());

        let report = pipeline(&fx.layout, 0.0, 1)
            .run(
                &mut fx.ledger,
                &mut submitter,
                &mut fx.aggregator,
                &fx.reports,
                None,
            )
            .await;

        assert_eq!(report.advanced.len(), 1);
        assert_eq!(report.record_failures, 1);
        assert_eq!(submitter.failures().records()[0].kind, FailureKind::Parse);
        assert_eq!(fx.aggregator.get(&fx.pair).unwrap().count, 2);
    }

    #[tokio::test]
    async fn missing_result_is_logged_under_its_request_id() {
        let mut fx = fixture(&[(1, "a"), (2, "b")]);
        let backend = Arc::new(MockBackend::new(|req| {
            if req.custom_id.starts_with("score_2_") {
                MockReply::Dropped
            } else {
                MockReply::json(serde_json::json!({"stance_score": 4, "reasoning": "Because."}))
            }
        }));
        let mut submitter = BatchSubmitter::ephemeral(backend, SubmitterConfig::immediate());

        let report = pipeline(&fx.layout, 1.0, 1)
            .run(
                &mut fx.ledger,
                &mut submitter,
                &mut fx.aggregator,
                &fx.reports,
                None,
            )
            .await;

        assert_eq!(report.advanced.len(), 1);
        assert_eq!(report.record_failures, 1);
        let failure = &submitter.failures().records()[0];
        assert_eq!(failure.kind, FailureKind::Request);
        assert_eq!(failure.custom_ids, vec!["score_2_1".to_string()]);
    }

    #[tokio::test]
    async fn missing_intermediate_file_blocks_the_pair() {
        let mut fx = fixture(&[(1, "a")]);
        std::fs::remove_file(fx.layout.filtered_path(&fx.pair)).unwrap();
        let backend = reasoning_backend();
        let mut submitter = BatchSubmitter::ephemeral(backend.clone(), SubmitterConfig::immediate());

        let report = pipeline(&fx.layout, 0.0, 1)
            .run(
                &mut fx.ledger,
                &mut submitter,
                &mut fx.aggregator,
                &fx.reports,
                None,
            )
            .await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(backend.create_calls(), 0);
        assert_eq!(fx.ledger.state(&fx.pair), Some(PhaseState::FilterComplete));
        assert_eq!(submitter.failures().records()[0].kind, FailureKind::Persistence);
    }

    #[tokio::test]
    async fn empty_filtered_file_advances_with_empty_output() {
        let mut fx = fixture(&[]);
        let backend = reasoning_backend();
        let mut submitter = BatchSubmitter::ephemeral(backend.clone(), SubmitterConfig::immediate());

        let report = pipeline(&fx.layout, 0.0, 1)
            .run(
                &mut fx.ledger,
                &mut submitter,
                &mut fx.aggregator,
                &fx.reports,
                None,
            )
            .await;

        assert_eq!(report.advanced.len(), 1);
        assert_eq!(backend.create_calls(), 0);
        assert!(read_scored(&fx.layout.scored_path(&fx.pair)).unwrap().unwrap().is_empty());
    }
}
