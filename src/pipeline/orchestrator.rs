//! PipelineOrchestrator: drives one batch through the three passes.
//!
//! Preprocessing → Detecting → Verifying → Done. Each pass runs the
//! concurrent executor, then the retry coordinator over its failures, and
//! only then writes results into the table. Workers never see the table.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::error::PipelineError;
use super::events::{PipelineEvent, PipelineState, ProgressSink};
use super::executor::{ConcurrentStageExecutor, StageRun};
use super::llm::LlmClient;
use super::retry::{RetryCoordinator, RetryRequest};
use super::stage::{Stage, StageInvoker, StageOutput, StageSpec};
use crate::config::PipelineConfig;
use crate::models::{BatchSummary, RecordId, RecordTable};

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Result of a batch run: the augmented table plus what went wrong.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_state: PipelineState,
    pub table: RecordTable,
    pub summary: BatchSummary,
    /// Removed after preprocessing failed every attempt.
    pub dropped: Vec<RecordId>,
    /// Kept without a detection result.
    pub unresolved_detect: Vec<RecordId>,
    /// Kept with the detection result copied over, unverified.
    pub unresolved_verify: Vec<RecordId>,
}

impl PipelineReport {
    pub fn has_failures(&self) -> bool {
        !(self.dropped.is_empty()
            && self.unresolved_detect.is_empty()
            && self.unresolved_verify.is_empty())
    }
}

pub struct PipelineOrchestrator {
    config: PipelineConfig,
    executor: ConcurrentStageExecutor,
    retry: RetryCoordinator,
}

// ═══════════════════════════════════════════════════════════
// Run
// ═══════════════════════════════════════════════════════════

impl PipelineOrchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, config: PipelineConfig) -> Self {
        let invoker = StageInvoker::new(llm);
        let executor = ConcurrentStageExecutor::new(invoker.clone(), config.workers);
        let retry = RetryCoordinator::new(invoker, executor.slots());
        Self {
            config,
            executor,
            retry,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every pass over `table` and return it augmented.
    ///
    /// Only an invalid configuration is an error, and it is raised before
    /// any service call. Per-record failures end up in the report.
    pub async fn run(
        &self,
        mut table: RecordTable,
        progress: &dyn ProgressSink,
    ) -> Result<PipelineReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();

        if let Err(e) = self.config.validate() {
            tracing::error!(%run_id, error = %e, "Batch rejected");
            enter(PipelineState::Failed, table.len(), progress);
            return Err(e);
        }

        tracing::info!(
            %run_id,
            records = table.len(),
            workers = self.config.workers,
            "Batch started"
        );

        // Preprocessing
        enter(PipelineState::Preprocessing, table.len(), progress);
        let inputs = stage_inputs(Stage::Preprocess, &table, table.ids());
        let run = self.run_stage(Stage::Preprocess, inputs, progress).await;
        for (id, output) in run.succeeded {
            if let StageOutput::Preprocessed(value) = output {
                table.set_preprocessed(id, value);
            }
        }
        let doomed: BTreeSet<RecordId> = table
            .iter()
            .filter(|r| r.preprocessed.is_none())
            .map(|r| r.id)
            .collect();
        for (id, e) in &run.failed {
            tracing::error!(record_id = %id, error = %e, "Preprocessing failed, record dropped");
        }
        table.remove_ids(&doomed);
        let dropped: Vec<RecordId> = doomed.into_iter().collect();
        if !dropped.is_empty() {
            progress.emit(&PipelineEvent::RecordsDropped {
                ids: dropped.clone(),
            });
        }

        // Detecting
        enter(PipelineState::Detecting, table.len(), progress);
        let inputs = stage_inputs(Stage::Detect, &table, table.ids());
        let run = self.run_stage(Stage::Detect, inputs, progress).await;
        for (id, output) in run.succeeded {
            if let StageOutput::Scored(value) = output {
                table.set_stage1(id, value);
            }
        }
        let unresolved_detect: Vec<RecordId> = run.failed.keys().copied().collect();
        for id in &unresolved_detect {
            tracing::warn!(record_id = %id, "Detection unresolved, record kept without a score");
        }
        table.copy_stage1_into_stage2();

        // Verifying
        let candidates = table.candidate_ids();
        enter(PipelineState::Verifying, candidates.len(), progress);
        let inputs = stage_inputs(Stage::Verify, &table, candidates);
        let run = self.run_stage(Stage::Verify, inputs, progress).await;
        for (id, output) in run.succeeded {
            if let StageOutput::Scored(value) = output {
                table.set_stage2(id, value);
            }
        }
        let unresolved_verify: Vec<RecordId> = run.failed.keys().copied().collect();
        for id in &unresolved_verify {
            tracing::warn!(record_id = %id, "Verification unresolved, detection result kept");
        }

        // Done
        let summary = BatchSummary::compute(&table, dropped.len());
        enter(PipelineState::Done, table.len(), progress);
        tracing::info!(
            %run_id,
            records = summary.records,
            dropped = summary.dropped,
            candidates = summary.candidates,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch complete"
        );

        Ok(PipelineReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            final_state: PipelineState::Done,
            table,
            summary,
            dropped,
            unresolved_detect,
            unresolved_verify,
        })
    }

    /// First pass plus retries for one stage. `failed` holds only ids that
    /// are still failing after retry.
    async fn run_stage(
        &self,
        stage: Stage,
        inputs: Vec<(RecordId, String)>,
        progress: &dyn ProgressSink,
    ) -> StageRun {
        let plan = self.config.plan(stage);
        let spec = Arc::new(
            StageSpec::new(stage, &plan.model, self.config.instructions(stage), plan.timeout)
                .with_reasoning_effort(plan.reasoning_effort.as_deref())
                .with_score_policy(self.config.score_policy),
        );

        let mut by_id: BTreeMap<RecordId, String> = inputs.iter().cloned().collect();
        let first = self.executor.run(Arc::clone(&spec), inputs, progress).await;

        let requests: Vec<RetryRequest> = first
            .failed
            .into_iter()
            .map(|(id, error)| RetryRequest {
                id,
                input: by_id.remove(&id).unwrap_or_default(),
                previous_error: Some(error),
            })
            .collect();

        let retried = self
            .retry
            .retry(spec, requests, plan.max_attempts, plan.backoff, progress)
            .await;

        let mut succeeded = first.succeeded;
        succeeded.extend(retried.recovered);
        StageRun {
            succeeded,
            failed: retried.still_failed,
        }
    }
}

fn enter(state: PipelineState, records: usize, progress: &dyn ProgressSink) {
    tracing::info!(state = state.as_str(), records, "Pipeline state");
    progress.emit(&PipelineEvent::StateChanged { state, records });
}

/// Inputs for `ids`, skipping records missing a prerequisite field.
fn stage_inputs(stage: Stage, table: &RecordTable, ids: Vec<RecordId>) -> Vec<(RecordId, String)> {
    ids.into_iter()
        .filter_map(|id| {
            let record = table.get(id)?;
            stage.build_input(record).map(|input| (id, input))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::models::{ErrorReport, Label, ScoredReport};
    use crate::pipeline::events::NoProgress;
    use crate::pipeline::llm::{MockLlmClient, MockRequest, ServiceError};
    use crate::pipeline::retry::BackoffPolicy;

    const LATERALITY: &str = "Left kidney shows cyst; impression: right kidney cyst";
    const NO_ERROR: &str = r#"{"error": "no error", "error_reason": "N/A"}"#;
    const CYST_ERROR: &str = r#"{"error": "right kidney cyst", "error_reason": "laterality conflict"}"#;

    fn fast_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.workers = 4;
        for plan in [&mut config.preprocess, &mut config.detect, &mut config.verify] {
            plan.backoff = BackoffPolicy::None;
        }
        config
    }

    fn is_verify(req: &MockRequest<'_>) -> bool {
        req.user_content().starts_with("<preprocessed report JSON>")
    }

    /// Echo preprocessing; detection and verification answer per report.
    fn scripted<F>(detect: F) -> MockLlmClient
    where
        F: Fn(&str, bool) -> Result<String, ServiceError> + Send + Sync + 'static,
    {
        MockLlmClient::new(move |req| {
            if req.schema_name == "preprocessing" {
                let findings = serde_json::to_string(req.user_content()).unwrap_or_default();
                return Ok(format!(r#"{{"findings": {findings}, "impression": "imp"}}"#));
            }
            detect(req.user_content(), is_verify(req))
        })
    }

    #[tokio::test]
    async fn laterality_conflict_is_confirmed_and_queued_for_review() {
        let llm = Arc::new(scripted(|_, _| Ok(CYST_ERROR.into())));
        let orchestrator = PipelineOrchestrator::new(llm.clone(), fast_config());
        let table = RecordTable::from_texts([LATERALITY]);

        let report = orchestrator.run(table, &NoProgress).await.unwrap();
        let record = report.table.get(RecordId(0)).unwrap();

        assert_eq!(record.stage1_score(), Some(0));
        assert_eq!(record.stage2_score(), Some(0));
        assert_eq!(
            record.stage2.as_ref().unwrap().report.error_reason,
            "laterality conflict"
        );
        assert_eq!(report.table.next_pending_review(), Some(RecordId(0)));
        assert_eq!(report.summary.candidates, 1);
        assert_eq!(llm.calls(), 3);
        assert_eq!(report.final_state, PipelineState::Done);
    }

    #[tokio::test]
    async fn no_error_skips_verification_and_copies_scores() {
        let verify_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&verify_calls);
        let llm = Arc::new(scripted(move |_, verify| {
            if verify {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(NO_ERROR.into())
        }));
        let orchestrator = PipelineOrchestrator::new(llm, fast_config());
        let table = RecordTable::from_texts(["Normal chest radiograph."]);

        let report = orchestrator.run(table, &NoProgress).await.unwrap();
        let record = report.table.get(RecordId(0)).unwrap();

        assert_eq!(verify_calls.load(Ordering::SeqCst), 0);
        assert_eq!(record.stage1_score(), Some(1));
        assert_eq!(record.stage2, record.stage1);
        assert_eq!(report.summary.stage2.mean, Some(1.0));
    }

    #[tokio::test]
    async fn preprocessing_failure_drops_the_record() {
        let llm = Arc::new(MockLlmClient::new(|req| {
            if req.schema_name == "preprocessing" {
                if req.user_content() == "report 7" {
                    return Ok("I cannot help with that.".into());
                }
                return Ok(r#"{"findings": "f", "impression": "i"}"#.into());
            }
            Ok(NO_ERROR.into())
        }));
        let events = Mutex::new(Vec::new());
        let sink = |e: &PipelineEvent| events.lock().unwrap().push(e.clone());

        let orchestrator = PipelineOrchestrator::new(llm, fast_config());
        let table = RecordTable::from_texts((0..10).map(|i| format!("report {i}")));
        let report = orchestrator.run(table, &sink).await.unwrap();

        assert_eq!(report.dropped, vec![RecordId(7)]);
        assert!(!report.table.contains(RecordId(7)));
        assert_eq!(report.table.len(), 9);
        assert_eq!(report.summary.records, 9);
        assert_eq!(report.summary.dropped, 1);
        assert_eq!(report.summary.stage1.count, 9);
        assert!(report.table.iter().all(|r| r.preprocessed.is_some()));
        assert!(events.into_inner().unwrap().contains(&PipelineEvent::RecordsDropped {
            ids: vec![RecordId(7)]
        }));
    }

    #[tokio::test]
    async fn invalid_config_fails_before_any_call() {
        let llm = Arc::new(MockLlmClient::fixed(NO_ERROR));
        let events = Mutex::new(Vec::new());
        let sink = |e: &PipelineEvent| events.lock().unwrap().push(e.clone());

        let mut config = fast_config();
        config.detect.model.clear();
        let orchestrator = PipelineOrchestrator::new(llm.clone(), config);
        let result = orchestrator.run(RecordTable::from_texts(["a", "b"]), &sink).await;

        assert!(matches!(result, Err(PipelineError::Configuration(_))));
        assert_eq!(llm.calls(), 0);
        assert_eq!(
            events.into_inner().unwrap(),
            vec![PipelineEvent::StateChanged {
                state: PipelineState::Failed,
                records: 2,
            }]
        );
    }

    #[tokio::test]
    async fn states_are_entered_in_order() {
        let llm = Arc::new(scripted(|input, _| {
            if input.contains("cyst") {
                Ok(CYST_ERROR.into())
            } else {
                Ok(NO_ERROR.into())
            }
        }));
        let states = Mutex::new(Vec::new());
        let sink = |e: &PipelineEvent| {
            if let PipelineEvent::StateChanged { state, records } = e {
                states.lock().unwrap().push((*state, *records));
            }
        };

        let orchestrator = PipelineOrchestrator::new(llm, fast_config());
        let table = RecordTable::from_texts([LATERALITY, "normal", "normal"]);
        orchestrator.run(table, &sink).await.unwrap();

        assert_eq!(
            states.into_inner().unwrap(),
            vec![
                (PipelineState::Preprocessing, 3),
                (PipelineState::Detecting, 3),
                (PipelineState::Verifying, 1),
                (PipelineState::Done, 3),
            ]
        );
    }

    #[tokio::test]
    async fn unresolved_detection_keeps_record_without_score() {
        let llm = Arc::new(scripted(|input, _| {
            if input.contains("bad") {
                Err(ServiceError::Connection("reset by peer".into()))
            } else {
                Ok(CYST_ERROR.into())
            }
        }));
        let orchestrator = PipelineOrchestrator::new(llm.clone(), fast_config());
        let table = RecordTable::from_texts(["bad report", LATERALITY]);

        let report = orchestrator.run(table, &NoProgress).await.unwrap();
        let record = report.table.get(RecordId(0)).unwrap();

        assert!(record.stage1.is_none());
        assert!(record.stage2.is_none());
        assert_eq!(report.unresolved_detect, vec![RecordId(0)]);
        assert_eq!(report.summary.stage1.count, 1);
        // 2 preprocess + (2 detect + 3 retries) + 1 verify
        assert_eq!(llm.calls(), 8);
        assert!(report.has_failures());
    }

    #[tokio::test]
    async fn unresolved_verification_keeps_copied_detection() {
        let llm = Arc::new(scripted(|_, verify| {
            if verify {
                Ok("{}".into())
            } else {
                Ok(CYST_ERROR.into())
            }
        }));
        let orchestrator = PipelineOrchestrator::new(llm, fast_config());
        let report = orchestrator
            .run(RecordTable::from_texts([LATERALITY]), &NoProgress)
            .await
            .unwrap();
        let record = report.table.get(RecordId(0)).unwrap();

        assert_eq!(report.unresolved_verify, vec![RecordId(0)]);
        assert_eq!(record.stage2, record.stage1);
        assert_eq!(record.stage2_score(), Some(0));
    }

    #[tokio::test]
    async fn verification_can_clear_a_false_positive() {
        let llm = Arc::new(scripted(|_, verify| {
            if verify {
                Ok(NO_ERROR.into())
            } else {
                Ok(CYST_ERROR.into())
            }
        }));
        let orchestrator = PipelineOrchestrator::new(llm, fast_config());
        let report = orchestrator
            .run(RecordTable::from_texts([LATERALITY]), &NoProgress)
            .await
            .unwrap();
        let record = report.table.get(RecordId(0)).unwrap();

        assert_eq!(record.stage1_score(), Some(0));
        assert_eq!(record.stage2_score(), Some(1));
        assert_eq!(report.table.next_pending_review(), None);
        assert_eq!(report.summary.candidates, 0);
    }

    #[tokio::test]
    async fn retried_success_matches_first_attempt_success() {
        let stable = Arc::new(scripted(|_, _| Ok(CYST_ERROR.into())));
        let seen = Mutex::new(HashSet::new());
        let flaky = Arc::new(scripted(move |input, verify| {
            // First detection call per report fails.
            if !verify && seen.lock().unwrap().insert(input.to_string()) {
                return Err(ServiceError::Api {
                    status: 503,
                    body: "busy".into(),
                });
            }
            Ok(CYST_ERROR.into())
        }));

        let texts = [LATERALITY, "second report"];
        let a = PipelineOrchestrator::new(stable, fast_config())
            .run(RecordTable::from_texts(texts), &NoProgress)
            .await
            .unwrap();
        let b = PipelineOrchestrator::new(flaky, fast_config())
            .run(RecordTable::from_texts(texts), &NoProgress)
            .await
            .unwrap();

        assert_eq!(a.table, b.table);
        assert!(b.unresolved_detect.is_empty());
    }

    #[tokio::test]
    async fn labels_are_unset_after_a_run() {
        let llm = Arc::new(scripted(|_, _| Ok(CYST_ERROR.into())));
        let orchestrator = PipelineOrchestrator::new(llm, fast_config());
        let mut report = orchestrator
            .run(RecordTable::from_texts([LATERALITY, LATERALITY]), &NoProgress)
            .await
            .unwrap();

        assert_eq!(report.table.label_counts().unset, 2);
        assert!(report.table.set_label(RecordId(0), Label::TruePositive));
        assert_eq!(report.table.next_pending_review(), Some(RecordId(1)));
    }

    #[tokio::test]
    async fn copy_invariant_holds_for_mixed_batch() {
        let llm = Arc::new(scripted(|input, verify| {
            if verify {
                return Ok(NO_ERROR.into());
            }
            if input.contains("cyst") {
                Ok(CYST_ERROR.into())
            } else {
                Ok(NO_ERROR.into())
            }
        }));
        let orchestrator = PipelineOrchestrator::new(llm, fast_config());
        let report = orchestrator
            .run(
                RecordTable::from_texts([LATERALITY, "clear", "clear", LATERALITY]),
                &NoProgress,
            )
            .await
            .unwrap();

        for record in report.table.iter() {
            if record.stage1_score() == Some(1) {
                assert_eq!(record.stage2, record.stage1);
            }
        }
        let expected = ScoredReport {
            report: ErrorReport {
                error: "no error".into(),
                error_reason: "N/A".into(),
            },
            score: 1,
        };
        assert_eq!(report.table.get(RecordId(3)).unwrap().stage2, Some(expected));
    }

    #[tokio::test]
    async fn preprocessing_recovered_on_retry_keeps_the_record() {
        let seen = Mutex::new(HashSet::new());
        let llm = Arc::new(MockLlmClient::new(move |req| {
            if req.schema_name == "preprocessing" {
                if seen.lock().unwrap().insert(req.user_content().to_string()) {
                    return Err(ServiceError::Api {
                        status: 503,
                        body: "busy".into(),
                    });
                }
                return Ok(r#"{"findings": "f", "impression": "i"}"#.into());
            }
            Ok(NO_ERROR.into())
        }));
        let orchestrator = PipelineOrchestrator::new(llm.clone(), fast_config());
        let report = orchestrator
            .run(RecordTable::from_texts(["first", "second"]), &NoProgress)
            .await
            .unwrap();

        assert!(report.dropped.is_empty());
        assert_eq!(report.table.len(), 2);
        assert!(report.table.iter().all(|r| r.preprocessed.is_some()));
        assert_eq!(report.summary.stage1.count, 2);
        // 2 failed + 2 retried preprocess + 2 detect
        assert_eq!(llm.calls(), 6);
    }

    #[tokio::test]
    async fn verification_recovered_on_retry_overwrites_stage2() {
        let verify_attempts = AtomicUsize::new(0);
        let llm = Arc::new(scripted(move |_, verify| {
            if !verify {
                return Ok(CYST_ERROR.into());
            }
            if verify_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ServiceError::Timeout(Duration::from_secs(1)));
            }
            Ok(NO_ERROR.into())
        }));
        let orchestrator = PipelineOrchestrator::new(llm.clone(), fast_config());
        let report = orchestrator
            .run(RecordTable::from_texts([LATERALITY]), &NoProgress)
            .await
            .unwrap();
        let record = report.table.get(RecordId(0)).unwrap();

        assert!(report.unresolved_verify.is_empty());
        assert_eq!(record.stage1_score(), Some(0));
        assert_eq!(record.stage2_score(), Some(1));
        assert_eq!(record.stage2.as_ref().unwrap().report.error, "no error");
        assert_eq!(report.summary.candidates, 0);
        assert_eq!(llm.calls(), 4);
    }

    #[tokio::test]
    async fn reasoning_effort_is_sent_to_detection_and_verification_only() {
        let seen: Arc<Mutex<Vec<(String, bool, Option<String>)>>> = Arc::default();
        let log = Arc::clone(&seen);
        let llm = Arc::new(MockLlmClient::new(move |req| {
            log.lock().unwrap().push((
                req.schema_name.to_string(),
                is_verify(req),
                req.reasoning_effort.map(str::to_string),
            ));
            if req.schema_name == "preprocessing" {
                return Ok(r#"{"findings": "f", "impression": "i"}"#.into());
            }
            Ok(CYST_ERROR.into())
        }));
        let orchestrator = PipelineOrchestrator::new(llm, fast_config());
        orchestrator
            .run(RecordTable::from_texts([LATERALITY]), &NoProgress)
            .await
            .unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("preprocessing".to_string(), false, None),
                ("error_report".to_string(), false, Some("high".to_string())),
                ("error_report".to_string(), true, Some("high".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn timed_out_preprocessing_never_exceeds_one_worker() {
        let llm = Arc::new(
            MockLlmClient::new(|_| Ok(r#"{"findings": "f", "impression": "i"}"#.into()))
                .with_latency(Duration::from_millis(300)),
        );
        let mut config = fast_config();
        config.workers = 1;
        config.preprocess.timeout = Duration::from_millis(50);
        config.preprocess.max_attempts = 2;
        let orchestrator = PipelineOrchestrator::new(llm.clone(), config);

        let report = orchestrator
            .run(RecordTable::from_texts(["only"]), &NoProgress)
            .await
            .unwrap();

        assert_eq!(report.dropped, vec![RecordId(0)]);
        assert_eq!(llm.calls(), 3);
        assert!(llm.peak_in_flight() <= 1);
    }

    #[tokio::test]
    async fn empty_table_completes() {
        let llm = Arc::new(MockLlmClient::fixed(NO_ERROR));
        let orchestrator = PipelineOrchestrator::new(llm.clone(), fast_config());
        let report = orchestrator.run(RecordTable::new(), &NoProgress).await.unwrap();
        assert_eq!(report.summary.records, 0);
        assert_eq!(report.summary.stage1.mean, None);
        assert_eq!(llm.calls(), 0);
    }
}
