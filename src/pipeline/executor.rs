//! ConcurrentStageExecutor: fan-out/fan-in of one pass over many records.
//!
//! One task per record id, at most `workers` service calls in flight, each
//! bounded by the stage timeout. The executor drains every task before
//! returning; results are handed back as maps for the orchestrator to apply.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use super::error::InvocationError;
use super::events::{PipelineEvent, ProgressSink};
use super::llm::ServiceError;
use super::stage::{StageInvoker, StageOutput, StageSpec};
use crate::models::RecordId;

/// Outcome of one pass: every submitted id lands in exactly one map.
#[derive(Debug, Default)]
pub struct StageRun {
    pub succeeded: BTreeMap<RecordId, StageOutput>,
    pub failed: BTreeMap<RecordId, InvocationError>,
}

impl StageRun {
    pub fn failed_ids(&self) -> BTreeSet<RecordId> {
        self.failed.keys().copied().collect()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

pub struct ConcurrentStageExecutor {
    invoker: StageInvoker,
    workers: usize,
    slots: Arc<Semaphore>,
}

impl ConcurrentStageExecutor {
    /// `workers` is clamped to at least one.
    pub fn new(invoker: StageInvoker, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            invoker,
            workers,
            slots: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Service-call slots. Anything else that calls the service on behalf
    /// of this executor's stages must take a slot from here first.
    pub fn slots(&self) -> Arc<Semaphore> {
        Arc::clone(&self.slots)
    }

    /// Run `spec` over every `(id, input)` pair and wait for all of them.
    ///
    /// Emits one `TaskCompleted` per id, in completion order.
    pub async fn run(
        &self,
        spec: Arc<StageSpec>,
        inputs: Vec<(RecordId, String)>,
        progress: &dyn ProgressSink,
    ) -> StageRun {
        let start = Instant::now();
        let total = inputs.len();
        let stage = spec.stage;

        tracing::info!(
            stage = stage.as_str(),
            records = total,
            workers = self.workers,
            model = %spec.model,
            "Stage pass started"
        );

        let mut tasks = JoinSet::new();
        let mut outstanding: BTreeSet<RecordId> = BTreeSet::new();

        for (id, input) in inputs {
            outstanding.insert(id);
            let slots = Arc::clone(&self.slots);
            let invoker = self.invoker.clone();
            let spec = Arc::clone(&spec);

            tasks.spawn(async move {
                let result = match acquire_slot(slots).await {
                    Ok(permit) => invoke_with_timeout(invoker, spec, input, permit).await,
                    Err(e) => Err(e),
                };
                (id, result)
            });
        }

        let mut run = StageRun::default();
        let mut completed = 0usize;

        while let Some(joined) = tasks.join_next().await {
            let (id, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    // The id is recovered from `outstanding` after the drain.
                    tracing::error!(stage = stage.as_str(), error = %e, "Stage task aborted");
                    continue;
                }
            };
            outstanding.remove(&id);
            completed += 1;
            record_result(&mut run, id, result, &spec, completed, total, progress);
        }

        for id in std::mem::take(&mut outstanding) {
            completed += 1;
            let err = InvocationError::Service(ServiceError::HttpClient(
                "worker task aborted".into(),
            ));
            record_result(&mut run, id, Err(err), &spec, completed, total, progress);
        }

        tracing::info!(
            stage = stage.as_str(),
            succeeded = run.succeeded.len(),
            failed = run.failed.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Stage pass complete"
        );

        run
    }
}

fn record_result(
    run: &mut StageRun,
    id: RecordId,
    result: Result<StageOutput, InvocationError>,
    spec: &StageSpec,
    completed: usize,
    total: usize,
    progress: &dyn ProgressSink,
) {
    let stage = spec.stage;
    match result {
        Ok(output) => {
            progress.emit(&PipelineEvent::TaskCompleted {
                id,
                stage,
                success: true,
                message: None,
                completed,
                total,
            });
            run.succeeded.insert(id, output);
        }
        Err(e) => {
            tracing::warn!(
                record_id = %id,
                stage = stage.as_str(),
                kind = ?e.kind(),
                error = %e,
                "Invocation failed"
            );
            progress.emit(&PipelineEvent::TaskCompleted {
                id,
                stage,
                success: false,
                message: Some(e.to_string()),
                completed,
                total,
            });
            run.failed.insert(id, e);
        }
    }
}

/// Wait for a free service-call slot.
pub(crate) async fn acquire_slot(
    slots: Arc<Semaphore>,
) -> Result<OwnedSemaphorePermit, InvocationError> {
    slots
        .acquire_owned()
        .await
        .map_err(|_| InvocationError::from(ServiceError::HttpClient("worker pool closed".into())))
}

/// Run one blocking invocation on the blocking pool, bounded by the stage
/// timeout. The timeout starts once the slot is held.
///
/// The permit moves into the blocking closure so the slot stays taken
/// until the service call really returns, even after the timeout fired.
pub(crate) async fn invoke_with_timeout(
    invoker: StageInvoker,
    spec: Arc<StageSpec>,
    input: String,
    permit: OwnedSemaphorePermit,
) -> Result<StageOutput, InvocationError> {
    let timeout = spec.timeout;
    let call = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        invoker.invoke(&spec, &input)
    });

    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(InvocationError::Service(ServiceError::HttpClient(format!(
            "worker failed: {join_err}"
        )))),
        Err(_) => Err(ServiceError::Timeout(timeout).into()),
    }
}
