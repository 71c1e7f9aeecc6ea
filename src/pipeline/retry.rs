//! RetryCoordinator: second chance for ids that failed a first pass.
//!
//! Works through failed ids one at a time to keep load low while the
//! service is misbehaving. Each attempt takes a slot from the executor's
//! pool, so a retry never runs beside first-pass calls that timed out but
//! have not returned yet. Every id ends up either recovered or reported as
//! still failing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use super::error::InvocationError;
use super::events::{PipelineEvent, ProgressSink};
use super::executor::{acquire_slot, invoke_with_timeout};
use super::stage::{StageInvoker, StageOutput, StageSpec};
use crate::models::RecordId;

/// Wait between two attempts on the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// `unit * 2^attempt` after failed attempt number `attempt` (1-based).
    Exponential { unit: Duration },
    Fixed { delay: Duration },
    None,
}

impl BackoffPolicy {
    pub fn exponential_secs() -> Self {
        Self::Exponential {
            unit: Duration::from_secs(1),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Exponential { unit } => unit.saturating_mul(1u32 << attempt.min(16)),
            Self::Fixed { delay } => *delay,
            Self::None => Duration::ZERO,
        }
    }
}

/// One attempt, classified for the retry loop.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Ok(T),
    Retryable(InvocationError),
    Terminal(InvocationError),
}

impl<T> From<Result<T, InvocationError>> for AttemptOutcome<T> {
    fn from(result: Result<T, InvocationError>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(e) if e.is_retryable() => Self::Retryable(e),
            Err(e) => Self::Terminal(e),
        }
    }
}

/// An id to retry, with the input it was first invoked with.
#[derive(Debug, Clone)]
pub struct RetryRequest {
    pub id: RecordId,
    pub input: String,
    /// Error from the first pass. A terminal one is not retried.
    pub previous_error: Option<InvocationError>,
}

#[derive(Debug, Default)]
pub struct RetryRun {
    pub recovered: BTreeMap<RecordId, StageOutput>,
    pub still_failed: BTreeMap<RecordId, InvocationError>,
}

pub struct RetryCoordinator {
    invoker: StageInvoker,
    slots: Arc<Semaphore>,
}

impl RetryCoordinator {
    /// `slots` is the pool shared with the first-pass executor.
    pub fn new(invoker: StageInvoker, slots: Arc<Semaphore>) -> Self {
        Self { invoker, slots }
    }

    /// Retry each request up to `max_attempts` times, sequentially.
    pub async fn retry(
        &self,
        spec: Arc<StageSpec>,
        requests: Vec<RetryRequest>,
        max_attempts: u32,
        backoff: BackoffPolicy,
        progress: &dyn ProgressSink,
    ) -> RetryRun {
        let stage = spec.stage;
        let mut run = RetryRun::default();

        if !requests.is_empty() {
            tracing::info!(
                stage = stage.as_str(),
                count = requests.len(),
                max_attempts,
                "Retrying failed requests"
            );
        }

        for request in requests {
            let id = request.id;
            let mut last_error = request.previous_error;

            if last_error.as_ref().is_some_and(|e| !e.is_retryable()) {
                tracing::debug!(record_id = %id, stage = stage.as_str(), "Terminal failure, not retried");
            } else {
                for attempt in 1..=max_attempts {
                    let result = match acquire_slot(Arc::clone(&self.slots)).await {
                        Ok(permit) => {
                            invoke_with_timeout(
                                self.invoker.clone(),
                                Arc::clone(&spec),
                                request.input.clone(),
                                permit,
                            )
                            .await
                        }
                        Err(e) => Err(e),
                    };

                    match AttemptOutcome::from(result) {
                        AttemptOutcome::Ok(output) => {
                            tracing::info!(record_id = %id, stage = stage.as_str(), attempt, "Retry succeeded");
                            progress.emit(&PipelineEvent::RetryRecovered {
                                id,
                                stage,
                                attempts: attempt,
                            });
                            run.recovered.insert(id, output);
                            last_error = None;
                            break;
                        }
                        AttemptOutcome::Retryable(e) => {
                            tracing::warn!(
                                record_id = %id,
                                stage = stage.as_str(),
                                attempt,
                                max_attempts,
                                error = %e,
                                "Retry attempt failed"
                            );
                            last_error = Some(e);
                            if attempt < max_attempts {
                                tokio::time::sleep(backoff.delay(attempt)).await;
                            }
                        }
                        AttemptOutcome::Terminal(e) => {
                            tracing::warn!(
                                record_id = %id,
                                stage = stage.as_str(),
                                attempt,
                                error = %e,
                                "Retry attempt failed terminally"
                            );
                            last_error = Some(e);
                            break;
                        }
                    }
                }
            }

            if run.recovered.contains_key(&id) {
                continue;
            }

            let error = last_error.unwrap_or_else(|| {
                InvocationError::SchemaViolation("no retry attempts configured".into())
            });
            progress.emit(&PipelineEvent::RetryExhausted {
                id,
                stage,
                kind: error.kind(),
                message: error.to_string(),
            });
            run.still_failed.insert(id, error);
        }

        run
    }
}
