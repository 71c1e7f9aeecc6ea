//! Progress notifications emitted while a batch runs.
//!
//! Purely observational: sinks cannot slow down or alter the pipeline.

use serde::Serialize;

use super::error::InvocationErrorKind;
use super::stage::Stage;
use crate::models::RecordId;

/// Orchestrator states over a single batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Preprocessing,
    Detecting,
    Verifying,
    Done,
    /// Configuration was rejected before any call was made.
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preprocessing => "preprocessing",
            Self::Detecting => "detecting",
            Self::Verifying => "verifying",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StateChanged {
        state: PipelineState,
        /// Records entering this state.
        records: usize,
    },
    /// One first-pass task finished, successfully or not.
    TaskCompleted {
        id: RecordId,
        stage: Stage,
        success: bool,
        message: Option<String>,
        completed: usize,
        total: usize,
    },
    /// A failed id succeeded on retry.
    RetryRecovered {
        id: RecordId,
        stage: Stage,
        attempts: u32,
    },
    /// A failed id is still failing after every retry attempt.
    RetryExhausted {
        id: RecordId,
        stage: Stage,
        kind: InvocationErrorKind,
        message: String,
    },
    /// Records removed after terminal preprocessing failure.
    RecordsDropped { ids: Vec<RecordId> },
}

/// Receiver of pipeline events.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&PipelineEvent) + Send + Sync,
{
    fn emit(&self, event: &PipelineEvent) {
        self(event)
    }
}

/// Sink that discards every event.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn emit(&self, _event: &PipelineEvent) {}
}
