use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::prompt::{error_report_schema, preprocessing_schema};
use super::score::ScorePolicy;
use crate::models::{ErrorReport, Preprocessed, Record, ScoredReport};
use crate::pipeline::llm::SchemaDescriptor;

/// The three sequential analysis passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preprocess,
    Detect,
    Verify,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preprocess => "preprocess",
            Self::Detect => "detect",
            Self::Verify => "verify",
        }
    }

    pub fn all() -> &'static [Stage] {
        &[Self::Preprocess, Self::Detect, Self::Verify]
    }

    /// User message for this pass, built from the record fields it depends on.
    /// `None` when a prerequisite field is missing.
    pub fn build_input(&self, record: &Record) -> Option<String> {
        match self {
            Self::Preprocess => Some(record.raw_text.clone()),
            Self::Detect => record.preprocessed.as_ref().map(Preprocessed::to_prompt_json),
            Self::Verify => {
                let pre = record.preprocessed.as_ref()?;
                let stage1 = record.stage1.as_ref()?;
                Some(verify_input(pre, &stage1.report))
            }
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The verifier sees both the report and the candidate error it is judging.
fn verify_input(pre: &Preprocessed, candidate: &ErrorReport) -> String {
    format!(
        "<preprocessed report JSON>\n{}\n\n<previous error JSON>\n{}",
        pre.to_prompt_json(),
        candidate.to_prompt_json()
    )
}

/// Everything one invocation needs: what to ask, which model, which shape
/// to expect back, and how long to wait.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub stage: Stage,
    pub model: String,
    pub instructions: String,
    pub schema: SchemaDescriptor,
    pub timeout: Duration,
    pub reasoning_effort: Option<String>,
    pub score_policy: ScorePolicy,
}

impl StageSpec {
    pub fn new(stage: Stage, model: &str, instructions: &str, timeout: Duration) -> Self {
        let schema = match stage {
            Stage::Preprocess => preprocessing_schema(),
            Stage::Detect | Stage::Verify => error_report_schema(),
        };
        Self {
            stage,
            model: model.to_string(),
            instructions: instructions.to_string(),
            schema,
            timeout,
            reasoning_effort: None,
            score_policy: ScorePolicy::default(),
        }
    }

    pub fn with_reasoning_effort(mut self, effort: Option<&str>) -> Self {
        self.reasoning_effort = effort.map(str::to_string);
        self
    }

    pub fn with_score_policy(mut self, policy: ScorePolicy) -> Self {
        self.score_policy = policy;
        self
    }
}

/// Validated, typed result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    Preprocessed(Preprocessed),
    Scored(ScoredReport),
}
