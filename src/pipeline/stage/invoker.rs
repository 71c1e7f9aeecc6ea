//! StageInvoker: one service call for one record for one pass.
//!
//! Builds the messages, calls the service once, and validates the
//! completion into a typed output. Never touches the record table.

use std::sync::Arc;

use serde_json::{Map, Value};

use super::sanitize::sanitize_completion;
use super::score::{score_report, ScorePolicy};
use super::spec::{Stage, StageOutput, StageSpec};
use crate::models::{ErrorReport, Preprocessed, ScoredReport};
use crate::pipeline::error::InvocationError;
use crate::pipeline::llm::{ChatMessage, LlmClient};

#[derive(Clone)]
pub struct StageInvoker {
    llm: Arc<dyn LlmClient>,
}

impl StageInvoker {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Issue exactly one call and validate its result. Blocks the caller.
    pub fn invoke(&self, spec: &StageSpec, input: &str) -> Result<StageOutput, InvocationError> {
        let messages = [
            ChatMessage::developer(spec.instructions.as_str()),
            ChatMessage::user(input),
        ];
        let raw = self.llm.complete(
            &spec.model,
            &messages,
            &spec.schema,
            spec.timeout,
            spec.reasoning_effort.as_deref(),
        )?;
        decode_output(spec, &raw)
    }
}

/// Validate a raw completion against the stage schema and decode it.
///
/// The payload must be a JSON object holding every required key as a
/// string. Anything else is a schema violation.
pub fn decode_output(spec: &StageSpec, raw: &str) -> Result<StageOutput, InvocationError> {
    let cleaned = sanitize_completion(raw);
    let value: Value = serde_json::from_str(&cleaned)
        .map_err(|e| InvocationError::SchemaViolation(format!("invalid JSON: {e}")))?;

    let Value::Object(map) = value else {
        return Err(InvocationError::SchemaViolation(
            "response is not a JSON object".into(),
        ));
    };

    for key in spec.schema.required_keys() {
        match map.get(key) {
            Some(Value::String(_)) => {}
            Some(_) => {
                return Err(InvocationError::SchemaViolation(format!(
                    "key '{key}' is not a string"
                )))
            }
            None => {
                return Err(InvocationError::SchemaViolation(format!(
                    "missing required key '{key}'"
                )))
            }
        }
    }

    match spec.stage {
        Stage::Preprocess => Ok(StageOutput::Preprocessed(Preprocessed {
            findings: string_field(&map, "findings")?,
            impression: string_field(&map, "impression")?,
        })),
        Stage::Detect | Stage::Verify => {
            let report = ErrorReport {
                error: string_field(&map, "error")?,
                error_reason: string_field(&map, "error_reason")?,
            };
            if spec.score_policy == ScorePolicy::RejectBlank && report.error.trim().is_empty() {
                return Err(InvocationError::SchemaViolation(
                    "'error' is blank: neither a cited error nor \"no error\"".into(),
                ));
            }
            let score = score_report(&report);
            Ok(StageOutput::Scored(ScoredReport { report, score }))
        }
    }
}

fn string_field(map: &Map<String, Value>, key: &str) -> Result<String, InvocationError> {
    map.get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| InvocationError::SchemaViolation(format!("missing required key '{key}'")))
}
