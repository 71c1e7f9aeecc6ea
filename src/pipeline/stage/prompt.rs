//! Instruction texts and output schemas for the three passes.
//!
//! Prompts are plain values handed to each stage at construction; nothing
//! here is mutated at runtime.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::pipeline::error::PipelineError;
use crate::pipeline::llm::SchemaDescriptor;

pub const PREPROCESSING_SCHEMA_NAME: &str = "preprocessing";
pub const ERROR_REPORT_SCHEMA_NAME: &str = "error_report";

pub const PREPROCESSING_KEYS: &[&str] = &["findings", "impression"];
pub const ERROR_REPORT_KEYS: &[&str] = &["error", "error_reason"];

pub fn preprocessing_schema() -> SchemaDescriptor {
    SchemaDescriptor::string_object(PREPROCESSING_SCHEMA_NAME, PREPROCESSING_KEYS)
}

pub fn error_report_schema() -> SchemaDescriptor {
    SchemaDescriptor::string_object(ERROR_REPORT_SCHEMA_NAME, ERROR_REPORT_KEYS)
}

pub const PREPROCESS_INSTRUCTIONS: &str = r#"**Tasks**
1. Keep only the *Findings* section (detailed observations) and the *Impression* / *Conclusion* / *Opinion* section (diagnostic interpretation).
2. If the report has an *Addendum* or *Correction* section:
   - Sentences that amend Findings go to Findings.
   - Sentences that amend the diagnostic interpretation go to Impression.
   - When unclear, append to Impression.
   - Mark the appended text as "Addendum".
3. Drop every other section (history, technique, timestamps, signatures, headers, billing codes, etc.).
4. Replace every explicit calendar date with the literal token **[DATE]**.
5. Replace PHI with the literal token **[PHI]**.

(Output must follow the JSON schema exactly.)
{"findings":"~", "impression":"~"}
If the Findings or Impression section is missing, set the corresponding value to "N/A"."#;

pub const DETECT_INSTRUCTIONS: &str = r#"**Tasks**
Identify clinically significant errors in the provided radiology report.

1. Read the whole report and understand the clinical scenario.
2. Identify any clinically significant errors.
3. Only report errors identifiable without the images:
- Internal factual inconsistencies: statements within the same report that directly conflict (e.g., laterality, measurements).
- Objective misinterpretations: interpretations clearly contradicted by explicit statements in the Findings and Impression sections of the same report.

(Output must follow the JSON schema exactly.)
If no error is found, return
"error": "no error", "error_reason": "N/A".
If an error is found, return
"error": "(cite the erroneous statement from the report)", "error_reason": "(concise explanation; quote if necessary)"."#;

pub const VERIFY_INSTRUCTIONS: &str = r#"You will receive a 'preprocessed report JSON' and a 'previous error JSON'.

**Tasks**
Decide whether the previous error is a TRUE clinically significant internal error of the report or a FALSE POSITIVE.

An error is confirmed only when:
- Objectivity: it is objectively incorrect, factually contradictory, or undeniably inaccurate.
- Clarity: every trained radiologist would agree it is incorrect.
- Clinical importance, differences in judgment, or disagreement about what belongs in the Impression or Findings do NOT qualify.
- Only contradictions or inaccuracies inside the report itself qualify. Differences between the report and clinical information, patient history, or outside context are NEVER errors.

(Output must follow the JSON schema exactly.)
If it is a FALSE POSITIVE, return
"error": "no error", "error_reason": "N/A".
If the error is confirmed, return it unchanged."#;

/// The three instruction texts, one per pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSet {
    pub preprocess: String,
    pub detect: String,
    pub verify: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            preprocess: PREPROCESS_INSTRUCTIONS.to_string(),
            detect: DETECT_INSTRUCTIONS.to_string(),
            verify: VERIFY_INSTRUCTIONS.to_string(),
        }
    }
}

/// On-disk prompt overrides. Missing or blank entries keep the default.
#[derive(Debug, Default, Deserialize)]
struct PromptOverrides {
    preprocess: Option<String>,
    detect: Option<String>,
    verify: Option<String>,
}

impl PromptSet {
    /// Load prompt overrides from a JSON file.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("cannot read prompt file {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, PipelineError> {
        let overrides: PromptOverrides = serde_json::from_str(text)
            .map_err(|e| PipelineError::Configuration(format!("invalid prompt file: {e}")))?;

        let pick = |value: Option<String>, default: &str| match value {
            Some(v) if !v.trim().is_empty() => v,
            _ => default.to_string(),
        };

        Ok(Self {
            preprocess: pick(overrides.preprocess, PREPROCESS_INSTRUCTIONS),
            detect: pick(overrides.detect, DETECT_INSTRUCTIONS),
            verify: pick(overrides.verify, VERIFY_INSTRUCTIONS),
        })
    }
}
