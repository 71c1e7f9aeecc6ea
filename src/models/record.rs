//! A single report carried through the three analysis passes.

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════
// Identity
// ═══════════════════════════════════════════

/// Stable ordinal key of a record, assigned at ingestion.
///
/// Ids are never reused within a table, even after the record is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════
// Structured stage outputs
// ═══════════════════════════════════════════

/// Output of the preprocessing pass: the report reduced to its two
/// diagnostically relevant sections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preprocessed {
    pub findings: String,
    pub impression: String,
}

impl Preprocessed {
    /// Compact JSON form fed to the detection and verification passes.
    pub fn to_prompt_json(&self) -> String {
        serde_json::json!({
            "findings": self.findings,
            "impression": self.impression,
        })
        .to_string()
    }
}

/// Output of the detection and verification passes.
///
/// `error` cites the erroneous statement, or reads "no error" when the
/// report is internally consistent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error: String,
    pub error_reason: String,
}

impl ErrorReport {
    pub fn to_prompt_json(&self) -> String {
        serde_json::json!({
            "error": self.error,
            "error_reason": self.error_reason,
        })
        .to_string()
    }
}

/// A scored error report. `score` is 1 when no error was detected,
/// 0 when the report carries a candidate error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoredReport {
    pub report: ErrorReport,
    pub score: u8,
}

impl ScoredReport {
    pub fn is_candidate(&self) -> bool {
        self.score == 0
    }
}

// ═══════════════════════════════════════════
// Labels
// ═══════════════════════════════════════════

/// Terminal classification assigned during review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Label {
    #[default]
    #[serde(rename = "")]
    Unset,
    #[serde(rename = "TP")]
    TruePositive,
    #[serde(rename = "FP")]
    FalsePositive,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::TruePositive => "TP",
            Self::FalsePositive => "FP",
        }
    }
}

// ═══════════════════════════════════════════
// Record
// ═══════════════════════════════════════════

/// One unit of work.
///
/// Stage fields are written only by the orchestrator, after a whole pass has
/// drained, never by the workers that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub raw_text: String,
    pub preprocessed: Option<Preprocessed>,
    pub stage1: Option<ScoredReport>,
    pub stage2: Option<ScoredReport>,
    #[serde(default)]
    pub label: Label,
}

impl Record {
    pub fn new(id: RecordId, raw_text: impl Into<String>) -> Self {
        Self {
            id,
            raw_text: raw_text.into(),
            preprocessed: None,
            stage1: None,
            stage2: None,
            label: Label::Unset,
        }
    }

    pub fn stage1_score(&self) -> Option<u8> {
        self.stage1.as_ref().map(|s| s.score)
    }

    pub fn stage2_score(&self) -> Option<u8> {
        self.stage2.as_ref().map(|s| s.score)
    }

    /// Verified score after review: a false positive counts as "no error".
    pub fn accuracy_3_score(&self) -> Option<u8> {
        match self.label {
            Label::FalsePositive => Some(1),
            _ => self.stage2_score(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_has_no_stage_fields() {
        let record = Record::new(RecordId(3), "Liver unremarkable.");
        assert_eq!(record.id, RecordId(3));
        assert!(record.preprocessed.is_none());
        assert!(record.stage1_score().is_none());
        assert!(record.stage2_score().is_none());
        assert_eq!(record.label, Label::Unset);
    }

    #[test]
    fn false_positive_label_clears_the_reviewed_score() {
        let mut record = Record::new(RecordId(0), "x");
        assert_eq!(record.accuracy_3_score(), None);

        record.stage2 = Some(ScoredReport {
            report: ErrorReport {
                error: "right kidney cyst".into(),
                error_reason: "laterality".into(),
            },
            score: 0,
        });
        assert_eq!(record.accuracy_3_score(), Some(0));
        record.label = Label::TruePositive;
        assert_eq!(record.accuracy_3_score(), Some(0));
        record.label = Label::FalsePositive;
        assert_eq!(record.accuracy_3_score(), Some(1));
    }

    #[test]
    fn prompt_json_carries_both_sections() {
        let pre = Preprocessed {
            findings: "Left kidney cyst".into(),
            impression: "Right kidney cyst".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&pre.to_prompt_json()).unwrap();
        assert_eq!(value["findings"], "Left kidney cyst");
        assert_eq!(value["impression"], "Right kidney cyst");
    }

    #[test]
    fn label_serializes_to_review_codes() {
        assert_eq!(serde_json::to_string(&Label::Unset).unwrap(), "\"\"");
        assert_eq!(serde_json::to_string(&Label::TruePositive).unwrap(), "\"TP\"");
        let parsed: Label = serde_json::from_str("\"FP\"").unwrap();
        assert_eq!(parsed, Label::FalsePositive);
        assert_eq!(parsed.as_str(), "FP");
    }

    #[test]
    fn record_id_displays_as_number() {
        assert_eq!(RecordId(42).to_string(), "42");
        assert_eq!(serde_json::to_string(&RecordId(42)).unwrap(), "42");
    }
}
