//! Binary score derived from an error report.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::ErrorReport;

/// "no error" sentinel: optional space or underscore, optional plural.
static NO_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^no[\s_]?errors?$").expect("valid regex"));

/// How a blank `error` field is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorePolicy {
    /// Blank error text fails validation and is retried.
    #[default]
    RejectBlank,
    /// Blank error text scores as a candidate error.
    BlankIsCandidate,
}

/// 1 when the report states there is no error, 0 otherwise.
pub fn score_error_text(error: &str) -> u8 {
    if NO_ERROR_RE.is_match(error.trim()) {
        1
    } else {
        0
    }
}

pub fn score_report(report: &ErrorReport) -> u8 {
    score_error_text(&report.error)
}
