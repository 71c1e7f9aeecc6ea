//! Batch ingestion and result persistence.
//!
//! Input is a JSON array of row objects; the report text lives in the
//! `report` column and every other column is ignored. Results are written
//! as pretty JSON next to a list of the ids that did not make it through.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{FAILED_REQUESTS_FILE, RESULTS_FILE, RESULT_STATS_FILE};
use crate::models::{LabelStats, RecordId, RecordTable};
use crate::pipeline::PipelineReport;

/// Column holding the free-text report.
pub const TEXT_COLUMN: &str = "report";

#[derive(Error, Debug)]
pub enum TableIoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("row {row} has no text column '{column}'")]
    MissingColumn { column: String, row: usize },
}

/// Read a batch from a JSON file.
pub fn load_table(path: &Path) -> Result<RecordTable, TableIoError> {
    let text = std::fs::read_to_string(path)?;
    let table = parse_table(&text)?;
    tracing::info!(path = %path.display(), records = table.len(), "Batch loaded");
    Ok(table)
}

/// Build a table from JSON rows. Fails on the first row without a string
/// `report` value, before anything is processed.
pub fn parse_table(text: &str) -> Result<RecordTable, TableIoError> {
    let rows: Vec<Map<String, Value>> = serde_json::from_str(text)?;
    let mut table = RecordTable::new();
    for (row, fields) in rows.iter().enumerate() {
        match fields.get(TEXT_COLUMN) {
            Some(Value::String(report)) => {
                table.push(report.as_str());
            }
            _ => {
                return Err(TableIoError::MissingColumn {
                    column: TEXT_COLUMN.to_string(),
                    row,
                })
            }
        }
    }
    Ok(table)
}

#[derive(Serialize)]
struct FailedRequests<'a> {
    run_id: Uuid,
    dropped: &'a [RecordId],
    unresolved_detect: &'a [RecordId],
    unresolved_verify: &'a [RecordId],
}

/// Where a run's results were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedPaths {
    pub results: PathBuf,
    pub failed_requests: PathBuf,
}

/// Write the report and its failed ids into `dir`, creating it if needed.
pub fn save_report(report: &PipelineReport, dir: &Path) -> Result<SavedPaths, TableIoError> {
    std::fs::create_dir_all(dir)?;

    let results = dir.join(RESULTS_FILE);
    std::fs::write(&results, serde_json::to_string_pretty(report)?)?;

    let failed = FailedRequests {
        run_id: report.run_id,
        dropped: &report.dropped,
        unresolved_detect: &report.unresolved_detect,
        unresolved_verify: &report.unresolved_verify,
    };
    let failed_requests = dir.join(FAILED_REQUESTS_FILE);
    std::fs::write(&failed_requests, serde_json::to_string_pretty(&failed)?)?;

    tracing::info!(
        results = %results.display(),
        failed = report.dropped.len() + report.unresolved_detect.len() + report.unresolved_verify.len(),
        "Results saved"
    );
    Ok(SavedPaths {
        results,
        failed_requests,
    })
}

/// Write review statistics for a labeled table into `dir`.
pub fn save_label_stats(table: &RecordTable, dir: &Path) -> Result<PathBuf, TableIoError> {
    std::fs::create_dir_all(dir)?;
    let stats = LabelStats::compute(table);
    let path = dir.join(RESULT_STATS_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(&stats)?)?;

    tracing::info!(
        path = %path.display(),
        true_positive = stats.true_positive,
        false_positive = stats.false_positive,
        "Review statistics saved"
    );
    Ok(path)
}
