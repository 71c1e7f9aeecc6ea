//! Score aggregates over a finished batch.

use serde::{Deserialize, Serialize};

use super::table::RecordTable;

/// Mean and sample standard deviation of one score column.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreStats {
    /// Number of records that carry a score for this pass.
    pub count: usize,
    pub mean: Option<f64>,
    /// Sample standard deviation (n - 1). Undefined below two scores.
    pub std: Option<f64>,
}

impl ScoreStats {
    pub fn from_scores(scores: &[u8]) -> Self {
        let count = scores.len();
        if count == 0 {
            return Self::default();
        }

        let n = count as f64;
        let mean = scores.iter().map(|&s| f64::from(s)).sum::<f64>() / n;
        let std = if count > 1 {
            let var = scores
                .iter()
                .map(|&s| (f64::from(s) - mean).powi(2))
                .sum::<f64>()
                / (n - 1.0);
            Some(var.sqrt())
        } else {
            None
        };

        Self {
            count,
            mean: Some(mean),
            std,
        }
    }
}

/// Review outcome over a labeled table.
///
/// aTPR is confirmed errors over all records; PPV is confirmed errors over
/// reviewed candidates. Both are `None` when their denominator is zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LabelStats {
    pub true_positive: usize,
    pub false_positive: usize,
    pub total: usize,
    pub atpr: Option<f64>,
    pub ppv: Option<f64>,
    /// Stage 2 scores with false positives counted as 1.
    pub accuracy_3: ScoreStats,
}

impl LabelStats {
    pub fn compute(table: &RecordTable) -> Self {
        let counts = table.label_counts();
        let total = table.len();
        let tp = counts.true_positive;
        let reviewed = tp + counts.false_positive;
        let ratio = |den: usize| (den > 0).then(|| tp as f64 / den as f64);
        let accuracy_3: Vec<u8> = table.iter().filter_map(|r| r.accuracy_3_score()).collect();

        Self {
            true_positive: tp,
            false_positive: counts.false_positive,
            total,
            atpr: ratio(total),
            ppv: ratio(reviewed),
            accuracy_3: ScoreStats::from_scores(&accuracy_3),
        }
    }
}

/// Batch-level summary returned alongside the augmented table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Records that survived preprocessing.
    pub records: usize,
    /// Records removed after terminal preprocessing failure.
    pub dropped: usize,
    pub stage1: ScoreStats,
    pub stage2: ScoreStats,
    /// Surviving records whose final (verified) score is 0.
    pub candidates: usize,
}

impl BatchSummary {
    pub fn compute(table: &RecordTable, dropped: usize) -> Self {
        let stage1: Vec<u8> = table.iter().filter_map(|r| r.stage1_score()).collect();
        let stage2: Vec<u8> = table.iter().filter_map(|r| r.stage2_score()).collect();
        let candidates = stage2.iter().filter(|&&s| s == 0).count();

        Self {
            records: table.len(),
            dropped,
            stage1: ScoreStats::from_scores(&stage1),
            stage2: ScoreStats::from_scores(&stage2),
            candidates,
        }
    }
}
