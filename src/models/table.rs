//! RecordTable: the mutable batch of records.
//!
//! Pure data model: ordering, identity and field writes. Which records get
//! written, and when, is decided by the pipeline orchestrator.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::record::{Label, Preprocessed, Record, RecordId, ScoredReport};

/// Records in insertion order, keyed by a never-reused ordinal id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTable {
    records: Vec<Record>,
    next_id: u64,
}

/// Per-label tally of the reviewed table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LabelCounts {
    pub unset: usize,
    pub true_positive: usize,
    pub false_positive: usize,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table with one record per input text, ids starting at 0.
    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::new();
        for text in texts {
            table.push(text);
        }
        table
    }

    /// Ingest a new record and return its id.
    pub fn push(&mut self, raw_text: impl Into<String>) -> RecordId {
        let id = RecordId(self.next_id);
        self.next_id += 1;
        self.records.push(Record::new(id, raw_text));
        id
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    fn get_mut(&mut self, id: RecordId) -> Option<&mut Record> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// All ids, in insertion order.
    pub fn ids(&self) -> Vec<RecordId> {
        self.records.iter().map(|r| r.id).collect()
    }

    /// Delete every record whose id is in `ids`. Survivors keep their order.
    /// Returns the number of records removed.
    pub fn remove_ids(&mut self, ids: &BTreeSet<RecordId>) -> usize {
        let before = self.records.len();
        self.records.retain(|r| !ids.contains(&r.id));
        before - self.records.len()
    }

    // ───────────────────────────────────────
    // Stage writes
    // ───────────────────────────────────────

    /// Returns false when the id is no longer in the table.
    pub fn set_preprocessed(&mut self, id: RecordId, value: Preprocessed) -> bool {
        match self.get_mut(id) {
            Some(record) => {
                record.preprocessed = Some(value);
                true
            }
            None => false,
        }
    }

    pub fn set_stage1(&mut self, id: RecordId, value: ScoredReport) -> bool {
        match self.get_mut(id) {
            Some(record) => {
                record.stage1 = Some(value);
                true
            }
            None => false,
        }
    }

    pub fn set_stage2(&mut self, id: RecordId, value: ScoredReport) -> bool {
        match self.get_mut(id) {
            Some(record) => {
                record.stage2 = Some(value);
                true
            }
            None => false,
        }
    }

    /// Initialize the verification fields as a copy of the detection fields,
    /// for every record that has a detection value.
    pub fn copy_stage1_into_stage2(&mut self) {
        for record in &mut self.records {
            if let Some(stage1) = &record.stage1 {
                record.stage2 = Some(stage1.clone());
            }
        }
    }

    /// Ids whose detection pass scored 0 (candidate errors), in table order.
    pub fn candidate_ids(&self) -> Vec<RecordId> {
        self.records
            .iter()
            .filter(|r| r.stage1.as_ref().is_some_and(ScoredReport::is_candidate))
            .map(|r| r.id)
            .collect()
    }

    // ───────────────────────────────────────
    // Review
    // ───────────────────────────────────────

    /// First record still awaiting review: verified as a candidate error
    /// and not yet labeled.
    pub fn next_pending_review(&self) -> Option<RecordId> {
        self.records
            .iter()
            .find(|r| r.stage2_score() == Some(0) && r.label == Label::Unset)
            .map(|r| r.id)
    }

    pub fn set_label(&mut self, id: RecordId, label: Label) -> bool {
        match self.get_mut(id) {
            Some(record) => {
                record.label = label;
                true
            }
            None => false,
        }
    }

    pub fn label_counts(&self) -> LabelCounts {
        let mut counts = LabelCounts::default();
        for record in &self.records {
            match record.label {
                Label::Unset => counts.unset += 1,
                Label::TruePositive => counts.true_positive += 1,
                Label::FalsePositive => counts.false_positive += 1,
            }
        }
        counts
    }
}
