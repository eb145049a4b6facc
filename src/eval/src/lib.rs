// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (C) 2025 Jonathan D.A. Jewell

//! Review Eval - scoring predictions against ground truth
//!
//! Compares predicted decisions and violations with human labels and reports
//! accuracy, per-policy precision/recall, and an ordered mismatch list. Rows
//! that exist on only one side are kept out of every denominator and listed
//! as unmatched.

use review_policy::{
    normalize_label, ClassificationResult, Decision, LabelMatch, PolicyId, PolicySet, Violation,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use thiserror::Error;
use tracing::{debug, info, warn};

// ============ Labels ============

const NONE: &str = "None";

/// A decision/violation pair in canonical string form
///
/// Known values become `Valid`/`Flagged` and policy ids; anything else is
/// kept trimmed so that it can still be compared and reported. A Valid
/// decision always carries `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub decision: String,
    pub violation: String,
}

impl Label {
    pub fn from_result(result: &ClassificationResult) -> Self {
        Self {
            decision: result.decision().to_string(),
            violation: result
                .primary_violation()
                .map(|v| v.to_string())
                .unwrap_or_else(|| NONE.to_string()),
        }
    }

    pub fn is_flagged(&self) -> bool {
        self.decision == Decision::Flagged.as_str()
    }

    pub fn is_valid(&self) -> bool {
        self.decision == Decision::Valid.as_str()
    }

    /// The policy named by the violation, if any
    pub fn policy(&self) -> Option<PolicyId> {
        self.violation.parse().ok()
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.decision, self.violation)
    }
}

// ============ Inputs ============

/// One predicted row
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub row_id: String,
    pub label: Label,
    pub review: Option<String>,
}

/// Ground-truth labels by row id, in insertion order
#[derive(Debug, Clone, Default)]
pub struct GroundTruth {
    rows: Vec<(String, Label)>,
    index: HashMap<String, usize>,
}

impl GroundTruth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false (and keeps the first label) when the id is already present
    pub fn insert(&mut self, row_id: impl Into<String>, label: Label) -> bool {
        let row_id = row_id.into();
        if self.index.contains_key(&row_id) {
            warn!(row_id, "Duplicate ground-truth row ignored");
            return false;
        }
        self.index.insert(row_id.clone(), self.rows.len());
        self.rows.push((row_id, label));
        true
    }

    pub fn get(&self, row_id: &str) -> Option<&Label> {
        self.index.get(row_id).map(|&i| &self.rows[i].1)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Label)> {
        self.rows.iter().map(|(id, label)| (id.as_str(), label))
    }
}

/// A row carrying both prediction and truth, as in a labeled CSV
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledRow {
    pub row_id: String,
    pub predicted: Label,
    pub truth: Label,
    pub review: Option<String>,
}

// ============ Report ============

/// Prediction and truth for one row, produced by the scorer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRow {
    pub row_id: String,
    pub predicted: Label,
    pub truth: Label,
    pub decision_match: bool,
    /// Only judged when the true decision is Flagged
    pub violation_match: Option<bool>,
    pub review: Option<String>,
}

impl EvaluationRow {
    pub fn is_mismatch(&self) -> bool {
        !self.decision_match || self.violation_match == Some(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnmatchedReason {
    /// Predicted row with no ground truth
    MissingGroundTruth,
    /// Ground-truth row that was never predicted
    MissingPrediction,
    /// The same row id was predicted more than once
    DuplicatePrediction,
}

/// A row left out of the accuracy figures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmatchedRow {
    pub row_id: String,
    pub reason: UnmatchedReason,
}

/// One-vs-rest metrics for a single policy over matched rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyMetrics {
    pub policy: PolicyId,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl PolicyMetrics {
    fn new(policy: PolicyId, tp: usize, fp: usize, fn_: usize) -> Self {
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };
        Self {
            policy,
            true_positives: tp,
            false_positives: fp,
            false_negatives: fn_,
            precision,
            recall,
            f1,
        }
    }
}

/// Result of one scoring run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    /// Rows present on both sides
    pub total_rows: usize,
    pub decision_correct: usize,
    /// Matched rows whose true decision is Flagged
    pub violation_rows: usize,
    pub violation_correct: usize,
    /// `None` when there is nothing to divide by
    pub decision_accuracy: Option<f64>,
    pub violation_accuracy: Option<f64>,
    /// Disagreements, in input order
    pub mismatches: Vec<EvaluationRow>,
    pub unmatched: Vec<UnmatchedRow>,
    pub per_policy: Vec<PolicyMetrics>,
}

impl ScoreReport {
    /// Human-readable summary
    pub fn summary_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Total rows: {}\n", self.total_rows));
        out.push_str(&format!(
            "Decision Accuracy: {}/{} = {}\n",
            self.decision_correct,
            self.total_rows,
            percent(self.decision_accuracy)
        ));
        out.push_str(&format!(
            "Violation Accuracy: {}/{} = {}\n",
            self.violation_correct,
            self.violation_rows,
            percent(self.violation_accuracy)
        ));
        out.push_str(&format!("Mismatches: {}\n", self.mismatches.len()));
        out.push_str(&format!("Unmatched rows: {}\n", self.unmatched.len()));

        if !self.per_policy.is_empty() {
            out.push_str("Per policy:\n");
            for m in &self.per_policy {
                out.push_str(&format!(
                    "  {:<18} P={:.2} R={:.2} F1={:.2}\n",
                    m.policy.as_str(),
                    m.precision,
                    m.recall,
                    m.f1
                ));
            }
        }
        out
    }
}

fn percent(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.2}%", v * 100.0),
        None => "n/a".to_string(),
    }
}

// ============ Scorer ============

#[derive(Debug, Default)]
struct Tally {
    evaluated: Vec<EvaluationRow>,
    decision_correct: usize,
    violation_rows: usize,
    violation_correct: usize,
}

impl Tally {
    fn add(&mut self, row_id: String, predicted: Label, truth: Label, review: Option<String>) {
        let decision_match = predicted.decision == truth.decision;
        let violation_match = truth
            .is_flagged()
            .then(|| predicted.violation == truth.violation);

        if decision_match {
            self.decision_correct += 1;
        }
        if let Some(matched) = violation_match {
            self.violation_rows += 1;
            if matched {
                self.violation_correct += 1;
            }
        }

        self.evaluated.push(EvaluationRow {
            row_id,
            predicted,
            truth,
            decision_match,
            violation_match,
            review,
        });
    }

    fn finish(self, unmatched: Vec<UnmatchedRow>) -> ScoreReport {
        let total_rows = self.evaluated.len();
        let ratio = |num: usize, den: usize| (den > 0).then(|| num as f64 / den as f64);

        let per_policy = PolicyId::ALL
            .iter()
            .map(|&policy| {
                let (mut tp, mut fp, mut fn_) = (0, 0, 0);
                for row in &self.evaluated {
                    let predicted = row.predicted.policy() == Some(policy);
                    let actual = row.truth.policy() == Some(policy);
                    match (predicted, actual) {
                        (true, true) => tp += 1,
                        (true, false) => fp += 1,
                        (false, true) => fn_ += 1,
                        (false, false) => {}
                    }
                }
                PolicyMetrics::new(policy, tp, fp, fn_)
            })
            .collect();

        let report = ScoreReport {
            total_rows,
            decision_correct: self.decision_correct,
            violation_rows: self.violation_rows,
            violation_correct: self.violation_correct,
            decision_accuracy: ratio(self.decision_correct, total_rows),
            violation_accuracy: ratio(self.violation_correct, self.violation_rows),
            mismatches: self
                .evaluated
                .into_iter()
                .filter(EvaluationRow::is_mismatch)
                .collect(),
            unmatched,
            per_policy,
        };

        info!(
            rows = report.total_rows,
            mismatches = report.mismatches.len(),
            unmatched = report.unmatched.len(),
            "Scoring finished"
        );
        report
    }
}

/// Normalizes labels and computes [`ScoreReport`]s
#[derive(Debug, Clone, Default)]
pub struct Scorer {
    policies: PolicySet,
}

impl Scorer {
    pub fn new(policies: PolicySet) -> Self {
        Self { policies }
    }

    /// Canonicalize a human- or model-written label pair.
    ///
    /// Decisions starting with `valid`/`flag` normalize; violations resolve
    /// through the policy names, ids, and aliases. A Valid decision forces
    /// the violation to `None`.
    pub fn label(&self, decision: &str, violation: &str) -> Label {
        let decision = match Decision::from_label(decision) {
            Some(d) => d.as_str().to_string(),
            None => decision.trim().to_string(),
        };

        let violation = if decision == Decision::Valid.as_str() {
            NONE.to_string()
        } else {
            match self.policies.match_violation(violation) {
                LabelMatch::NoViolation => NONE.to_string(),
                LabelMatch::Policy(id) => id.as_str().to_string(),
                LabelMatch::Unrecognized
                    if normalize_label(violation) == normalize_label(Violation::UNSPECIFIED) =>
                {
                    Violation::UNSPECIFIED.to_string()
                }
                LabelMatch::Unrecognized => violation.trim().to_string(),
            }
        };

        Label {
            decision,
            violation,
        }
    }

    /// Score classifier output against ground truth
    pub fn score(
        &self,
        predicted: &[(String, ClassificationResult)],
        ground_truth: &GroundTruth,
    ) -> ScoreReport {
        let predictions: Vec<Prediction> = predicted
            .iter()
            .map(|(row_id, result)| Prediction {
                row_id: row_id.clone(),
                label: Label::from_result(result),
                review: None,
            })
            .collect();
        self.score_predictions(&predictions, ground_truth)
    }

    /// Score already-labeled predictions, matching rows by id
    pub fn score_predictions(
        &self,
        predicted: &[Prediction],
        ground_truth: &GroundTruth,
    ) -> ScoreReport {
        let mut tally = Tally::default();
        let mut unmatched = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();

        for prediction in predicted {
            if !seen.insert(prediction.row_id.as_str()) {
                unmatched.push(UnmatchedRow {
                    row_id: prediction.row_id.clone(),
                    reason: UnmatchedReason::DuplicatePrediction,
                });
                continue;
            }
            match ground_truth.get(&prediction.row_id) {
                Some(truth) => tally.add(
                    prediction.row_id.clone(),
                    prediction.label.clone(),
                    truth.clone(),
                    prediction.review.clone(),
                ),
                None => unmatched.push(UnmatchedRow {
                    row_id: prediction.row_id.clone(),
                    reason: UnmatchedReason::MissingGroundTruth,
                }),
            }
        }

        for (row_id, _) in ground_truth.iter() {
            if !seen.contains(row_id) {
                unmatched.push(UnmatchedRow {
                    row_id: row_id.to_string(),
                    reason: UnmatchedReason::MissingPrediction,
                });
            }
        }

        if !unmatched.is_empty() {
            warn!(count = unmatched.len(), "Rows excluded from scoring");
        }
        tally.finish(unmatched)
    }

    /// Score rows that already pair prediction and truth
    pub fn score_rows(&self, rows: &[LabeledRow]) -> ScoreReport {
        let mut tally = Tally::default();
        for row in rows {
            tally.add(
                row.row_id.clone(),
                row.predicted.clone(),
                row.truth.clone(),
                row.review.clone(),
            );
        }
        tally.finish(Vec::new())
    }
}

// ============ CSV ============

/// Column names in a labeled CSV
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledColumns {
    pub pred_decision: String,
    pub pred_violation: String,
    pub gt_decision: String,
    pub gt_violation: String,
    /// Row identity; the 1-based row number when absent
    pub id: Option<String>,
    /// Review text; `review` or `Review` when absent
    pub review: Option<String>,
}

impl Default for LabeledColumns {
    fn default() -> Self {
        Self {
            pred_decision: "Decision".to_string(),
            pred_violation: "Primary Violation".to_string(),
            gt_decision: "GT_Decision".to_string(),
            gt_violation: "GT_Violation".to_string(),
            id: None,
            review: None,
        }
    }
}

const REVIEW_FALLBACKS: &[&str] = &["review", "Review"];

struct Columns {
    headers: csv::StringRecord,
}

impl Columns {
    /// Exact match first, then case-insensitive; a leading BOM is ignored
    fn find(&self, name: &str) -> Option<usize> {
        let clean = |h: &str| h.trim_start_matches('\u{feff}').trim().to_string();
        self.headers
            .iter()
            .position(|h| clean(h) == name)
            .or_else(|| self.headers.iter().position(|h| clean(h).eq_ignore_ascii_case(name)))
    }

    fn require(&self, name: &str) -> Result<usize, EvalError> {
        self.find(name)
            .ok_or_else(|| EvalError::MissingColumn(name.to_string()))
    }

    fn review(&self, configured: Option<&str>) -> Result<Option<usize>, EvalError> {
        match configured {
            Some(name) => self.require(name).map(Some),
            None => Ok(REVIEW_FALLBACKS.iter().find_map(|name| self.find(name))),
        }
    }
}

fn cell(record: &csv::StringRecord, idx: usize) -> &str {
    record.get(idx).unwrap_or_default()
}

fn row_id(record: &csv::StringRecord, id_idx: Option<usize>, ordinal: usize) -> String {
    match id_idx {
        Some(idx) => cell(record, idx).trim().to_string(),
        None => ordinal.to_string(),
    }
}

fn open<R: io::Read>(reader: R) -> Result<(csv::Reader<R>, Columns), EvalError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = reader.headers()?.clone();
    Ok((reader, Columns { headers }))
}

/// Read a CSV that holds predicted and ground-truth columns side by side
pub fn read_labeled_rows<R: io::Read>(
    reader: R,
    columns: &LabeledColumns,
    scorer: &Scorer,
) -> Result<Vec<LabeledRow>, EvalError> {
    let (mut reader, found) = open(reader)?;
    let pred_decision = found.require(&columns.pred_decision)?;
    let pred_violation = found.require(&columns.pred_violation)?;
    let gt_decision = found.require(&columns.gt_decision)?;
    let gt_violation = found.require(&columns.gt_violation)?;
    let id = columns.id.as_deref().map(|c| found.require(c)).transpose()?;
    let review = found.review(columns.review.as_deref())?;

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        rows.push(LabeledRow {
            row_id: row_id(&record, id, i + 1),
            predicted: scorer.label(cell(&record, pred_decision), cell(&record, pred_violation)),
            truth: scorer.label(cell(&record, gt_decision), cell(&record, gt_violation)),
            review: review.map(|idx| cell(&record, idx).to_string()),
        });
    }

    debug!(rows = rows.len(), "Read labeled rows");
    Ok(rows)
}

/// Read predictions, e.g. a batch output file.
///
/// Rows with an empty decision (failed classifications) are skipped, so they
/// surface as unmatched when scored.
pub fn read_predictions<R: io::Read>(
    reader: R,
    id_column: &str,
    decision_column: &str,
    violation_column: &str,
    scorer: &Scorer,
) -> Result<Vec<Prediction>, EvalError> {
    let (mut reader, found) = open(reader)?;
    let id = found.require(id_column)?;
    let decision = found.require(decision_column)?;
    let violation = found.require(violation_column)?;
    let review = found.review(None)?;

    let mut predictions = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row_id = cell(&record, id).trim().to_string();
        if cell(&record, decision).trim().is_empty() {
            debug!(row_id, "Skipping row without a decision");
            continue;
        }
        predictions.push(Prediction {
            label: scorer.label(cell(&record, decision), cell(&record, violation)),
            row_id,
            review: review.map(|idx| cell(&record, idx).to_string()),
        });
    }
    Ok(predictions)
}

/// Read ground-truth labels keyed by row id
pub fn read_ground_truth<R: io::Read>(
    reader: R,
    id_column: &str,
    decision_column: &str,
    violation_column: &str,
    scorer: &Scorer,
) -> Result<GroundTruth, EvalError> {
    let (mut reader, found) = open(reader)?;
    let id = found.require(id_column)?;
    let decision = found.require(decision_column)?;
    let violation = found.require(violation_column)?;

    let mut truth = GroundTruth::new();
    for record in reader.records() {
        let record = record?;
        truth.insert(
            cell(&record, id).trim(),
            scorer.label(cell(&record, decision), cell(&record, violation)),
        );
    }
    Ok(truth)
}

pub const MISMATCH_HEADERS: [&str; 6] = [
    "id",
    "pred_decision",
    "gt_decision",
    "pred_violation",
    "gt_violation",
    "review",
];

/// Write the mismatch report as CSV, header included even when empty
pub fn write_mismatches<W: io::Write>(writer: W, report: &ScoreReport) -> Result<(), EvalError> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(MISMATCH_HEADERS)?;
    for row in &report.mismatches {
        writer.write_record([
            row.row_id.as_str(),
            row.predicted.decision.as_str(),
            row.truth.decision.as_str(),
            row.predicted.violation.as_str(),
            row.truth.violation.as_str(),
            row.review.as_deref().unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

// ============ Errors ============

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("Missing column: {0}")]
    MissingColumn(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

// ============ Tests ============
