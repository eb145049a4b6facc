// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (C) 2025 Jonathan D.A. Jewell

//! Review Contract - the classification pipeline for location reviews
//!
//! This crate defines the complete contract for classifying a review:
//! - **Prompt**: grounding examples + policies + review → one instruction (`PromptBuilder`)
//! - **Parsing**: loosely structured model text → typed result (`ResponseParser`)
//! - **Pipeline**: retrieve → build → infer → parse (`ReviewClassifier`)
//! - **Batches**: per-row isolation with bounded retries (`BatchRunner`)
//! - **Audit**: one structured record per processed row (`AuditEntry`)
//!
//! Everything except the inference call is a pure function of its inputs, so
//! the pipeline is testable with a deterministic stub in place of the model.

use chrono::{DateTime, Utc};
use example_retrieval::{ExampleRetriever, LabeledExample, RetrievalError};
use regex::Regex;
use review_policy::{
    ClassificationResult, Decision, LabelMatch, ParseNote, PolicyError, PolicySet,
    ResultMetadata, ReviewInput, Violation,
};
use serde::{Deserialize, Serialize};
use slm_client::{BackendError, InferenceBackend};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// CONTRACT VERSION
// ============================================================================

/// Contract version for compatibility checking
pub const CONTRACT_VERSION: &str = "0.1.0";

/// Audit record schema identifier
pub const AUDIT_SCHEMA: &str = "review-gating-audit-v1";

// ============================================================================
// PROMPT BUILDER
// ============================================================================

/// A fully rendered classification prompt
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PromptText(String);

impl PromptText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for PromptText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const ROLE: &str =
    "You are an expert in identifying trustworthy and policy-compliant location reviews.\n";

const INSTRUCTIONS: &str = "
Instructions:
  - First, determine whether the review is Valid or Flagged.
  - If the review is flagged, identify which single policy it violated the most (choose the strongest violation).
  - Provide a brief explanation (1 to 2 sentences) justifying your decision.

Output Format (exactly these three lines, in this order):
Decision: <Valid or Flagged>
Primary Violation: <one policy name from the list above, or None if Valid>
Explanation: <short reasoning>

Example Output:
Decision: Flagged
Primary Violation: No Advertisement
Explanation: The review contains a promotional link to a discount website, which violates the no advertisement policy.
";

/// Renders the single instruction sent to the model.
///
/// Output depends only on the arguments: identical policies, examples, and
/// input always produce byte-identical prompts.
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn build(
        policies: &PolicySet,
        examples: &[&LabeledExample],
        input: &ReviewInput,
    ) -> PromptText {
        let mut out = String::from(ROLE);

        out.push_str("\nPolicies to Enforce:\n");
        for (i, policy) in policies.policies.iter().enumerate() {
            out.push_str(&format!(
                "  {}. {} ({}): {}\n",
                i + 1,
                policy.name,
                policy.id,
                policy.description
            ));
        }

        out.push_str("\nReference Materials:\n");
        if examples.is_empty() {
            out.push_str("  No labeled reference reviews are available.\n");
        }
        for (i, example) in examples.iter().enumerate() {
            let violation = example
                .violation
                .map(|id| policies.display_name(id))
                .unwrap_or("None");
            let explanation = if example.rationale.trim().is_empty() {
                format!("Labeled {} by a human reviewer.", example.decision)
            } else {
                one_line(&example.rationale)
            };
            out.push_str(&format!(
                "Reference {}:\n  Location: {}\n  Review: {}\n  Decision: {}\n  Primary Violation: {}\n  Explanation: {}\n",
                i + 1,
                location_or_placeholder(&example.location),
                one_line(&example.review_text),
                example.decision,
                violation,
                explanation
            ));
        }

        out.push_str("\nReview to Evaluate:\n");
        out.push_str(&format!(
            "  Location: {}\n  Review: {}\n",
            location_or_placeholder(&input.location),
            one_line(&input.review_text)
        ));

        out.push_str(INSTRUCTIONS);
        PromptText(out)
    }
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn location_or_placeholder(location: &str) -> String {
    let location = one_line(location);
    if location.is_empty() {
        "(not provided)".to_string()
    } else {
        location
    }
}

// ============================================================================
// RESPONSE PARSER
// ============================================================================

/// Model output that cannot be turned into a decision
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("No decision token found in model output")]
    NoDecision,
    #[error("Ambiguous decision in model output: '{0}'")]
    AmbiguousDecision(String),
}

/// Labeled line: optional bullets/markdown, a known label, anything up to the
/// first colon (e.g. "(if flagged)"), then the value.
const LABEL_PATTERN: &str = r"(?i)^[\s>#*•\-\d.)]*(decision|verdict|classification|primary\s+violation|violated\s+policy|violation|policy|explanation|reasoning|reason|justification|rationale)\b[^:\n]*:\s*(.*)$";

const NEGATIONS: &[&str] = &["not", "non", "no", "isn", "never"];

/// Words a negation may reach ahead ("isn't really valid")
const NEGATION_WINDOW: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Decision,
    Violation,
    Explanation,
}

#[derive(Debug, Default)]
struct Sections {
    decision: Option<String>,
    violation: Option<String>,
    explanation: Option<String>,
    free: Vec<String>,
}

impl Sections {
    fn slot(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::Decision => &mut self.decision,
            Field::Violation => &mut self.violation,
            Field::Explanation => &mut self.explanation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecisionScan {
    Found(Decision),
    Conflicting,
    Missing,
}

/// Turns raw model text into a [`ClassificationResult`].
///
/// Rules, in order:
/// 1. The decision comes from the labeled `Decision:` line, normalizing
///    synonyms ("flag", "violates", "compliant"). Without a usable label the
///    unlabeled lines are scanned instead and the result is marked
///    low-confidence. No decision token at all is [`ParseError::NoDecision`];
///    both classes at once is [`ParseError::AmbiguousDecision`].
///    Policy names and ids are skipped while scanning, so the leading "No" of
///    "No Advertisement" never negates a nearby decision word.
/// 2. A Flagged decision takes its policy from the `Primary Violation:` line
///    via [`PolicySet::match_violation`]. With no such line, a policy named
///    in the decision line or the explanation is used. Otherwise the
///    violation is [`Violation::Unspecified`].
/// 3. The explanation is the `Explanation:` text (continuation lines
///    included), or the remaining free text when unlabeled. Empty
///    explanations are allowed but marked low-confidence.
///
/// Tie-break: a Valid decision never carries a violation. If the model also
/// names one, the decision wins and the violation is dropped
/// ([`ParseNote::ContradictionResolved`]).
#[derive(Debug, Clone)]
pub struct ResponseParser {
    policies: PolicySet,
    label: Regex,
    /// Policy names and ids as word sequences
    policy_phrases: Vec<Vec<String>>,
}

impl ResponseParser {
    pub fn new(policies: PolicySet) -> Result<Self, ContractError> {
        let policy_phrases = policies
            .policies
            .iter()
            .flat_map(|p| [word_tokens(&p.name), word_tokens(p.id.as_str())])
            .filter(|phrase| !phrase.is_empty())
            .collect();
        Ok(Self {
            policies,
            label: Regex::new(LABEL_PATTERN)?,
            policy_phrases,
        })
    }

    pub fn parse(&self, raw: &str) -> Result<ClassificationResult, ParseError> {
        let sections = self.split_sections(raw);
        let mut metadata = ResultMetadata::default();

        let labeled = sections
            .decision
            .as_deref()
            .map(|text| scan_decision(text, &self.policy_phrases))
            .unwrap_or(DecisionScan::Missing);
        let decision = match labeled {
            DecisionScan::Found(decision) => decision,
            DecisionScan::Conflicting => {
                return Err(ParseError::AmbiguousDecision(
                    sections.decision.clone().unwrap_or_default(),
                ))
            }
            DecisionScan::Missing => {
                let free_text = sections.free.join("\n");
                match scan_decision(&free_text, &self.policy_phrases) {
                    DecisionScan::Found(decision) => {
                        metadata.low_confidence = true;
                        metadata.note(ParseNote::UnlabeledDecision);
                        decision
                    }
                    DecisionScan::Conflicting => {
                        return Err(ParseError::AmbiguousDecision(one_line(&free_text)))
                    }
                    DecisionScan::Missing => return Err(ParseError::NoDecision),
                }
            }
        };

        let explanation = sections
            .explanation
            .clone()
            .unwrap_or_else(|| sections.free.join(" "))
            .trim()
            .to_string();
        let violation_label = sections.violation.as_deref();
        let violation_match = violation_label.map(|label| self.policies.match_violation(label));

        let result = match decision {
            Decision::Valid => {
                if matches!(
                    violation_match,
                    Some(LabelMatch::Policy(_)) | Some(LabelMatch::Unrecognized)
                ) {
                    warn!(
                        violation = violation_label.unwrap_or_default(),
                        "Model answered Valid but named a violation; keeping Valid"
                    );
                    metadata.note(ParseNote::ContradictionResolved);
                }
                ClassificationResult::valid(explanation)
            }
            Decision::Flagged => {
                let violation = match violation_match {
                    Some(LabelMatch::Policy(id)) => Violation::Policy(id),
                    None => sections
                        .decision
                        .as_deref()
                        .and_then(|text| self.policies.find_in_text(text))
                        .or_else(|| self.policies.find_in_text(&explanation))
                        .map(Violation::Policy)
                        .unwrap_or(Violation::Unspecified),
                    Some(_) => Violation::Unspecified,
                };
                if violation == Violation::Unspecified {
                    warn!(
                        violation = violation_label.unwrap_or_default(),
                        "Flagged without a recognizable policy"
                    );
                    metadata.note(ParseNote::UnspecifiedViolation);
                }
                ClassificationResult::flagged(violation, explanation)
            }
        };

        if result.explanation().is_empty() {
            metadata.low_confidence = true;
            metadata.note(ParseNote::EmptyExplanation);
        }

        Ok(result.with_metadata(metadata))
    }

    fn split_sections(&self, raw: &str) -> Sections {
        let mut sections = Sections::default();
        let mut current: Option<Field> = None;

        for line in raw.lines() {
            if let Some(caps) = self.label.captures(line) {
                let field = field_for(&caps[1]);
                let slot = sections.slot(field);
                // First occurrence wins; repeats are treated as plain text.
                if slot.is_none() {
                    *slot = Some(clean_value(caps.get(2).map_or("", |m| m.as_str())).to_string());
                    current = Some(field);
                    continue;
                }
            }

            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            if current == Some(Field::Explanation) {
                let explanation = sections.explanation.get_or_insert_with(String::new);
                if !explanation.is_empty() {
                    explanation.push(' ');
                }
                explanation.push_str(clean_value(text));
            } else {
                sections.free.push(text.to_string());
            }
        }

        sections
    }
}

fn field_for(label: &str) -> Field {
    let label = label.to_lowercase();
    if matches!(label.as_str(), "decision" | "verdict" | "classification") {
        Field::Decision
    } else if label.starts_with("primary") || label.starts_with("violat") || label == "policy" {
        Field::Violation
    } else {
        Field::Explanation
    }
}

fn clean_value(value: &str) -> &str {
    value.trim_matches(|c: char| c.is_whitespace() || c == '*' || c == '`')
}

fn word_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Classify the decision words in `text`, stepping over any of `skip`
fn scan_decision(text: &str, skip: &[Vec<String>]) -> DecisionScan {
    let words = word_tokens(text);

    let mut valid = false;
    let mut flagged = false;
    let mut negated_at: Option<usize> = None;
    let mut i = 0;

    while i < words.len() {
        if let Some(phrase) = skip.iter().find(|p| words[i..].starts_with(p.as_slice())) {
            i += phrase.len();
            negated_at = None;
            continue;
        }

        let word = &words[i];
        if NEGATIONS.contains(&word.as_str()) {
            negated_at = Some(i);
            i += 1;
            continue;
        }
        if let Some(decision) = Decision::from_token(word) {
            let negated = negated_at.is_some_and(|n| i - n <= NEGATION_WINDOW);
            negated_at = None;
            match (decision, negated) {
                (Decision::Valid, false) | (Decision::Flagged, true) => valid = true,
                (Decision::Flagged, false) | (Decision::Valid, true) => flagged = true,
            }
        }
        i += 1;
    }

    match (valid, flagged) {
        (true, true) => DecisionScan::Conflicting,
        (true, false) => DecisionScan::Found(Decision::Valid),
        (false, true) => DecisionScan::Found(Decision::Flagged),
        (false, false) => DecisionScan::Missing,
    }
}

// ============================================================================
// CONTRACT ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum ContractError {
    #[error("k must be between 1 and {size}, got {k}")]
    InvalidK { k: usize, size: usize },

    #[error("Invalid regex: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Missing column: {0}")]
    MissingColumn(String),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Why classifying one review failed
#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("Invalid input: {0}")]
    Input(#[from] PolicyError),

    #[error("Retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Inference failed: {0}")]
    Backend(#[from] BackendError),

    #[error("Unparsable model output: {0}")]
    Parse(#[from] ParseError),
}

impl ClassifyError {
    /// The inference or embedding backend is gone
    pub fn is_fatal(&self) -> bool {
        match self {
            ClassifyError::Backend(e) => e.is_fatal(),
            ClassifyError::Retrieval(e) => e.is_fatal(),
            _ => false,
        }
    }
}

// ============================================================================
// CLASSIFIER - retrieve, build, infer, parse
// ============================================================================

/// Pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifierConfig {
    /// Grounding examples per prompt
    #[serde(default = "default_k")]
    pub k: usize,

    #[serde(default)]
    pub retry: RetryPolicy,
}

const fn default_k() -> usize {
    3
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClassifierConfig {
    /// `k` capped at the store size
    pub fn effective_k(&self, store_size: usize) -> usize {
        if self.k > store_size {
            warn!(
                requested = self.k,
                available = store_size,
                "k exceeds the example store; using every example"
            );
            store_size
        } else {
            self.k
        }
    }
}

/// A prompt ready to send, with what went into it
#[derive(Debug, Clone)]
pub struct PreparedPrompt {
    pub prompt: PromptText,
    pub examples_used: usize,
    pub top_similarity: f32,
}

/// The end-to-end classification pipeline
pub struct ReviewClassifier {
    policies: PolicySet,
    retriever: ExampleRetriever,
    backend: Arc<dyn InferenceBackend>,
    parser: ResponseParser,
    k: usize,
}

impl ReviewClassifier {
    pub fn new(
        policies: PolicySet,
        retriever: ExampleRetriever,
        backend: Arc<dyn InferenceBackend>,
        k: usize,
    ) -> Result<Self, ContractError> {
        let size = retriever.store().len();
        if k == 0 || k > size {
            return Err(ContractError::InvalidK { k, size });
        }

        let parser = ResponseParser::new(policies.clone())?;
        info!(k, model = backend.model(), "Review classifier ready");

        Ok(Self {
            policies,
            retriever,
            backend,
            parser,
            k,
        })
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    pub fn retriever(&self) -> &ExampleRetriever {
        &self.retriever
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Validate the input and build its grounded prompt
    pub fn prepare(&self, input: &ReviewInput) -> Result<PreparedPrompt, ClassifyError> {
        input.validate()?;

        let scored = self.retriever.retrieve(&input.review_text, self.k)?;
        let examples: Vec<&LabeledExample> = scored.iter().map(|s| s.example).collect();
        let prompt = PromptBuilder::build(&self.policies, &examples, input);

        debug!(
            row_id = input.row_id.as_deref().unwrap_or("-"),
            examples = examples.len(),
            prompt_len = prompt.as_str().len(),
            "Prepared prompt"
        );

        Ok(PreparedPrompt {
            prompt,
            examples_used: examples.len(),
            top_similarity: scored.first().map(|s| s.similarity).unwrap_or_default(),
        })
    }

    /// One call to the model; never retries
    pub fn infer(&self, prompt: &PromptText) -> Result<String, BackendError> {
        self.backend.infer(prompt.as_str())
    }

    pub fn parse(&self, raw: &str) -> Result<ClassificationResult, ParseError> {
        self.parser.parse(raw)
    }

    /// Classify a single review, surfacing the first error
    pub fn classify(&self, input: &ReviewInput) -> Result<ClassificationResult, ClassifyError> {
        let prepared = self.prepare(input)?;
        let raw = self.infer(&prepared.prompt)?;
        let result = self.parse(&raw)?;

        debug!(
            decision = %result.decision(),
            violation = result.primary_violation().map(|v| v.as_str()).unwrap_or("None"),
            "Classified review"
        );
        Ok(result)
    }
}

impl fmt::Debug for ReviewClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReviewClassifier")
            .field("policies", &self.policies.name)
            .field("retriever", &self.retriever)
            .field("model", &self.backend.model())
            .field("k", &self.k)
            .finish()
    }
}

// ============================================================================
// BATCH RUNNER
// ============================================================================

/// Retry budget for inference timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per row, first try included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    250
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_max_backoff_ms() -> u64 {
    4_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, mostly for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            multiplier: 1.0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16) as i32;
        let delay = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms as f64) as u64)
    }
}

/// A row that could not be classified; the batch carries on
#[derive(Error, Debug, Clone, PartialEq)]
#[error("row {}: {kind}", .row_id.as_deref().unwrap_or("?"))]
pub struct BatchError {
    pub row_id: Option<String>,
    pub kind: BatchErrorKind,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BatchErrorKind {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("retrieval failed: {0}")]
    Retrieval(String),

    #[error("inference failed after {attempts} attempt(s): {error}")]
    Inference { attempts: u32, error: BackendError },

    #[error("unparsable model output: {0}")]
    Parse(ParseError),
}

/// The backend went away; the rest of the batch was not attempted
#[derive(Error, Debug, Clone, PartialEq)]
#[error("batch aborted at position {position} (row {}): {cause}", .row_id.as_deref().unwrap_or("?"))]
pub struct BatchAbort {
    /// Zero-based index of the row being processed
    pub position: usize,
    pub row_id: Option<String>,
    pub cause: BackendError,
}

/// Outcome for one input row
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub input: ReviewInput,
    pub outcome: Result<ClassificationResult, BatchError>,
    pub attempts: u32,
    pub examples_used: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ItemStatus {
    Ok,
    LowConfidence,
    Error,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Ok => "ok",
            ItemStatus::LowConfidence => "low-confidence",
            ItemStatus::Error => "error",
        }
    }
}

impl BatchItem {
    pub fn status(&self) -> ItemStatus {
        match &self.outcome {
            Ok(result) if result.is_low_confidence() => ItemStatus::LowConfidence,
            Ok(_) => ItemStatus::Ok,
            Err(_) => ItemStatus::Error,
        }
    }
}

/// Runs the classifier over many rows, one at a time, in input order
pub struct BatchRunner<'a> {
    classifier: &'a ReviewClassifier,
    retry: RetryPolicy,
}

impl<'a> BatchRunner<'a> {
    pub fn new(classifier: &'a ReviewClassifier, retry: RetryPolicy) -> Self {
        Self { classifier, retry }
    }

    /// Lazily process `inputs`.
    ///
    /// Yields one `Ok(BatchItem)` per row. If the backend becomes unreachable
    /// it yields a single `Err(BatchAbort)` and then ends.
    pub fn run<I>(&self, inputs: I) -> BatchRun<'a, I::IntoIter>
    where
        I: IntoIterator<Item = ReviewInput>,
    {
        BatchRun {
            classifier: self.classifier,
            retry: self.retry.clone(),
            inputs: inputs.into_iter(),
            position: 0,
            halted: false,
        }
    }

    /// Process everything and collect the results
    pub fn run_to_report<I>(&self, inputs: I) -> BatchReport
    where
        I: IntoIterator<Item = ReviewInput>,
    {
        let mut report = BatchReport::default();
        for step in self.run(inputs) {
            match step {
                Ok(item) => report.items.push(item),
                Err(abort) => report.aborted = Some(abort),
            }
        }
        info!(
            rows = report.items.len(),
            aborted = report.aborted.is_some(),
            "Batch finished"
        );
        report
    }
}

/// Iterator returned by [`BatchRunner::run`]
pub struct BatchRun<'a, I> {
    classifier: &'a ReviewClassifier,
    retry: RetryPolicy,
    inputs: I,
    position: usize,
    halted: bool,
}

impl<I> BatchRun<'_, I> {
    fn process(&self, input: ReviewInput) -> Result<BatchItem, BatchAbort> {
        let start = Instant::now();
        let row_id = input.row_id.clone();
        let abort = |cause: BackendError| BatchAbort {
            position: self.position,
            row_id: row_id.clone(),
            cause,
        };
        let failed = |kind: BatchErrorKind| BatchError {
            row_id: row_id.clone(),
            kind,
        };

        let prepared = match self.classifier.prepare(&input) {
            Ok(prepared) => prepared,
            Err(ClassifyError::Retrieval(RetrievalError::Embedding(e))) if e.is_fatal() => {
                return Err(abort(e))
            }
            Err(e) => {
                let kind = match e {
                    ClassifyError::Input(e) => BatchErrorKind::InvalidInput(e.to_string()),
                    other => BatchErrorKind::Retrieval(other.to_string()),
                };
                warn!(row_id = row_id.as_deref().unwrap_or("-"), error = %kind, "Row failed before inference");
                return Ok(BatchItem {
                    input,
                    outcome: Err(failed(kind)),
                    attempts: 0,
                    examples_used: 0,
                    duration: start.elapsed(),
                });
            }
        };

        let mut attempts = 0;
        let raw = loop {
            attempts += 1;
            match self.classifier.infer(&prepared.prompt) {
                Ok(raw) => break Ok(raw),
                Err(e) if e.is_fatal() => return Err(abort(e)),
                Err(e) if e.is_retryable() && attempts < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempts);
                    warn!(
                        row_id = row_id.as_deref().unwrap_or("-"),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying inference"
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => break Err(e),
            }
        };

        let outcome = match raw {
            Ok(raw) => self
                .classifier
                .parse(&raw)
                .map_err(|e| failed(BatchErrorKind::Parse(e))),
            Err(error) => Err(failed(BatchErrorKind::Inference { attempts, error })),
        };

        if let Err(e) = &outcome {
            warn!(error = %e, "Row failed");
        }

        Ok(BatchItem {
            input,
            outcome,
            attempts,
            examples_used: prepared.examples_used,
            duration: start.elapsed(),
        })
    }
}

impl<I> Iterator for BatchRun<'_, I>
where
    I: Iterator<Item = ReviewInput>,
{
    type Item = Result<BatchItem, BatchAbort>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.halted {
            return None;
        }
        let input = self.inputs.next()?;
        let step = self.process(input);
        self.position += 1;

        if let Err(abort) = &step {
            warn!(error = %abort, "Backend unavailable, aborting batch");
            self.halted = true;
        }
        Some(step)
    }
}

/// Everything a batch run produced
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Processed rows, in input order
    pub items: Vec<BatchItem>,
    pub aborted: Option<BatchAbort>,
}

/// Outcome counts; failures are counted apart from Valid and Flagged
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub valid: usize,
    pub flagged: usize,
    pub failed: usize,
    pub low_confidence: usize,
    pub unspecified: usize,
}

impl BatchSummary {
    pub fn record(&mut self, item: &BatchItem) {
        self.total += 1;
        match &item.outcome {
            Ok(result) => {
                match result.decision() {
                    Decision::Valid => self.valid += 1,
                    Decision::Flagged => self.flagged += 1,
                }
                if result.is_low_confidence() {
                    self.low_confidence += 1;
                }
                if result.primary_violation() == Some(Violation::Unspecified) {
                    self.unspecified += 1;
                }
            }
            Err(_) => self.failed += 1,
        }
    }
}

impl BatchReport {
    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for item in &self.items {
            summary.record(item);
        }
        summary
    }

    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }
}

// ============================================================================
// AUDIT LOG FORMAT
// ============================================================================

/// Audit record for one processed row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub schema: String,
    pub audit_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub row_id: Option<String>,
    pub location: String,
    pub status: ItemStatus,
    pub decision: Option<Decision>,
    pub primary_violation: Option<Violation>,
    pub error: Option<String>,
    pub model: String,
    pub examples_used: usize,
    pub attempts: u32,
    pub duration_us: u64,
    pub low_confidence: bool,
    pub notes: Vec<ParseNote>,
    pub contract_version: String,
    /// Hash of the review text, so entries can be matched without storing it
    pub content_hash: String,
}

impl AuditEntry {
    pub fn from_item(item: &BatchItem, model: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        item.input.review_text.hash(&mut hasher);
        let content_hash = format!("{:016x}", hasher.finish());

        let (decision, primary_violation, error, low_confidence, notes) = match &item.outcome {
            Ok(result) => (
                Some(result.decision()),
                result.primary_violation(),
                None,
                result.is_low_confidence(),
                result.metadata().notes.clone(),
            ),
            Err(e) => (None, None, Some(e.kind.to_string()), false, Vec::new()),
        };

        Self {
            schema: AUDIT_SCHEMA.to_string(),
            audit_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            row_id: item.input.row_id.clone(),
            location: item.input.location.clone(),
            status: item.status(),
            decision,
            primary_violation,
            error,
            model: model.to_string(),
            examples_used: item.examples_used,
            attempts: item.attempts,
            duration_us: item.duration.as_micros() as u64,
            low_confidence,
            notes,
            contract_version: CONTRACT_VERSION.to_string(),
            content_hash,
        }
    }

    /// Single-line JSON for append-only logs
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// BATCH CSV FORMAT
// ============================================================================

pub const DECISION_COLUMN: &str = "Decision";
pub const PRIMARY_VIOLATION_COLUMN: &str = "Primary Violation";
pub const EXPLANATION_COLUMN: &str = "Explanation";
pub const STATUS_COLUMN: &str = "Status";
pub const ERROR_COLUMN: &str = "Error";
pub const ROW_ID_COLUMN: &str = "row_id";

/// Which input columns hold the review fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchColumns {
    pub location: String,
    pub review: String,
    /// Row identity column; the 1-based row number is used when absent
    pub id: Option<String>,
}

impl Default for BatchColumns {
    fn default() -> Self {
        Self {
            location: "location".to_string(),
            review: "review".to_string(),
            id: None,
        }
    }
}

/// One input row: the original record plus the extracted input
#[derive(Debug, Clone)]
pub struct BatchRow {
    pub record: csv::StringRecord,
    pub input: ReviewInput,
}

#[derive(Debug, Clone)]
pub struct BatchTable {
    pub headers: csv::StringRecord,
    pub rows: Vec<BatchRow>,
}

impl BatchTable {
    pub fn inputs(&self) -> impl Iterator<Item = ReviewInput> + '_ {
        self.rows.iter().map(|row| row.input.clone())
    }
}

/// Case-insensitive header lookup, ignoring a UTF-8 BOM
pub fn column_index(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|h| h.trim_start_matches('\u{feff}').trim().eq_ignore_ascii_case(name.trim()))
}

/// Read review rows from CSV. Empty review cells are kept; they fail per row.
pub fn read_batch_csv<R: io::Read>(
    reader: R,
    columns: &BatchColumns,
) -> Result<BatchTable, ContractError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = reader.headers()?.clone();

    let find = |name: &str| {
        column_index(&headers, name).ok_or_else(|| ContractError::MissingColumn(name.to_string()))
    };
    let location_idx = find(&columns.location)?;
    let review_idx = find(&columns.review)?;
    let id_idx = columns.id.as_deref().map(find).transpose()?;

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        let field = |idx: usize| record.get(idx).unwrap_or_default().to_string();
        let row_id = match id_idx {
            Some(idx) => field(idx),
            None => (i + 1).to_string(),
        };
        let input = ReviewInput::new(field(location_idx), field(review_idx)).with_row_id(row_id);
        rows.push(BatchRow { record, input });
    }

    debug!(rows = rows.len(), "Read batch input");
    Ok(BatchTable { headers, rows })
}

/// Writes input rows back out with the classification columns appended
pub struct BatchCsvWriter<W: io::Write> {
    writer: csv::Writer<W>,
    add_row_id: bool,
}

impl<W: io::Write> BatchCsvWriter<W> {
    /// Writes the header row immediately
    pub fn new(inner: W, input_headers: &csv::StringRecord, add_row_id: bool) -> Result<Self, ContractError> {
        let mut writer = csv::Writer::from_writer(inner);
        let mut headers: Vec<&str> = input_headers.iter().collect();
        if add_row_id {
            headers.push(ROW_ID_COLUMN);
        }
        headers.extend([
            DECISION_COLUMN,
            PRIMARY_VIOLATION_COLUMN,
            EXPLANATION_COLUMN,
            STATUS_COLUMN,
            ERROR_COLUMN,
        ]);
        writer.write_record(&headers)?;
        Ok(Self { writer, add_row_id })
    }

    pub fn write_item(&mut self, record: &csv::StringRecord, item: &BatchItem) -> Result<(), ContractError> {
        let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
        if self.add_row_id {
            fields.push(item.input.row_id.clone().unwrap_or_default());
        }

        match &item.outcome {
            Ok(result) => {
                fields.push(result.decision().to_string());
                fields.push(
                    result
                        .primary_violation()
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "None".to_string()),
                );
                fields.push(result.explanation().to_string());
                fields.push(item.status().as_str().to_string());
                fields.push(String::new());
            }
            Err(e) => {
                fields.extend([String::new(), String::new(), String::new()]);
                fields.push(item.status().as_str().to_string());
                fields.push(e.kind.to_string());
            }
        }

        self.writer.write_record(&fields)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn finish(self) -> Result<W, ContractError> {
        self.writer
            .into_inner()
            .map_err(|e| ContractError::IoError(e.into_error()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
