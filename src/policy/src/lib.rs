// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (C) 2025 Jonathan D.A. Jewell

//! Review Policy - the content policies location reviews are checked against
//!
//! Holds the fixed policy catalog (advertisement, off-topic, rant without a
//! visit), the labels a classification can carry, and the normalization rules
//! that map loosely written labels ("promo", "Flagged ", "off-topic") onto them.
//! The built-in grounding corpus of labeled reviews also lives here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

// ============ Core Types ============

/// Binary outcome of classifying a review
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Decision {
    Valid,
    Flagged,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Valid => "Valid",
            Decision::Flagged => "Flagged",
        }
    }

    /// Normalize a human-written decision label.
    ///
    /// Anything starting with `valid` is Valid and anything starting with
    /// `flag` is Flagged, ignoring case and surrounding whitespace.
    pub fn from_label(label: &str) -> Option<Self> {
        let key = normalize_label(label);
        if key.starts_with("valid") {
            Some(Decision::Valid)
        } else if key.starts_with("flag") {
            Some(Decision::Flagged)
        } else {
            None
        }
    }

    /// Map a single word of model output onto a decision class.
    ///
    /// Wider than [`Decision::from_label`]: synonyms such as "violates" or
    /// "compliant" count. Negations are handled by the caller.
    pub fn from_token(word: &str) -> Option<Self> {
        let word = word.to_lowercase();
        if VALID_TOKENS.contains(&word.as_str()) {
            Some(Decision::Valid)
        } else if FLAGGED_TOKENS.contains(&word.as_str()) {
            Some(Decision::Flagged)
        } else {
            None
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const VALID_TOKENS: &[&str] = &[
    "valid",
    "compliant",
    "acceptable",
    "approved",
    "allowed",
    "ok",
    "okay",
    "pass",
    "passes",
    "legitimate",
];

const FLAGGED_TOKENS: &[&str] = &[
    "flagged",
    "flag",
    "flags",
    "violates",
    "violation",
    "violating",
    "violated",
    "invalid",
    "rejected",
    "reject",
    "blocked",
    "noncompliant",
    "removed",
];

/// Identifier of one of the fixed review policies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PolicyId {
    #[serde(rename = "No-Advertisement")]
    NoAdvertisement,
    #[serde(rename = "No-Off-Topic")]
    NoOffTopic,
    #[serde(rename = "No-Fake-Rant")]
    NoFakeRant,
}

impl PolicyId {
    pub const ALL: [PolicyId; 3] = [
        PolicyId::NoAdvertisement,
        PolicyId::NoOffTopic,
        PolicyId::NoFakeRant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyId::NoAdvertisement => "No-Advertisement",
            PolicyId::NoOffTopic => "No-Off-Topic",
            PolicyId::NoFakeRant => "No-Fake-Rant",
        }
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyId {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = normalize_label(s);
        PolicyId::ALL
            .into_iter()
            .find(|id| normalize_label(id.as_str()) == key)
            .ok_or_else(|| PolicyError::UnknownPolicy(s.to_string()))
    }
}

/// The policy a flagged review is charged with
///
/// `Unspecified` is used when the model flagged a review without naming a
/// recognizable policy. It is never guessed into a concrete policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(into = "String", try_from = "String")]
pub enum Violation {
    Policy(PolicyId),
    Unspecified,
}

impl Violation {
    pub const UNSPECIFIED: &'static str = "Unspecified";

    pub fn as_str(&self) -> &'static str {
        match self {
            Violation::Policy(id) => id.as_str(),
            Violation::Unspecified => Self::UNSPECIFIED,
        }
    }

    pub fn policy(&self) -> Option<PolicyId> {
        match self {
            Violation::Policy(id) => Some(*id),
            Violation::Unspecified => None,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<PolicyId> for Violation {
    fn from(id: PolicyId) -> Self {
        Violation::Policy(id)
    }
}

impl From<Violation> for String {
    fn from(v: Violation) -> Self {
        v.as_str().to_string()
    }
}

impl TryFrom<String> for Violation {
    type Error = PolicyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.trim().eq_ignore_ascii_case(Self::UNSPECIFIED) {
            return Ok(Violation::Unspecified);
        }
        s.parse::<PolicyId>().map(Violation::Policy)
    }
}

/// A unit of work submitted for classification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewInput {
    pub location: String,
    pub review_text: String,
    /// Present in batch mode, absent for single reviews
    pub row_id: Option<String>,
}

impl ReviewInput {
    pub fn new(location: impl Into<String>, review_text: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            review_text: review_text.into(),
            row_id: None,
        }
    }

    /// Builder: tag the input with its batch row identity
    pub fn with_row_id(mut self, row_id: impl Into<String>) -> Self {
        self.row_id = Some(row_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.review_text.trim().is_empty() {
            return Err(PolicyError::MissingReviewText {
                row_id: self.row_id.clone(),
            });
        }
        Ok(())
    }
}

/// A human-labeled review from the grounding corpus (no embedding yet)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExampleRecord {
    pub location: String,
    pub review_text: String,
    pub decision: Decision,
    pub violation: Option<PolicyId>,
    /// Short justification shown to the model alongside the label
    #[serde(default)]
    pub rationale: String,
}

impl ExampleRecord {
    pub fn validate(&self) -> Result<(), PolicyError> {
        let consistent = match self.decision {
            Decision::Valid => self.violation.is_none(),
            Decision::Flagged => self.violation.is_some(),
        };
        if !consistent || self.review_text.trim().is_empty() {
            return Err(PolicyError::InconsistentExample {
                review: self.review_text.clone(),
            });
        }
        Ok(())
    }
}

// ============ Classification Result ============

/// Something the parser noticed while reading model output
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ParseNote {
    /// Flagged without a recognizable policy label
    UnspecifiedViolation,
    /// Said Valid but also named a violation; the violation was dropped
    ContradictionResolved,
    /// No explanation text was found
    EmptyExplanation,
    /// No labeled decision line; the decision came from free text
    UnlabeledDecision,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultMetadata {
    pub low_confidence: bool,
    pub notes: Vec<ParseNote>,
}

impl ResultMetadata {
    pub fn note(&mut self, note: ParseNote) {
        if !self.notes.contains(&note) {
            self.notes.push(note);
        }
    }
}

/// The classifier's sole output
///
/// `primary_violation` is `None` exactly when the decision is Valid. The
/// constructors are the only way to build one, so the invariant holds for
/// every value in the program, including deserialized ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "ClassificationRecord")]
pub struct ClassificationResult {
    decision: Decision,
    primary_violation: Option<Violation>,
    explanation: String,
    metadata: ResultMetadata,
}

impl ClassificationResult {
    pub fn valid(explanation: impl Into<String>) -> Self {
        Self {
            decision: Decision::Valid,
            primary_violation: None,
            explanation: explanation.into(),
            metadata: ResultMetadata::default(),
        }
    }

    pub fn flagged(violation: Violation, explanation: impl Into<String>) -> Self {
        Self {
            decision: Decision::Flagged,
            primary_violation: Some(violation),
            explanation: explanation.into(),
            metadata: ResultMetadata::default(),
        }
    }

    /// Builder: attach parse metadata
    pub fn with_metadata(mut self, metadata: ResultMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn primary_violation(&self) -> Option<Violation> {
        self.primary_violation
    }

    pub fn explanation(&self) -> &str {
        &self.explanation
    }

    pub fn metadata(&self) -> &ResultMetadata {
        &self.metadata
    }

    pub fn is_low_confidence(&self) -> bool {
        self.metadata.low_confidence
    }
}

#[derive(Deserialize)]
struct ClassificationRecord {
    decision: Decision,
    primary_violation: Option<Violation>,
    explanation: String,
    #[serde(default)]
    metadata: ResultMetadata,
}

impl TryFrom<ClassificationRecord> for ClassificationResult {
    type Error = PolicyError;

    fn try_from(record: ClassificationRecord) -> Result<Self, Self::Error> {
        let result = match (record.decision, record.primary_violation) {
            (Decision::Valid, None) => ClassificationResult::valid(record.explanation),
            (Decision::Flagged, Some(v)) => ClassificationResult::flagged(v, record.explanation),
            (decision, violation) => {
                return Err(PolicyError::InconsistentResult {
                    decision,
                    violation: violation.map(|v| v.as_str()).unwrap_or("None").to_string(),
                })
            }
        };
        Ok(result.with_metadata(record.metadata))
    }
}

// ============ Policy Catalog ============

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyDefinition {
    pub id: PolicyId,
    pub name: String,
    pub description: String,
    /// Labels that name this policy exactly once normalized
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Fragments that identify this policy anywhere inside a label
    #[serde(default)]
    pub stems: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicySet {
    pub name: String,
    pub policies: Vec<PolicyDefinition>,
}

/// Outcome of resolving a free-form violation label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelMatch {
    /// Empty, "none", "n/a" and the like
    NoViolation,
    Policy(PolicyId),
    Unrecognized,
}

const NONE_LABELS: &[&str] = &[
    "none",
    "n/a",
    "na",
    "null",
    "nil",
    "no violation",
    "not applicable",
];

impl PolicySet {
    /// The three location review policies
    pub fn location_review_default() -> Self {
        Self {
            name: "Location Review Policies".to_string(),
            policies: vec![
                PolicyDefinition {
                    id: PolicyId::NoAdvertisement,
                    name: "No Advertisement".to_string(),
                    description: "Reviews should not contain promotional content, discount offers, or links."
                        .to_string(),
                    aliases: vec![
                        "advertising".to_string(),
                        "advertisement".to_string(),
                        "ads".to_string(),
                        "promo".to_string(),
                        "promotion".to_string(),
                    ],
                    stems: vec!["advert".to_string(), "promo".to_string()],
                },
                PolicyDefinition {
                    id: PolicyId::NoOffTopic,
                    name: "No Irrelevant Content".to_string(),
                    description: "Reviews should focus on the experience at the location, not other matters."
                        .to_string(),
                    aliases: vec!["irrelevant".to_string(), "off-topic".to_string()],
                    stems: vec![
                        "irrelev".to_string(),
                        "offtopic".to_string(),
                        "off topic".to_string(),
                    ],
                },
                PolicyDefinition {
                    id: PolicyId::NoFakeRant,
                    name: "No Rant Without Visit".to_string(),
                    description: "Rants or complaints must come from someone who actually visited, not from speculation or hearsay."
                        .to_string(),
                    aliases: vec![
                        "rant without visit".to_string(),
                        "speculation".to_string(),
                        "hearsay".to_string(),
                    ],
                    stems: vec![
                        "visit".to_string(),
                        "hearsay".to_string(),
                        "speculat".to_string(),
                        "rant".to_string(),
                    ],
                },
            ],
        }
    }

    /// Load a policy set from JSON; every policy id must appear exactly once
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let set: PolicySet = serde_json::from_str(json)?;
        for id in PolicyId::ALL {
            let count = set.policies.iter().filter(|p| p.id == id).count();
            if count != 1 {
                return Err(PolicyError::IncompletePolicySet(format!(
                    "policy {} defined {} times",
                    id, count
                )));
            }
        }
        debug!(name = %set.name, "Loaded policy set");
        Ok(set)
    }

    pub fn get(&self, id: PolicyId) -> Option<&PolicyDefinition> {
        self.policies.iter().find(|p| p.id == id)
    }

    /// Display name for a policy, falling back to its id
    pub fn display_name(&self, id: PolicyId) -> &str {
        self.get(id).map(|p| p.name.as_str()).unwrap_or(id.as_str())
    }

    /// Resolve a loosely written violation label onto a policy.
    ///
    /// Tried in order: exact id or name, exact alias, id or name contained in
    /// the label, stem starting a word of the label. Matching is
    /// case-insensitive and treats `-` and `_` as spaces.
    pub fn match_violation(&self, label: &str) -> LabelMatch {
        let key = normalize_label(label);
        if key.is_empty() || NONE_LABELS.contains(&key.as_str()) {
            return LabelMatch::NoViolation;
        }

        let exact = self.policies.iter().find(|p| {
            key == normalize_label(p.id.as_str()) || key == normalize_label(&p.name)
        });
        if let Some(p) = exact {
            return LabelMatch::Policy(p.id);
        }

        let alias = self
            .policies
            .iter()
            .find(|p| p.aliases.iter().any(|a| key == normalize_label(a)));
        if let Some(p) = alias {
            return LabelMatch::Policy(p.id);
        }

        if let Some(id) = self.find_in_text(&key) {
            return LabelMatch::Policy(id);
        }

        let stem = self.policies.iter().find(|p| {
            p.stems
                .iter()
                .map(|s| normalize_label(s))
                .any(|s| !s.is_empty() && find_word_start(&key, &s).is_some())
        });
        match stem {
            Some(p) => LabelMatch::Policy(p.id),
            None => LabelMatch::Unrecognized,
        }
    }

    /// Find the policy whose id or name appears earliest in free text
    pub fn find_in_text(&self, text: &str) -> Option<PolicyId> {
        let haystack = normalize_label(text);
        self.policies
            .iter()
            .filter_map(|p| {
                let by_name = find_word_start(&haystack, &normalize_label(&p.name));
                let by_id = find_word_start(&haystack, &normalize_label(p.id.as_str()));
                by_name.into_iter().chain(by_id).min().map(|pos| (pos, p.id))
            })
            .min_by_key(|(pos, _)| *pos)
            .map(|(_, id)| id)
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::location_review_default()
    }
}

/// Lowercase, treat `-`/`_` as spaces, collapse whitespace, strip edge punctuation
pub fn normalize_label(s: &str) -> String {
    let lowered = s.to_lowercase().replace(['-', '_'], " ");
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '/')
        .to_string()
}

/// Position of the first `needle` that begins a word of `haystack`
fn find_word_start(haystack: &str, needle: &str) -> Option<usize> {
    haystack.match_indices(needle).map(|(i, _)| i).find(|&i| {
        haystack[..i]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric())
    })
}

// ============ Example Corpus ============

const BUILTIN_EXAMPLES: &str = include_str!("../data/examples.json");

/// The labeled reviews shipped with the engine
pub fn builtin_examples() -> Result<Vec<ExampleRecord>, PolicyError> {
    examples_from_json(BUILTIN_EXAMPLES)
}

/// Parse and validate a JSON array of labeled examples
pub fn examples_from_json(json: &str) -> Result<Vec<ExampleRecord>, PolicyError> {
    let examples: Vec<ExampleRecord> = serde_json::from_str(json)?;
    for example in &examples {
        example.validate()?;
    }
    Ok(examples)
}

// ============ Errors ============

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Review text is missing{}", .row_id.as_deref().map(|r| format!(" (row {r})")).unwrap_or_default())]
    MissingReviewText { row_id: Option<String> },
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),
    #[error("Example label is inconsistent with its decision: {review}")]
    InconsistentExample { review: String },
    #[error("Decision {decision} cannot carry violation {violation}")]
    InconsistentResult { decision: Decision, violation: String },
    #[error("Incomplete policy set: {0}")]
    IncompletePolicySet(String),
    #[error("Policy parse error: {0}")]
    ParseError(#[from] serde_json::Error),
}

// ============ Tests ============
