//! End-to-end pipeline tests with a deterministic stand-in for the model

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use example_retrieval::{ExampleRetriever, ExampleStore};
use review_contract::{
    BatchErrorKind, BatchRunner, ClassifyError, ContractError, ItemStatus, ReviewClassifier,
    RetryPolicy,
};
use review_policy::{builtin_examples, Decision, PolicyId, PolicySet, ReviewInput, Violation};
use slm_client::{BackendError, EmbeddingBackend, HashingEmbedder, InferenceBackend};

/// Answers based on the review under evaluation, never on the examples
struct KeywordBackend {
    calls: AtomicUsize,
}

impl KeywordBackend {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn review_under_evaluation(prompt: &str) -> &str {
    let section = prompt.split("Review to Evaluate:").nth(1).unwrap_or_default();
    section
        .lines()
        .find_map(|line| line.trim().strip_prefix("Review: "))
        .unwrap_or_default()
}

impl InferenceBackend for KeywordBackend {
    fn infer(&self, prompt: &str) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let review = review_under_evaluation(prompt).to_lowercase();

        if review.contains("stall") {
            Err(BackendError::Timeout { timeout_ms: 10 })
        } else if review.contains("shutdown") {
            Err(BackendError::Unavailable("connection refused".to_string()))
        } else if review.contains("gibberish") {
            Ok("I'd rather not say.".to_string())
        } else if review.contains("www.") || review.contains("discount") {
            Ok("Decision: Flagged\nPrimary Violation: No Advertisement\nExplanation: The review promotes a discount website.".to_string())
        } else {
            Ok("Decision: Valid\nPrimary Violation: None\nExplanation: A first-hand account of the visit.".to_string())
        }
    }

    fn model(&self) -> &str {
        "keyword-stub"
    }
}

/// Embeds like [`HashingEmbedder`] until a text mentions "blackout"
struct FlakyEmbedder {
    inner: HashingEmbedder,
    calls: AtomicUsize,
}

impl EmbeddingBackend for FlakyEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("blackout") {
            return Err(BackendError::Unavailable("embedding server down".to_string()));
        }
        self.inner.embed(text)
    }

    fn model(&self) -> &str {
        "flaky-hashing"
    }
}

fn classifier_with(backend: Arc<KeywordBackend>, k: usize) -> Result<ReviewClassifier, ContractError> {
    let embedder = Arc::new(HashingEmbedder::default());
    let store = ExampleStore::build(builtin_examples().unwrap(), embedder.as_ref()).unwrap();
    let retriever = ExampleRetriever::new(Arc::new(store), embedder).unwrap();
    ReviewClassifier::new(PolicySet::location_review_default(), retriever, backend, k)
}

fn classifier(backend: Arc<KeywordBackend>) -> ReviewClassifier {
    classifier_with(backend, 3).unwrap()
}

#[test]
fn advertisement_is_flagged() {
    let classifier = classifier(Arc::new(KeywordBackend::new()));
    let input = ReviewInput::new(
        "Luigi's Pizzeria",
        "Get a 30% discount on your first order, use code SAVE30 at www.best-deals.com",
    );

    let result = classifier.classify(&input).unwrap();
    assert_eq!(result.decision(), Decision::Flagged);
    assert_eq!(
        result.primary_violation(),
        Some(Violation::Policy(PolicyId::NoAdvertisement))
    );
    assert!(!result.explanation().is_empty());
}

#[test]
fn first_hand_review_is_valid() {
    let classifier = classifier(Arc::new(KeywordBackend::new()));
    let input = ReviewInput::new(
        "Blue Door Cafe",
        "The croissants were flaky and the barista remembered my order.",
    );

    let result = classifier.classify(&input).unwrap();
    assert_eq!(result.decision(), Decision::Valid);
    assert_eq!(result.primary_violation(), None);
}

#[test]
fn prompt_grounds_on_k_examples() {
    let classifier = classifier(Arc::new(KeywordBackend::new()));
    let input = ReviewInput::new("Blue Door Cafe", "Nice coffee");

    let prepared = classifier.prepare(&input).unwrap();
    assert_eq!(prepared.examples_used, 3);
    let prompt = prepared.prompt.as_str();
    assert!(prompt.contains("Reference 3:"));
    assert!(!prompt.contains("Reference 4:"));
    assert_eq!(prepared.prompt, classifier.prepare(&input).unwrap().prompt);
}

#[test]
fn missing_review_text_fails_before_inference() {
    let backend = Arc::new(KeywordBackend::new());
    let classifier = classifier(backend.clone());
    let input = ReviewInput::new("Blue Door Cafe", "   ").with_row_id("12");

    let err = classifier.classify(&input).unwrap_err();
    assert!(matches!(err, ClassifyError::Input(_)));
    assert!(err.to_string().contains("row 12"));
    assert_eq!(backend.calls(), 0);
}

#[test]
fn unparsable_output_is_an_error_in_single_mode() {
    let classifier = classifier(Arc::new(KeywordBackend::new()));
    let input = ReviewInput::new("Sunset Park", "gibberish");

    let err = classifier.classify(&input).unwrap_err();
    assert!(matches!(err, ClassifyError::Parse(_)));
    assert!(!err.is_fatal());
}

#[test]
fn k_must_fit_the_store() {
    let err = classifier_with(Arc::new(KeywordBackend::new()), 0).unwrap_err();
    assert!(matches!(err, ContractError::InvalidK { k: 0, .. }));

    let err = classifier_with(Arc::new(KeywordBackend::new()), 1000).unwrap_err();
    assert!(matches!(err, ContractError::InvalidK { k: 1000, .. }));
}

#[test]
fn batch_isolates_failing_rows_and_keeps_order() {
    let backend = Arc::new(KeywordBackend::new());
    let classifier = classifier(backend.clone());
    let runner = BatchRunner::new(&classifier, RetryPolicy::immediate(3));

    let inputs = vec![
        ReviewInput::new("Blue Door Cafe", "Lovely scones").with_row_id("a"),
        ReviewInput::new("Harbor View Hotel", "stall stall stall").with_row_id("b"),
        ReviewInput::new("Luigi's Pizzeria", "Order at www.cheap-pizza.biz").with_row_id("c"),
        ReviewInput::new("Sunset Park", "").with_row_id("d"),
        ReviewInput::new("Sunset Park", "gibberish").with_row_id("e"),
    ];

    let report = runner.run_to_report(inputs);
    assert!(report.is_complete());

    let ids: Vec<_> = report
        .items
        .iter()
        .map(|i| i.input.row_id.clone().unwrap())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);

    let statuses: Vec<_> = report.items.iter().map(|i| i.status()).collect();
    assert_eq!(
        statuses,
        vec![
            ItemStatus::Ok,
            ItemStatus::Error,
            ItemStatus::Ok,
            ItemStatus::Error,
            ItemStatus::Error
        ]
    );

    // Timeouts retry up to the budget.
    let stalled = &report.items[1];
    assert_eq!(stalled.attempts, 3);
    let err = stalled.outcome.as_ref().unwrap_err();
    assert_eq!(err.row_id.as_deref(), Some("b"));
    assert!(matches!(
        err.kind,
        BatchErrorKind::Inference { attempts: 3, error: BackendError::Timeout { .. } }
    ));

    // Invalid input never reaches the model.
    assert_eq!(report.items[3].attempts, 0);
    assert!(matches!(
        report.items[3].outcome.as_ref().unwrap_err().kind,
        BatchErrorKind::InvalidInput(_)
    ));

    // Parse failures are not retried.
    assert_eq!(report.items[4].attempts, 1);

    // a, c and e once each, b three times.
    assert_eq!(backend.calls(), 6);

    let summary = report.summary();
    assert_eq!(summary.total, 5);
    assert_eq!(summary.valid, 1);
    assert_eq!(summary.flagged, 1);
    assert_eq!(summary.failed, 3);
}

#[test]
fn batch_aborts_when_backend_is_unavailable() {
    let backend = Arc::new(KeywordBackend::new());
    let classifier = classifier(backend.clone());
    let runner = BatchRunner::new(&classifier, RetryPolicy::immediate(3));

    let inputs = vec![
        ReviewInput::new("Blue Door Cafe", "Lovely scones").with_row_id("1"),
        ReviewInput::new("Blue Door Cafe", "shutdown").with_row_id("2"),
        ReviewInput::new("Blue Door Cafe", "Great tea").with_row_id("3"),
    ];

    let steps: Vec<_> = runner.run(inputs).collect();
    assert_eq!(steps.len(), 2);
    assert!(steps[0].is_ok());

    let abort = steps[1].as_ref().unwrap_err();
    assert_eq!(abort.position, 1);
    assert_eq!(abort.row_id.as_deref(), Some("2"));
    assert!(abort.cause.is_fatal());

    // Unavailable is not retried and row 3 is never attempted.
    assert_eq!(backend.calls(), 2);
}

#[test]
fn batch_aborts_when_embedding_backend_is_unavailable() {
    let embedder = Arc::new(FlakyEmbedder {
        inner: HashingEmbedder::default(),
        calls: AtomicUsize::new(0),
    });
    let store = ExampleStore::build(builtin_examples().unwrap(), embedder.as_ref()).unwrap();
    let retriever = ExampleRetriever::new(Arc::new(store), embedder.clone()).unwrap();
    let backend = Arc::new(KeywordBackend::new());
    let classifier = ReviewClassifier::new(
        PolicySet::location_review_default(),
        retriever,
        backend.clone(),
        3,
    )
    .unwrap();
    let runner = BatchRunner::new(&classifier, RetryPolicy::immediate(3));

    let before = embedder.calls.load(Ordering::SeqCst);
    let steps: Vec<_> = runner
        .run(vec![
            ReviewInput::new("Blue Door Cafe", "Lovely scones").with_row_id("1"),
            ReviewInput::new("Blue Door Cafe", "blackout").with_row_id("2"),
            ReviewInput::new("Blue Door Cafe", "Great tea").with_row_id("3"),
        ])
        .collect();

    assert_eq!(steps.len(), 2);
    assert!(steps[0].is_ok());
    let abort = steps[1].as_ref().unwrap_err();
    assert_eq!(abort.position, 1);
    assert_eq!(abort.row_id.as_deref(), Some("2"));
    assert!(matches!(abort.cause, BackendError::Unavailable(_)));

    // One query embed each for rows 1 and 2, none for row 3.
    assert_eq!(embedder.calls.load(Ordering::SeqCst) - before, 2);
    assert_eq!(backend.calls(), 1);
}

#[test]
fn batch_report_records_abort() {
    let classifier = classifier(Arc::new(KeywordBackend::new()));
    let runner = BatchRunner::new(&classifier, RetryPolicy::immediate(1));

    let report = runner.run_to_report(vec![
        ReviewInput::new("Cafe", "shutdown").with_row_id("x"),
        ReviewInput::new("Cafe", "Fine").with_row_id("y"),
    ]);
    assert!(report.items.is_empty());
    assert!(!report.is_complete());
    assert_eq!(
        report.aborted.as_ref().and_then(|a| a.row_id.as_deref()),
        Some("x")
    );
}
