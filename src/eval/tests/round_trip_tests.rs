//! Batch output written to disk and re-read must score identically

use std::fs::File;
use std::time::Duration;

use review_contract::{
    read_batch_csv, BatchColumns, BatchCsvWriter, BatchError, BatchErrorKind, BatchItem,
    ParseError,
};
use review_eval::{read_ground_truth, read_predictions, GroundTruth, Scorer, UnmatchedReason};
use review_policy::{ClassificationResult, PolicyId, Violation};

const INPUT: &str = "\
review_id,location,review
r1,Blue Door Cafe,The scones were warm and the staff friendly
r2,Luigi's Pizzeria,\"Order now at www.cheap-pizza.biz, 50% off\"
r3,Sunset Park,Never been but I heard it's dirty
r4,Harbor View Hotel,My landlord keeps raising the rent
r5,Greenfield Dental Clinic,???
";

fn outcomes() -> Vec<Result<ClassificationResult, BatchError>> {
    vec![
        Ok(ClassificationResult::valid("First-hand visit.")),
        Ok(ClassificationResult::flagged(
            PolicyId::NoAdvertisement.into(),
            "Promotional link.",
        )),
        Ok(ClassificationResult::flagged(
            PolicyId::NoAdvertisement.into(),
            "Wrong on purpose.",
        )),
        Ok(ClassificationResult::flagged(Violation::Unspecified, "Off topic, maybe.")),
        Err(BatchError {
            row_id: Some("r5".into()),
            kind: BatchErrorKind::Parse(ParseError::NoDecision),
        }),
    ]
}

fn ground_truth(scorer: &Scorer) -> GroundTruth {
    let mut truth = GroundTruth::new();
    truth.insert("r1", scorer.label("Valid", "None"));
    truth.insert("r2", scorer.label("Flagged", "No Advertisement"));
    truth.insert("r3", scorer.label("Flagged", "hearsay"));
    truth.insert("r4", scorer.label("Flagged", "No Irrelevant Content"));
    truth.insert("r5", scorer.label("Valid", ""));
    truth
}

#[test]
fn batch_output_round_trip_preserves_scores() {
    let scorer = Scorer::default();
    let truth = ground_truth(&scorer);
    let columns = BatchColumns {
        id: Some("review_id".to_string()),
        ..BatchColumns::default()
    };
    let table = read_batch_csv(INPUT.as_bytes(), &columns).unwrap();

    let items: Vec<BatchItem> = table
        .rows
        .iter()
        .zip(outcomes())
        .map(|(row, outcome)| BatchItem {
            input: row.input.clone(),
            outcome,
            attempts: 1,
            examples_used: 3,
            duration: Duration::from_millis(1),
        })
        .collect();

    // Scored directly from the in-memory results.
    let direct: Vec<(String, ClassificationResult)> = items
        .iter()
        .filter_map(|item| {
            let id = item.input.row_id.clone()?;
            item.outcome.as_ref().ok().map(|r| (id, r.clone()))
        })
        .collect();
    let expected = scorer.score(&direct, &truth);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("classified.csv");
    let mut writer = BatchCsvWriter::new(File::create(&path).unwrap(), &table.headers, false).unwrap();
    for (row, item) in table.rows.iter().zip(&items) {
        writer.write_item(&row.record, item).unwrap();
    }
    writer.finish().unwrap();

    let predictions = read_predictions(
        File::open(&path).unwrap(),
        "review_id",
        "Decision",
        "Primary Violation",
        &scorer,
    )
    .unwrap();
    let reread = scorer.score_predictions(&predictions, &truth);

    assert_eq!(reread.total_rows, expected.total_rows);
    assert_eq!(reread.decision_accuracy, expected.decision_accuracy);
    assert_eq!(reread.violation_accuracy, expected.violation_accuracy);
    assert_eq!(reread.per_policy, expected.per_policy);
    assert_eq!(
        reread.mismatches.iter().map(|m| &m.row_id).collect::<Vec<_>>(),
        expected.mismatches.iter().map(|m| &m.row_id).collect::<Vec<_>>()
    );

    assert_eq!(expected.total_rows, 4);
    assert_eq!(expected.decision_accuracy, Some(1.0));
    assert_eq!(expected.violation_rows, 3);
    assert_eq!(expected.violation_correct, 1);
    assert_eq!(expected.unmatched.len(), 1);
    assert_eq!(expected.unmatched[0].reason, UnmatchedReason::MissingPrediction);
    assert_eq!(reread.unmatched, expected.unmatched);

    // The re-read side knows the review text.
    let r3 = reread.mismatches.iter().find(|m| m.row_id == "r3").unwrap();
    assert_eq!(r3.review.as_deref(), Some("Never been but I heard it's dirty"));
}

#[test]
fn ground_truth_file_round_trip() {
    let scorer = Scorer::default();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("truth.csv");
    std::fs::write(
        &path,
        "id,label,policy\n1,valid,\n2,FLAGGED,advertising\n2,Valid,\n",
    )
    .unwrap();

    let truth = read_ground_truth(File::open(&path).unwrap(), "id", "label", "policy", &scorer).unwrap();
    assert_eq!(truth.len(), 2);
    assert_eq!(truth.get("2").unwrap().violation, "No-Advertisement");
    assert!(truth.get("1").unwrap().is_valid());
}
