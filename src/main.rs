// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (C) 2025 Jonathan D.A. Jewell

//! Review Gating CLI
//!
//! Command-line interface for the review classifier.
//!
//! # Overview
//!
//! Classifies location reviews against the content policies (advertisement,
//! irrelevant content, rant without visit) by grounding a local language
//! model on similar labeled examples, and scores predictions against human
//! labels.
//!
//! # Dry Run Mode
//!
//! Commands that would contact the model or write files support `--dry-run`
//! to preview the work without side effects.

mod config;

use clap::{Parser, Subcommand, ValueEnum};
use config::{AppConfig, ConfigError, Overrides};
use example_retrieval::{ExampleRetriever, ExampleStore, RetrievalError};
use review_contract::{
    read_batch_csv, AuditEntry, BatchColumns, BatchCsvWriter, BatchRunner, BatchSummary,
    ClassifyError, ContractError, ReviewClassifier,
};
use review_eval::{
    read_ground_truth, read_labeled_rows, read_predictions, write_mismatches, EvalError,
    LabeledColumns, ScoreReport, Scorer,
};
use review_policy::{
    builtin_examples, examples_from_json, ClassificationResult, Decision, ExampleRecord,
    PolicyError, PolicySet, ReviewInput,
};
use slm_client::{BackendError, EmbeddingBackend, HashingEmbedder, InferenceBackend, OllamaClient};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Output format for results
#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine processing
    Json,
    /// Compact single-line output
    Compact,
}

/// Verbosity level
#[derive(Debug, Clone, ValueEnum)]
enum Verbosity {
    /// Errors only
    Quiet,
    /// Warnings such as retried timeouts and degraded parses
    Normal,
    /// Pipeline progress
    Verbose,
    /// Per-step detail including prompt sizes and similarities
    Debug,
}

impl Verbosity {
    fn filter(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "error",
            Verbosity::Normal => "warn",
            Verbosity::Verbose => "info",
            Verbosity::Debug => "debug",
        }
    }
}

#[derive(Parser)]
#[command(name = "revgate")]
#[command(author = "Jonathan D.A. Jewell <jonathan@hyperpolymath.org>")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Retrieval-grounded policy classification for location reviews")]
#[command(long_about = r#"
Review Gating - Policy classification for location reviews

OVERVIEW
  Decides whether a review is Valid or Flagged against three policies:
  1. No Advertisement: promotional content, discount offers, or links
  2. No Irrelevant Content: reviews must be about the location
  3. No Rant Without Visit: complaints must come from actual visitors

  Each review is embedded, the most similar labeled examples are retrieved,
  and a local model (Ollama) classifies it with those examples as grounding.

EXAMPLES
  revgate classify -l "Blue Door Cafe" -r "Great scones!"
  revgate batch reviews.csv -o classified.csv --audit-log audit.jsonl
  revgate score classified.csv --mismatches mismatches.csv
  revgate retrieve "Use code SAVE10 at www.deals.com" -k 5
  revgate policy --format json

EXIT CODES
  0  Valid (classify) / success
  1  Flagged (classify)
  2  Some batch rows failed
  3  Error during execution, or batch aborted

MORE INFO
  https://github.com/hyperpolymath/review-gating
"#)]
#[command(after_help = r#"
CONFIGURATION
  --config takes a JSON file: {"inference": {...}, "classifier": {...},
  "offline_embeddings": false}. Flags and REVGATE_* variables override it.

LOGGING
  Logs go to stderr. RUST_LOG overrides --verbosity.

SHELL COMPLETIONS
  Generate completions with:
    revgate completions bash > /etc/bash_completion.d/revgate
    revgate completions zsh > ~/.zfunc/_revgate
    revgate completions fish > ~/.config/fish/completions/revgate.fish
"#)]
struct Cli {
    /// Output verbosity level
    #[arg(short, long, value_enum, default_value = "normal", global = true)]
    verbosity: Verbosity,

    /// Dry run mode - show what would be done without doing it
    #[arg(long, global = true)]
    dry_run: bool,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Custom policy catalog (JSON)
    #[arg(short, long, global = true)]
    policy_file: Option<PathBuf>,

    /// Custom labeled example corpus (JSON)
    #[arg(short, long, global = true)]
    examples_file: Option<PathBuf>,

    /// Ollama base URL
    #[arg(long, global = true, env = "REVGATE_OLLAMA_URL")]
    ollama_url: Option<String>,

    /// Generation model
    #[arg(short, long, global = true, env = "REVGATE_MODEL")]
    model: Option<String>,

    /// Embedding model
    #[arg(long, global = true, env = "REVGATE_EMBED_MODEL")]
    embed_model: Option<String>,

    /// Per-request timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Embed locally with feature hashing instead of the embedding model
    #[arg(long, global = true)]
    offline_embeddings: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a single review
    ///
    /// Surfaces the first error immediately.
    ///
    /// EXAMPLES
    ///   revgate classify -l "Sunset Park" -r "Never been, heard it's dirty"
    ///   echo "Lovely staff" | revgate classify -r -
    #[command(visible_alias = "c")]
    Classify {
        /// Review text (use '-' for stdin)
        #[arg(short, long)]
        review: String,

        /// Location the review is about
        #[arg(short, long, default_value = "")]
        location: String,

        /// Grounding examples per prompt
        #[arg(short)]
        k: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Classify every row of a CSV file
    ///
    /// Appends Decision, Primary Violation, Explanation, Status and Error
    /// columns. A failing row is recorded and the batch continues; an
    /// unreachable backend aborts the batch.
    #[command(visible_alias = "b")]
    Batch {
        /// Input CSV
        input: PathBuf,

        /// Output CSV (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Column holding the location
        #[arg(long, default_value = "location")]
        location_column: String,

        /// Column holding the review text
        #[arg(long, default_value = "review")]
        review_column: String,

        /// Column holding a row identity (row number when omitted)
        #[arg(long)]
        id_column: Option<String>,

        /// Add a row_id column to the output
        #[arg(long)]
        with_row_id: bool,

        /// Append one JSON audit record per row to this file
        #[arg(long)]
        audit_log: Option<PathBuf>,

        /// Grounding examples per prompt
        #[arg(short)]
        k: Option<usize>,

        /// Attempts per row on inference timeouts
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Summary format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Score predictions against ground truth
    ///
    /// Reads one CSV holding both predicted and true labels, or predictions
    /// plus a separate --truth file matched by row id. Writes the mismatch
    /// report as CSV.
    #[command(visible_alias = "s")]
    Score {
        /// Labeled CSV, or predictions when --truth is given
        input: PathBuf,

        /// Separate ground-truth CSV
        #[arg(long)]
        truth: Option<PathBuf>,

        /// Predicted decision column
        #[arg(long, default_value = "Decision")]
        decision_column: String,

        /// Predicted violation column
        #[arg(long, default_value = "Primary Violation")]
        violation_column: String,

        /// True decision column
        #[arg(long, default_value = "GT_Decision")]
        gt_decision_column: String,

        /// True violation column
        #[arg(long, default_value = "GT_Violation")]
        gt_violation_column: String,

        /// Row identity column (required with --truth, default row_id)
        #[arg(long)]
        id_column: Option<String>,

        /// Review text column for the mismatch report
        #[arg(long)]
        review_column: Option<String>,

        /// Mismatch report path
        #[arg(long, default_value = "mismatches.csv")]
        mismatches: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the grounding examples retrieved for a review
    #[command(visible_alias = "r")]
    Retrieve {
        /// Review text (use '-' for stdin)
        review: String,

        /// Number of examples
        #[arg(short)]
        k: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Display the policy catalog
    #[command(visible_alias = "p")]
    Policy {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Generate shell completions
    ///
    /// EXAMPLES
    ///   revgate completions bash > ~/.local/share/bash-completion/completions/revgate
    ///   revgate completions zsh > ~/.zfunc/_revgate
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },

    /// Generate man page
    ///
    /// EXAMPLE
    ///   revgate man > /usr/local/share/man/man1/revgate.1
    Man,
}

#[derive(Error, Debug)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{context}: {source}")]
    Io { context: String, source: io::Error },
}

fn io_context(context: impl Into<String>) -> impl FnOnce(io::Error) -> AppError {
    let context = context.into();
    move |source| AppError::Io { context, source }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.verbosity);

    let exit_code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            3
        }
    };

    std::process::exit(exit_code);
}

fn init_tracing(verbosity: &Verbosity) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity.filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<i32, AppError> {
    match &cli.command {
        Commands::Classify {
            review,
            location,
            k,
            format,
        } => {
            let config = load_config(cli, *k, None)?;
            let review = read_text_arg(review)?;
            if cli.dry_run {
                println!("[dry-run] Would classify a {}-character review", review.len());
                println!("[dry-run] Model: {} via {}", config.inference.model, config.inference.base_url);
                println!("[dry-run] Grounding examples: {}", config.classifier.k);
                return Ok(0);
            }
            let classifier = build_classifier(cli, &config)?;
            classify_review(&classifier, ReviewInput::new(location.as_str(), review), format)
        }
        Commands::Batch {
            input,
            output,
            location_column,
            review_column,
            id_column,
            with_row_id,
            audit_log,
            k,
            max_attempts,
            format,
        } => {
            let config = load_config(cli, *k, *max_attempts)?;
            let columns = BatchColumns {
                location: location_column.clone(),
                review: review_column.clone(),
                id: id_column.clone(),
            };
            let file = File::open(input).map_err(io_context(format!("Cannot open {}", input.display())))?;
            let table = read_batch_csv(file, &columns)?;

            if cli.dry_run {
                println!("[dry-run] Would classify {} rows from {}", table.rows.len(), input.display());
                match output {
                    Some(path) => println!("[dry-run] Output: {}", path.display()),
                    None => println!("[dry-run] Output: stdout"),
                }
                println!(
                    "[dry-run] Model: {}, k: {}, attempts per row: {}",
                    config.inference.model, config.classifier.k, config.classifier.retry.max_attempts
                );
                return Ok(0);
            }

            let classifier = build_classifier(cli, &config)?;
            let options = BatchOptions {
                output: output.as_deref(),
                with_row_id: *with_row_id,
                audit_log: audit_log.as_deref(),
                format,
            };
            run_batch(&classifier, &config, table, options)
        }
        Commands::Score {
            input,
            truth,
            decision_column,
            violation_column,
            gt_decision_column,
            gt_violation_column,
            id_column,
            review_column,
            mismatches,
            format,
        } => {
            let scorer = Scorer::new(load_policies(cli)?);
            let open = |path: &Path| {
                File::open(path).map_err(io_context(format!("Cannot open {}", path.display())))
            };

            let report = match truth {
                Some(truth) => {
                    let id = id_column.as_deref().unwrap_or("row_id");
                    let predictions =
                        read_predictions(open(input.as_path())?, id, decision_column, violation_column, &scorer)?;
                    let truth = read_ground_truth(
                        open(truth.as_path())?,
                        id,
                        gt_decision_column,
                        gt_violation_column,
                        &scorer,
                    )?;
                    scorer.score_predictions(&predictions, &truth)
                }
                None => {
                    let columns = LabeledColumns {
                        pred_decision: decision_column.clone(),
                        pred_violation: violation_column.clone(),
                        gt_decision: gt_decision_column.clone(),
                        gt_violation: gt_violation_column.clone(),
                        id: id_column.clone(),
                        review: review_column.clone(),
                    };
                    let rows = read_labeled_rows(open(input.as_path())?, &columns, &scorer)?;
                    scorer.score_rows(&rows)
                }
            };

            print_score(&report, format)?;

            if cli.dry_run {
                println!("[dry-run] Would write {} mismatches to {}", report.mismatches.len(), mismatches.display());
            } else {
                let file = File::create(mismatches)
                    .map_err(io_context(format!("Cannot create {}", mismatches.display())))?;
                write_mismatches(BufWriter::new(file), &report)?;
                if matches!(format, OutputFormat::Text) {
                    println!("\nSaved mismatch report: {}", mismatches.display());
                }
            }
            Ok(0)
        }
        Commands::Retrieve { review, k, format } => {
            let config = load_config(cli, *k, None)?;
            let review = read_text_arg(review)?;
            let retriever = build_retriever(cli, &config, embedder(&config)?)?;
            let k = config.classifier.effective_k(retriever.store().len());
            show_retrieved(&retriever, &review, k, format)?;
            Ok(0)
        }
        Commands::Policy { format } => {
            show_policy(&load_policies(cli)?, format)?;
            Ok(0)
        }
        Commands::Completions { shell } => {
            generate_completions(*shell);
            Ok(0)
        }
        Commands::Man => generate_man_page(),
    }
}

// ============ Setup ============

fn load_config(cli: &Cli, k: Option<usize>, max_attempts: Option<u32>) -> Result<AppConfig, AppError> {
    let config = AppConfig::load(cli.config.as_deref())?.apply(Overrides {
        base_url: cli.ollama_url.clone(),
        model: cli.model.clone(),
        embedding_model: cli.embed_model.clone(),
        timeout_ms: cli.timeout_ms,
        k,
        max_attempts,
        offline_embeddings: cli.offline_embeddings,
    });
    Ok(config)
}

fn load_policies(cli: &Cli) -> Result<PolicySet, AppError> {
    match &cli.policy_file {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(io_context(format!("Cannot read {}", path.display())))?;
            Ok(PolicySet::from_json(&json)?)
        }
        None => Ok(PolicySet::location_review_default()),
    }
}

fn load_examples(cli: &Cli) -> Result<Vec<ExampleRecord>, AppError> {
    match &cli.examples_file {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(io_context(format!("Cannot read {}", path.display())))?;
            Ok(examples_from_json(&json)?)
        }
        None => Ok(builtin_examples()?),
    }
}

fn embedder(config: &AppConfig) -> Result<Arc<dyn EmbeddingBackend>, AppError> {
    if config.offline_embeddings {
        Ok(Arc::new(HashingEmbedder::default()))
    } else {
        Ok(Arc::new(OllamaClient::new(config.inference.clone())?))
    }
}

fn build_retriever(
    cli: &Cli,
    config: &AppConfig,
    embedder: Arc<dyn EmbeddingBackend>,
) -> Result<ExampleRetriever, AppError> {
    let store = ExampleStore::build(load_examples(cli)?, embedder.as_ref())?;
    Ok(ExampleRetriever::new(Arc::new(store), embedder)?)
}

fn build_classifier(cli: &Cli, config: &AppConfig) -> Result<ReviewClassifier, AppError> {
    let client = Arc::new(OllamaClient::new(config.inference.clone())?);
    let embedder: Arc<dyn EmbeddingBackend> = if config.offline_embeddings {
        Arc::new(HashingEmbedder::default())
    } else {
        client.clone()
    };

    let retriever = build_retriever(cli, config, embedder)?;
    let k = config.classifier.effective_k(retriever.store().len());
    let backend: Arc<dyn InferenceBackend> = client;
    Ok(ReviewClassifier::new(load_policies(cli)?, retriever, backend, k)?)
}

fn read_text_arg(value: &str) -> Result<String, AppError> {
    if value != "-" {
        return Ok(value.to_string());
    }
    let mut buffer = String::new();
    io::stdin()
        .read_to_string(&mut buffer)
        .map_err(io_context("Cannot read stdin"))?;
    Ok(buffer.trim_end().to_string())
}

// ============ Classify ============

fn classify_review(
    classifier: &ReviewClassifier,
    input: ReviewInput,
    format: &OutputFormat,
) -> Result<i32, AppError> {
    let result = classifier.classify(&input)?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Compact => {
            println!(
                "{} {}",
                result.decision().as_str().to_uppercase(),
                violation_text(&result)
            );
        }
        OutputFormat::Text => print_result(classifier.policies(), &result),
    }

    Ok(match result.decision() {
        Decision::Valid => 0,
        Decision::Flagged => 1,
    })
}

fn violation_text(result: &ClassificationResult) -> String {
    result
        .primary_violation()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "None".to_string())
}

fn print_result(policies: &PolicySet, result: &ClassificationResult) {
    println!("=== Review Classification ===\n");
    println!("Decision: {}", result.decision());
    match result.primary_violation().and_then(|v| v.policy()) {
        Some(id) => println!("Primary Violation: {} ({})", policies.display_name(id), id),
        None => println!("Primary Violation: {}", violation_text(result)),
    }
    println!("Explanation: {}", result.explanation());

    if result.is_low_confidence() || !result.metadata().notes.is_empty() {
        println!();
        if result.is_low_confidence() {
            println!("Confidence: low");
        }
        for note in &result.metadata().notes {
            println!("Note: {:?}", note);
        }
    }
}

// ============ Batch ============

struct BatchOptions<'a> {
    output: Option<&'a Path>,
    with_row_id: bool,
    audit_log: Option<&'a Path>,
    format: &'a OutputFormat,
}

fn run_batch(
    classifier: &ReviewClassifier,
    config: &AppConfig,
    table: review_contract::BatchTable,
    options: BatchOptions<'_>,
) -> Result<i32, AppError> {
    let sink: Box<dyn Write> = match options.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).map_err(io_context(format!("Cannot create {}", path.display())))?,
        )),
        None => Box::new(io::stdout().lock()),
    };
    let mut writer = BatchCsvWriter::new(sink, &table.headers, options.with_row_id)?;

    let mut audit = match options.audit_log {
        Some(path) => Some(BufWriter::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(io_context(format!("Cannot open {}", path.display())))?,
        )),
        None => None,
    };

    info!(rows = table.rows.len(), model = classifier.model(), "Starting batch");
    let runner = BatchRunner::new(classifier, config.classifier.retry.clone());
    let mut summary = BatchSummary::default();
    let mut aborted = None;

    for (row, step) in table.rows.iter().zip(runner.run(table.inputs())) {
        match step {
            Ok(item) => {
                writer.write_item(&row.record, &item)?;
                if let Some(log) = audit.as_mut() {
                    let line = AuditEntry::from_item(&item, classifier.model()).to_json()?;
                    writeln!(log, "{}", line).map_err(io_context("Cannot write audit log"))?;
                }
                summary.record(&item);
            }
            Err(abort) => aborted = Some(abort),
        }
    }

    writer.finish()?.flush().map_err(io_context("Cannot write output"))?;
    if let Some(mut log) = audit {
        log.flush().map_err(io_context("Cannot write audit log"))?;
    }

    // With the CSV on stdout, the summary goes to stderr.
    let mut report: Box<dyn Write> = if options.output.is_some() {
        Box::new(io::stdout())
    } else {
        Box::new(io::stderr())
    };
    print_batch_summary(&mut report, &summary, table.rows.len(), options.format)?;

    if let Some(abort) = aborted {
        eprintln!("Batch aborted: {}", abort);
        eprintln!("Is the model server running at {}?", config.inference.base_url);
        return Ok(3);
    }
    if summary.failed > 0 {
        warn!(failed = summary.failed, "Some rows could not be classified");
        return Ok(2);
    }
    Ok(0)
}

fn print_batch_summary(
    out: &mut dyn Write,
    summary: &BatchSummary,
    rows: usize,
    format: &OutputFormat,
) -> Result<(), AppError> {
    let write_err = io_context("Cannot write summary");
    match format {
        OutputFormat::Json => {
            writeln!(out, "{}", serde_json::to_string_pretty(summary)?).map_err(write_err)?;
        }
        OutputFormat::Compact => {
            writeln!(
                out,
                "processed={}/{} valid={} flagged={} failed={} low_confidence={}",
                summary.total, rows, summary.valid, summary.flagged, summary.failed, summary.low_confidence
            )
            .map_err(write_err)?;
        }
        OutputFormat::Text => {
            let text = format!(
                "=== Batch Summary ===\n\nRows processed: {}/{}\nValid: {}\nFlagged: {} ({} unspecified)\nFailed: {}\nLow confidence: {}",
                summary.total,
                rows,
                summary.valid,
                summary.flagged,
                summary.unspecified,
                summary.failed,
                summary.low_confidence
            );
            writeln!(out, "{}", text).map_err(write_err)?;
        }
    }
    Ok(())
}

// ============ Score ============

fn print_score(report: &ScoreReport, format: &OutputFormat) -> Result<(), AppError> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Compact => {
            let pct = |v: Option<f64>| v.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "n/a".to_string());
            println!(
                "rows={} decision={} violation={} mismatches={} unmatched={}",
                report.total_rows,
                pct(report.decision_accuracy),
                pct(report.violation_accuracy),
                report.mismatches.len(),
                report.unmatched.len()
            );
        }
        OutputFormat::Text => {
            println!("=== Results ===\n");
            print!("{}", report.summary_text());
            if !report.unmatched.is_empty() {
                println!("\nUNMATCHED ({}):", report.unmatched.len());
                for row in &report.unmatched {
                    println!("  {} - {:?}", row.row_id, row.reason);
                }
            }
        }
    }
    Ok(())
}

// ============ Retrieve / Policy ============

fn show_retrieved(
    retriever: &ExampleRetriever,
    review: &str,
    k: usize,
    format: &OutputFormat,
) -> Result<(), AppError> {
    let results = retriever.retrieve(review, k)?;

    match format {
        OutputFormat::Json => {
            let rows: Vec<_> = results
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "similarity": r.similarity,
                        "location": r.example.location,
                        "review_text": r.example.review_text,
                        "decision": r.example.decision,
                        "violation": r.example.violation,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Compact => {
            for r in &results {
                println!(
                    "{:.4} {} {}",
                    r.similarity,
                    r.example.decision,
                    r.example.violation.map(|v| v.as_str()).unwrap_or("None")
                );
            }
        }
        OutputFormat::Text => {
            println!("=== Grounding Examples (k={}) ===\n", k);
            for (i, r) in results.iter().enumerate() {
                println!("{}. [{:.3}] {} - {}", i + 1, r.similarity, r.example.location, r.example.review_text);
                println!(
                    "   {} / {}",
                    r.example.decision,
                    r.example.violation.map(|v| v.as_str()).unwrap_or("None")
                );
            }
        }
    }
    Ok(())
}

fn show_policy(policies: &PolicySet, format: &OutputFormat) -> Result<(), AppError> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(policies)?),
        OutputFormat::Compact => {
            let ids: Vec<_> = policies.policies.iter().map(|p| p.id.as_str()).collect();
            println!("policies={} {}", ids.len(), ids.join(","));
        }
        OutputFormat::Text => {
            println!("=== {} ===\n", policies.name);
            for policy in &policies.policies {
                println!("{} ({})", policy.name, policy.id);
                println!("  {}", policy.description);
                if !policy.aliases.is_empty() {
                    println!("  aliases: {}", policy.aliases.join(", "));
                }
                println!();
            }
        }
    }
    Ok(())
}

fn generate_completions(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    clap_complete::generate(shell, &mut Cli::command(), "revgate", &mut io::stdout());
}

fn generate_man_page() -> Result<i32, AppError> {
    use clap::CommandFactory;
    let man = clap_mangen::Man::new(Cli::command());
    let mut buffer: Vec<u8> = Vec::new();
    man.render(&mut buffer)
        .map_err(io_context("Failed to generate man page"))?;
    io::stdout()
        .write_all(&buffer)
        .map_err(io_context("Cannot write man page"))?;
    Ok(0)
}
