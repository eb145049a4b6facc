// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (C) 2025 Jonathan D.A. Jewell

//! Example Retrieval - grounding examples for the classifier prompt
//!
//! The [`ExampleStore`] embeds the labeled corpus once at startup and is
//! read-only afterwards, so it can be shared freely behind an `Arc`. The
//! [`ExampleRetriever`] embeds a candidate review and returns the `k` most
//! similar examples by cosine similarity. Ties keep insertion order, which
//! makes retrieval reproducible for identical inputs.

use review_policy::{Decision, ExampleRecord, PolicyError, PolicyId};
use serde::{Deserialize, Serialize};
use slm_client::{BackendError, EmbeddingBackend};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

// ============ Core Types ============

/// A labeled review together with its embedding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabeledExample {
    pub review_text: String,
    pub location: String,
    pub decision: Decision,
    pub violation: Option<PolicyId>,
    pub rationale: String,
    pub embedding: Vec<f32>,
}

/// A retrieved example and how close it was to the query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredExample<'a> {
    pub example: &'a LabeledExample,
    pub similarity: f32,
}

// ============ Errors ============

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("k must be between 1 and {size}, got {k}")]
    InvalidK { k: usize, size: usize },
    #[error("Example store is empty")]
    EmptyStore,
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Embedder '{actual}' does not match store embedder '{expected}'")]
    EmbedderMismatch { expected: String, actual: String },
    #[error("Embedding error: {0}")]
    Embedding(#[from] BackendError),
    #[error("Invalid example: {0}")]
    InvalidExample(#[from] PolicyError),
}

impl RetrievalError {
    /// True when the embedding backend itself is gone
    pub fn is_fatal(&self) -> bool {
        matches!(self, RetrievalError::Embedding(e) if e.is_fatal())
    }
}

// ============ Example Store ============

#[derive(Debug)]
pub struct ExampleStore {
    examples: Vec<LabeledExample>,
    dimensions: usize,
    embedding_model: String,
}

impl ExampleStore {
    /// Embed and index the corpus. Insertion order is preserved.
    pub fn build(
        records: Vec<ExampleRecord>,
        embedder: &dyn EmbeddingBackend,
    ) -> Result<Self, RetrievalError> {
        if records.is_empty() {
            return Err(RetrievalError::EmptyStore);
        }
        for record in &records {
            record.validate()?;
        }

        let texts: Vec<String> = records.iter().map(|r| r.review_text.clone()).collect();
        let embeddings = embedder.embed_batch(&texts)?;
        if embeddings.len() != records.len() {
            return Err(RetrievalError::Embedding(BackendError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                records.len(),
                embeddings.len()
            ))));
        }

        let dimensions = embeddings.first().map(Vec::len).unwrap_or_default();
        if let Some(bad) = embeddings.iter().find(|e| e.len() != dimensions || e.is_empty()) {
            return Err(RetrievalError::DimensionMismatch {
                expected: dimensions,
                actual: bad.len(),
            });
        }

        let examples: Vec<LabeledExample> = records
            .into_iter()
            .zip(embeddings)
            .map(|(record, embedding)| LabeledExample {
                review_text: record.review_text,
                location: record.location,
                decision: record.decision,
                violation: record.violation,
                rationale: record.rationale,
                embedding,
            })
            .collect();

        info!(
            examples = examples.len(),
            dimensions,
            model = embedder.model(),
            "Built example store"
        );

        Ok(Self {
            examples,
            dimensions,
            embedding_model: embedder.model().to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    pub fn examples(&self) -> &[LabeledExample] {
        &self.examples
    }

    /// Rank every example against an already-embedded query and keep the top `k`
    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredExample<'_>>, RetrievalError> {
        if k == 0 || k > self.examples.len() {
            return Err(RetrievalError::InvalidK {
                k,
                size: self.examples.len(),
            });
        }
        if query.len() != self.dimensions {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }

        let mut scored: Vec<ScoredExample<'_>> = self
            .examples
            .iter()
            .map(|example| ScoredExample {
                example,
                similarity: cosine_similarity(query, &example.embedding),
            })
            .collect();

        // Stable sort: equal scores stay in insertion order.
        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(k);
        Ok(scored)
    }
}

/// Cosine similarity; 0.0 for empty, mismatched, or zero-length vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

// ============ Example Retriever ============

/// Looks up grounding examples for candidate reviews
pub struct ExampleRetriever {
    store: Arc<ExampleStore>,
    embedder: Arc<dyn EmbeddingBackend>,
}

impl ExampleRetriever {
    /// The embedder must be the one the store was built with
    pub fn new(
        store: Arc<ExampleStore>,
        embedder: Arc<dyn EmbeddingBackend>,
    ) -> Result<Self, RetrievalError> {
        if embedder.model() != store.embedding_model() {
            return Err(RetrievalError::EmbedderMismatch {
                expected: store.embedding_model().to_string(),
                actual: embedder.model().to_string(),
            });
        }
        Ok(Self { store, embedder })
    }

    pub fn store(&self) -> &ExampleStore {
        &self.store
    }

    /// The `k` examples most similar to `review_text`, most similar first
    pub fn retrieve(
        &self,
        review_text: &str,
        k: usize,
    ) -> Result<Vec<ScoredExample<'_>>, RetrievalError> {
        if k == 0 || k > self.store.len() {
            return Err(RetrievalError::InvalidK {
                k,
                size: self.store.len(),
            });
        }

        let query = self.embedder.embed(review_text)?;
        let results = self.store.nearest(&query, k)?;

        debug!(
            k,
            top_similarity = results.first().map(|r| r.similarity).unwrap_or_default(),
            "Retrieved grounding examples"
        );
        Ok(results)
    }
}

impl std::fmt::Debug for ExampleRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExampleRetriever")
            .field("examples", &self.store.len())
            .field("embedding_model", &self.store.embedding_model())
            .finish()
    }
}

// ============ Tests ============
