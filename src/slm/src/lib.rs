// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (C) 2025 Jonathan D.A. Jewell

//! SLM Client - language model and embedding backends
//!
//! The classifier only ever talks to two narrow contracts:
//!
//! - [`InferenceBackend`]: prompt text in, raw model text out
//! - [`EmbeddingBackend`]: text in, fixed-dimension vector out
//!
//! [`OllamaClient`] implements both against a locally served model.
//! [`HashingEmbedder`] is a deterministic offline embedder for fixtures and
//! machines without an embedding model.
//!
//! Calls are synchronous and block the calling thread for the duration of
//! generation. The client never retries; retry policy belongs to the caller.

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

// ============ Configuration ============

/// Connection and generation settings for the local model server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferenceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Generation model identifier
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Per-request deadline in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub temperature: f32,

    /// Fixed sampling seed so repeated runs stay comparable
    #[serde(default = "default_seed")]
    pub seed: Option<u64>,

    /// Upper bound on generated tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3.2".to_string()
}

fn default_embedding_model() -> String {
    "mxbai-embed-large".to_string()
}

const fn default_timeout_ms() -> u64 {
    120_000
}

const fn default_seed() -> Option<u64> {
    Some(42)
}

const fn default_max_tokens() -> u32 {
    256
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            timeout_ms: default_timeout_ms(),
            temperature: 0.0,
            seed: default_seed(),
            max_tokens: default_max_tokens(),
        }
    }
}

// ============ Backend Contracts ============

/// Text generation backend
pub trait InferenceBackend: Send + Sync {
    /// Send a prompt and return the raw model text
    fn infer(&self, prompt: &str) -> Result<String, BackendError>;

    /// Model identifier used for generation
    fn model(&self) -> &str;
}

/// Text embedding backend
pub trait EmbeddingBackend: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn model(&self) -> &str;
}

// ============ Errors ============

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Model not available: {0}")]
    ModelNotAvailable(String),
    #[error("Backend timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("Backend returned an empty response")]
    EmptyResponse,
    #[error("Server error: {0}")]
    ServerError(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// The backend cannot serve any request; continuing a batch is pointless
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_) | BackendError::ModelNotAvailable(_)
        )
    }

    /// Worth another attempt under a retry budget
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Timeout { .. })
    }
}

// ============ Ollama Client ============

/// Blocking client for an Ollama-compatible model server
#[derive(Debug)]
pub struct OllamaClient {
    client: Client,
    config: InferenceConfig,
}

impl OllamaClient {
    pub fn new(config: InferenceConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        info!(
            base_url = %config.base_url,
            model = %config.model,
            embedding_model = %config.embedding_model,
            "Initialized Ollama client"
        );

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    /// Generate a completion for a prompt
    #[instrument(skip(self, prompt), fields(model = %self.config.model, prompt_len = prompt.len()))]
    pub fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.config.temperature,
                seed: self.config.seed,
                num_predict: self.config.max_tokens,
            },
        };

        debug!("Sending generate request");
        let response = self
            .client
            .post(self.url("generate"))
            .json(&request)
            .send()
            .map_err(|e| self.send_error(e))?;
        let response = check_status(response)?;

        let body: GenerateResponse = response.json().map_err(|e| self.read_error(e))?;
        if body.response.trim().is_empty() {
            warn!("Model returned no content");
            return Err(BackendError::EmptyResponse);
        }

        debug!(response_len = body.response.len(), "Received completion");
        Ok(body.response)
    }

    /// Embed one text with the configured embedding model
    #[instrument(skip(self, text), fields(model = %self.config.embedding_model, text_len = text.len()))]
    pub fn embed_text(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let texts = [text.to_string()];
        let mut embeddings = self.embed_texts(&texts)?;
        embeddings
            .pop()
            .ok_or_else(|| BackendError::InvalidResponse("No embedding in response".to_string()))
    }

    /// Embed several texts in one request, preserving order
    #[instrument(skip(self, texts), fields(model = %self.config.embedding_model, batch_size = texts.len()))]
    pub fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbedRequest {
            model: &self.config.embedding_model,
            input: texts,
        };

        let response = self
            .client
            .post(self.url("embed"))
            .json(&request)
            .send()
            .map_err(|e| self.send_error(e))?;
        let response = check_status(response)?;

        let body: EmbedResponse = response.json().map_err(|e| self.read_error(e))?;
        if body.embeddings.len() != texts.len() {
            return Err(BackendError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                body.embeddings.len()
            )));
        }

        debug!(count = body.embeddings.len(), "Received embeddings");
        Ok(body.embeddings)
    }

    fn send_error(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            warn!(timeout_ms = self.config.timeout_ms, "Request to model server timed out");
            BackendError::Timeout {
                timeout_ms: self.config.timeout_ms,
            }
        } else if err.is_connect() {
            warn!(error = %err, base_url = %self.config.base_url, "Model server unreachable");
            BackendError::Unavailable(err.to_string())
        } else {
            BackendError::ServerError(err.to_string())
        }
    }

    fn read_error(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout {
                timeout_ms: self.config.timeout_ms,
            }
        } else {
            BackendError::InvalidResponse(err.to_string())
        }
    }
}

fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().unwrap_or_default();
    warn!(status = %status, error = %body, "Model server request failed");
    if status == StatusCode::NOT_FOUND {
        Err(BackendError::ModelNotAvailable(body))
    } else {
        Err(BackendError::ServerError(format!("{status}: {body}")))
    }
}

impl InferenceBackend for OllamaClient {
    fn infer(&self, prompt: &str) -> Result<String, BackendError> {
        self.generate(prompt)
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

impl EmbeddingBackend for OllamaClient {
    fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        self.embed_text(text)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        self.embed_texts(texts)
    }

    fn model(&self) -> &str {
        &self.config.embedding_model
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

// ============ Hashing Embedder ============

/// Deterministic bag-of-words embedder using signed feature hashing
///
/// Unigrams and adjacent bigrams are hashed (FNV-1a) into a fixed number of
/// buckets and the result is L2-normalized. Identical text always yields an
/// identical vector, across runs and platforms.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSIONS: usize = 512;

    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn tokens(text: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        for raw in text.split_whitespace() {
            let lowered = raw.to_lowercase();
            if lowered.starts_with("http") || lowered.starts_with("www.") || lowered.contains(".com") {
                tokens.push("<link>".to_string());
            }
            tokens.extend(
                lowered
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                    .map(str::to_string),
            );
        }
        tokens
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let tokens = Self::tokens(text);
        let bigrams = tokens.windows(2).map(|w| format!("{} {}", w[0], w[1]));

        for feature in tokens.iter().cloned().chain(bigrams) {
            let hash = fnv1a(feature.as_bytes());
            let index = (hash % self.dimensions as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSIONS)
    }
}

impl EmbeddingBackend for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        Ok(self.vectorize(text))
    }

    fn model(&self) -> &str {
        "hashing-bow"
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_default_config() {
        let config = InferenceConfig::default();
        assert_eq!(config.base_url, "http://localhost:11434");
        assert_eq!(config.model, "llama3.2");
        assert_eq!(config.timeout_ms, 120_000);
        assert_eq!(config.seed, Some(42));
    }

    #[test]
    fn test_config_fills_missing_fields() {
        let config: InferenceConfig = serde_json::from_str(r#"{"model": "qwen2.5"}"#).unwrap();
        assert_eq!(config.model, "qwen2.5");
        assert_eq!(config.embedding_model, "mxbai-embed-large");
        assert_eq!(config.max_tokens, 256);
    }

    #[test]
    fn test_error_classification() {
        assert!(BackendError::Unavailable("refused".into()).is_fatal());
        assert!(BackendError::ModelNotAvailable("llama".into()).is_fatal());
        assert!(BackendError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(!BackendError::Timeout { timeout_ms: 10 }.is_fatal());
        assert!(!BackendError::EmptyResponse.is_retryable());
        assert!(!BackendError::EmptyResponse.is_fatal());
    }

    #[test]
    fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed("Great pancakes and friendly staff").unwrap();
        let b = embedder.embed("Great pancakes and friendly staff").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), HashingEmbedder::DEFAULT_DIMENSIONS);
    }

    #[test]
    fn test_hashing_embedder_is_normalized() {
        let embedder = HashingEmbedder::new(64);
        let v = embedder.embed("one two three four").unwrap();
        assert!((dot(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_embedder_empty_text() {
        let embedder = HashingEmbedder::new(16);
        let v = embedder.embed("   ").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_hashing_embedder_similarity_ordering() {
        let embedder = HashingEmbedder::default();
        let query = embedder.embed("discount code at www.deals.com").unwrap();
        let ad = embedder.embed("use this discount code at www.promo.com today").unwrap();
        let visit = embedder.embed("we had dinner with the family on friday").unwrap();
        assert!(dot(&query, &ad) > dot(&query, &visit));
    }

    #[test]
    fn test_fnv1a_known_value() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }
}
