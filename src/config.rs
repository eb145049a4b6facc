// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (C) 2025 Jonathan D.A. Jewell

//! Application configuration for the `revgate` binary
//!
//! Precedence: command-line flags (and their environment fallbacks), then the
//! `--config` JSON file, then built-in defaults.

use review_contract::ClassifierConfig;
use serde::{Deserialize, Serialize};
use slm_client::InferenceConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Use the local hashing embedder instead of the embedding model
    #[serde(default)]
    pub offline_embeddings: bool,
}

/// Values given on the command line; `None` leaves the file/default value
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub embedding_model: Option<String>,
    pub timeout_ms: Option<u64>,
    pub k: Option<usize>,
    pub max_attempts: Option<u32>,
    pub offline_embeddings: bool,
}

impl AppConfig {
    /// Load from a JSON file, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    pub fn apply(mut self, overrides: Overrides) -> Self {
        if let Some(url) = overrides.base_url {
            self.inference.base_url = url;
        }
        if let Some(model) = overrides.model {
            self.inference.model = model;
        }
        if let Some(model) = overrides.embedding_model {
            self.inference.embedding_model = model;
        }
        if let Some(timeout_ms) = overrides.timeout_ms {
            self.inference.timeout_ms = timeout_ms;
        }
        if let Some(k) = overrides.k {
            self.classifier.k = k;
        }
        if let Some(max_attempts) = overrides.max_attempts {
            self.classifier.retry.max_attempts = max_attempts;
        }
        self.offline_embeddings |= overrides.offline_embeddings;
        self
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"inference": {"model": "qwen2.5"}, "classifier": {"k": 5}}"#)
                .unwrap();
        assert_eq!(config.inference.model, "qwen2.5");
        assert_eq!(config.inference.base_url, "http://localhost:11434");
        assert_eq!(config.classifier.k, 5);
        assert_eq!(config.classifier.retry.max_attempts, 3);
        assert!(!config.offline_embeddings);
    }

    #[test]
    fn test_overrides_win() {
        let config = AppConfig::default().apply(Overrides {
            model: Some("mistral".into()),
            k: Some(2),
            max_attempts: Some(1),
            offline_embeddings: true,
            ..Overrides::default()
        });
        assert_eq!(config.inference.model, "mistral");
        assert_eq!(config.inference.embedding_model, "mxbai-embed-large");
        assert_eq!(config.classifier.k, 2);
        assert_eq!(config.classifier.retry.max_attempts, 1);
        assert!(config.offline_embeddings);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/revgate.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(AppConfig::load(None).is_ok());
    }
}
