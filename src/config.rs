use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::RetryPolicy;

const ENV_MAX_RETRIES: &str = "TASKCUTER_MAX_RETRIES";
const ENV_RETRY_INTERVAL_MS: &str = "TASKCUTER_RETRY_INTERVAL_MS";
const ENV_FALLBACK_PATH: &str = "TASKCUTER_FALLBACK_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Processor settings.
///
/// ```toml
/// fallback_path = "state/embeddings.jsonl"
///
/// [retry]
/// max_retries = 5
/// interval_ms = 250
/// backoff = { type = "exponential", multiplier = 2.0 }
/// jitter = 0.1
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub retry: RetryPolicy,
    /// Where minimal embedding records go when the enhancement hook fails.
    pub fallback_path: Option<PathBuf>,
}

impl ProcessorConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut cfg: ProcessorConfig = toml::from_str(content)?;
        cfg.retry = cfg.retry.normalized();
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Applies `TASKCUTER_*` environment overrides on top of the loaded values.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let value = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = value(ENV_MAX_RETRIES) {
            self.retry.max_retries = v.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_MAX_RETRIES,
                value: v.clone(),
            })?;
        }
        if let Some(v) = value(ENV_RETRY_INTERVAL_MS) {
            self.retry.interval_ms = v.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_RETRY_INTERVAL_MS,
                value: v.clone(),
            })?;
        }
        if let Some(v) = value(ENV_FALLBACK_PATH) {
            self.fallback_path = Some(PathBuf::from(v));
        }

        self.retry = self.retry.normalized();
        Ok(self)
    }
}
