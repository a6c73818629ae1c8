//! Grader adapter
//!
//! Wraps an external [`Grader`] behind a stable interface. Short candidates
//! are rejected before the grader is called, every call runs under a timeout,
//! and grader failures fall back to a neutral score (fail-open) or reject the
//! candidate (fail-closed).

pub mod heuristic;
pub mod remote;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Config, GraderConfig, MAX_GRADE, MemoryConfig};

pub use heuristic::{FixedGrader, HeuristicGrader};
pub use remote::RemoteGrader;

/// Grader-specific errors
#[derive(Debug, thiserror::Error)]
pub enum GraderError {
    #[error("Grader unavailable: {0}")]
    Unavailable(String),
    #[error("Grader timed out after {0}s")]
    Timeout(u64),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Scoring backend (remote model, heuristic, fixed)
#[async_trait]
pub trait Grader: Send + Sync {
    /// Rate how useful `text` is as a future memory, 0-10.
    ///
    /// `context` is the prompt that produced the text, or empty.
    async fn score(&self, text: &str, context: &str) -> Result<u8, GraderError>;

    /// Provider name for logging
    fn name(&self) -> &'static str;
}

/// Outcome of [`GraderAdapter::grade`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum GradeVerdict {
    /// Rejected by the length pre-filter; the grader was not called
    TooShort { tokens: usize, min: usize },
    /// Score in `0..=10`. `fallback` is set when the grader failed and the
    /// default score was used instead.
    Graded { score: u8, fallback: bool },
    /// Grader failed and the adapter is fail-closed
    Unavailable { reason: String },
}

/// Length pre-filter plus failure isolation around a [`Grader`]
pub struct GraderAdapter {
    grader: Arc<dyn Grader>,
    min_length_tokens: usize,
    fail_open: bool,
    default_score: u8,
    timeout: Duration,
}

impl GraderAdapter {
    pub fn new(grader: Arc<dyn Grader>, memory: &MemoryConfig, config: &GraderConfig) -> Self {
        Self {
            grader,
            min_length_tokens: memory.min_length_tokens,
            fail_open: config.fail_open,
            default_score: config.default_score.min(MAX_GRADE),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    /// Override the per-call timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the configured provider and wrap it
    pub fn from_config(config: &Config) -> Result<Self, GraderError> {
        let grader: Arc<dyn Grader> = match config.grader.provider.as_str() {
            "fixed" => Arc::new(FixedGrader::new(config.grader.default_score)),
            "heuristic" => Arc::new(HeuristicGrader),
            "remote" => Arc::new(RemoteGrader::new(
                &config.grader.remote,
                config.grader.timeout_secs,
            )?),
            other => {
                return Err(GraderError::ConfigError(format!(
                    "Unknown grader provider '{other}' (expected fixed, heuristic or remote)"
                )));
            }
        };
        info!("Grader provider: {}", grader.name());
        Ok(Self::new(grader, &config.memory, &config.grader))
    }

    pub fn grader_name(&self) -> &'static str {
        self.grader.name()
    }

    pub fn min_length_tokens(&self) -> usize {
        self.min_length_tokens
    }

    /// Grade a candidate of `tokens` tokens.
    ///
    /// Candidates with exactly `min_length_tokens` tokens are graded; one
    /// fewer is `TooShort`.
    pub async fn grade(&self, text: &str, tokens: usize, context: &str) -> GradeVerdict {
        if tokens < self.min_length_tokens {
            debug!(tokens, min = self.min_length_tokens, "Candidate below length pre-filter");
            return GradeVerdict::TooShort {
                tokens,
                min: self.min_length_tokens,
            };
        }

        let result = match tokio::time::timeout(self.timeout, self.grader.score(text, context)).await
        {
            Ok(result) => result,
            Err(_) => Err(GraderError::Timeout(self.timeout.as_secs())),
        };

        match result {
            Ok(score) => GradeVerdict::Graded {
                score: score.min(MAX_GRADE),
                fallback: false,
            },
            Err(e) if self.fail_open => {
                warn!(
                    grader = self.grader.name(),
                    default_score = self.default_score,
                    "Grader failed, using default score: {e}"
                );
                GradeVerdict::Graded {
                    score: self.default_score,
                    fallback: true,
                }
            }
            Err(e) => {
                warn!(grader = self.grader.name(), "Grader failed, rejecting candidate: {e}");
                GradeVerdict::Unavailable {
                    reason: e.to_string(),
                }
            }
        }
    }
}

impl std::fmt::Debug for GraderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraderAdapter")
            .field("grader", &self.grader.name())
            .field("min_length_tokens", &self.min_length_tokens)
            .field("fail_open", &self.fail_open)
            .field("default_score", &self.default_score)
            .field("timeout", &self.timeout)
            .finish()
    }
}
