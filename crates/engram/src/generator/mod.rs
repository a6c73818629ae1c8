//! Text generation collaborator
//!
//! The generator produces the assistant response for a turn. Its output is
//! the only input to the write path. Failures are never recovered locally.

pub mod remote;

use async_trait::async_trait;

use crate::completion::ChatMessage;

pub use remote::RemoteGenerator;

/// Generator-specific errors
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("Generator unavailable: {0}")]
    Unavailable(String),
    #[error("Generator timed out after {0}s")]
    Timeout(u64),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Produces a response for a prompt
#[async_trait]
pub trait Generator: Send + Sync {
    /// `messages` is the full prompt: system context first, then the
    /// conversation so far.
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, GeneratorError>;

    /// Provider name for logging
    fn name(&self) -> &'static str;
}
