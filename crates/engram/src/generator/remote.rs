//! Remote generator using an OpenAI-compatible chat completion endpoint

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::completion::{ChatMessage, CompletionClient, CompletionError, CompletionParams};
use crate::config::GeneratorConfig;
use crate::generator::{Generator, GeneratorError};

const PARAMS: CompletionParams = CompletionParams {
    temperature: 0.7,
    max_tokens: 1024,
};

impl From<CompletionError> for GeneratorError {
    fn from(e: CompletionError) -> Self {
        match e {
            CompletionError::MissingApiKey(_) | CompletionError::MissingUrl => {
                GeneratorError::ConfigError(e.to_string())
            }
            CompletionError::Request(msg) => GeneratorError::Unavailable(msg),
            other => GeneratorError::ApiError(other.to_string()),
        }
    }
}

/// Generator backed by a remote language model
#[derive(Debug)]
pub struct RemoteGenerator {
    client: CompletionClient,
    timeout: Duration,
}

impl RemoteGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self, GeneratorError> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let client =
            CompletionClient::new(&config.api_url, &config.api_key_env, &config.model, timeout)?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Generator for RemoteGenerator {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, GeneratorError> {
        debug!(model = self.client.model(), messages = messages.len(), "Generating response");
        // The HTTP client has its own timeout; this bounds the retries as well
        match tokio::time::timeout(self.timeout * 2, self.client.complete(messages, PARAMS)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(GeneratorError::Timeout(self.timeout.as_secs() * 2)),
        }
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}
