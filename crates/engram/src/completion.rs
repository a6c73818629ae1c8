//! OpenAI-compatible chat completion client
//!
//! Shared by the remote grader and the remote generator. Any endpoint that
//! speaks `POST {api_url}/chat/completions` works.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const MAX_RETRIES: u32 = 3;

/// Errors from the completion endpoint
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("API key env var '{0}' not set")]
    MissingApiKey(String),

    #[error("API URL is not configured")]
    MissingUrl,

    #[error("{0}")]
    Request(String),

    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to parse completion response: {0}")]
    Parse(String),

    #[error("Empty response")]
    Empty,
}

/// Role of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message of a chat completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Sampling parameters for one request
#[derive(Debug, Clone, Copy)]
pub struct CompletionParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// HTTP client bound to one endpoint, model and API key
#[derive(Debug)]
pub struct CompletionClient {
    client: Client,
    url: String,
    model: String,
    api_key: String,
}

impl CompletionClient {
    /// Build a client, reading the API key from `api_key_env`.
    pub fn new(
        api_url: &str,
        api_key_env: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, CompletionError> {
        if api_url.trim().is_empty() {
            return Err(CompletionError::MissingUrl);
        }
        let api_key = env::var(api_key_env)
            .map_err(|_| CompletionError::MissingApiKey(api_key_env.to_string()))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CompletionError::Request(e.to_string()))?;

        let url = format!("{}/chat/completions", api_url.trim_end_matches('/'));
        info!("Completion client initialized with model: {}, url: {}", model, url);

        Ok(Self {
            client,
            url,
            model: model.to_string(),
            api_key,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send the messages and return the first choice's content.
    ///
    /// Retries up to 3 times with backoff of 1s, 2s, 4s on 429 responses
    /// and transport errors.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        params: CompletionParams,
    ) -> Result<String, CompletionError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };
        debug!("Calling completion API at: {}", self.url);

        let mut last_error = None;
        let mut delay = Duration::from_secs(1);

        for attempt in 0..MAX_RETRIES {
            match self
                .client
                .post(&self.url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&request)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();

                    if status == 429 {
                        warn!(
                            "Rate limited on attempt {}/{}, waiting {:?}",
                            attempt + 1,
                            MAX_RETRIES,
                            delay
                        );
                        last_error = Some(format!("rate limited ({status})"));
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                        continue;
                    }

                    if !status.is_success() {
                        let body = response
                            .text()
                            .await
                            .unwrap_or_else(|_| "Unknown error".to_string());
                        return Err(CompletionError::Status {
                            status: status.as_u16(),
                            body,
                        });
                    }

                    let completion: ChatCompletionResponse = response
                        .json()
                        .await
                        .map_err(|e| CompletionError::Parse(e.to_string()))?;

                    return completion
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.message.content)
                        .filter(|c| !c.trim().is_empty())
                        .ok_or(CompletionError::Empty);
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    last_error = Some(err_msg.clone());
                    if attempt < MAX_RETRIES - 1 {
                        warn!(
                            "Request failed on attempt {}/{}, retrying: {}",
                            attempt + 1,
                            MAX_RETRIES,
                            err_msg
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(CompletionError::Request(format!(
            "Failed after {} retries: {}",
            MAX_RETRIES,
            last_error.unwrap_or_else(|| "Unknown error".to_string())
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PARAMS: CompletionParams = CompletionParams {
        temperature: 0.0,
        max_tokens: 16,
    };

    fn client_for(url: &str, env_name: &str) -> CompletionClient {
        unsafe { env::set_var(env_name, "test-key") };
        CompletionClient::new(url, env_name, "test-model", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_missing_api_key() {
        unsafe { env::remove_var("ENGRAM_COMPLETION_MISSING_KEY") };
        let err = CompletionClient::new(
            "https://api.example.com/v1",
            "ENGRAM_COMPLETION_MISSING_KEY",
            "m",
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(err.to_string().contains("ENGRAM_COMPLETION_MISSING_KEY"));
    }

    #[test]
    fn test_missing_url() {
        unsafe { env::set_var("ENGRAM_COMPLETION_URL_KEY", "k") };
        let err = CompletionClient::new("", "ENGRAM_COMPLETION_URL_KEY", "m", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, CompletionError::MissingUrl));
    }

    #[tokio::test]
    async fn test_complete_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "hello there"}}]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), "ENGRAM_COMPLETION_OK_KEY");
        let reply = client
            .complete(&[ChatMessage::user("hi")], PARAMS)
            .await
            .unwrap();
        assert_eq!(reply, "hello there");
    }

    #[tokio::test]
    async fn test_complete_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), "ENGRAM_COMPLETION_500_KEY");
        let err = client
            .complete(&[ChatMessage::user("hi")], PARAMS)
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_complete_empty_choices() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server.uri(), "ENGRAM_COMPLETION_EMPTY_KEY");
        let err = client
            .complete(&[ChatMessage::user("hi")], PARAMS)
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Empty));
    }

    #[test]
    fn test_message_serialization() {
        let json = serde_json::to_value(ChatMessage::system("be brief")).unwrap();
        assert_eq!(json["role"], "system");
        assert_eq!(json["content"], "be brief");
    }
}
