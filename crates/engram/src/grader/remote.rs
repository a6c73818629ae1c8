//! Remote grader using an OpenAI-compatible chat completion endpoint

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::completion::{ChatMessage, CompletionClient, CompletionError, CompletionParams};
use crate::config::{MAX_GRADE, RemoteApiConfig};
use crate::grader::{Grader, GraderError};

const GRADING_PROMPT: &str = "Rate how useful the following assistant response would be to remember \
for later in the conversation, on a scale from 0 (useless) to 10 (essential). \
Reply with a single integer only.";

const PARAMS: CompletionParams = CompletionParams {
    temperature: 0.0,
    max_tokens: 8,
};

impl From<CompletionError> for GraderError {
    fn from(e: CompletionError) -> Self {
        match e {
            CompletionError::MissingApiKey(_) | CompletionError::MissingUrl => {
                GraderError::ConfigError(e.to_string())
            }
            CompletionError::Parse(msg) => GraderError::ParseError(msg),
            CompletionError::Request(msg) => GraderError::Unavailable(msg),
            other => GraderError::ApiError(other.to_string()),
        }
    }
}

/// Grader backed by a remote language model
#[derive(Debug)]
pub struct RemoteGrader {
    client: CompletionClient,
}

impl RemoteGrader {
    /// Reads the API key from `config.api_key_env`; fails if it is unset.
    pub fn new(config: &RemoteApiConfig, timeout_secs: u64) -> Result<Self, GraderError> {
        let client = CompletionClient::new(
            &config.api_url,
            &config.api_key_env,
            &config.model,
            Duration::from_secs(timeout_secs.max(1)),
        )?;
        Ok(Self { client })
    }
}

/// First integer in the reply, clamped to the grading scale
fn parse_score(reply: &str) -> Result<u8, GraderError> {
    let digits: String = reply
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();

    if digits.is_empty() {
        return Err(GraderError::ParseError(format!(
            "No score in grader reply: {reply:?}"
        )));
    }

    // Overlong digit runs saturate rather than fail
    let value = digits.parse::<u64>().unwrap_or(u64::MAX);
    Ok(value.min(MAX_GRADE as u64) as u8)
}

#[async_trait]
impl Grader for RemoteGrader {
    async fn score(&self, text: &str, context: &str) -> Result<u8, GraderError> {
        let mut user = String::new();
        if !context.is_empty() {
            user.push_str("User prompt:\n");
            user.push_str(context);
            user.push_str("\n\n");
        }
        user.push_str("Assistant response:\n");
        user.push_str(text);

        let messages = [ChatMessage::system(GRADING_PROMPT), ChatMessage::user(user)];
        let reply = self.client.complete(&messages, PARAMS).await?;
        debug!("Grader reply: {}", reply);
        parse_score(&reply)
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(api_url: String, key_env: &str) -> RemoteApiConfig {
        RemoteApiConfig {
            api_url,
            api_key_env: key_env.to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }

    async fn grader_replying(content: &str, key_env: &str) -> (MockServer, RemoteGrader) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": content}}]
            })))
            .mount(&server)
            .await;

        unsafe { env::set_var(key_env, "test-key") };
        let grader = RemoteGrader::new(&config_for(server.uri(), key_env), 5).unwrap();
        (server, grader)
    }

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("8").unwrap(), 8);
        assert_eq!(parse_score("Score: 6/10").unwrap(), 6);
        assert_eq!(parse_score("  10\n").unwrap(), 10);
        assert_eq!(parse_score("15").unwrap(), 10);
        assert!(parse_score("very useful").is_err());
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        unsafe { env::remove_var("ENGRAM_GRADER_MISSING_KEY") };
        let err = RemoteGrader::new(
            &config_for("https://api.example.com/v1".to_string(), "ENGRAM_GRADER_MISSING_KEY"),
            5,
        )
        .unwrap_err();
        assert!(matches!(err, GraderError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_remote_score() {
        let (_server, grader) = grader_replying("7", "ENGRAM_GRADER_OK_KEY").await;
        assert_eq!(grader.score("some response", "a prompt").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_remote_unparseable_reply() {
        let (_server, grader) = grader_replying("I cannot rate this", "ENGRAM_GRADER_BAD_KEY").await;
        let err = grader.score("some response", "").await.unwrap_err();
        assert!(matches!(err, GraderError::ParseError(_)));
    }

    #[tokio::test]
    async fn test_remote_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        unsafe { env::set_var("ENGRAM_GRADER_503_KEY", "test-key") };
        let grader =
            RemoteGrader::new(&config_for(server.uri(), "ENGRAM_GRADER_503_KEY"), 5).unwrap();
        let err = grader.score("some response", "").await.unwrap_err();
        assert!(matches!(err, GraderError::ApiError(_)));
    }
}
