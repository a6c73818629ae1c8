//! Session identifiers
//!
//! Every memory operation is scoped to exactly one session. Identifiers are
//! opaque to the manager but must be safe to use as directory names in the
//! durable store: alphanumeric with underscores and hyphens, max 128 chars.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Maximum length for session IDs
const MAX_SESSION_ID_LEN: usize = 128;

/// Errors that can occur during session ID validation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionIdError {
    /// Session ID is empty
    #[error("Session ID cannot be empty")]
    Empty,

    /// Session ID contains invalid characters
    #[error("Session ID contains invalid characters: allowed are a-z, A-Z, 0-9, _, -")]
    InvalidChars,

    /// Session ID exceeds maximum length
    #[error("Session ID exceeds maximum length of {MAX_SESSION_ID_LEN} characters")]
    TooLong,
}

/// A validated session ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random session ID
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }

    /// Get the session ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix used in human-facing output
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }

    fn validate(s: &str) -> Result<(), SessionIdError> {
        if s.is_empty() {
            return Err(SessionIdError::Empty);
        }

        if s.len() > MAX_SESSION_ID_LEN {
            return Err(SessionIdError::TooLong);
        }

        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(SessionIdError::InvalidChars);
        }

        Ok(())
    }
}

impl TryFrom<&str> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::validate(value)?;
        Ok(SessionId(value.to_string()))
    }
}

impl TryFrom<String> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::validate(&value)?;
        Ok(SessionId(value))
    }
}

impl std::str::FromStr for SessionId {
    type Err = SessionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SessionId::try_from(s)
    }
}

impl From<SessionId> for String {
    fn from(session_id: SessionId) -> Self {
        session_id.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_session_ids() {
        assert!(SessionId::try_from("project-abc").is_ok());
        assert!(SessionId::try_from("PROJECT_123").is_ok());
        assert!(SessionId::try_from("a").is_ok());
        assert!(SessionId::try_from("123").is_ok());
    }

    #[test]
    fn test_generated_ids_are_valid_and_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(SessionId::try_from(a.as_str()).is_ok());
    }

    #[test]
    fn test_empty_session_id() {
        let result = SessionId::try_from("");
        assert!(matches!(result, Err(SessionIdError::Empty)));
    }

    #[test]
    fn test_path_traversal_rejected() {
        let result = SessionId::try_from("../etc");
        assert!(matches!(result, Err(SessionIdError::InvalidChars)));

        let result = SessionId::try_from("a/b");
        assert!(matches!(result, Err(SessionIdError::InvalidChars)));
    }

    #[test]
    fn test_session_id_too_long() {
        let long_id = "a".repeat(129);
        let result = SessionId::try_from(long_id.as_str());
        assert!(matches!(result, Err(SessionIdError::TooLong)));

        let max_id = "a".repeat(128);
        assert!(SessionId::try_from(max_id.as_str()).is_ok());
    }

    #[test]
    fn test_short_prefix() {
        let id = SessionId::try_from("0123456789abcdef").unwrap();
        assert_eq!(id.short(), "01234567");

        let id = SessionId::try_from("abc").unwrap();
        assert_eq!(id.short(), "abc");
    }

    #[test]
    fn test_serde_validates() {
        let id: SessionId = serde_json::from_str("\"chat-1\"").unwrap();
        assert_eq!(id.as_str(), "chat-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"chat-1\"");

        let bad: Result<SessionId, _> = serde_json::from_str("\"has spaces\"");
        assert!(bad.is_err());
    }
}
