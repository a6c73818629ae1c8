//! Error types for Engram

use thiserror::Error;

use crate::codec::CodecError;
use crate::generator::GeneratorError;
use crate::grader::GraderError;
use crate::session::SessionIdError;

/// Main error type for Engram operations
#[derive(Error, Debug)]
pub enum EngramError {
    /// Payload encode/decode failures
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// External grader failures that were not absorbed by the adapter
    #[error("Grader error: {0}")]
    Grader(#[from] GraderError),

    /// Text generation failures (never recovered locally)
    #[error("Generator error: {0}")]
    Generator(#[from] GeneratorError),

    /// Durable store errors (file system, serialization of records, etc.)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Session is not registered with the manager
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Operation not allowed while the session is registered
    #[error("Session is active: {0}")]
    SessionActive(String),

    /// Session identifier failed validation
    #[error("Invalid session: {0}")]
    InvalidSession(#[from] SessionIdError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EngramError {
    fn from(e: serde_json::Error) -> Self {
        EngramError::Serialization(e.to_string())
    }
}

/// Result type alias for Engram operations
pub type Result<T> = std::result::Result<T, EngramError>;
