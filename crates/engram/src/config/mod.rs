use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{EngramError, Result};

/// Main configuration structure for Engram
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Filtering, capacity and reinjection policy
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Payload codec settings
    #[serde(default)]
    pub codec: CodecConfig,
    /// Grader adapter configuration
    #[serde(default)]
    pub grader: GraderConfig,
    /// Text generator (chat mode) configuration
    #[serde(default)]
    pub generator: GeneratorConfig,
    /// Durable store configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from an explicit path, or from the default
    /// locations, falling back to defaults when no file exists.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = match config_path {
            Some(path) => {
                tracing::info!("Loading config from: {}", path.display());
                Self::from_file(path)?
            }
            None => {
                let default_paths = [
                    dirs::home_dir().map(|h| h.join(".engram").join("config.toml")),
                    dirs::config_dir().map(|c| c.join("engram").join("config.toml")),
                    Some(PathBuf::from("config.toml")),
                ];

                match default_paths.iter().flatten().find(|p| p.exists()) {
                    Some(path) => {
                        tracing::info!("Loading config from: {}", path.display());
                        Self::from_file(path)?
                    }
                    None => {
                        tracing::info!("No config file found, using defaults");
                        Config::default()
                    }
                }
            }
        };

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngramError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| EngramError::Config(format!("Failed to parse config: {e}")))
    }

    /// Reject settings that would make the policy meaningless
    pub fn validate(&self) -> Result<()> {
        let m = &self.memory;
        if m.capacity_tokens == 0 {
            return Err(EngramError::Config(
                "memory.capacity_tokens must be greater than 0".to_string(),
            ));
        }
        if !(m.usage_threshold > 0.0 && m.usage_threshold <= 1.0) {
            return Err(EngramError::Config(format!(
                "memory.usage_threshold must be in (0, 1], got {}",
                m.usage_threshold
            )));
        }
        if m.reinject_batch_size == 0 {
            return Err(EngramError::Config(
                "memory.reinject_batch_size must be at least 1".to_string(),
            ));
        }
        if m.min_grade > MAX_GRADE {
            return Err(EngramError::Config(format!(
                "memory.min_grade must be at most {MAX_GRADE}, got {}",
                m.min_grade
            )));
        }
        if self.grader.default_score > MAX_GRADE {
            return Err(EngramError::Config(format!(
                "grader.default_score must be at most {MAX_GRADE}, got {}",
                self.grader.default_score
            )));
        }
        if self.codec.level > 9 {
            return Err(EngramError::Config(format!(
                "codec.level must be 0-9, got {}",
                self.codec.level
            )));
        }
        Ok(())
    }
}

/// Upper bound of the grading scale (inclusive)
pub const MAX_GRADE: u8 = 10;

/// Filtering, capacity and reinjection policy
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    /// Candidates with fewer tokens are rejected as too short
    #[serde(default = "default_min_length_tokens")]
    pub min_length_tokens: usize,
    /// Candidates graded lower are rejected as low grade
    #[serde(default = "default_min_grade")]
    pub min_grade: u8,
    /// Denominator of the usage ratio, in tokens
    #[serde(default = "default_capacity_tokens")]
    pub capacity_tokens: usize,
    /// Interval trigger period in turns (0 disables the interval trigger)
    #[serde(default = "default_interval_turns")]
    pub interval_turns: u64,
    /// Usage ratio above which reabsorption fires
    #[serde(default = "default_usage_threshold")]
    pub usage_threshold: f64,
    /// Number of oldest records reinjected per trigger
    #[serde(default = "default_reinject_batch_size")]
    pub reinject_batch_size: usize,
    /// Default number of memories returned by recall
    #[serde(default = "default_recall_top_k")]
    pub recall_top_k: usize,
    /// Recall results scoring below this are dropped
    #[serde(default = "default_min_recall_score")]
    pub min_recall_score: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            min_length_tokens: default_min_length_tokens(),
            min_grade: default_min_grade(),
            capacity_tokens: default_capacity_tokens(),
            interval_turns: default_interval_turns(),
            usage_threshold: default_usage_threshold(),
            reinject_batch_size: default_reinject_batch_size(),
            recall_top_k: default_recall_top_k(),
            min_recall_score: default_min_recall_score(),
        }
    }
}

fn default_min_length_tokens() -> usize {
    50
}

fn default_min_grade() -> u8 {
    6
}

fn default_capacity_tokens() -> usize {
    8000
}

fn default_interval_turns() -> u64 {
    3
}

fn default_usage_threshold() -> f64 {
    0.8
}

fn default_reinject_batch_size() -> usize {
    1
}

fn default_recall_top_k() -> usize {
    2
}

fn default_min_recall_score() -> f64 {
    0.3
}

/// Payload codec configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CodecConfig {
    /// Deflate compression level (0-9)
    #[serde(default = "default_codec_level")]
    pub level: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            level: default_codec_level(),
        }
    }
}

fn default_codec_level() -> u32 {
    6
}

/// Grader adapter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GraderConfig {
    /// Provider type: fixed, heuristic, or remote
    #[serde(default = "default_grader_provider")]
    pub provider: String,
    /// Fall back to `default_score` when the grader fails (false = reject)
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
    /// Neutral score used by the fixed grader and the fail-open fallback
    #[serde(default = "default_score")]
    pub default_score: u8,
    /// Upper bound on a single grader call
    #[serde(default = "default_grader_timeout_secs")]
    pub timeout_secs: u64,
    /// Remote API configuration
    #[serde(default)]
    pub remote: RemoteApiConfig,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            provider: default_grader_provider(),
            fail_open: default_fail_open(),
            default_score: default_score(),
            timeout_secs: default_grader_timeout_secs(),
            remote: RemoteApiConfig::default(),
        }
    }
}

fn default_grader_provider() -> String {
    "fixed".to_string()
}

fn default_fail_open() -> bool {
    true
}

fn default_score() -> u8 {
    7
}

fn default_grader_timeout_secs() -> u64 {
    10
}

/// OpenAI-compatible remote API settings
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteApiConfig {
    /// API base URL (`/chat/completions` is appended)
    #[serde(default)]
    pub api_url: String,
    /// Environment variable name for API key
    #[serde(default = "default_grader_api_key_env")]
    pub api_key_env: String,
    /// Model identifier for remote API
    #[serde(default = "default_remote_model")]
    pub model: String,
}

impl Default for RemoteApiConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key_env: default_grader_api_key_env(),
            model: default_remote_model(),
        }
    }
}

fn default_grader_api_key_env() -> String {
    "GRADER_API_KEY".to_string()
}

fn default_remote_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Text generator configuration for chat mode
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorConfig {
    /// API base URL (`/chat/completions` is appended)
    #[serde(default)]
    pub api_url: String,
    /// Environment variable name for API key
    #[serde(default = "default_generator_api_key_env")]
    pub api_key_env: String,
    /// Model identifier
    #[serde(default = "default_remote_model")]
    pub model: String,
    /// Request timeout in seconds
    #[serde(default = "default_generator_timeout_secs")]
    pub timeout_secs: u64,
    /// Standing instruction placed at the top of every prompt
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key_env: default_generator_api_key_env(),
            model: default_remote_model(),
            timeout_secs: default_generator_timeout_secs(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_generator_api_key_env() -> String {
    "GENERATOR_API_KEY".to_string()
}

fn default_generator_timeout_secs() -> u64 {
    60
}

fn default_system_prompt() -> String {
    "You are a helpful AI assistant. Keep responses concise but informative.".to_string()
}

/// Durable store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory for session data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".engram"))
        .unwrap_or_else(|| PathBuf::from(".engram"))
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:9898")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            event_buffer: default_event_buffer(),
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:9898".to_string()
}

fn default_event_buffer() -> usize {
    256
}

fn default_request_timeout_secs() -> u64 {
    30
}
