//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::agent::llm::GenerationConfig;
use crate::error::Error;
use crate::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend selection and credentials
    #[serde(default)]
    pub auth: AuthConfig,

    /// Flagship model used for every new session
    #[serde(default = "default_model")]
    pub model: String,

    /// Model switched to when the flagship runs out of quota
    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,

    /// Upper bound on automatic continuations per user prompt
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    #[serde(default)]
    pub system_instruction: Option<String>,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub loop_detection: LoopDetectionConfig,
}

/// Backend family
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    #[default]
    GeminiApiKey,
    VertexAi,
    #[serde(rename = "openai-compatible")]
    OpenAiCompatible,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::GeminiApiKey => "gemini-api-key",
            AuthType::VertexAi => "vertex-ai",
            AuthType::OpenAiCompatible => "openai-compatible",
        }
    }
}

/// Auth descriptor handed to the content generator factory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub auth_type: AuthType,

    /// API key, or the OAuth access token for Vertex AI
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    /// Google Cloud project (Vertex AI)
    #[serde(default)]
    pub project: Option<String>,

    /// Google Cloud region (Vertex AI)
    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub embedding_model: Option<String>,
}

/// When and how much history is summarized
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Fraction of the context window that triggers compression
    #[serde(default = "default_threshold_ratio")]
    pub threshold_ratio: f64,

    /// Trigger fraction checked right after tool results are appended
    #[serde(default = "default_threshold_ratio_after_tools")]
    pub threshold_ratio_after_tools: f64,

    /// Fraction of history (by size) kept verbatim after the summary
    #[serde(default = "default_preserve_fraction")]
    pub preserve_fraction: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold_ratio: default_threshold_ratio(),
            threshold_ratio_after_tools: default_threshold_ratio_after_tools(),
            preserve_fraction: default_preserve_fraction(),
        }
    }
}

/// Backoff policy for transient backend failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDetectionConfig {
    /// Identical tool calls within the window that count as a loop
    #[serde(default = "default_tool_call_threshold")]
    pub tool_call_threshold: usize,

    /// Number of recent tool calls remembered
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Consecutive identical text chunks that count as a loop
    #[serde(default = "default_content_chunk_threshold")]
    pub content_chunk_threshold: usize,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            tool_call_threshold: default_tool_call_threshold(),
            window_size: default_window_size(),
            content_chunk_threshold: default_content_chunk_threshold(),
        }
    }
}

fn default_model() -> String {
    "gemini-2.5-pro".to_string()
}

fn default_fallback_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_max_turns() -> usize {
    100
}

fn default_threshold_ratio() -> f64 {
    0.95
}

fn default_threshold_ratio_after_tools() -> f64 {
    0.85
}

fn default_preserve_fraction() -> f64 {
    0.3
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    5000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_tool_call_threshold() -> usize {
    5
}

fn default_window_size() -> usize {
    20
}

fn default_content_chunk_threshold() -> usize {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth: AuthConfig::default(),
            model: default_model(),
            fallback_model: default_fallback_model(),
            max_turns: default_max_turns(),
            system_instruction: None,
            generation: GenerationConfig::default(),
            compression: CompressionConfig::default(),
            retry: RetryConfig::default(),
            loop_detection: LoopDetectionConfig::default(),
        }
    }
}

impl Config {
    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup`. Empty values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        match self.auth.auth_type {
            AuthType::GeminiApiKey => {
                if let Some(key) = var("GEMINI_API_KEY") {
                    self.auth.api_key = Some(key);
                }
            }
            AuthType::OpenAiCompatible => {
                if let Some(key) = var("OPENAI_API_KEY") {
                    self.auth.api_key = Some(key);
                }
                if let Some(url) = var("OPENAI_BASE_URL") {
                    self.auth.base_url = Some(url);
                }
            }
            AuthType::VertexAi => {}
        }
        if let Some(project) = var("GOOGLE_CLOUD_PROJECT") {
            self.auth.project = Some(project);
        }
        if let Some(location) = var("GOOGLE_CLOUD_LOCATION") {
            self.auth.location = Some(location);
        }
        if let Some(model) = var("TERN_MODEL") {
            debug!(model = %model, "Model overridden from environment");
            self.model = model;
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::Config("model must not be empty".to_string()));
        }
        if self.max_turns == 0 {
            return Err(Error::Config("max_turns must be at least 1".to_string()));
        }

        let c = &self.compression;
        for (name, ratio) in [
            ("compression.threshold_ratio", c.threshold_ratio),
            ("compression.threshold_ratio_after_tools", c.threshold_ratio_after_tools),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(Error::Config(format!("{name} must be in (0, 1], got {ratio}")));
            }
        }
        if !(c.preserve_fraction > 0.0 && c.preserve_fraction < 1.0) {
            return Err(Error::Config(format!(
                "compression.preserve_fraction must be in (0, 1), got {}",
                c.preserve_fraction
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Config(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }

        let l = &self.loop_detection;
        if l.tool_call_threshold < 2 || l.content_chunk_threshold < 2 {
            return Err(Error::Config("loop detection thresholds must be at least 2".to_string()));
        }
        if l.window_size < l.tool_call_threshold {
            return Err(Error::Config(
                "loop_detection.window_size must be at least tool_call_threshold".to_string(),
            ));
        }
        Ok(())
    }
}

/// Get the config directory path
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tern")
}

/// Get the config file path
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load the config file, apply environment overrides and validate.
pub fn load() -> Result<Config> {
    let mut config = load_from(&config_path())?;
    config.apply_env();
    config.validate()?;
    Ok(config)
}

/// Read configuration from `path`; a missing file yields the defaults.
pub fn load_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        debug!(path = ?path, "No config file, using defaults");
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}

/// Save configuration to the default location
pub fn save(config: &Config) -> Result<()> {
    save_to(config, &config_path())
}

/// Save configuration to `path`
pub fn save_to(config: &Config, path: &Path) -> Result<()> {
    // Create parent directory
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.model, "gemini-2.5-pro");
        assert_eq!(config.fallback_model, "gemini-2.5-flash");
        assert_eq!(config.max_turns, 100);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "auth": { "auth_type": "openai-compatible", "base_url": "http://localhost:11434/v1" },
                 "model": "qwen3-coder", "compression": { "preserve_fraction": 0.5 } }"#,
        )
        .unwrap();
        assert_eq!(config.auth.auth_type, AuthType::OpenAiCompatible);
        assert_eq!(config.model, "qwen3-coder");
        assert_eq!(config.compression.preserve_fraction, 0.5);
        assert_eq!(config.compression.threshold_ratio, 0.95);
        assert_eq!(config.loop_detection.tool_call_threshold, 5);
    }

    #[test]
    fn test_env_overrides_follow_auth_type() {
        let env: HashMap<&str, &str> = [
            ("GEMINI_API_KEY", "g-key"),
            ("OPENAI_API_KEY", "o-key"),
            ("OPENAI_BASE_URL", "http://proxy/v1"),
            ("TERN_MODEL", "gemini-2.5-flash"),
            ("GOOGLE_CLOUD_PROJECT", ""),
        ]
        .into_iter()
        .collect();
        let lookup = |name: &str| env.get(name).map(|v| v.to_string());

        let mut config = Config::default();
        config.apply_env_from(lookup);
        assert_eq!(config.auth.api_key.as_deref(), Some("g-key"));
        assert_eq!(config.auth.base_url, None);
        assert_eq!(config.auth.project, None);
        assert_eq!(config.model, "gemini-2.5-flash");

        let mut config = Config::default();
        config.auth.auth_type = AuthType::OpenAiCompatible;
        config.apply_env_from(lookup);
        assert_eq!(config.auth.api_key.as_deref(), Some("o-key"));
        assert_eq!(config.auth.base_url.as_deref(), Some("http://proxy/v1"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.compression.threshold_ratio = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.max_turns = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.initial_delay_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_from() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.auth.auth_type = AuthType::VertexAi;
        config.auth.project = Some("my-proj".to_string());
        save_to(&config, &path).unwrap();

        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded.auth.auth_type, AuthType::VertexAi);
        assert_eq!(loaded.auth.project.as_deref(), Some("my-proj"));

        let missing = load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(missing.model, "gemini-2.5-pro");
    }
}
